use std::sync::Arc;

use http::{HeaderMap, Method};
use serde_json::Value;
use thiserror::Error;

pub(crate) type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidEndpoint,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    RequestBuild,
    SerializeJson,
    Network,
    Timeout,
    ResponseBodyTooLarge,
    HttpStatus,
    Deserialize,
    AuthRetryExhausted,
    DispatchAborted,
    TlsBackendInit,
}

impl ErrorCode {
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::InvalidEndpoint,
            Self::InvalidUri,
            Self::InvalidHeaderName,
            Self::InvalidHeaderValue,
            Self::RequestBuild,
            Self::SerializeJson,
            Self::Network,
            Self::Timeout,
            Self::ResponseBodyTooLarge,
            Self::HttpStatus,
            Self::Deserialize,
            Self::AuthRetryExhausted,
            Self::DispatchAborted,
            Self::TlsBackendInit,
        ]
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidEndpoint => "invalid_endpoint",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::RequestBuild => "request_build",
            Self::SerializeJson => "serialize_json",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::HttpStatus => "http_status",
            Self::Deserialize => "deserialize",
            Self::AuthRetryExhausted => "auth_retry_exhausted",
            Self::DispatchAborted => "dispatch_aborted",
            Self::TlsBackendInit => "tls_backend_init",
        }
    }
}

/// Failure of a request as seen by the caller.
///
/// Values are cheap to clone: every caller sharing a deduplicated request
/// observes the same error.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request endpoint is empty")]
    InvalidEndpoint,
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderName>,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: Arc<http::header::InvalidHeaderValue>,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: Arc<http::Error>,
    },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("network error ({kind}) for {method} {uri}: {source}")]
    Network {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: SharedError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error(
        "response body too large ({actual_bytes} bytes > {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("http status error {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        headers: Box<HeaderMap>,
        body: Value,
    },
    #[error("failed to decode response value: {source}")]
    Deserialize {
        #[source]
        source: Arc<serde_json::Error>,
    },
    #[error("relogin did not complete; giving up on {method} {uri} after status {status}")]
    AuthRetryExhausted {
        status: u16,
        method: Method,
        uri: String,
    },
    #[error("request dispatch for {method} {uri} ended before producing a result")]
    DispatchAborted { method: Method, uri: String },
    #[error("failed to initialize tls backend {backend}: {message}")]
    TlsBackendInit {
        backend: &'static str,
        message: String,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidEndpoint => ErrorCode::InvalidEndpoint,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::Network { .. } => ErrorCode::Network,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::AuthRetryExhausted { .. } => ErrorCode::AuthRetryExhausted,
            Self::DispatchAborted { .. } => ErrorCode::DispatchAborted,
            Self::TlsBackendInit { .. } => ErrorCode::TlsBackendInit,
        }
    }

    /// HTTP status carried by the failure, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } | Self::AuthRetryExhausted { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Parsed (or raw string) body of an [`Error::HttpStatus`] failure.
    pub fn body(&self) -> Option<&Value> {
        match self {
            Self::HttpStatus { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Non-fatal body decoding problems. They are logged and never fail a request.
#[derive(Debug, Error)]
pub enum BodyParseError {
    #[error("response body is not valid json: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
    },
    #[error("response body is not valid xml: {message}")]
    Xml { message: String },
}
