use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Request, StatusCode, Uri};
use tokio::time::timeout;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::RequestConfig;
use crate::content::decode_body;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::response::Response;
use crate::sender::{HttpSender, SendError};
use crate::shard::resolve_endpoint;
use crate::util::{parse_header_name, parse_header_value, redact_uri_for_logs};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes exactly one network call per [`RequestTransport::execute`].
pub struct RequestTransport {
    sender: Arc<dyn HttpSender>,
    request_timeout: Duration,
    client_name: String,
    metrics: Metrics,
}

impl std::fmt::Debug for RequestTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestTransport")
            .field("request_timeout", &self.request_timeout)
            .field("client_name", &self.client_name)
            .finish()
    }
}

fn is_success(status: StatusCode) -> bool {
    matches!(status, StatusCode::OK | StatusCode::ACCEPTED)
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
}

impl RequestTransport {
    pub(crate) fn new(
        sender: Arc<dyn HttpSender>,
        request_timeout: Duration,
        client_name: String,
        metrics: Metrics,
    ) -> Self {
        Self {
            sender,
            request_timeout: request_timeout.max(Duration::from_millis(1)),
            client_name,
            metrics,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Resolves `endpoint_template` against `config`, sends it and classifies
    /// the outcome. 200 and 202 are successes; any other status fails with
    /// [`Error::HttpStatus`] carrying the decoded body.
    pub async fn execute(
        &self,
        endpoint_template: &str,
        config: &RequestConfig,
    ) -> crate::Result<Response> {
        let uri_text = resolve_endpoint(endpoint_template, config)?;
        let redacted_uri = redact_uri_for_logs(&uri_text);
        let method = config.method().clone();
        let span = info_span!(
            "reqlane.request",
            client = %self.client_name,
            method = %method,
            uri = %redacted_uri
        );

        async {
            let request = build_request(&method, &uri_text, config)?;
            let started = Instant::now();
            let _in_flight = self.metrics.enter_in_flight();
            debug!("sending request");

            let result = self
                .send_with_timeout(request, &method, &redacted_uri, config.response_header)
                .await;
            self.metrics.record_completed(&result, started.elapsed());
            match &result {
                Ok(response) => debug!(
                    status = response.status().as_u16(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request completed"
                ),
                Err(error) => debug!(
                    error = %error,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn send_with_timeout(
        &self,
        request: Request<Bytes>,
        method: &Method,
        redacted_uri: &str,
        keep_headers: bool,
    ) -> crate::Result<Response> {
        let response = match timeout(self.request_timeout, self.sender.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(SendError::Transport { kind, source })) => {
                return Err(Error::Network {
                    kind,
                    method: method.clone(),
                    uri: redacted_uri.to_owned(),
                    source,
                });
            }
            Ok(Err(SendError::TooLarge {
                limit_bytes,
                actual_bytes,
            })) => {
                return Err(Error::ResponseBodyTooLarge {
                    limit_bytes,
                    actual_bytes,
                    method: method.clone(),
                    uri: redacted_uri.to_owned(),
                });
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "request timed out"
                );
                return Err(Error::Timeout {
                    timeout_ms: self.request_timeout.as_millis(),
                    method: method.clone(),
                    uri: redacted_uri.to_owned(),
                });
            }
        };

        let (parts, body) = response.into_parts();
        let data = decode_body(content_type(&parts.headers), &body);
        if !is_success(parts.status) {
            return Err(Error::HttpStatus {
                status: parts.status.as_u16(),
                method: method.clone(),
                uri: redacted_uri.to_owned(),
                headers: Box::new(parts.headers),
                body: data,
            });
        }

        let headers = keep_headers.then_some(parts.headers);
        Ok(Response::new(parts.status, headers, data))
    }
}

fn build_request(
    method: &Method,
    uri_text: &str,
    config: &RequestConfig,
) -> crate::Result<Request<Bytes>> {
    let invalid_uri = || Error::InvalidUri {
        uri: redact_uri_for_logs(uri_text),
    };
    let uri: Uri = uri_text.parse().map_err(|_| invalid_uri())?;
    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(invalid_uri());
    }
    let mut builder = Request::builder().method(method.clone()).uri(uri);
    for (label, value) in config.headers() {
        let name = parse_header_name(label)?;
        let value = parse_header_value(label, value)?;
        builder = builder.header(name, value);
    }
    builder
        .body(config.body().cloned().unwrap_or_default())
        .map_err(|source| Error::RequestBuild {
            source: Arc::new(source),
        })
}
