//! The network seam.
//!
//! [`RequestTransport`](crate::RequestTransport) talks to the network only
//! through [`HttpSender`]. The default implementation is a pooled hyper
//! client; tests and embedders can install their own.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;

#[cfg(feature = "tls-rustls-ring")]
use hyper_rustls::HttpsConnectorBuilder;

use crate::error::{Error, SharedError, TransportErrorKind};
use crate::util::classify_transport_error;

/// Why a send produced no usable response.
#[derive(Clone, Debug)]
pub enum SendError {
    Transport {
        kind: TransportErrorKind,
        source: SharedError,
    },
    TooLarge {
        limit_bytes: usize,
        actual_bytes: usize,
    },
}

impl SendError {
    pub fn transport(
        kind: TransportErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            kind,
            source: Arc::from(source.into()),
        }
    }
}

pub trait HttpSender: Send + Sync {
    /// Sends one request and buffers the full response body.
    fn send(&self, request: Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>, SendError>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsBackend {
    RustlsRing,
    NativeTls,
}

impl TlsBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RustlsRing => "tls-rustls-ring",
            Self::NativeTls => "tls-native",
        }
    }
}

pub(crate) const fn default_tls_backend() -> TlsBackend {
    #[cfg(feature = "tls-rustls-ring")]
    {
        return TlsBackend::RustlsRing;
    }
    #[allow(unreachable_code)]
    TlsBackend::NativeTls
}

#[cfg(feature = "tls-rustls-ring")]
type RustlsHyperClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

#[cfg(feature = "tls-native")]
type NativeHyperClient = Client<hyper_tls::HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Clone)]
enum TransportClient {
    #[cfg(feature = "tls-rustls-ring")]
    Rustls(RustlsHyperClient),
    #[cfg(feature = "tls-native")]
    Native(NativeHyperClient),
}

impl TransportClient {
    async fn request(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        match self {
            #[cfg(feature = "tls-rustls-ring")]
            Self::Rustls(client) => client.request(request).await,
            #[cfg(feature = "tls-native")]
            Self::Native(client) => client.request(request).await,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ConnectionOptions {
    pub(crate) connect_timeout: Duration,
    pub(crate) pool_idle_timeout: Duration,
    pub(crate) pool_max_idle_per_host: usize,
    pub(crate) max_response_body_bytes: usize,
}

fn http_connector(options: &ConnectionOptions) -> HttpConnector {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(options.connect_timeout));
    http
}

#[cfg(feature = "tls-rustls-ring")]
fn build_rustls_ring_transport(options: &ConnectionOptions) -> crate::Result<TransportClient> {
    let https = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|source| Error::TlsBackendInit {
            backend: TlsBackend::RustlsRing.as_str(),
            message: source.to_string(),
        })?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http_connector(options));
    let transport = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(options.pool_idle_timeout)
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        .build(https);
    Ok(TransportClient::Rustls(transport))
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn build_rustls_ring_transport(_options: &ConnectionOptions) -> crate::Result<TransportClient> {
    Err(Error::TlsBackendInit {
        backend: TlsBackend::RustlsRing.as_str(),
        message: "backend is not enabled in this build".to_owned(),
    })
}

#[cfg(feature = "tls-native")]
fn build_native_tls_transport(options: &ConnectionOptions) -> crate::Result<TransportClient> {
    let https = hyper_tls::HttpsConnector::new_with_connector(http_connector(options));
    let transport = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(options.pool_idle_timeout)
        .pool_max_idle_per_host(options.pool_max_idle_per_host)
        .build(https);
    Ok(TransportClient::Native(transport))
}

#[cfg(not(feature = "tls-native"))]
fn build_native_tls_transport(_options: &ConnectionOptions) -> crate::Result<TransportClient> {
    Err(Error::TlsBackendInit {
        backend: TlsBackend::NativeTls.as_str(),
        message: "backend is not enabled in this build".to_owned(),
    })
}

/// Pooled hyper client used when no custom sender is installed.
pub(crate) struct HyperSender {
    transport: TransportClient,
    max_response_body_bytes: usize,
}

impl HyperSender {
    pub(crate) fn new(tls_backend: TlsBackend, options: &ConnectionOptions) -> crate::Result<Self> {
        let transport = match tls_backend {
            TlsBackend::RustlsRing => build_rustls_ring_transport(options)?,
            TlsBackend::NativeTls => build_native_tls_transport(options)?,
        };
        Ok(Self {
            transport,
            max_response_body_bytes: options.max_response_body_bytes.max(1),
        })
    }
}

impl HttpSender for HyperSender {
    fn send(&self, request: Request<Bytes>) -> BoxFuture<'static, Result<Response<Bytes>, SendError>> {
        let transport = self.transport.clone();
        let max_bytes = self.max_response_body_bytes;
        async move {
            let response = transport
                .request(request.map(Full::new))
                .await
                .map_err(|source| SendError::Transport {
                    kind: classify_transport_error(&source),
                    source: Arc::new(source),
                })?;
            let (parts, body) = response.into_parts();
            let body = read_all_body_limited(body, max_bytes).await?;
            Ok(Response::from_parts(parts, body))
        }
        .boxed()
    }
}

async fn read_all_body_limited(mut body: Incoming, max_bytes: usize) -> Result<Bytes, SendError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|source| SendError::Transport {
            kind: TransportErrorKind::Read,
            source: Arc::new(source),
        })?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(SendError::TooLarge {
                    limit_bytes: max_bytes,
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}
