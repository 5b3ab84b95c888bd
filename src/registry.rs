//! In-flight request deduplication.
//!
//! The registry keeps one entry per equivalence class of
//! `(endpoint, outstanding, config)`. A caller enqueuing a request equivalent
//! to a pending one receives a handle to the same future and causes no
//! second network call.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tracing::{debug, warn};

use crate::auth::AuthRetryCoordinator;
use crate::config::RequestConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::response::Response;
use crate::transport::RequestTransport;
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

type SharedResult = Shared<BoxFuture<'static, crate::Result<Response>>>;

/// Handle to a dispatched request. Clones observe the same outcome.
#[derive(Clone)]
#[must_use = "a pending request does nothing observable unless awaited"]
pub struct PendingRequest {
    id: u64,
    future: SharedResult,
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("settled", &self.future.peek().is_some())
            .finish()
    }
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The settled outcome, if the request has finished.
    pub fn peek(&self) -> Option<&crate::Result<Response>> {
        self.future.peek()
    }

    /// Whether two handles refer to the same dispatch.
    pub fn same_dispatch(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Future for PendingRequest {
    type Output = crate::Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.future).poll(cx)
    }
}

struct PendingEntry {
    id: u64,
    endpoint: String,
    outstanding: u64,
    config: RequestConfig,
    request: PendingRequest,
}

impl PendingEntry {
    fn matches(&self, endpoint: &str, outstanding: u64, config: &RequestConfig) -> bool {
        self.endpoint == endpoint
            && self.outstanding == outstanding
            && self.config.is_equivalent(config)
    }
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<PendingEntry>,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
    transport: Arc<RequestTransport>,
    coordinator: Arc<AuthRetryCoordinator>,
    metrics: Metrics,
}

#[derive(Clone)]
pub(crate) struct RequestRegistry {
    inner: Arc<RegistryInner>,
}

impl RequestRegistry {
    pub(crate) fn new(
        transport: Arc<RequestTransport>,
        coordinator: Arc<AuthRetryCoordinator>,
        metrics: Metrics,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                next_id: AtomicU64::new(1),
                transport,
                coordinator,
                metrics,
            }),
        }
    }

    /// Returns the pending handle for an equivalent request, or dispatches a
    /// new one. Must be called from within a tokio runtime.
    pub(crate) fn enqueue(
        &self,
        endpoint: &str,
        config: RequestConfig,
        outstanding: u64,
    ) -> PendingRequest {
        self.inner.metrics.record_enqueued();
        let mut state = lock_unpoisoned(&self.inner.state);
        if let Some(entry) = state
            .entries
            .iter()
            .find(|entry| entry.matches(endpoint, outstanding, &config))
        {
            self.inner.metrics.record_dedup_hit();
            debug!(id = entry.id, "joining equivalent pending request");
            return entry.request.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = PendingRequest {
            id,
            future: self.spawn_dispatch(id, endpoint.to_owned(), config.clone()),
        };
        state.entries.push(PendingEntry {
            id,
            endpoint: endpoint.to_owned(),
            outstanding,
            config,
            request: request.clone(),
        });
        request
    }

    /// Removes the entry behind `request`. Returns `false` when it is no
    /// longer registered.
    pub(crate) fn dequeue(&self, request: &PendingRequest) -> bool {
        if self.remove(request.id) {
            return true;
        }
        warn!(id = request.id, "dequeue found no pending request");
        false
    }

    pub(crate) fn pending_count(&self) -> usize {
        lock_unpoisoned(&self.inner.state).entries.len()
    }

    fn remove(&self, id: u64) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        let before = state.entries.len();
        state.entries.retain(|entry| entry.id != id);
        state.entries.len() != before
    }

    // The task holds only a weak reference to the registry so an abandoned
    // client does not outlive its last handle.
    fn spawn_dispatch(&self, id: u64, endpoint: String, config: RequestConfig) -> SharedResult {
        let registry = Arc::downgrade(&self.inner);
        let transport = Arc::clone(&self.inner.transport);
        let coordinator = Arc::clone(&self.inner.coordinator);
        let method = config.method().clone();
        let redacted = redact_uri_for_logs(&endpoint);
        let auto_dequeue = config.is_auto_dequeue();

        let task = tokio::spawn(async move {
            let result = if config.needs_session() {
                coordinator.dispatch(&endpoint, config).await
            } else {
                transport.execute(&endpoint, &config).await
            };
            if auto_dequeue && let Some(inner) = registry.upgrade() {
                (RequestRegistry { inner }).remove(id);
            }
            result
        });

        async move {
            task.await.unwrap_or_else(|join_error| {
                warn!(id, error = %join_error, "request dispatch task ended abnormally");
                Err(Error::DispatchAborted {
                    method,
                    uri: redacted,
                })
            })
        }
        .boxed()
        .shared()
    }
}
