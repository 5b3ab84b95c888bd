use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::auth::AuthRetryCoordinator;
use crate::classify::HealingTable;
use crate::config::RequestConfig;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::{PendingRequest, RequestRegistry};
use crate::sender::{ConnectionOptions, HttpSender, HyperSender, TlsBackend, default_tls_backend};
use crate::session::{AuthSession, LoginTrigger};
use crate::transport::{DEFAULT_REQUEST_TIMEOUT, RequestTransport};

const DEFAULT_CLIENT_NAME: &str = "reqlane";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;

pub struct ClientBuilder {
    client_name: String,
    request_timeout: Duration,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    max_response_body_bytes: usize,
    healing_table: HealingTable,
    login_trigger: Option<Arc<dyn LoginTrigger>>,
    session: Option<AuthSession>,
    http_sender: Option<Arc<dyn HttpSender>>,
    tls_backend: TlsBackend,
    metrics_enabled: bool,
}

impl ClientBuilder {
    pub(crate) fn new() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            healing_table: HealingTable::standard(),
            login_trigger: None,
            session: None,
            http_sender: None,
            tls_backend: default_tls_backend(),
            metrics_enabled: true,
        }
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    /// Overall deadline for every request issued by the client.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn healing_table(mut self, healing_table: HealingTable) -> Self {
        self.healing_table = healing_table;
        self
    }

    /// Installs the hook fired when a relogin is needed. Ignored when an
    /// explicit [`ClientBuilder::session`] is supplied.
    pub fn login_trigger(mut self, login_trigger: Arc<dyn LoginTrigger>) -> Self {
        self.login_trigger = Some(login_trigger);
        self
    }

    /// Shares an existing session, e.g. between several clients.
    pub fn session(mut self, session: AuthSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn http_sender(mut self, http_sender: Arc<dyn HttpSender>) -> Self {
        self.http_sender = Some(http_sender);
        self
    }

    pub fn tls_backend(mut self, tls_backend: TlsBackend) -> Self {
        self.tls_backend = tls_backend;
        self
    }

    pub fn metrics_enabled(mut self, metrics_enabled: bool) -> Self {
        self.metrics_enabled = metrics_enabled;
        self
    }

    pub fn try_build(self) -> crate::Result<Client> {
        let sender: Arc<dyn HttpSender> = match self.http_sender {
            Some(sender) => sender,
            None => {
                let options = ConnectionOptions {
                    connect_timeout: self.connect_timeout,
                    pool_idle_timeout: self.pool_idle_timeout,
                    pool_max_idle_per_host: self.pool_max_idle_per_host,
                    max_response_body_bytes: self.max_response_body_bytes,
                };
                Arc::new(HyperSender::new(self.tls_backend, &options)?)
            }
        };
        let session = match (self.session, self.login_trigger) {
            (Some(session), _) => session,
            (None, Some(trigger)) => AuthSession::new(trigger),
            (None, None) => AuthSession::without_trigger(),
        };
        let metrics = if self.metrics_enabled {
            Metrics::enabled()
        } else {
            Metrics::disabled()
        };

        let transport = Arc::new(RequestTransport::new(
            sender,
            self.request_timeout,
            self.client_name,
            metrics.clone(),
        ));
        let coordinator = Arc::new(AuthRetryCoordinator::new(
            Arc::clone(&transport),
            session.clone(),
            Arc::new(self.healing_table),
            metrics.clone(),
        ));
        let registry = RequestRegistry::new(Arc::clone(&transport), coordinator, metrics.clone());

        Ok(Client {
            transport,
            registry,
            session,
            metrics,
            tls_backend: self.tls_backend,
        })
    }

    pub fn build(self) -> Client {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build reqlane client: {error}"))
    }
}

/// Entry point for issuing requests. Cheap to clone; clones share the
/// pending-request table, the session and the metrics.
#[derive(Clone)]
pub struct Client {
    transport: Arc<RequestTransport>,
    registry: RequestRegistry,
    session: AuthSession,
    metrics: Metrics,
    tls_backend: TlsBackend,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("transport", &self.transport)
            .field("session", &self.session)
            .field("pending", &self.registry.pending_count())
            .field("tls_backend", &self.tls_backend)
            .finish()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Submits a request, or joins an equivalent one still pending.
    ///
    /// `outstanding` is the caller's freshness token for the resource; two
    /// requests only share a dispatch when their tokens match. Must be called
    /// from within a tokio runtime.
    pub fn enqueue(
        &self,
        endpoint: impl AsRef<str>,
        config: RequestConfig,
        outstanding: u64,
    ) -> PendingRequest {
        self.registry.enqueue(endpoint.as_ref(), config, outstanding)
    }

    /// Drops the registry entry of a request enqueued with
    /// `auto_dequeue(false)`. Returns `false` if it was already gone.
    pub fn dequeue(&self, request: &PendingRequest) -> bool {
        self.registry.dequeue(request)
    }

    /// Appends a header unless the session is offline.
    pub fn add_header(
        &self,
        config: &mut RequestConfig,
        label: impl Into<String>,
        value: impl Into<String>,
    ) {
        let label = label.into();
        if !self.session.is_online() {
            debug!(label = %label, "offline; header not added");
            return;
        }
        config.push_header(label, value);
    }

    /// The underlying transport, for one-off calls that bypass deduplication
    /// and relogin handling.
    pub fn transport(&self) -> &RequestTransport {
        &self.transport
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    pub fn request_timeout(&self) -> Duration {
        self.transport.request_timeout()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.pending_entries = self.registry.pending_count() as u64;
        snapshot
    }

    pub fn tls_backend(&self) -> TlsBackend {
        self.tls_backend
    }
}
