use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::classify::{FailureVerdict, HealingTable, classify_failure};
use crate::config::RequestConfig;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::response::Response;
use crate::session::{AuthSession, LoginOutcome};
use crate::transport::RequestTransport;

/// Where one authenticated call is in its lifecycle. Only used for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AuthRetryState {
    Attempting,
    AwaitingRelogin,
    Replaying,
    Done,
    Failed,
}

impl AuthRetryState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Attempting => "attempting",
            Self::AwaitingRelogin => "awaiting_relogin",
            Self::Replaying => "replaying",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Runs an authenticated call and, when the backend rejects the credential,
/// waits for one relogin and replays the call exactly once.
pub(crate) struct AuthRetryCoordinator {
    transport: Arc<RequestTransport>,
    session: AuthSession,
    healing: Arc<HealingTable>,
    metrics: Metrics,
}

impl AuthRetryCoordinator {
    pub(crate) fn new(
        transport: Arc<RequestTransport>,
        session: AuthSession,
        healing: Arc<HealingTable>,
        metrics: Metrics,
    ) -> Self {
        Self {
            transport,
            session,
            healing,
            metrics,
        }
    }

    pub(crate) async fn dispatch(
        &self,
        endpoint: &str,
        mut config: RequestConfig,
    ) -> crate::Result<Response> {
        if config.requires_auth
            && let Some(token) = self.current_token()
        {
            config.set_auth_token(&token);
        }

        log_state(AuthRetryState::Attempting);
        let error = match self.transport.execute(endpoint, &config).await {
            Ok(response) => {
                log_state(AuthRetryState::Done);
                return Ok(response);
            }
            Err(error) => error,
        };

        let classified = match &error {
            Error::HttpStatus { status, body, .. } => {
                Some((*status, classify_failure(&self.healing, *status, body)))
            }
            _ => None,
        };
        let Some((status, verdict)) = classified else {
            log_state(AuthRetryState::Failed);
            return Err(error);
        };

        let service = match verdict {
            FailureVerdict::Healable { service } => service,
            FailureVerdict::Permanent { signature } => {
                debug!(status, ?signature, "failure is not curable by relogin");
                log_state(AuthRetryState::Failed);
                return Err(error);
            }
        };
        if config.dont_relogin {
            debug!(status, "relogin suppressed for this request");
            log_state(AuthRetryState::Failed);
            return Err(error);
        }
        if !self.session.is_logged_in() {
            debug!(status, "session is logged out; not requesting relogin");
            log_state(AuthRetryState::Failed);
            return Err(error);
        }
        let Some(subscription) = self.session.begin_relogin() else {
            debug!(status, "no login trigger installed");
            log_state(AuthRetryState::Failed);
            return Err(error);
        };

        let service = service.map(|service| service.as_str()).unwrap_or("any");
        if subscription.initiated() {
            self.metrics.record_relogin_triggered();
            info!(status, service, "credential rejected; relogin requested");
        } else {
            self.metrics.record_relogin_coalesced();
            debug!(status, service, "credential rejected; waiting on relogin in flight");
        }

        log_state(AuthRetryState::AwaitingRelogin);
        match subscription.outcome().await {
            LoginOutcome::Succeeded => {}
            LoginOutcome::Failed => {
                warn!(status, "relogin failed; giving up");
                log_state(AuthRetryState::Failed);
                return Err(exhausted(error));
            }
        }

        if let Some(token) = self.current_token() {
            if config.requires_auth {
                config.set_auth_token(&token);
            } else {
                config.replace_auth_token(&token);
            }
        }
        self.metrics.record_replay();
        log_state(AuthRetryState::Replaying);

        let result = self.transport.execute(endpoint, &config).await;
        log_state(if result.is_ok() {
            AuthRetryState::Done
        } else {
            AuthRetryState::Failed
        });
        result
    }

    fn current_token(&self) -> Option<String> {
        self.session
            .access_token()
            .filter(|token| !token.is_empty())
    }
}

fn log_state(state: AuthRetryState) {
    debug!(state = state.as_str(), "auth retry state");
}

fn exhausted(error: Error) -> Error {
    match error {
        Error::HttpStatus {
            status,
            method,
            uri,
            ..
        } => Error::AuthRetryExhausted {
            status,
            method,
            uri,
        },
        other => other,
    }
}
