//! Shared login state and the relogin handshake.
//!
//! At most one handshake is outstanding per session. Every request that
//! needs a fresh credential while it is outstanding subscribes to it; the
//! embedding application is asked to log in once through [`LoginTrigger`]
//! and reports back with [`AuthSession::login_succeeded`] or
//! [`AuthSession::login_failed`].

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginOutcome {
    Succeeded,
    Failed,
}

/// Hook the session uses to ask the application for a new login.
pub trait LoginTrigger: Send + Sync {
    fn trigger_login(&self);
}

/// One-shot subscription to the outcome of the outstanding handshake.
#[derive(Debug)]
pub struct LoginSubscription {
    receiver: oneshot::Receiver<LoginOutcome>,
    initiated: bool,
}

impl LoginSubscription {
    /// Whether this subscription started the handshake (and fired the
    /// trigger) rather than joining one already in flight.
    pub fn initiated(&self) -> bool {
        self.initiated
    }

    /// Resolves once the handshake settles. A session dropped mid-handshake
    /// counts as a failed login.
    pub async fn outcome(self) -> LoginOutcome {
        self.receiver.await.unwrap_or(LoginOutcome::Failed)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    access_token: Option<String>,
    user_id: Option<String>,
    offline: bool,
    relogin_waiters: Option<Vec<oneshot::Sender<LoginOutcome>>>,
}

struct SessionInner {
    state: Mutex<SessionState>,
    trigger: Option<Arc<dyn LoginTrigger>>,
}

#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock_unpoisoned(&self.inner.state);
        formatter
            .debug_struct("AuthSession")
            .field("logged_in", &is_logged_in(&state))
            .field("online", &!state.offline)
            .field("relogin_in_flight", &state.relogin_waiters.is_some())
            .field("has_trigger", &self.inner.trigger.is_some())
            .finish()
    }
}

fn is_logged_in(state: &SessionState) -> bool {
    let non_empty = |value: &Option<String>| value.as_deref().is_some_and(|text| !text.is_empty());
    non_empty(&state.access_token) && non_empty(&state.user_id)
}

impl AuthSession {
    pub fn new(trigger: Arc<dyn LoginTrigger>) -> Self {
        Self::with_trigger(Some(trigger))
    }

    /// A session nobody can log back into; healable failures propagate as-is.
    pub fn without_trigger() -> Self {
        Self::with_trigger(None)
    }

    fn with_trigger(trigger: Option<Arc<dyn LoginTrigger>>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState::default()),
                trigger,
            }),
        }
    }

    pub fn set_credentials(&self, access_token: impl Into<String>, user_id: impl Into<String>) {
        let mut state = lock_unpoisoned(&self.inner.state);
        state.access_token = Some(access_token.into());
        state.user_id = Some(user_id.into());
    }

    pub fn clear_credentials(&self) {
        let mut state = lock_unpoisoned(&self.inner.state);
        state.access_token = None;
        state.user_id = None;
    }

    pub fn access_token(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.state).access_token.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.state).user_id.clone()
    }

    /// True when both the access token and the user id are non-empty.
    pub fn is_logged_in(&self) -> bool {
        is_logged_in(&lock_unpoisoned(&self.inner.state))
    }

    pub fn set_online(&self, online: bool) {
        lock_unpoisoned(&self.inner.state).offline = !online;
    }

    pub fn is_online(&self) -> bool {
        !lock_unpoisoned(&self.inner.state).offline
    }

    pub fn relogin_in_flight(&self) -> bool {
        lock_unpoisoned(&self.inner.state).relogin_waiters.is_some()
    }

    /// Joins the outstanding handshake, or starts one and fires the trigger.
    ///
    /// Returns `None` when no trigger is installed.
    pub fn begin_relogin(&self) -> Option<LoginSubscription> {
        let trigger = self.inner.trigger.as_ref()?;
        let (sender, receiver) = oneshot::channel();
        let initiated = {
            let mut state = lock_unpoisoned(&self.inner.state);
            match &mut state.relogin_waiters {
                Some(waiters) => {
                    waiters.push(sender);
                    false
                }
                None => {
                    state.relogin_waiters = Some(vec![sender]);
                    true
                }
            }
        };

        if initiated {
            info!("requesting relogin");
            trigger.trigger_login();
        } else {
            debug!("joining relogin already in flight");
        }
        Some(LoginSubscription {
            receiver,
            initiated,
        })
    }

    /// Stores the refreshed token and releases every waiting request.
    pub fn login_succeeded(&self, access_token: impl Into<String>) {
        let waiters = {
            let mut state = lock_unpoisoned(&self.inner.state);
            state.access_token = Some(access_token.into());
            state.relogin_waiters.take()
        };
        self.settle(waiters, LoginOutcome::Succeeded);
    }

    pub fn login_failed(&self) {
        let waiters = lock_unpoisoned(&self.inner.state).relogin_waiters.take();
        self.settle(waiters, LoginOutcome::Failed);
    }

    fn settle(&self, waiters: Option<Vec<oneshot::Sender<LoginOutcome>>>, outcome: LoginOutcome) {
        let Some(waiters) = waiters else {
            debug!(?outcome, "login outcome reported with no relogin in flight");
            return;
        };
        debug!(?outcome, waiters = waiters.len(), "relogin settled");
        for waiter in waiters {
            let _ = waiter.send(outcome);
        }
    }
}
