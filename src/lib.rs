//! `reqlane` is the request orchestration layer for store and social backend clients.
//!
//! It deduplicates concurrent equivalent requests, normalizes JSON and XML
//! bodies into one `serde_json::Value` shape, enforces a per-client timeout
//! and, for authenticated calls, turns an expired-credential rejection into a
//! single relogin plus one transparent replay.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use reqlane::prelude::{AuthSession, Client, LoginTrigger, RequestConfig};
//!
//! struct ShowLoginWindow;
//!
//! impl LoginTrigger for ShowLoginWindow {
//!     fn trigger_login(&self) {
//!         // ask the application to refresh the session; it later calls
//!         // `AuthSession::login_succeeded` or `AuthSession::login_failed`
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = AuthSession::new(Arc::new(ShowLoginWindow));
//!     session.set_credentials("access-token", "1000123");
//!
//!     let client = Client::builder()
//!         .client_name("store-sdk")
//!         .session(session)
//!         .try_build()?;
//!
//!     let mut config = RequestConfig::get().requires_auth(true);
//!     config.add_parameter("offerId", "OFB-EAST:1234");
//!     config.add_auth_hint("AuthToken", "{token}");
//!
//!     let offer = client
//!         .enqueue("https://api{num}.origin.com/ecommerce2/offers/{offerId}", config, 0)
//!         .await?;
//!     println!("offer={}", offer.data());
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Keep the default 30 s request timeout; it is the contract callers rely on.
//! - Leave `auto_dequeue` on unless the caller owns the request identity.
//! - Install a [`LoginTrigger`] or requests never recover from an expired token.

#[cfg(all(not(feature = "tls-rustls-ring"), not(feature = "tls-native")))]
compile_error!(
    "reqlane requires one TLS backend feature: enable `tls-rustls-ring` or `tls-native`"
);

mod auth;
mod classify;
mod client;
mod content;
mod core;
mod registry;
mod response;
mod sender;
mod session;
mod shard;
mod transport;

pub(crate) use crate::core::{config, error, metrics, util};

pub use crate::classify::{
    AUTH_FAILURE_STATUSES, BackendErrorSignature, BackendService, ERROR_SHAPES, ErrorShape,
    FailureVerdict, HealingRule, HealingTable, classify_failure, extract_signature,
};
pub use crate::client::{Client, ClientBuilder};
pub use crate::config::{AuthHint, RequestConfig};
pub use crate::content::decode_body;
pub use crate::error::{BodyParseError, Error, ErrorCode, TransportErrorKind};
pub use crate::metrics::MetricsSnapshot;
pub use crate::registry::PendingRequest;
pub use crate::response::Response;
pub use crate::sender::{HttpSender, SendError, TlsBackend};
pub use crate::session::{AuthSession, LoginOutcome, LoginSubscription, LoginTrigger};
pub use crate::shard::{resolve_endpoint, shard_index};
pub use crate::transport::{DEFAULT_REQUEST_TIMEOUT, RequestTransport};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AuthHint, AuthSession, BackendService, Client, ClientBuilder, Error, ErrorCode,
        FailureVerdict, HealingRule, HealingTable, HttpSender, LoginOutcome, LoginTrigger,
        MetricsSnapshot, PendingRequest, RequestConfig, Response, Result, SendError, TlsBackend,
        TransportErrorKind,
    };
}

#[cfg(test)]
mod tests;
