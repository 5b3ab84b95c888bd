//! Failure classification for authenticated calls.
//!
//! Backend services wrap their errors differently, so a failure body is first
//! reduced to a [`BackendErrorSignature`] by trying [`ERROR_SHAPES`] in
//! order. The signature is then looked up in a [`HealingTable`] that knows,
//! per backend family, which `(status, cause, field)` combinations mean "the
//! credential is bad, log in again" as opposed to a permanent refusal.

use serde_json::Value;

/// Statuses that may carry a credential problem.
pub const AUTH_FAILURE_STATUSES: [u16; 3] = [400, 401, 403];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendErrorSignature {
    pub status: u16,
    pub cause: String,
    pub field: Option<String>,
}

type Extractor = fn(&Value) -> Option<(String, Option<String>)>;

pub struct ErrorShape {
    pub name: &'static str,
    extract: Extractor,
}

impl std::fmt::Debug for ErrorShape {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.name)
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn cause_and_field(failure: &Value) -> Option<(String, Option<String>)> {
    let cause = failure.get("cause").and_then(text)?;
    Some((cause, failure.get("field").and_then(text)))
}

fn flat_failure(body: &Value) -> Option<(String, Option<String>)> {
    cause_and_field(body.get("failure")?)
}

fn nested_failure(body: &Value) -> Option<(String, Option<String>)> {
    cause_and_field(body.get("error")?.get("failure")?)
}

fn named_error(body: &Value) -> Option<(String, Option<String>)> {
    let name = body.get("error")?.get("name").and_then(text)?;
    Some((name, None))
}

fn bare_error(body: &Value) -> Option<(String, Option<String>)> {
    match body.get("error")? {
        Value::String(cause) => Some((cause.clone(), None)),
        _ => None,
    }
}

fn message_and_code(body: &Value) -> Option<(String, Option<String>)> {
    let message = body.get("message").and_then(text)?;
    let code = body.get("code").and_then(text)?;
    Some((message, Some(code)))
}

/// Envelope extractors, tried in order; the first match wins.
pub static ERROR_SHAPES: [ErrorShape; 5] = [
    ErrorShape {
        name: "failure",
        extract: flat_failure,
    },
    ErrorShape {
        name: "error.failure",
        extract: nested_failure,
    },
    ErrorShape {
        name: "error.name",
        extract: named_error,
    },
    ErrorShape {
        name: "error",
        extract: bare_error,
    },
    ErrorShape {
        name: "message+code",
        extract: message_and_code,
    },
];

pub fn extract_signature(status: u16, body: &Value) -> Option<BackendErrorSignature> {
    ERROR_SHAPES.iter().find_map(|shape| {
        (shape.extract)(body).map(|(cause, field)| BackendErrorSignature {
            status,
            cause,
            field,
        })
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendService {
    Gateway,
    Achievements,
    Social,
    Atom,
    Avatars,
    Chat,
    GroupChat,
    ConsolidatedEntitlements,
    EntitlementProxy,
    Search,
    Gifting,
}

impl BackendService {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Achievements => "achievements",
            Self::Social => "social",
            Self::Atom => "atom",
            Self::Avatars => "avatars",
            Self::Chat => "chat",
            Self::GroupChat => "group_chat",
            Self::ConsolidatedEntitlements => "consolidated_entitlements",
            Self::EntitlementProxy => "entitlement_proxy",
            Self::Search => "search",
            Self::Gifting => "gifting",
        }
    }
}

impl std::fmt::Display for BackendService {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// One healable `(status, cause, field)` combination. A `None` field matches
/// any field, including none.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealingRule {
    pub service: BackendService,
    pub status: u16,
    pub cause: String,
    pub field: Option<String>,
}

impl HealingRule {
    pub fn new(
        service: BackendService,
        status: u16,
        cause: impl Into<String>,
        field: Option<&str>,
    ) -> Self {
        Self {
            service,
            status,
            cause: cause.into(),
            field: field.map(ToOwned::to_owned),
        }
    }

    fn matches(&self, signature: &BackendErrorSignature) -> bool {
        if self.status != signature.status || self.cause != signature.cause {
            return false;
        }
        match (&self.field, &signature.field) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected.eq_ignore_ascii_case(actual),
            (Some(_), None) => false,
        }
    }
}

const STANDARD_RULES: &[(BackendService, u16, &str, Option<&str>)] = &[
    (BackendService::Gateway, 400, "MISSING_VALUE", Some("AuthToken")),
    (BackendService::Gateway, 401, "INVALID_VALUE", Some("AuthToken")),
    (BackendService::Gateway, 401, "MISSING_VALUE", Some("AuthToken")),
    (BackendService::Gateway, 403, "INVALID_AUTHTOKEN", None),
    (BackendService::Gateway, 401, "invalid_token", None),
    (BackendService::Gateway, 401, "login_required", None),
    (BackendService::Achievements, 401, "AUTHTOKEN_INVALID", None),
    (BackendService::Achievements, 401, "AUTHTOKEN_EXPIRED", None),
    (BackendService::Achievements, 403, "AUTHTOKEN_USERID_INCONSISTENT", None),
    (BackendService::Social, 401, "Invalid AuthToken", None),
    (BackendService::Social, 401, "AuthToken expired", None),
    (BackendService::Social, 403, "Token is not valid", None),
    (BackendService::Atom, 400, "INVALID_VALUE", Some("authToken")),
    (BackendService::Atom, 401, "MISSING_AUTHTOKEN", None),
    (BackendService::Atom, 403, "INVALID_AUTHTOKEN", None),
    (BackendService::Atom, 403, "EXPIRED_AUTHTOKEN", None),
    (BackendService::Avatars, 401, "AUTHTOKEN_INVALID", None),
    (BackendService::Avatars, 403, "AUTHTOKEN_EXPIRED", None),
    (BackendService::Chat, 401, "AUTHTOKEN_INVALID", None),
    (BackendService::Chat, 401, "AUTHTOKEN_EXPIRED", None),
    (BackendService::Chat, 403, "AUTHTOKEN_USERID_INCONSISTENT", None),
    (BackendService::GroupChat, 401, "AUTHTOKEN_INVALID", None),
    (BackendService::GroupChat, 403, "AUTHTOKEN_EXPIRED", None),
    (BackendService::GroupChat, 403, "AUTHTOKEN_USERID_INCONSISTENT", None),
    (BackendService::ConsolidatedEntitlements, 400, "INVALID_VALUE", Some("authToken")),
    (BackendService::ConsolidatedEntitlements, 401, "INVALID_AUTHTOKEN", None),
    (BackendService::ConsolidatedEntitlements, 403, "INVALID_AUTHTOKEN", None),
    (BackendService::EntitlementProxy, 401, "UNAUTHORIZED", None),
    (BackendService::EntitlementProxy, 403, "INVALID_USER_TOKEN", None),
    (BackendService::EntitlementProxy, 403, "MISSING_AUTHTOKEN", None),
    (BackendService::Search, 400, "invalid_request", Some("access_token")),
    (BackendService::Search, 401, "invalid_token", None),
    (BackendService::Search, 403, "token_expired", None),
    (BackendService::Gifting, 400, "MISSING_VALUE", Some("authToken")),
    (BackendService::Gifting, 401, "AUTHENTICATION_REQUIRED", None),
    (BackendService::Gifting, 403, "INVALID_AUTHTOKEN", None),
];

/// Lookup table deciding which signatures a relogin can cure.
#[derive(Clone, Debug, Default)]
pub struct HealingTable {
    rules: Vec<HealingRule>,
}

impl HealingTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Credential failures of every known backend family.
    pub fn standard() -> Self {
        let rules = STANDARD_RULES
            .iter()
            .map(|(service, status, cause, field)| {
                HealingRule::new(*service, *status, *cause, *field)
            })
            .collect();
        Self { rules }
    }

    pub fn with_rule(mut self, rule: HealingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[HealingRule] {
        &self.rules
    }

    /// The family whose rule declares `signature` healable.
    pub fn lookup(&self, signature: &BackendErrorSignature) -> Option<BackendService> {
        self.rules
            .iter()
            .find(|rule| rule.matches(signature))
            .map(|rule| rule.service)
    }
}

/// Outcome of classifying one failed authenticated call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureVerdict {
    /// A fresh credential may cure it. `service` is `None` for the empty-403
    /// signature, which is not tied to a family.
    Healable { service: Option<BackendService> },
    /// Must not trigger a relogin.
    Permanent {
        signature: Option<BackendErrorSignature>,
    },
}

impl FailureVerdict {
    pub fn is_healable(&self) -> bool {
        matches!(self, Self::Healable { .. })
    }
}

fn is_empty_body(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

pub fn classify_failure(table: &HealingTable, status: u16, body: &Value) -> FailureVerdict {
    if !AUTH_FAILURE_STATUSES.contains(&status) {
        return FailureVerdict::Permanent { signature: None };
    }
    if status == 403 && is_empty_body(body) {
        return FailureVerdict::Healable { service: None };
    }

    let signature = extract_signature(status, body);
    match signature.as_ref().and_then(|signature| table.lookup(signature)) {
        Some(service) => FailureVerdict::Healable {
            service: Some(service),
        },
        None => FailureVerdict::Permanent { signature },
    }
}
