use bytes::Bytes;
use http::Method;
use http::header::AUTHORIZATION;
use serde::Serialize;

use crate::error::Error;

pub(crate) const AUTH_TOKEN_HEADER: &str = "AuthToken";
pub(crate) const TOKEN_PLACEHOLDER: &str = "{token}";

/// Tells the auth coordinator which header carries the access token and how
/// to render it. `format` may contain `{token}`; a format without it is
/// treated as a prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthHint {
    pub property: String,
    pub format: String,
}

impl AuthHint {
    pub fn new(property: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            format: format.into(),
        }
    }

    pub(crate) fn render(&self, token: &str) -> String {
        render_token(&self.format, token)
    }
}

pub(crate) fn render_token(format: &str, token: &str) -> String {
    if format.contains(TOKEN_PLACEHOLDER) {
        format.replace(TOKEN_PLACEHOLDER, token)
    } else {
        format!("{format}{token}")
    }
}

/// Everything that describes one logical request besides its endpoint.
///
/// Header, parameter and append-parameter lists keep insertion order, and
/// that order is part of the request identity.
#[derive(Clone, Debug)]
pub struct RequestConfig {
    pub(crate) method: Method,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) parameters: Vec<(String, String)>,
    pub(crate) append_params: Option<Vec<(String, String)>>,
    pub(crate) body: Option<Bytes>,
    pub(crate) requires_auth: bool,
    pub(crate) requires_user: bool,
    pub(crate) auth_hint: Option<AuthHint>,
    pub(crate) dont_relogin: bool,
    pub(crate) auto_dequeue: bool,
    pub(crate) response_header: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestConfig {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: Vec::new(),
            parameters: Vec::new(),
            append_params: None,
            body: None,
            requires_auth: false,
            requires_user: false,
            auth_hint: None,
            dont_relogin: false,
            auto_dequeue: true,
            response_header: false,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn requires_auth(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    pub fn requires_user(mut self, requires_user: bool) -> Self {
        self.requires_user = requires_user;
        self
    }

    pub fn dont_relogin(mut self, dont_relogin: bool) -> Self {
        self.dont_relogin = dont_relogin;
        self
    }

    pub fn auto_dequeue(mut self, auto_dequeue: bool) -> Self {
        self.auto_dequeue = auto_dequeue;
        self
    }

    pub fn response_header(mut self, response_header: bool) -> Self {
        self.response_header = response_header;
        self
    }

    /// Appends a header unconditionally. Use [`crate::Client::add_header`] for
    /// the connectivity-aware variant.
    pub fn header(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.push_header(label, value);
        self
    }

    pub(crate) fn push_header(&mut self, label: impl Into<String>, value: impl Into<String>) {
        self.headers.push((label.into(), value.into()));
    }

    /// Adds a `{label}` path substitution.
    pub fn add_parameter(&mut self, label: impl Into<String>, value: impl Into<String>) {
        self.parameters.push((label.into(), value.into()));
    }

    /// Adds a query pair appended after path substitution.
    pub fn append_parameter(&mut self, label: impl Into<String>, value: impl Into<String>) {
        self.append_params
            .get_or_insert_with(Vec::new)
            .push((label.into(), value.into()));
    }

    pub fn add_body(&mut self, body: impl Into<Bytes>) {
        self.body = Some(body.into());
    }

    pub fn add_json_body<T>(&mut self, payload: &T) -> crate::Result<()>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson {
            source: source.into(),
        })?;
        self.body = Some(Bytes::from(encoded));
        Ok(())
    }

    pub fn add_auth_hint(&mut self, property: impl Into<String>, format: impl Into<String>) {
        self.auth_hint = Some(AuthHint::new(property, format));
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    pub fn append_params(&self) -> Option<&[(String, String)]> {
        self.append_params.as_deref()
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn auth_hint(&self) -> Option<&AuthHint> {
        self.auth_hint.as_ref()
    }

    pub fn is_auto_dequeue(&self) -> bool {
        self.auto_dequeue
    }

    pub(crate) fn needs_session(&self) -> bool {
        self.requires_auth || self.requires_user
    }

    /// Whether two configs describe the same logical request.
    ///
    /// Lists are compared index by index, so reordering otherwise identical
    /// headers yields a different request.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.method == other.method
            && self.requires_auth == other.requires_auth
            && self.requires_user == other.requires_user
            && self.headers == other.headers
            && self.parameters == other.parameters
            && self.append_params == other.append_params
            && self.body == other.body
    }

    /// Labels that may carry the access token, most specific first.
    pub(crate) fn auth_header_candidates(&self) -> Vec<&str> {
        let mut labels = Vec::with_capacity(3);
        if let Some(hint) = &self.auth_hint {
            labels.push(hint.property.as_str());
        }
        labels.push(AUTHORIZATION.as_str());
        labels.push(AUTH_TOKEN_HEADER);
        labels
    }

    /// Rewrites the value of an existing authorization header. Returns
    /// whether one was found.
    pub(crate) fn replace_auth_token(&mut self, token: &str) -> bool {
        let candidates = self
            .auth_header_candidates()
            .into_iter()
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();
        let existing = self.headers.iter().position(|(label, _)| {
            candidates
                .iter()
                .any(|candidate| candidate.eq_ignore_ascii_case(label))
        });
        let Some(index) = existing else {
            return false;
        };
        let label = self.headers[index].0.clone();
        self.headers[index].1 = self.render_auth_value(&label, token);
        true
    }

    /// Writes `token` into the authorization header, adding one under the
    /// hinted label (or `AuthToken`) when none is present yet.
    pub(crate) fn set_auth_token(&mut self, token: &str) {
        if self.replace_auth_token(token) {
            return;
        }
        let label = self
            .auth_hint
            .as_ref()
            .map(|hint| hint.property.clone())
            .unwrap_or_else(|| AUTH_TOKEN_HEADER.to_owned());
        let value = self.render_auth_value(&label, token);
        self.headers.push((label, value));
    }

    fn render_auth_value(&self, label: &str, token: &str) -> String {
        match &self.auth_hint {
            Some(hint) if hint.property.eq_ignore_ascii_case(label) => hint.render(token),
            _ if label.eq_ignore_ascii_case(AUTHORIZATION.as_str()) => {
                render_token("Bearer {token}", token)
            }
            _ => token.to_owned(),
        }
    }
}
