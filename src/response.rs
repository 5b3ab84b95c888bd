use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::Error;

/// A successful (200/202) response with its body normalized to a JSON value.
#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: Option<HeaderMap>,
    data: Value,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: Option<HeaderMap>, data: Value) -> Self {
        Self {
            status,
            headers,
            data,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers, kept only when the request asked for them.
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.headers.as_ref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.data).map_err(|source| Error::Deserialize {
            source: source.into(),
        })
    }
}
