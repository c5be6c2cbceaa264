//! Wire-neutral request types shared by codecs and the dispatcher.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Caller-chosen call identifier, echoed back unchanged in the response.
///
/// Numbers keep their original JSON representation, so `u64`-range and
/// fractional ids survive the round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallId {
    Number(serde_json::Number),
    String(String),
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for CallId {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// A decoded request envelope as handed over by a codec.
///
/// `id` is `None` for notifications, which are executed but never answered.
/// `params` is the raw, still untyped argument payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub id: Option<CallId>,
    pub params: Option<serde_json::Value>,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, id: Option<CallId>, params: Option<serde_json::Value>) -> Self {
        Self {
            method: method.into(),
            id,
            params,
        }
    }
}

/// Server-generated subscription identifier, opaque to clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
