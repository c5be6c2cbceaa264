//! JSON-RPC 2.0 envelope types.
//!
//! The dispatcher never sees these: codecs translate between envelopes and
//! the wire-neutral [`Request`] plus the `write_*` calls of
//! [`ServerCodec`](crate::codec::ServerCodec). They are public so that
//! clients and tests can build requests and decode responses.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;
use crate::types::{CallId, Request, SubscriptionId};

pub const JSONRPC_VERSION: &str = "2.0";

/// Suffix appended to the service name to form the notification method.
pub const NOTIFICATION_METHOD_SUFFIX: &str = "_subscription";

/// Outbound request envelope (client side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<CallId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub params: Option<Value>,
}

impl RequestEnvelope {
    #[must_use]
    pub fn new(id: impl Into<CallId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params: Some(params),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub jsonrpc: String,
    pub id: CallId,
    pub result: Value,
}

/// Error response. `id` serializes as `null` when the request id could not
/// be recovered (e.g. parse errors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub jsonrpc: String,
    pub id: Option<CallId>,
    pub error: RpcError,
}

/// Subscription notification pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    pub params: SubscriptionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionResult {
    pub subscription: SubscriptionId,
    pub result: Value,
}

impl Notification {
    #[must_use]
    pub fn new(namespace: &str, subscription: SubscriptionId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: format!("{namespace}{NOTIFICATION_METHOD_SUFFIX}"),
            params: SubscriptionResult {
                subscription,
                result,
            },
        }
    }
}

/// Parses one textual request envelope.
///
/// On failure returns the recovered call id (if any) together with the wire
/// error to send back, so the caller can still correlate the response.
///
/// # Errors
///
/// - parse error when the text is not JSON
/// - invalid request for batches, non-objects, bad ids and missing methods
pub fn parse_request(text: &str) -> Result<Request, (Option<CallId>, RpcError)> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| (None, RpcError::parse_error(e)))?;

    let mut object = match value {
        Value::Object(object) => object,
        Value::Array(_) => {
            return Err((
                None,
                RpcError::invalid_request("batch requests are not supported"),
            ))
        }
        _ => return Err((None, RpcError::invalid_request("expected a JSON object"))),
    };

    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<CallId>(raw)
                .map_err(|_| (None, RpcError::invalid_request("id must be a number or a string")))?,
        ),
    };

    let method = match object.remove("method") {
        Some(Value::String(method)) if !method.is_empty() => method,
        _ => return Err((id, RpcError::invalid_request("missing method"))),
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(params) => Some(params),
    };

    Ok(Request { method, id, params })
}
