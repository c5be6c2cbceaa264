//! Wire-level error taxonomy.
//!
//! Every recoverable failure the dispatcher reports to a caller is an
//! `RpcError`: a numeric code plus a human-readable message. Codes follow
//! the JSON-RPC 2.0 reserved range, with `-32000`..`-32099` used for
//! server-defined conditions.

use serde::{Deserialize, Serialize};

/// Numeric error codes carried by [`RpcError`].
pub mod codes {
    /// The request envelope could not be parsed.
    pub const PARSE_ERROR: i64 = -32700;
    /// The envelope parsed but is not a valid request.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown service, method or subscription name.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Argument count or shape mismatch.
    pub const INVALID_PARAMS: i64 = -32602;
    /// The callback faulted (panic) or broke its declared contract.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The callback returned an error through its error slot.
    pub const CALLBACK_ERROR: i64 = -32000;
    /// The server stopped accepting requests.
    pub const SHUTDOWN: i64 = -32000;
    /// The call exceeded the configured call timeout.
    pub const TIMEOUT: i64 = -32002;
}

/// Error object sent back to the caller in an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::PARSE_ERROR, format!("parse error: {detail}"))
    }

    #[must_use]
    pub fn invalid_request(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_REQUEST, format!("invalid request: {detail}"))
    }

    /// Unknown `service_method` reference. `method` is the full reference as
    /// received, or `service_subscribe` plus the subscription name.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            codes::METHOD_NOT_FOUND,
            format!("the method {method} does not exist/is not available"),
        )
    }

    #[must_use]
    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INVALID_PARAMS, detail.to_string())
    }

    #[must_use]
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(codes::INTERNAL_ERROR, detail.to_string())
    }

    /// Error returned by the callback itself; the message is passed through verbatim.
    #[must_use]
    pub fn callback(message: impl Into<String>) -> Self {
        Self::new(codes::CALLBACK_ERROR, message)
    }

    #[must_use]
    pub fn shutting_down() -> Self {
        Self::new(codes::SHUTDOWN, "server is shutting down")
    }

    #[must_use]
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(codes::TIMEOUT, format!("request timed out after {timeout_ms}ms"))
    }
}
