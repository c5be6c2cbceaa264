//! The codec boundary consumed by the dispatcher.
//!
//! A codec owns one connection's framing and encoding. The dispatcher reads
//! requests sequentially from a single task and writes responses and
//! notifications from a single writer task, so implementations only need to
//! tolerate one concurrent reader plus one concurrent writer, and `close`
//! from any task.

pub mod json;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RpcError;
use crate::types::{CallId, Request, SubscriptionId};

pub use json::{JsonCodec, JsonCodecConfig};

/// Failure to obtain the next request.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// The peer closed the connection or the codec was closed locally.
    #[error("connection closed")]
    Closed,
    /// One envelope was unusable but the stream is still framed correctly.
    /// The dispatcher answers with `error` and keeps reading.
    #[error("malformed request: {error}")]
    Malformed { id: Option<CallId>, error: RpcError },
    /// Unrecoverable transport failure; the session ends.
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

/// Failure to write an outbound message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("codec is closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One connection's read/write boundary.
#[async_trait]
pub trait ServerCodec: Send + Sync + 'static {
    /// Reads the next request. Blocks until a message arrives or the
    /// connection closes.
    async fn read_request(&self) -> Result<Request, ReadError>;

    /// Writes a success response. Methods without a return value pass `Value::Null`.
    async fn write_success(&self, id: &CallId, result: Value) -> Result<(), CodecError>;

    /// Writes an error response; `id` is `None` when it could not be recovered.
    async fn write_error(&self, id: Option<&CallId>, error: &RpcError) -> Result<(), CodecError>;

    /// Writes one subscription notification for the service `namespace`.
    async fn write_notification(
        &self,
        namespace: &str,
        subscription: &SubscriptionId,
        payload: Value,
    ) -> Result<(), CodecError>;

    /// Closes the connection. Pending and future reads return `ReadError::Closed`.
    async fn close(&self);

    /// Whether `close` has been called.
    fn is_closed(&self) -> bool;
}
