//! Line-delimited JSON-RPC 2.0 codec over any async byte stream.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CodecError, ReadError, ServerCodec};
use crate::error::RpcError;
use crate::messages::{
    parse_request, ErrorResponse, Notification, SuccessResponse, JSONRPC_VERSION,
};
use crate::types::{CallId, Request, SubscriptionId};

/// Framing limits for [`JsonCodec`].
#[derive(Debug, Clone)]
pub struct JsonCodecConfig {
    /// Longest accepted request line in bytes. Longer lines are skipped and
    /// answered with an invalid-request error.
    pub max_line_length: usize,
}

impl Default for JsonCodecConfig {
    fn default() -> Self {
        Self {
            max_line_length: 5 * 1024 * 1024,
        }
    }
}

/// A line that was framed correctly but cannot be handed to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineFault {
    TooLong,
    NotUtf8,
}

/// [`LinesCodec`] with per-line faults reported as frames.
///
/// Returning a decode error would put `FramedRead` into its errored state,
/// which stalls lines already buffered behind the bad one.
struct RequestLines {
    lines: LinesCodec,
}

impl RequestLines {
    fn new(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
        }
    }
}

impl Decoder for RequestLines {
    type Item = Result<String, LineFault>;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        line_frame(self.lines.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        line_frame(self.lines.decode_eof(buf))
    }
}

// `LinesCodec` only produces `Io` from decode for lines that are not UTF-8;
// the line has already been consumed from the buffer at that point.
fn line_frame(
    decoded: Result<Option<String>, LinesCodecError>,
) -> Result<Option<Result<String, LineFault>>, LinesCodecError> {
    match decoded {
        Ok(line) => Ok(line.map(Ok)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(LineFault::TooLong))),
        Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
            Ok(Some(Err(LineFault::NotUtf8)))
        }
        Err(e) => Err(e),
    }
}

/// One JSON object per line in both directions.
pub struct JsonCodec<R, W> {
    reader: Mutex<FramedRead<R, RequestLines>>,
    writer: Mutex<FramedWrite<W, LinesCodec>>,
    closed: CancellationToken,
}

impl<T> JsonCodec<ReadHalf<T>, WriteHalf<T>>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Splits a duplex stream (socket, pipe, `tokio::io::duplex`) into a codec.
    pub fn from_io(io: T) -> Self {
        Self::from_io_with_config(io, &JsonCodecConfig::default())
    }

    pub fn from_io_with_config(io: T, config: &JsonCodecConfig) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self::new(reader, writer, config)
    }
}

impl<R, W> JsonCodec<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W, config: &JsonCodecConfig) -> Self {
        Self {
            reader: Mutex::new(FramedRead::new(
                reader,
                RequestLines::new(config.max_line_length),
            )),
            writer: Mutex::new(FramedWrite::new(writer, LinesCodec::new())),
            closed: CancellationToken::new(),
        }
    }

    async fn write_envelope<T: Serialize + Sync>(&self, envelope: &T) -> Result<(), CodecError> {
        if self.closed.is_cancelled() {
            return Err(CodecError::Closed);
        }
        let line = serde_json::to_string(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.send(line).await.map_err(lines_error)
    }
}

fn lines_error(err: LinesCodecError) -> CodecError {
    match err {
        LinesCodecError::Io(e) => CodecError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => CodecError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "line length exceeded",
        )),
    }
}

#[async_trait]
impl<R, W> ServerCodec for JsonCodec<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn read_request(&self) -> Result<Request, ReadError> {
        let mut reader = tokio::select! {
            () = self.closed.cancelled() => return Err(ReadError::Closed),
            guard = self.reader.lock() => guard,
        };

        loop {
            let next = tokio::select! {
                () = self.closed.cancelled() => return Err(ReadError::Closed),
                next = reader.next() => next,
            };

            match next {
                None => return Err(ReadError::Closed),
                Some(Ok(Ok(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return parse_request(&line)
                        .map_err(|(id, error)| ReadError::Malformed { id, error });
                }
                Some(Ok(Err(LineFault::TooLong))) => {
                    debug!("discarding oversized request line");
                    return Err(ReadError::Malformed {
                        id: None,
                        error: RpcError::invalid_request("request exceeds maximum line length"),
                    });
                }
                Some(Ok(Err(LineFault::NotUtf8))) => {
                    debug!("discarding request line that is not UTF-8");
                    return Err(ReadError::Malformed {
                        id: None,
                        error: RpcError::parse_error("request is not valid UTF-8"),
                    });
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(ReadError::Transport(e)),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(ReadError::Transport(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "line length exceeded",
                    )))
                }
            }
        }
    }

    async fn write_success(&self, id: &CallId, result: Value) -> Result<(), CodecError> {
        self.write_envelope(&SuccessResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.clone(),
            result,
        })
        .await
    }

    async fn write_error(&self, id: Option<&CallId>, error: &RpcError) -> Result<(), CodecError> {
        self.write_envelope(&ErrorResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.cloned(),
            error: error.clone(),
        })
        .await
    }

    async fn write_notification(
        &self,
        namespace: &str,
        subscription: &SubscriptionId,
        payload: Value,
    ) -> Result<(), CodecError> {
        self.write_envelope(&Notification::new(namespace, subscription.clone(), payload))
            .await
    }

    async fn close(&self) {
        self.closed.cancel();
        // A writer blocked on a slow peer keeps the lock; the stream is then
        // shut down when the codec is dropped instead.
        if let Ok(mut writer) = self.writer.try_lock() {
            if let Err(e) = SinkExt::<String>::close(&mut *writer).await {
                debug!(error = %e, "error shutting down codec writer");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
