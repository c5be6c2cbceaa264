//! Live codec tracking and the per-connection write path.
//!
//! Every codec the server is serving gets a [`ConnectionHandle`] in the
//! [`CodecRegistry`]. Responses and notifications for a connection go through
//! one bounded mpsc channel drained by [`write_loop`], so a codec only ever
//! sees one write at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use callgate_core::{CallId, RpcError, ServerCodec, SubscriptionId};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Unique identifier for a served codec, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message waiting to be written to a connection.
#[derive(Debug)]
pub enum OutboundMessage {
    Success {
        id: CallId,
        result: Value,
    },
    Error {
        id: Option<CallId>,
        error: RpcError,
    },
    Notification {
        namespace: String,
        subscription: SubscriptionId,
        payload: Value,
    },
}

/// Handle to one served codec.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub codec: Arc<dyn ServerCodec>,
    /// Cancelled when the connection ends; parent of every call scope on it.
    pub scope: CancellationToken,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Cancels all work on the connection and closes the codec.
    pub async fn close(&self) {
        self.scope.cancel();
        self.codec.close().await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled() || self.codec.is_closed()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// Thread-safe set of codecs currently being served.
#[derive(Debug)]
pub struct CodecRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl CodecRegistry {
    /// Connection IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Adds a codec to the live set. `scope` becomes the connection scope.
    pub fn register(
        &self,
        codec: Arc<dyn ServerCodec>,
        scope: CancellationToken,
    ) -> Arc<ConnectionHandle> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(ConnectionHandle {
            id,
            codec,
            scope,
            connected_at: Instant::now(),
        });
        self.connections.insert(id, Arc::clone(&handle));
        metrics::gauge!("callgate_live_codecs").increment(1.0);
        handle
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let removed = self.connections.remove(&id).map(|(_, handle)| handle);
        if removed.is_some() {
            metrics::gauge!("callgate_live_codecs").decrement(1.0);
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Removes and returns every live handle.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        keys.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains `rx` into `codec` until the channel closes or `scope` is cancelled.
///
/// A failed write cancels `scope`, which ends the whole connection.
pub(crate) async fn write_loop(
    codec: Arc<dyn ServerCodec>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    scope: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = scope.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else { break };

        let written = match message {
            OutboundMessage::Success { id, result } => codec.write_success(&id, result).await,
            OutboundMessage::Error { id, error } => codec.write_error(id.as_ref(), &error).await,
            OutboundMessage::Notification {
                namespace,
                subscription,
                payload,
            } => {
                codec
                    .write_notification(&namespace, &subscription, payload)
                    .await
            }
        };
        if let Err(error) = written {
            debug!(%error, "codec write failed, closing connection");
            scope.cancel();
            break;
        }
    }
}
