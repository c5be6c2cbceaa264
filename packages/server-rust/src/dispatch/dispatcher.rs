//! Per-connection request loop.
//!
//! One [`Dispatcher`] serves one codec. It reads requests sequentially and
//! runs every call on its own task, so a slow call never blocks the reader
//! and responses may be written in any order. All writes go through a single
//! outbound channel drained by the connection's writer task.

use std::sync::Arc;
use std::time::Duration;

use callgate_core::{CallId, ReadError, Request, RpcError, ServerCodec, SubscriptionId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info_span, warn, Instrument};

use super::context::CallContext;
use super::invoke::{invoke, reply_value};
use crate::config::ServerConfig;
use crate::network::connection::{write_loop, ConnectionHandle, ConnectionId, OutboundMessage};
use crate::network::ShutdownController;
use crate::service::descriptor::Reply;
use crate::service::{split_method_ref, Callback, ServiceRegistry};
use crate::subscription::{Notifier, SubscriptionManager};

/// Method suffix that starts a subscription: `<service>_subscribe`.
pub const SUBSCRIBE_METHOD: &str = "subscribe";

/// Method suffix that ends a subscription: `<service>_unsubscribe`.
pub const UNSUBSCRIBE_METHOD: &str = "unsubscribe";

/// Why a dispatcher returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client went away or the connection was closed locally.
    PeerClosed,
    /// Reading failed below the framing layer.
    TransportFault,
    /// The server was stopped.
    ServerStopped,
}

/// Drives one codec until it closes or the server stops.
pub struct Dispatcher {
    connection: ConnectionId,
    codec: Arc<dyn ServerCodec>,
    scope: CancellationToken,
    registry: Arc<ServiceRegistry>,
    config: Arc<ServerConfig>,
    shutdown: Arc<ShutdownController>,
    subscriptions: Arc<SubscriptionManager>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        handle: &ConnectionHandle,
        registry: Arc<ServiceRegistry>,
        config: Arc<ServerConfig>,
        shutdown: Arc<ShutdownController>,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new(
            handle.scope.child_token(),
            config.connection.subscription_queue_capacity,
        ));
        Self {
            connection: handle.id,
            codec: Arc::clone(&handle.codec),
            scope: handle.scope.clone(),
            registry,
            config,
            shutdown,
            subscriptions,
        }
    }

    /// Runs the read loop to completion, then tears the connection down.
    pub async fn run(self) -> SessionEnd {
        let span = info_span!("connection", id = %self.connection);
        async move {
            let (tx, rx) = mpsc::channel(self.config.connection.outbound_channel_capacity);
            let writer = tokio::spawn(write_loop(
                Arc::clone(&self.codec),
                rx,
                self.scope.clone(),
            ));
            let delivery = tokio::spawn(Arc::clone(&self.subscriptions).run_delivery(tx.clone()));
            let calls = TaskTracker::new();

            let end = self.read_loop(&tx, &calls).await;
            debug!(?end, "read loop finished");
            self.finish(end, tx, &calls, writer, delivery).await;
            end
        }
        .instrument(span)
        .await
    }

    async fn read_loop(
        &self,
        tx: &mpsc::Sender<OutboundMessage>,
        calls: &TaskTracker,
    ) -> SessionEnd {
        loop {
            let read = tokio::select! {
                biased;
                () = self.scope.cancelled() => return SessionEnd::PeerClosed,
                () = self.shutdown.stopping() => return SessionEnd::ServerStopped,
                read = self.codec.read_request() => read,
            };

            match read {
                Ok(request) => {
                    if !self.shutdown.is_accepting() {
                        if let Some(id) = request.id {
                            send(tx, OutboundMessage::Error {
                                id: Some(id),
                                error: RpcError::shutting_down(),
                            })
                            .await;
                        }
                        return SessionEnd::ServerStopped;
                    }
                    self.handle_request(request, tx, calls).await;
                }
                Err(ReadError::Malformed { id, error }) => {
                    debug!(%error, "malformed request");
                    send(tx, OutboundMessage::Error { id, error }).await;
                }
                Err(ReadError::Closed) => return SessionEnd::PeerClosed,
                Err(ReadError::Transport(error)) => {
                    warn!(%error, "transport failure while reading");
                    return SessionEnd::TransportFault;
                }
            }
        }
    }

    async fn handle_request(
        &self,
        request: Request,
        tx: &mpsc::Sender<OutboundMessage>,
        calls: &TaskTracker,
    ) {
        let Request { method, id, params } = request;

        let Some((service, name)) = split_method_ref(&method) else {
            respond(tx, id, Err(RpcError::method_not_found(&method))).await;
            return;
        };
        let Some(catalogue) = self.registry.lookup(service) else {
            respond(tx, id, Err(RpcError::method_not_found(&method))).await;
            return;
        };

        if let Some(callback) = catalogue.callback(name) {
            self.spawn_call(service, Arc::clone(callback), id, params, tx, calls);
            return;
        }
        match name {
            SUBSCRIBE_METHOD => self.subscribe(service, &catalogue, id, params, tx, calls).await,
            UNSUBSCRIBE_METHOD => {
                let outcome = self.unsubscribe(params);
                respond(tx, id, outcome).await;
            }
            _ => respond(tx, id, Err(RpcError::method_not_found(&method))).await,
        }
    }

    fn call_context(&self, service: &str) -> CallContext {
        CallContext::new(
            self.scope.child_token(),
            Notifier::new(Arc::clone(&self.subscriptions), service),
        )
    }

    fn spawn_call(
        &self,
        service: &str,
        callback: Arc<Callback>,
        id: Option<CallId>,
        params: Option<Value>,
        tx: &mpsc::Sender<OutboundMessage>,
        calls: &TaskTracker,
    ) {
        let context = self.call_context(service);
        let guard = self.shutdown.in_flight_guard();
        let timeout = self.config.call_timeout;
        let tx = tx.clone();
        let span = info_span!("call", service, method = callback.name(), id = ?id);

        calls.spawn(
            async move {
                let _guard = guard;
                let outcome = run_scoped(&callback, &context, params, timeout).await;
                context.notifier().release_unclaimed(None);
                let Some(outcome) = outcome else {
                    return;
                };
                record_call(&outcome);
                respond(&tx, id, outcome.and_then(reply_value)).await;
            }
            .instrument(span),
        );
    }

    async fn subscribe(
        &self,
        service: &str,
        catalogue: &crate::service::ServiceCatalogue,
        id: Option<CallId>,
        params: Option<Value>,
        tx: &mpsc::Sender<OutboundMessage>,
        calls: &TaskTracker,
    ) {
        let Some(id) = id else {
            debug!(service, "subscribe request without id ignored");
            return;
        };
        let (name, args) = match split_subscribe_params(params) {
            Ok(parts) => parts,
            Err(error) => {
                respond(tx, Some(id), Err(error)).await;
                return;
            }
        };
        let Some(callback) = catalogue.subscription(&name) else {
            let reference = format!("{service}_{SUBSCRIBE_METHOD}/{name}");
            respond(tx, Some(id), Err(RpcError::method_not_found(&reference))).await;
            return;
        };

        let callback = Arc::clone(callback);
        let context = self.call_context(service);
        let guard = self.shutdown.in_flight_guard();
        let timeout = self.config.call_timeout;
        let subscriptions = Arc::clone(&self.subscriptions);
        let tx = tx.clone();
        let span = info_span!("subscribe", service, subscription = %name, id = %id);

        calls.spawn(
            async move {
                let _guard = guard;
                let outcome = run_scoped(&callback, &context, args, timeout).await;
                let claimed = match &outcome {
                    Some(Ok(Reply::Subscription(subscription))) => Some(subscription.id().clone()),
                    _ => None,
                };
                context.notifier().release_unclaimed(claimed.as_ref());
                let Some(outcome) = outcome else {
                    return;
                };
                record_call(&outcome);
                let subscription = match outcome {
                    Ok(Reply::Subscription(subscription)) => subscription,
                    Ok(_) => {
                        let error = RpcError::internal("subscription method did not return a subscription");
                        respond(&tx, Some(id), Err(error)).await;
                        return;
                    }
                    Err(error) => {
                        respond(&tx, Some(id), Err(error)).await;
                        return;
                    }
                };

                let sub_id = subscription.id().clone();
                let accepted = tx
                    .send(OutboundMessage::Success {
                        id,
                        result: Value::String(sub_id.as_str().to_string()),
                    })
                    .await
                    .is_ok();
                if accepted {
                    subscriptions.activate(&sub_id);
                    debug!(subscription = %sub_id, "subscription active");
                } else {
                    subscriptions.cancel(&sub_id);
                }
            }
            .instrument(span),
        );
    }

    fn unsubscribe(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let sub_id = match params {
            Some(Value::Array(values)) => match values.as_slice() {
                [Value::String(raw)] => SubscriptionId(raw.clone()),
                _ => return Err(RpcError::invalid_params("expected a single subscription id")),
            },
            _ => return Err(RpcError::invalid_params("expected a single subscription id")),
        };
        if self.subscriptions.cancel(&sub_id) {
            Ok(Value::Bool(true))
        } else {
            Err(RpcError::callback("subscription not found"))
        }
    }

    async fn finish(
        &self,
        end: SessionEnd,
        tx: mpsc::Sender<OutboundMessage>,
        calls: &TaskTracker,
        writer: JoinHandle<()>,
        delivery: JoinHandle<()>,
    ) {
        let drain = self.config.connection.drain_timeout;
        calls.close();

        let drained = match end {
            SessionEnd::ServerStopped => {
                let drained = tokio::time::timeout(drain, calls.wait()).await.is_ok();
                if !drained {
                    warn!(
                        remaining = calls.len(),
                        "calls still running after drain timeout, cancelling"
                    );
                }
                drained
            }
            SessionEnd::PeerClosed | SessionEnd::TransportFault => false,
        };
        if !drained {
            self.scope.cancel();
        }

        self.subscriptions.close_all();
        calls.wait().await;
        drop(tx);
        if let Err(e) = delivery.await {
            warn!(error = %e, "subscription delivery task failed");
        }
        if tokio::time::timeout(drain, writer).await.is_err() {
            warn!("writer did not flush before drain timeout");
        }
        self.scope.cancel();
        self.codec.close().await;
    }
}

/// Runs a call under its own scope. Returns `None` if the scope was cancelled
/// before the call finished; nothing is written for such calls.
async fn run_scoped(
    callback: &Callback,
    context: &CallContext,
    params: Option<Value>,
    timeout: Option<Duration>,
) -> Option<Result<Reply, RpcError>> {
    let outcome = tokio::select! {
        biased;
        () = context.cancelled() => None,
        outcome = invoke(callback, context, params, timeout) => Some(outcome),
    };
    context.scope().cancel();
    if outcome.is_none() {
        debug!("call cancelled before completion");
    }
    outcome
}

/// Splits `[name, args...]` into the subscription name and its arguments.
fn split_subscribe_params(params: Option<Value>) -> Result<(String, Option<Value>), RpcError> {
    let Some(Value::Array(mut values)) = params else {
        return Err(RpcError::invalid_request("expected subscription name as first argument"));
    };
    if values.is_empty() {
        return Err(RpcError::invalid_request("expected subscription name as first argument"));
    }
    match values.remove(0) {
        Value::String(name) => Ok((name, Some(Value::Array(values)))),
        _ => Err(RpcError::invalid_request("expected subscription name as first argument")),
    }
}

fn record_call(outcome: &Result<Reply, RpcError>) {
    let label = if outcome.is_ok() { "ok" } else { "error" };
    metrics::counter!("callgate_calls_total", "outcome" => label).increment(1);
}

/// Queues a response for `id`. Requests without an id get no response.
async fn respond(
    tx: &mpsc::Sender<OutboundMessage>,
    id: Option<CallId>,
    outcome: Result<Value, RpcError>,
) {
    let Some(id) = id else { return };
    let message = match outcome {
        Ok(result) => OutboundMessage::Success { id, result },
        Err(error) => OutboundMessage::Error {
            id: Some(id),
            error,
        },
    };
    send(tx, message).await;
}

async fn send(tx: &mpsc::Sender<OutboundMessage>, message: OutboundMessage) {
    if tx.send(message).await.is_err() {
        debug!("writer gone, dropping outbound message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_params_split() {
        let (name, args) = split_subscribe_params(Some(json!(["count", 3]))).unwrap();
        assert_eq!(name, "count");
        assert_eq!(args, Some(json!([3])));

        let (name, args) = split_subscribe_params(Some(json!(["ticks"]))).unwrap();
        assert_eq!(name, "ticks");
        assert_eq!(args, Some(json!([])));
    }

    #[test]
    fn subscribe_params_require_name() {
        for bad in [None, Some(json!([])), Some(json!([1])), Some(json!({"a": 1}))] {
            let err = split_subscribe_params(bad).unwrap_err();
            assert_eq!(err.code, -32600);
        }
    }
}
