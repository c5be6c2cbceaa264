//! Fixtures shared by the unit tests: an in-memory codec and a few services.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use callgate_core::{CallId, CodecError, ReadError, Request, RpcError, ServerCodec, SubscriptionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::CallContext;
use crate::service::{ArgShape, Invocation, MethodDecl, Reply, ReturnSlot, RpcService, ServiceDescriptor};
use crate::subscription::Subscription;

// ---------------------------------------------------------------------------
// MemoryCodec
// ---------------------------------------------------------------------------

/// One write observed by a [`MemoryCodec`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Written {
    Success(CallId, Value),
    Error(Option<CallId>, RpcError),
    Notification(String, SubscriptionId, Value),
}

/// Codec fed from an mpsc channel that records everything written to it.
pub(crate) struct MemoryCodec {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Request>>,
    written: parking_lot::Mutex<Vec<Written>>,
    closed: CancellationToken,
}

pub(crate) fn memory_codec() -> (mpsc::UnboundedSender<Request>, Arc<MemoryCodec>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let codec = Arc::new(MemoryCodec {
        inbound: tokio::sync::Mutex::new(rx),
        written: parking_lot::Mutex::new(Vec::new()),
        closed: CancellationToken::new(),
    });
    (tx, codec)
}

pub(crate) fn request(id: i64, method: &str, params: Value) -> Request {
    Request::new(method, Some(CallId::from(id)), Some(params))
}

impl MemoryCodec {
    pub(crate) fn written(&self) -> Vec<Written> {
        self.written.lock().clone()
    }

    /// Polls until at least `count` writes happened; panics after five seconds.
    pub(crate) async fn wait_for_writes(&self, count: usize) -> Vec<Written> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let written = self.written();
            if written.len() >= count {
                return written;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} writes, got {written:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Polls until the response for `id` was written; panics after five seconds.
    pub(crate) async fn wait_for_response(&self, id: i64) -> Written {
        let id = CallId::from(id);
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let found = self.written().into_iter().find(|write| match write {
                Written::Success(got, _) | Written::Error(Some(got), _) => *got == id,
                _ => false,
            });
            if let Some(write) = found {
                return write;
            }
            assert!(Instant::now() < deadline, "no response for id {id}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn record(&self, write: Written) -> Result<(), CodecError> {
        if self.closed.is_cancelled() {
            return Err(CodecError::Closed);
        }
        self.written.lock().push(write);
        Ok(())
    }
}

#[async_trait]
impl ServerCodec for MemoryCodec {
    async fn read_request(&self) -> Result<Request, ReadError> {
        let mut inbound = tokio::select! {
            () = self.closed.cancelled() => return Err(ReadError::Closed),
            inbound = self.inbound.lock() => inbound,
        };
        tokio::select! {
            () = self.closed.cancelled() => Err(ReadError::Closed),
            next = inbound.recv() => next.ok_or(ReadError::Closed),
        }
    }

    async fn write_success(&self, id: &CallId, result: Value) -> Result<(), CodecError> {
        self.record(Written::Success(id.clone(), result))
    }

    async fn write_error(&self, id: Option<&CallId>, error: &RpcError) -> Result<(), CodecError> {
        self.record(Written::Error(id.cloned(), error.clone()))
    }

    async fn write_notification(
        &self,
        namespace: &str,
        subscription: &SubscriptionId,
        payload: Value,
    ) -> Result<(), CodecError> {
        self.record(Written::Notification(
            namespace.to_string(),
            subscription.clone(),
            payload,
        ))
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Polls `flag` until it is set; panics after five seconds.
pub(crate) async fn wait_for_flag(flag: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "flag was never set");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Args {
    pub(crate) s: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct EchoResult {
    pub(crate) string: String,
    pub(crate) int: i64,
    pub(crate) args: Option<Args>,
}

/// Sets its flag when dropped after the call's scope was cancelled.
struct CancelWatch {
    context: CallContext,
    flag: Arc<AtomicBool>,
}

impl Drop for CancelWatch {
    fn drop(&mut self) {
        if self.context.is_cancelled() {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

async fn echo(mut call: Invocation) -> anyhow::Result<Reply> {
    let string: String = call.args.take(0)?;
    let int: i64 = call.args.take(1)?;
    let args: Option<Args> = call.args.reference(2)?;
    Reply::json(&EchoResult { string, int, args })
}

fn echo_decl<T: Send + Sync + 'static>(name: &str, with_context: bool) -> MethodDecl<T> {
    let decl = MethodDecl::new(name, |_svc, call| echo(call));
    let decl = if with_context { decl.context() } else { decl };
    decl.arg(ArgShape::value::<String>())
        .arg(ArgShape::value::<i64>())
        .arg(ArgShape::reference::<Args>())
        .returns(ReturnSlot::value::<EchoResult>())
}

async fn sleep_observed(call: &mut Invocation, flag: Arc<AtomicBool>) -> anyhow::Result<Reply> {
    let context = call.require_context()?.clone();
    let millis: u64 = call.args.take(0)?;
    let _watch = CancelWatch {
        context: context.clone(),
        flag,
    };
    tokio::select! {
        () = context.cancelled() => {}
        () = tokio::time::sleep(Duration::from_millis(millis)) => {}
    }
    Ok(Reply::Unit)
}

/// Five plain callbacks and one subscription, next to methods whose
/// signatures keep them off the wire.
pub(crate) struct CalcService;

impl RpcService for CalcService {
    fn describe(self: Arc<Self>) -> ServiceDescriptor<Self> {
        ServiceDescriptor::exported(self)
            .method(
                MethodDecl::new("Add", |_svc, mut call| async move {
                    let a: i64 = call.args.take(0)?;
                    let b: i64 = call.args.take(1)?;
                    Reply::json(&(a + b))
                })
                .arg(ArgShape::value::<i64>())
                .arg(ArgShape::value::<i64>())
                .returns(ReturnSlot::value::<i64>()),
            )
            .method(
                MethodDecl::new("Div", |_svc, mut call| async move {
                    let a: i64 = call.args.take(0)?;
                    let b: i64 = call.args.take(1)?;
                    if b == 0 {
                        anyhow::bail!("division by zero");
                    }
                    Reply::json(&(a / b))
                })
                .arg(ArgShape::value::<i64>())
                .arg(ArgShape::value::<i64>())
                .returns(ReturnSlot::value::<i64>())
                .returns(ReturnSlot::Error),
            )
            .method(echo_decl("Echo", false))
            .method(MethodDecl::new("NoArgsRets", |_svc, _call| async { Ok(Reply::Unit) }))
            .method(
                MethodDecl::new("Sleep", |_svc, mut call| async move {
                    sleep_observed(&mut call, Arc::new(AtomicBool::new(false))).await
                })
                .context()
                .arg(ArgShape::value::<u64>()),
            )
            .method(
                MethodDecl::new("Subscription", |_svc, call| async move {
                    let context = call.require_context()?;
                    Ok(Reply::Subscription(context.notifier().create_subscription()))
                })
                .context()
                .returns(ReturnSlot::Subscription)
                .returns(ReturnSlot::Error),
            )
            .method(
                MethodDecl::new("helper", |_svc, _call| async { Ok(Reply::Unit) }).internal(),
            )
            .method(
                MethodDecl::new("ErrorFirst", |_svc, _call| async { Ok(Reply::Unit) })
                    .returns(ReturnSlot::Error)
                    .returns(ReturnSlot::value::<i64>()),
            )
            .method(
                MethodDecl::new("Pair", |_svc, _call| async { Ok(Reply::Unit) })
                    .returns(ReturnSlot::value::<i64>())
                    .returns(ReturnSlot::value::<i64>()),
            )
            .method(
                MethodDecl::new("PairOrError", |_svc, _call| async { Ok(Reply::Unit) })
                    .returns(ReturnSlot::value::<i64>())
                    .returns(ReturnSlot::value::<i64>())
                    .returns(ReturnSlot::Error),
            )
            .method(
                MethodDecl::new("LateContext", |_svc, _call| async { Ok(Reply::Unit) })
                    .arg(ArgShape::value::<i64>())
                    .context(),
            )
    }
}

/// Mirrors the usual test fixture: valid, invalid and subscription methods.
#[derive(Default)]
pub(crate) struct TestService {
    pub(crate) sleep_cancelled: Arc<AtomicBool>,
    pub(crate) ticker_stopped: Arc<AtomicBool>,
}

impl RpcService for TestService {
    fn describe(self: Arc<Self>) -> ServiceDescriptor<Self> {
        ServiceDescriptor::exported(self)
            .method(MethodDecl::new("NoArgsRets", |_svc, _call| async { Ok(Reply::Unit) }))
            .method(echo_decl("Echo", false))
            .method(echo_decl("EchoWithCtx", true))
            .method(
                MethodDecl::new("Sleep", |svc: Arc<Self>, mut call| async move {
                    sleep_observed(&mut call, Arc::clone(&svc.sleep_cancelled)).await
                })
                .context()
                .arg(ArgShape::value::<u64>()),
            )
            .method(
                MethodDecl::new("Rets", |_svc, _call| async { Reply::json("") })
                    .returns(ReturnSlot::value::<String>())
                    .returns(ReturnSlot::Error),
            )
            .method(
                MethodDecl::new("InvalidRets1", |_svc, _call| async { Ok(Reply::Unit) })
                    .returns(ReturnSlot::Error)
                    .returns(ReturnSlot::value::<i64>()),
            )
            .method(
                MethodDecl::new("InvalidRets2", |_svc, _call| async { Ok(Reply::Unit) })
                    .returns(ReturnSlot::value::<String>())
                    .returns(ReturnSlot::value::<String>()),
            )
            .method(
                MethodDecl::new("InvalidRets3", |_svc, _call| async { Ok(Reply::Unit) })
                    .returns(ReturnSlot::value::<String>())
                    .returns(ReturnSlot::value::<String>())
                    .returns(ReturnSlot::Error),
            )
            .method(
                MethodDecl::new("Subscription", |_svc, mut call| async move {
                    let context = call.require_context()?.clone();
                    let count: Option<u64> = call.args.reference(0)?;
                    let subscription = context.notifier().create_subscription();
                    let producer = subscription.clone();
                    tokio::spawn(async move {
                        for n in 0..count.unwrap_or(0) {
                            if producer.notify(&n).is_err() {
                                return;
                            }
                        }
                        producer.cancelled().await;
                    });
                    Ok(Reply::Subscription(subscription))
                })
                .context()
                .arg(ArgShape::reference::<u64>())
                .returns(ReturnSlot::Subscription)
                .returns(ReturnSlot::Error),
            )
            .method(
                MethodDecl::new("Ticker", |svc: Arc<Self>, call| async move {
                    let context = call.require_context()?;
                    let subscription = context.notifier().create_subscription();
                    let producer = subscription.clone();
                    let stopped = Arc::clone(&svc.ticker_stopped);
                    tokio::spawn(async move {
                        let mut tick = 0_u64;
                        loop {
                            tokio::select! {
                                () = producer.cancelled() => break,
                                () = tokio::time::sleep(Duration::from_millis(5)) => {
                                    if producer.notify(&tick).is_err() {
                                        break;
                                    }
                                    tick += 1;
                                }
                            }
                        }
                        stopped.store(true, Ordering::SeqCst);
                    });
                    Ok(Reply::Subscription(subscription))
                })
                .context()
                .returns(ReturnSlot::Subscription)
                .returns(ReturnSlot::Error),
            )
    }
}

/// Methods that misbehave. Subscriptions they open without returning are
/// kept in `abandoned` so tests can check they were released.
#[derive(Default)]
pub(crate) struct FaultyService {
    pub(crate) abandoned: parking_lot::Mutex<Vec<Subscription>>,
}

fn abandon(svc: &FaultyService, call: &Invocation) -> anyhow::Result<()> {
    let subscription = call.require_context()?.notifier().create_subscription();
    svc.abandoned.lock().push(subscription);
    Ok(())
}

impl RpcService for FaultyService {
    fn describe(self: Arc<Self>) -> ServiceDescriptor<Self> {
        ServiceDescriptor::exported(self)
            .method(
                MethodDecl::new("Panics", |_svc, _call| async {
                    if true {
                        panic!("boom");
                    }
                    Ok(Reply::Unit)
                })
                .returns(ReturnSlot::value::<i64>()),
            )
            .method(MethodDecl::new("FailsSilently", |_svc, _call| async {
                Err(anyhow::anyhow!("no error slot to report this"))
            }))
            .method(
                MethodDecl::new("NotASubscription", |svc: Arc<Self>, call| async move {
                    abandon(&svc, &call)?;
                    Reply::json(&1)
                })
                .context()
                .returns(ReturnSlot::Subscription)
                .returns(ReturnSlot::Error),
            )
            .method(
                MethodDecl::new("Unavailable", |svc: Arc<Self>, call| async move {
                    abandon(&svc, &call)?;
                    Err(anyhow::anyhow!("backend unavailable"))
                })
                .context()
                .returns(ReturnSlot::Subscription)
                .returns(ReturnSlot::Error),
            )
            .method(
                MethodDecl::new("Stalls", |svc: Arc<Self>, call| async move {
                    abandon(&svc, &call)?;
                    std::future::pending::<()>().await;
                    Ok(Reply::Unit)
                })
                .context()
                .returns(ReturnSlot::Subscription)
                .returns(ReturnSlot::Error),
            )
            .method(
                MethodDecl::new("OpensStray", |svc: Arc<Self>, call| async move {
                    abandon(&svc, &call)?;
                    Ok(Reply::Unit)
                })
                .context(),
            )
    }
}
