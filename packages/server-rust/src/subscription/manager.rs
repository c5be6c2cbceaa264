use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use callgate_core::SubscriptionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::Subscription;
use crate::network::connection::OutboundMessage;

// ---------------------------------------------------------------------------
// SubscriptionSlot
// ---------------------------------------------------------------------------

/// Per-subscription state: a bounded payload queue plus delivery flags.
pub(crate) struct SubscriptionSlot {
    pub(crate) id: SubscriptionId,
    pub(crate) namespace: Arc<str>,
    pub(crate) token: CancellationToken,
    queue: Mutex<VecDeque<Value>>,
    /// Set once the subscribe response is queued; payloads wait until then.
    active: AtomicBool,
    /// Set while the slot sits in the ready list.
    scheduled: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriptionSlot {
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// SubscriptionManager
// ---------------------------------------------------------------------------

/// Live subscriptions of one connection.
///
/// Producers never block: when a subscription's queue is full the oldest
/// pending payload is discarded. A single delivery task per connection moves
/// queued payloads to the outbound channel, preserving per-subscription order.
pub struct SubscriptionManager {
    slots: DashMap<SubscriptionId, Arc<SubscriptionSlot>>,
    ready: Mutex<VecDeque<Arc<SubscriptionSlot>>>,
    wake: Notify,
    capacity: usize,
    scope: CancellationToken,
    dropped_total: AtomicU64,
}

impl SubscriptionManager {
    /// Creates a manager whose subscriptions end when `scope` is cancelled.
    #[must_use]
    pub fn new(scope: CancellationToken, capacity: usize) -> Self {
        Self {
            slots: DashMap::new(),
            ready: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            capacity: capacity.max(1),
            scope,
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Allocates a fresh subscription in the pending state.
    pub(crate) fn create(self: &Arc<Self>, namespace: &Arc<str>) -> Subscription {
        loop {
            if let Entry::Vacant(vacant) = self.slots.entry(new_subscription_id()) {
                let slot = Arc::new(SubscriptionSlot {
                    id: vacant.key().clone(),
                    namespace: Arc::clone(namespace),
                    token: self.scope.child_token(),
                    queue: Mutex::new(VecDeque::new()),
                    active: AtomicBool::new(false),
                    scheduled: AtomicBool::new(false),
                    dropped: AtomicU64::new(0),
                });
                vacant.insert(Arc::clone(&slot));
                debug!(subscription = %slot.id, namespace = %namespace, "subscription created");
                return Subscription::new(slot, Arc::downgrade(self));
            }
        }
    }

    /// Marks a subscription deliverable and flushes anything queued so far.
    ///
    /// Returns `false` if the id is unknown.
    pub fn activate(&self, id: &SubscriptionId) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        slot.active.store(true, Ordering::Release);
        let pending = !slot.queue.lock().is_empty();
        if pending {
            self.schedule(&slot);
        }
        true
    }

    /// Queues `payload` for delivery.
    ///
    /// Returns `false` if the subscription is unknown or already cancelled;
    /// the payload is discarded in that case.
    pub fn deliver(&self, id: &SubscriptionId, payload: Value) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        if slot.token.is_cancelled() {
            return false;
        }
        {
            let mut queue = slot.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                slot.dropped.fetch_add(1, Ordering::Relaxed);
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("callgate_notifications_dropped_total").increment(1);
                trace!(subscription = %id, "notification queue full, dropped oldest");
            }
            queue.push_back(payload);
        }
        if slot.active.load(Ordering::Acquire) {
            self.schedule(&slot);
        }
        true
    }

    /// Ends one subscription. Returns `false` if it was not live.
    pub fn cancel(&self, id: &SubscriptionId) -> bool {
        match self.slots.remove(id) {
            Some((_, slot)) => {
                slot.token.cancel();
                slot.queue.lock().clear();
                debug!(subscription = %id, "subscription cancelled");
                true
            }
            None => false,
        }
    }

    /// Ends every subscription and stops the delivery task.
    pub fn close_all(&self) {
        self.scope.cancel();
        self.slots.clear();
        self.ready.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Payloads discarded by the queue bound since the manager was created.
    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Moves queued payloads to `outbound` until the manager is closed or the
    /// channel goes away.
    pub async fn run_delivery(self: Arc<Self>, outbound: mpsc::Sender<OutboundMessage>) {
        loop {
            tokio::select! {
                biased;
                () = self.scope.cancelled() => return,
                () = self.wake.notified() => {}
            }

            loop {
                let next = self.ready.lock().pop_front();
                let Some(slot) = next else { break };
                slot.scheduled.store(false, Ordering::Release);
                let pending: Vec<Value> = slot.queue.lock().drain(..).collect();

                for payload in pending {
                    if slot.token.is_cancelled() {
                        break;
                    }
                    let message = OutboundMessage::Notification {
                        namespace: slot.namespace.to_string(),
                        subscription: slot.id.clone(),
                        payload,
                    };
                    tokio::select! {
                        biased;
                        () = self.scope.cancelled() => return,
                        sent = outbound.send(message) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    fn slot(&self, id: &SubscriptionId) -> Option<Arc<SubscriptionSlot>> {
        self.slots.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn schedule(&self, slot: &Arc<SubscriptionSlot>) {
        if !slot.scheduled.swap(true, Ordering::AcqRel) {
            self.ready.lock().push_back(Arc::clone(slot));
            self.wake.notify_one();
        }
    }
}

/// `0x` followed by 16 random bytes in hex.
fn new_subscription_id() -> SubscriptionId {
    let bytes: [u8; 16] = rand::random();
    SubscriptionId(format!("0x{}", hex::encode(bytes)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
