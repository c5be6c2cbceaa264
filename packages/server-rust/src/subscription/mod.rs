//! Server-pushed notification streams.
//!
//! A subscription callback creates a [`Subscription`] through the
//! [`Notifier`] in its call context and returns it. The dispatcher answers the
//! subscribe call with the subscription id and only then activates delivery,
//! so the client always sees the id before the first notification.
//!
//! A subscription is tied to its connection, not to the call that created
//! it: producers should watch [`Subscription::cancelled`], since the creating
//! call's context is cancelled as soon as the handler returns.

mod manager;

use std::fmt;
use std::sync::{Arc, Weak};

use callgate_core::SubscriptionId;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

pub use manager::SubscriptionManager;
pub(crate) use manager::SubscriptionSlot;

// ---------------------------------------------------------------------------
// NotifyError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The subscription was cancelled or its connection closed.
    #[error("subscription is no longer live")]
    Unsubscribed,
    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Creates subscriptions on the connection a call arrived on.
///
/// One notifier belongs to one call. Subscriptions it created that the call
/// does not hand back as its result are cancelled when the call ends.
#[derive(Clone)]
pub struct Notifier {
    manager: Arc<SubscriptionManager>,
    namespace: Arc<str>,
    created: Arc<Mutex<Vec<SubscriptionId>>>,
}

impl Notifier {
    pub(crate) fn new(manager: Arc<SubscriptionManager>, namespace: &str) -> Self {
        Self {
            manager,
            namespace: Arc::from(namespace),
            created: Arc::default(),
        }
    }

    /// Allocates a subscription. Notifications sent before the subscribe
    /// response is written are held back, subject to the queue bound.
    #[must_use]
    pub fn create_subscription(&self) -> Subscription {
        let subscription = self.manager.create(&self.namespace);
        self.created.lock().push(subscription.id().clone());
        subscription
    }

    /// Cancels every subscription this notifier created except `claimed`.
    pub(crate) fn release_unclaimed(&self, claimed: Option<&SubscriptionId>) {
        let created = std::mem::take(&mut *self.created.lock());
        for id in created.iter().filter(|id| Some(*id) != claimed) {
            if self.manager.cancel(id) {
                debug!(subscription = %id, "released subscription not returned by its call");
            }
        }
    }

    /// Service name notifications are published under.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("namespace", &self.namespace)
            .field("live", &self.manager.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Producer handle for one subscription.
#[derive(Clone)]
pub struct Subscription {
    slot: Arc<SubscriptionSlot>,
    manager: Weak<SubscriptionManager>,
}

impl Subscription {
    pub(crate) fn new(slot: Arc<SubscriptionSlot>, manager: Weak<SubscriptionManager>) -> Self {
        Self { slot, manager }
    }

    #[must_use]
    pub fn id(&self) -> &SubscriptionId {
        &self.slot.id
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.slot.namespace
    }

    /// Queues a notification. Never blocks; a full queue drops its oldest entry.
    ///
    /// # Errors
    ///
    /// `Unsubscribed` once the subscription has ended, `Encode` if the payload
    /// cannot be serialized.
    pub fn notify<T: Serialize + ?Sized>(&self, payload: &T) -> Result<(), NotifyError> {
        if self.is_cancelled() {
            return Err(NotifyError::Unsubscribed);
        }
        let value = serde_json::to_value(payload)?;
        let manager = self.manager.upgrade().ok_or(NotifyError::Unsubscribed)?;
        if manager.deliver(self.id(), value) {
            Ok(())
        } else {
            Err(NotifyError::Unsubscribed)
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.slot.token.is_cancelled()
    }

    /// Resolves when the client unsubscribes or the connection ends.
    pub async fn cancelled(&self) {
        self.slot.token.cancelled().await;
    }

    /// Notifications discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.slot.dropped()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.slot.id)
            .field("namespace", &self.slot.namespace)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
