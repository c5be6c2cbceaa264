use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::subscription::Notifier;

/// Per-call context handed to methods that declare a context parameter.
///
/// The scope is a child of the connection scope: it is cancelled when the
/// connection closes, when the server cancels outstanding work, or when the
/// call itself has finished.
#[derive(Clone)]
pub struct CallContext {
    scope: CancellationToken,
    notifier: Notifier,
}

impl CallContext {
    pub(crate) fn new(scope: CancellationToken, notifier: Notifier) -> Self {
        Self { scope, notifier }
    }

    #[must_use]
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Resolves when the call's scope is cancelled.
    pub async fn cancelled(&self) {
        self.scope.cancelled().await;
    }

    /// Creates subscriptions on the connection this call arrived on.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("cancelled", &self.scope.is_cancelled())
            .field("notifier", &self.notifier)
            .finish()
    }
}
