//! Server stop signal and in-flight call accounting.
//!
//! `stop()` on the server flips the controller to `Stopping`: codecs stop
//! reading, new codecs are refused, and calls already running are allowed to
//! finish. Each running call holds an [`InFlightGuard`]; the controller reaches
//! `Stopped` once the last guard drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// Lifecycle of a server.
///
/// State machine: Running -> Stopping -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Accepting codecs and requests.
    Running,
    /// Stop requested; in-flight calls are finishing.
    Stopping,
    /// Stop requested and no calls remain.
    Stopped,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Broadcasts the stop request and tracks calls that are still running.
#[derive(Debug)]
pub struct ShutdownController {
    stop_signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
    health_state: ArcSwap<HealthState>,
}

impl ShutdownController {
    /// Creates a controller in the `Running` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            stop_signal: tx,
            in_flight: Arc::new(InFlight::default()),
            health_state: ArcSwap::from_pointee(HealthState::Running),
        }
    }

    /// Moves to `Stopping` and wakes every [`stopping`](Self::stopping) waiter.
    /// Later calls are no-ops.
    pub fn trigger_shutdown(&self) {
        if self.health_state() == HealthState::Running {
            self.health_state.store(Arc::new(HealthState::Stopping));
        }
        self.stop_signal.send_replace(true);
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health_state.load()
    }

    /// Whether new codecs and requests may still be taken on.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !*self.stop_signal.borrow()
    }

    /// Resolves once a stop has been requested. Cancel-safe.
    pub async fn stopping(&self) {
        let mut rx = self.stop_signal.subscribe();
        // The sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Counts a call as in flight until the guard drops, panics included.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no call is in flight, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` if the count reached zero after a
    /// stop was requested; returns `false` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.in_flight.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.in_flight_count() == 0 {
                if !self.is_accepting() {
                    self.health_state.store(Arc::new(HealthState::Stopped));
                }
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return false;
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop and wakes drain waiters at zero.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running_and_accepting() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Running);
        assert!(controller.is_accepting());
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[test]
    fn trigger_shutdown_is_idempotent() {
        let controller = ShutdownController::new();
        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Stopping);
        assert!(!controller.is_accepting());

        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Stopping);
    }

    #[test]
    fn in_flight_guard_counts() {
        let controller = ShutdownController::new();
        let first = controller.in_flight_guard();
        let second = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(first);
        assert_eq!(controller.in_flight_count(), 1);
        drop(second);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn stopping_resolves_after_trigger() {
        let controller = Arc::new(ShutdownController::new());
        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.stopping().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        controller.trigger_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stopping() did not resolve")
            .unwrap();

        // Already stopped: resolves immediately.
        controller.stopping().await;
    }

    #[tokio::test]
    async fn drain_completes_when_last_guard_drops() {
        let controller = ShutdownController::new();
        let guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_call_running() {
        let controller = ShutdownController::new();
        let _guard = controller.in_flight_guard();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(controller.health_state(), HealthState::Stopping);
    }

    #[tokio::test]
    async fn idle_drain_without_stop_keeps_running() {
        let controller = ShutdownController::new();
        assert!(controller.wait_for_drain(Duration::from_millis(10)).await);
        assert_eq!(controller.health_state(), HealthState::Running);
    }
}
