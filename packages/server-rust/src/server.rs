//! The server: service registration plus the lifecycle of served codecs.

use std::sync::Arc;
use std::time::Duration;

use callgate_core::ServerCodec;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, SessionEnd};
use crate::network::{CodecRegistry, HealthState, ShutdownController};
use crate::service::{RegistrationError, RpcInfo, RpcService, ServiceRegistry, METADATA_SERVICE};

/// Serves registered services over any number of codecs.
///
/// Share it behind an `Arc` and call [`serve_codec`](Self::serve_codec) once
/// per connection.
pub struct Server {
    config: Arc<ServerConfig>,
    registry: Arc<ServiceRegistry>,
    codecs: CodecRegistry,
    shutdown: Arc<ShutdownController>,
    root: CancellationToken,
}

impl Server {
    /// Creates a server with the `rpc` metadata service already registered.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ServiceRegistry::new());
        if let Err(error) = registry.register(METADATA_SERVICE, Arc::new(RpcInfo::new(&registry))) {
            warn!(%error, "failed to register metadata service");
        }
        Self {
            config: Arc::new(config),
            registry,
            codecs: CodecRegistry::new(),
            shutdown: Arc::new(ShutdownController::new()),
            root: CancellationToken::new(),
        }
    }

    /// Registers `service` under `name`. See [`ServiceRegistry::register`].
    ///
    /// # Errors
    ///
    /// Returns the registration error unchanged.
    pub fn register_name<T: RpcService>(
        &self,
        name: &str,
        service: Arc<T>,
    ) -> Result<(), RegistrationError> {
        self.registry.register(name, service)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serves one codec until it closes or the server stops.
    ///
    /// A codec handed in after [`stop`](Self::stop) is closed immediately.
    pub async fn serve_codec(&self, codec: Arc<dyn ServerCodec>) -> SessionEnd {
        if !self.shutdown.is_accepting() {
            codec.close().await;
            return SessionEnd::ServerStopped;
        }

        let handle = self.codecs.register(codec, self.root.child_token());
        info!(connection = %handle.id, live = self.codecs.count(), "serving codec");

        let dispatcher = Dispatcher::new(
            &handle,
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
            Arc::clone(&self.shutdown),
        );
        let end = dispatcher.run().await;

        self.codecs.remove(handle.id);
        info!(connection = %handle.id, ?end, "codec finished");
        end
    }

    /// Stops reading from every codec and refuses new ones. Calls already
    /// running are given the configured drain timeout to finish.
    pub fn stop(&self) {
        info!(live = self.codecs.count(), "stopping server");
        self.shutdown.trigger_shutdown();
    }

    /// Waits for in-flight calls and live codecs to finish, up to `timeout`.
    ///
    /// On timeout every remaining codec is closed and `false` is returned.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut drained = self.shutdown.wait_for_drain(timeout).await;

        while drained && self.codecs.count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                drained = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        if !drained {
            let remaining = self.codecs.drain_all();
            warn!(remaining = remaining.len(), "drain timed out, closing codecs");
            for handle in remaining {
                handle.close().await;
            }
        }
        drained
    }

    /// Number of codecs currently being served.
    #[must_use]
    pub fn live_codecs(&self) -> usize {
        self.codecs.count()
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.shutdown.in_flight_count()
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        self.shutdown.health_state()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
