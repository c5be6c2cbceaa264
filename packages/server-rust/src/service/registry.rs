//! Name-to-catalogue registry with additive merging.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::callback::Callback;
use super::catalogue::{ScannedService, ServiceCatalogue};
use super::descriptor::RpcService;

// ---------------------------------------------------------------------------
// RegistrationError
// ---------------------------------------------------------------------------

/// Why a service object could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("no service name for type {type_name}")]
    EmptyName { type_name: &'static str },
    #[error("{type_name} is not exported")]
    NotExported { type_name: &'static str },
    #[error("service {type_name} doesn't have any suitable methods/subscriptions to expose")]
    NoUsableMethods { type_name: &'static str },
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Name-keyed catalogue of registered services.
///
/// Lookups hand out `Arc<ServiceCatalogue>` snapshots, so a call resolved
/// before a concurrent registration keeps the catalogue it saw.
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceCatalogue>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Registers every eligible method of `service` under `name`.
    ///
    /// Registering again under an existing name adds to that catalogue.
    ///
    /// # Errors
    ///
    /// Fails without touching the registry if the name is empty, the type is
    /// not exported, or no method passes the eligibility rules.
    pub fn register<T: RpcService>(
        &self,
        name: &str,
        service: Arc<T>,
    ) -> Result<(), RegistrationError> {
        let descriptor = service.describe();
        let type_name = descriptor.type_name();
        if name.is_empty() {
            return Err(RegistrationError::EmptyName { type_name });
        }
        if !descriptor.is_exported() {
            return Err(RegistrationError::NotExported { type_name });
        }

        let scanned = scan(name, descriptor);
        if scanned.is_empty() {
            return Err(RegistrationError::NoUsableMethods { type_name });
        }

        let catalogue = match self.services.entry(name.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().type_id() != scanned.type_id {
                    warn!(
                        service = name,
                        previous = existing.get().type_name(),
                        incoming = type_name,
                        "merging methods of a different type into service"
                    );
                }
                let merged = Arc::new(existing.get().merged_with(scanned));
                existing.insert(Arc::clone(&merged));
                merged
            }
            Entry::Vacant(slot) => {
                let fresh = Arc::new(ServiceCatalogue::new(name, scanned));
                slot.insert(Arc::clone(&fresh));
                fresh
            }
        };

        info!(
            service = name,
            receiver = type_name,
            callbacks = catalogue.callback_count(),
            subscriptions = catalogue.subscription_count(),
            "registered service"
        );
        Ok(())
    }

    /// Snapshot of the catalogue registered under `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<ServiceCatalogue>> {
        self.services.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Sorted names of all registered services.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs every declared method through the eligibility rules.
fn scan<T: RpcService>(
    service_name: &str,
    descriptor: super::descriptor::ServiceDescriptor<T>,
) -> ScannedService {
    let type_name = descriptor.type_name();
    let type_id = descriptor.type_id();
    let (receiver, methods) = descriptor.into_bound();

    let mut scanned = ScannedService {
        type_name,
        type_id,
        callbacks: std::collections::HashMap::new(),
        subscriptions: std::collections::HashMap::new(),
    };
    for method in methods {
        match Callback::from_bound(&receiver, method) {
            Ok(callback) => {
                let table = if callback.is_subscription() {
                    &mut scanned.subscriptions
                } else {
                    &mut scanned.callbacks
                };
                table.insert(callback.name().to_string(), Arc::new(callback));
            }
            Err((method, reason)) => {
                debug!(service = service_name, method = %method, %reason, "skipping method");
            }
        }
    }
    scanned
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
