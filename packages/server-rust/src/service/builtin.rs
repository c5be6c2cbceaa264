//! The metadata service every server registers for itself.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use super::descriptor::{MethodDecl, Reply, ReturnSlot, RpcService, ServiceDescriptor};
use super::registry::ServiceRegistry;

/// Service name of the metadata service.
pub const METADATA_SERVICE: &str = "rpc";

/// Version string reported for every registered module.
pub const MODULE_VERSION: &str = "1.0";

/// Answers `rpc_modules` with the names of all registered services.
pub struct RpcInfo {
    registry: Weak<ServiceRegistry>,
}

impl RpcInfo {
    #[must_use]
    pub fn new(registry: &Arc<ServiceRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }

    /// Service name to version, for every service currently registered.
    #[must_use]
    pub fn modules(&self) -> BTreeMap<String, String> {
        self.registry
            .upgrade()
            .map(|registry| {
                registry
                    .names()
                    .into_iter()
                    .map(|name| (name, MODULE_VERSION.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl RpcService for RpcInfo {
    fn describe(self: Arc<Self>) -> ServiceDescriptor<Self> {
        ServiceDescriptor::exported(self).method(
            MethodDecl::new("Modules", |info: Arc<Self>, _call| async move {
                Reply::json(&info.modules())
            })
            .returns(ReturnSlot::value::<BTreeMap<String, String>>()),
        )
    }
}
