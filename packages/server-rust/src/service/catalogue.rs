//! Per-service method tables: what a registration scanned and the merged,
//! immutable catalogue readers look methods up in.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use super::callback::Callback;

/// Methods collected from one service object, split by kind.
#[derive(Debug, Clone)]
pub(crate) struct ScannedService {
    pub(crate) type_name: &'static str,
    pub(crate) type_id: TypeId,
    pub(crate) callbacks: HashMap<String, Arc<Callback>>,
    pub(crate) subscriptions: HashMap<String, Arc<Callback>>,
}

impl ScannedService {
    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.subscriptions.is_empty()
    }
}

/// Everything callable under one service name.
///
/// Catalogues are immutable once published; a later registration under the
/// same name produces a new merged catalogue.
#[derive(Debug, Clone)]
pub struct ServiceCatalogue {
    name: String,
    type_name: &'static str,
    type_id: TypeId,
    callbacks: HashMap<String, Arc<Callback>>,
    subscriptions: HashMap<String, Arc<Callback>>,
}

impl ServiceCatalogue {
    pub(crate) fn new(name: &str, scanned: ScannedService) -> Self {
        Self {
            name: name.to_string(),
            type_name: scanned.type_name,
            type_id: scanned.type_id,
            callbacks: scanned.callbacks,
            subscriptions: scanned.subscriptions,
        }
    }

    /// Adds `scanned` on top of this catalogue. Entries with an equal wire
    /// name are replaced; the receiver type reported is the newest one.
    pub(crate) fn merged_with(&self, scanned: ScannedService) -> Self {
        let mut merged = self.clone();
        merged.type_name = scanned.type_name;
        merged.type_id = scanned.type_id;
        merged.callbacks.extend(scanned.callbacks);
        merged.subscriptions.extend(scanned.subscriptions);
        merged
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type name of the most recently registered receiver.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[must_use]
    pub fn callback(&self, method: &str) -> Option<&Arc<Callback>> {
        self.callbacks.get(method)
    }

    #[must_use]
    pub fn subscription(&self, name: &str) -> Option<&Arc<Callback>> {
        self.subscriptions.get(name)
    }

    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Sorted wire names of plain callbacks.
    #[must_use]
    pub fn callback_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.callbacks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Sorted wire names of subscription callbacks.
    #[must_use]
    pub fn subscription_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.subscriptions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
