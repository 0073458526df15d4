//! In-memory resource registry.
//!
//! # Keying
//!
//! ```text
//! (backend type, identity fingerprint) -> Arc<TrackedResource>
//! ```
//!
//! The first instance registered for an identity wins; later discoveries of the
//! same real resource get the existing entry back, so an in-flight experiment's
//! claim and health survive repeated discovery passes. Entries are never
//! removed: a resource that stops being discovered simply stops appearing in
//! rosters.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::resource::{Resource, ResourceRef, TrackedResource};
use crate::types::{BackendType, ResourceIdentity};

type RegistryKey = (BackendType, ResourceIdentity);

#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: RwLock<HashMap<RegistryKey, ResourceRef>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resource` if its identity is new. Returns whether it was added.
    pub fn offer(&self, resource: ResourceRef) -> bool {
        let key = (resource.backend_type().clone(), resource.identity().clone());
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) {
            return false;
        }
        tracing::debug!(
            backend = %key.0,
            identity = %key.1.short(),
            resource = %resource.display_name(),
            "registered new resource",
        );
        entries.insert(key, resource);
        true
    }

    /// Return the canonical entry for a freshly discovered resource, creating
    /// it if this identity has not been seen for `backend_type`.
    ///
    /// Lookup and insert happen under one write lock, so concurrent discoveries
    /// of the same entity always observe a single instance.
    pub fn register(&self, backend_type: &BackendType, resource: Box<dyn Resource>) -> ResourceRef {
        let identity = resource.identity();
        let key = (backend_type.clone(), identity);
        if let Some(existing) = self.lookup(&key) {
            return existing;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(key)
            .or_insert_with(|| {
                let tracked = Arc::new(TrackedResource::new(backend_type.clone(), resource));
                tracing::debug!(
                    backend = %backend_type,
                    identity = %tracked.identity().short(),
                    resource = %tracked.display_name(),
                    "registered new resource",
                );
                tracked
            })
            .clone()
    }

    pub fn find(&self, backend_type: &BackendType, identity: &ResourceIdentity) -> Option<ResourceRef> {
        self.lookup(&(backend_type.clone(), identity.clone()))
    }

    /// Find by identity fingerprint or by backend-native key.
    pub fn find_by_key(&self, backend_type: &BackendType, key: &str) -> Option<ResourceRef> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|((ty, _), _)| ty == backend_type)
            .map(|(_, r)| r)
            .find(|r| r.identity().0 == key || r.unique_key() == key)
            .cloned()
    }

    pub fn resources(&self, backend_type: &BackendType) -> Vec<ResourceRef> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = entries
            .iter()
            .filter(|((ty, _), _)| ty == backend_type)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by(|a, b| a.unique_key().cmp(b.unique_key()));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &RegistryKey) -> Option<ResourceRef> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
