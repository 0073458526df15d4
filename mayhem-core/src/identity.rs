//! Resource identity fingerprints.
//!
//! Each resource kind declares the fields that identify the real-world entity
//! (instance id, engine, resource id, ...). Transient readings such as health
//! or status never participate. Fields are kept sorted by name so the
//! fingerprint does not depend on declaration order.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::types::ResourceIdentity;

/// Ordered set of identity-contributing fields for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityFields {
    fields: BTreeMap<String, String>,
}

impl IdentityFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Absent values are skipped rather than hashed as empty strings.
    pub fn with_opt(self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with(name, value),
            None => self,
        }
    }

    pub fn extend<I, K, V>(mut self, iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in iter {
            self.fields.insert(k.into(), v.into());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// SHA-256 over `kind` and every `name=value` pair, NUL-separated.
    pub fn fingerprint(&self, kind: &str) -> ResourceIdentity {
        let mut h = Sha256::new();
        h.update(kind.as_bytes());
        h.update([0u8]);
        for (name, value) in &self.fields {
            h.update(name.as_bytes());
            h.update(b"=");
            h.update(value.as_bytes());
            h.update([0u8]);
        }
        ResourceIdentity(hex::encode(h.finalize()))
    }
}
