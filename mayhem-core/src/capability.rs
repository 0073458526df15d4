//! Static capability tables.
//!
//! A table maps each operation a resource kind can perform to the fault type
//! it injects, plus an optional corrective operation. Tables are built once per
//! kind (from configuration or code) and shared by every resource of that kind.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::IteratorRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::{FaultType, OperationName};

/// One registered fault operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub operation: OperationName,
    pub fault_type: FaultType,
    /// Operation that undoes this fault when the resource does not recover alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_healing: Option<OperationName>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityTable {
    entries: BTreeMap<OperationName, Capability>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, operation: impl Into<OperationName>, fault_type: FaultType) -> Self {
        self.register(Capability {
            operation: operation.into(),
            fault_type,
            self_healing: None,
        });
        self
    }

    pub fn with_self_healing(
        mut self,
        operation: impl Into<OperationName>,
        fault_type: FaultType,
        self_healing: impl Into<OperationName>,
    ) -> Self {
        self.register(Capability {
            operation: operation.into(),
            fault_type,
            self_healing: Some(self_healing.into()),
        });
        self
    }

    pub fn register(&mut self, capability: Capability) {
        self.entries.insert(capability.operation.clone(), capability);
    }

    pub fn get(&self, operation: &OperationName) -> Option<&Capability> {
        self.entries.get(operation)
    }

    pub fn supports(&self, operation: &OperationName) -> bool {
        self.entries.contains_key(operation)
    }

    pub fn supported_fault_types(&self) -> BTreeSet<FaultType> {
        self.entries.values().map(|c| c.fault_type).collect()
    }

    pub fn operations(&self) -> impl Iterator<Item = &OperationName> {
        self.entries.keys()
    }

    pub fn operations_for(&self, fault_type: FaultType) -> impl Iterator<Item = &OperationName> {
        self.entries
            .values()
            .filter(move |c| c.fault_type == fault_type)
            .map(|c| &c.operation)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Pick an operation: a fault type is drawn uniformly among the supported
    /// ones (or the requested one is used), then an operation uniformly within it.
    pub fn choose<R: Rng + ?Sized>(
        &self,
        fault_type: Option<FaultType>,
        rng: &mut R,
    ) -> Option<OperationName> {
        let fault_type = match fault_type {
            Some(fault_type) => fault_type,
            None => self.supported_fault_types().into_iter().choose(rng)?,
        };
        self.operations_for(fault_type).choose(rng).cloned()
    }
}
