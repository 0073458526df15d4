//! Experimentable resources.
//!
//! [`Resource`] is implemented per resource kind and talks to the backend
//! client. [`TrackedResource`] is the registry entry wrapping it: it owns the
//! last observed health, the last invoked operation and the claim held by the
//! experiment currently disrupting it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use crate::capability::CapabilityTable;
use crate::error::ChaosError;
use crate::identity::IdentityFields;
use crate::types::{
    AggregationKey, BackendType, ExperimentId, FaultType, OperationName, ResourceHealth,
    ResourceIdentity,
};

pub type HealthCheck = Box<dyn Fn() -> Result<ResourceHealth, ChaosError> + Send + Sync>;
pub type Action = Box<dyn Fn() -> Result<(), ChaosError> + Send + Sync>;

/// Recovery strategy returned by a fault operation.
///
/// Set once when the experiment starts and never replaced afterwards.
#[derive(Default)]
pub struct Recovery {
    health_check: Option<HealthCheck>,
    self_healing: Option<Action>,
    finalize: Option<Action>,
}

impl Recovery {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_health_check<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<ResourceHealth, ChaosError> + Send + Sync + 'static,
    {
        self.health_check = Some(Box::new(f));
        self
    }

    pub fn with_self_healing<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<(), ChaosError> + Send + Sync + 'static,
    {
        self.self_healing = Some(Box::new(f));
        self
    }

    pub fn with_finalize<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<(), ChaosError> + Send + Sync + 'static,
    {
        self.finalize = Some(Box::new(f));
        self
    }

    pub fn health_check(&self) -> Option<&HealthCheck> {
        self.health_check.as_ref()
    }

    pub fn self_healing(&self) -> Option<&Action> {
        self.self_healing.as_ref()
    }

    pub fn finalize(&self) -> Option<&Action> {
        self.finalize.as_ref()
    }

    pub fn has_self_healing(&self) -> bool {
        self.self_healing.is_some()
    }
}

impl fmt::Debug for Recovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recovery")
            .field("health_check", &self.health_check.is_some())
            .field("self_healing", &self.self_healing.is_some())
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

/// One experimentable real-world entity, as exposed by its backend.
pub trait Resource: Send + Sync + fmt::Debug {
    /// Kind within the backend (e.g. `db-instance`, `db-cluster`).
    fn kind(&self) -> &str;

    /// Backend-native identifier (instance id, cluster name, ...).
    fn unique_key(&self) -> &str;

    /// Immutable, backend-reported attributes that identify this entity.
    fn identity_fields(&self) -> IdentityFields;

    fn aggregation_key(&self) -> AggregationKey {
        AggregationKey::ungrouped()
    }

    fn capabilities(&self) -> &CapabilityTable;

    /// Read current health from the backend. Must not change any state.
    fn check_health(&self) -> Result<ResourceHealth, ChaosError>;

    /// Perform `operation` against the real resource.
    fn invoke(&self, operation: &OperationName) -> Result<Recovery, ChaosError>;

    /// `(minimum, maximum)` experiment duration for `operation`, when it
    /// differs from the engine defaults.
    fn duration_bounds(&self, _operation: &OperationName) -> Option<(Duration, Duration)> {
        None
    }

    fn display_name(&self) -> String {
        self.unique_key().to_string()
    }

    fn identity(&self) -> ResourceIdentity {
        self.identity_fields().fingerprint(self.kind())
    }
}

/// Registry entry for one resource.
pub struct TrackedResource {
    backend_type: BackendType,
    identity: ResourceIdentity,
    inner: Box<dyn Resource>,
    health: RwLock<ResourceHealth>,
    last_operation: Mutex<Option<OperationName>>,
    claim: Mutex<Option<ExperimentId>>,
}

impl TrackedResource {
    pub fn new(backend_type: BackendType, inner: Box<dyn Resource>) -> Self {
        let identity = inner.identity();
        Self {
            backend_type,
            identity,
            inner,
            health: RwLock::new(ResourceHealth::Normal),
            last_operation: Mutex::new(None),
            claim: Mutex::new(None),
        }
    }

    pub fn backend_type(&self) -> &BackendType {
        &self.backend_type
    }

    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    pub fn resource(&self) -> &dyn Resource {
        self.inner.as_ref()
    }

    pub fn kind(&self) -> &str {
        self.inner.kind()
    }

    pub fn unique_key(&self) -> &str {
        self.inner.unique_key()
    }

    pub fn display_name(&self) -> String {
        self.inner.display_name()
    }

    pub fn aggregation_key(&self) -> AggregationKey {
        self.inner.aggregation_key()
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        self.inner.capabilities()
    }

    pub fn duration_bounds(&self, operation: &OperationName) -> Option<(Duration, Duration)> {
        self.inner.duration_bounds(operation)
    }

    pub fn supported_fault_types(&self) -> BTreeSet<FaultType> {
        self.inner.capabilities().supported_fault_types()
    }

    /// Last observed health.
    pub fn health(&self) -> ResourceHealth {
        *self.health.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Query the backend and record the reading.
    pub fn refresh_health(&self) -> Result<ResourceHealth, ChaosError> {
        let health = self.inner.check_health()?;
        self.record_health(health);
        Ok(health)
    }

    pub(crate) fn record_health(&self, health: ResourceHealth) {
        let mut guard = self.health.write().unwrap_or_else(PoisonError::into_inner);
        if *guard != health {
            tracing::debug!(
                resource = %self.display_name(),
                from = %*guard,
                to = %health,
                "resource health changed",
            );
        }
        *guard = health;
    }

    pub fn last_operation(&self) -> Option<OperationName> {
        self.last_operation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark the resource as under experiment and invoke `operation`.
    ///
    /// On failure the previous health reading is restored.
    pub(crate) fn begin_experiment(&self, operation: &OperationName) -> Result<Recovery, ChaosError> {
        if !self.inner.capabilities().supports(operation) {
            return Err(ChaosError::UnknownOperation {
                resource_type: self.kind().to_string(),
                operation: operation.0.clone(),
            });
        }
        let previous = self.health();
        self.record_health(ResourceHealth::RunningExperiment);
        match self.inner.invoke(operation) {
            Ok(recovery) => {
                *self.last_operation.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(operation.clone());
                Ok(recovery)
            }
            Err(err) => {
                self.record_health(previous);
                Err(err)
            }
        }
    }

    /// Re-invoke the last operation without choosing a new one.
    pub(crate) fn repeat_experiment(&self) -> Result<Recovery, ChaosError> {
        let Some(operation) = self.last_operation() else {
            return Err(ChaosError::IllegalState(format!(
                "no prior experiment to repeat on {}",
                self.display_name()
            )));
        };
        self.record_health(ResourceHealth::RunningExperiment);
        self.inner.invoke(&operation)
    }

    /// Take the experiment claim. Returns `false` if another experiment holds it.
    pub fn try_claim(&self, experiment: ExperimentId) -> bool {
        let mut guard = self.claim.lock().unwrap_or_else(PoisonError::into_inner);
        match *guard {
            Some(holder) if holder != experiment => false,
            _ => {
                *guard = Some(experiment);
                true
            }
        }
    }

    /// Release the claim if `experiment` holds it.
    pub fn release(&self, experiment: ExperimentId) {
        let mut guard = self.claim.lock().unwrap_or_else(PoisonError::into_inner);
        if *guard == Some(experiment) {
            *guard = None;
        }
    }

    pub fn claimed_by(&self) -> Option<ExperimentId> {
        *self.claim.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by().is_some()
    }
}

impl fmt::Debug for TrackedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedResource")
            .field("backend_type", &self.backend_type)
            .field("identity", &self.identity.short())
            .field("resource", &self.inner)
            .field("health", &self.health())
            .finish()
    }
}

/// Shared handle to a registry entry.
pub type ResourceRef = Arc<TrackedResource>;

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::{tracked, FakeResource};
    use super::*;

    #[test]
    fn begin_experiment_marks_resource_running() {
        let r = tracked("i-1");
        r.begin_experiment(&OperationName::from("restart")).unwrap();
        assert_eq!(r.health(), ResourceHealth::RunningExperiment);
        assert_eq!(r.last_operation(), Some(OperationName::from("restart")));
    }

    #[test]
    fn unsupported_operation_is_rejected_without_touching_health() {
        let r = tracked("i-1");
        let err = r.begin_experiment(&OperationName::from("explode")).unwrap_err();
        assert!(matches!(err, ChaosError::UnknownOperation { .. }), "got: {err}");
        assert_eq!(r.health(), ResourceHealth::Normal);
    }

    #[test]
    fn failed_invoke_restores_previous_health() {
        let mut fake = FakeResource::new("i-1");
        fake.fail_invoke = true;
        let r = TrackedResource::new(BackendType::from("fake"), Box::new(fake));
        assert!(r.begin_experiment(&OperationName::from("restart")).is_err());
        assert_eq!(r.health(), ResourceHealth::Normal);
        assert_eq!(r.last_operation(), None);
    }

    #[test]
    fn repeat_without_prior_start_is_illegal() {
        let r = tracked("i-1");
        let err = r.repeat_experiment().unwrap_err();
        assert!(matches!(err, ChaosError::IllegalState(_)), "got: {err}");
    }

    #[test]
    fn repeat_reinvokes_last_operation() {
        let fake = FakeResource::new("i-1");
        let calls = fake.invocations.clone();
        let r = TrackedResource::new(BackendType::from("fake"), Box::new(fake));
        r.begin_experiment(&OperationName::from("restart")).unwrap();
        r.repeat_experiment().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let r = tracked("i-1");
        let a = ExperimentId::new();
        let b = ExperimentId::new();
        assert!(r.try_claim(a));
        assert!(!r.try_claim(b));
        r.release(b);
        assert_eq!(r.claimed_by(), Some(a));
        r.release(a);
        assert!(r.try_claim(b));
    }

    #[test]
    fn refresh_records_backend_reading() {
        let fake = FakeResource::new("i-1");
        let health = fake.health.clone();
        let r = TrackedResource::new(BackendType::from("fake"), Box::new(fake));
        *health.lock().unwrap() = ResourceHealth::DoesNotExist;
        assert_eq!(r.refresh_health().unwrap(), ResourceHealth::DoesNotExist);
        assert_eq!(r.health(), ResourceHealth::DoesNotExist);
    }
}
