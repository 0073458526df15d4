//! Experiment lifecycle.
//!
//! ```text
//! CREATED -> RUNNING -> VERIFYING -> FINALIZED
//!                          |  ^
//!                          v  |
//!                      SELF_HEALING
//! (any non-terminal) -> FAILED
//! ```
//!
//! The state machine is driven entirely by [`Experiment::poll`]; every
//! time-dependent call takes the current [`Instant`] so tests can step a
//! virtual clock. The experiment holds its resource's claim from
//! [`ExperimentBuilder::build`] until it reaches a terminal state or is
//! dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChaosError;
use crate::notification::{dispatch, EventKind, ExperimentEvent, Notifier, TracingNotifier};
use crate::resource::{Recovery, ResourceRef};
use crate::types::{
    AggregationKey, BackendType, ExperimentId, ExperimentState, FaultType, OperationName,
    ResourceHealth, ResourceIdentity,
};

/// Timing policy for one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExperimentTiming {
    /// No verification before this much time has passed since start.
    pub minimum: Duration,
    /// Self-healing may be triggered once this has elapsed.
    pub maximum: Duration,
    /// Grace period after `maximum` before the experiment is failed.
    pub finalization: Duration,
    pub poll_interval_min: Duration,
    pub poll_interval_max: Duration,
}

impl ExperimentTiming {
    /// Elapsed time at which a still-unhealthy resource fails the experiment.
    pub fn deadline(&self) -> Duration {
        self.maximum + self.finalization
    }
}

impl Default for ExperimentTiming {
    fn default() -> Self {
        Self {
            minimum: Duration::from_secs(30),
            maximum: Duration::from_secs(300),
            finalization: Duration::from_secs(60),
            poll_interval_min: Duration::from_secs(1),
            poll_interval_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Still unhealthy after maximum + finalization.
    Timeout,
    /// The backend reported the resource gone.
    ResourceVanished,
    /// Stopped by shutdown or an operator abort.
    Abandoned,
}

/// Serializable point-in-time view of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSnapshot {
    pub id: ExperimentId,
    pub backend_type: BackendType,
    pub resource_identity: ResourceIdentity,
    pub resource_name: String,
    pub aggregation_key: AggregationKey,
    pub fault_type: Option<FaultType>,
    pub operation: Option<OperationName>,
    pub state: ExperimentState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub self_healing_attempted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health: Option<ResourceHealth>,
    pub polls: u32,
    pub repeats: u32,
}

pub struct ExperimentBuilder {
    resource: ResourceRef,
    operation: Option<OperationName>,
    fault_type: Option<FaultType>,
    timing: ExperimentTiming,
    notifier: Arc<dyn Notifier>,
}

impl ExperimentBuilder {
    /// Run exactly this operation instead of choosing one.
    pub fn operation(mut self, operation: impl Into<OperationName>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Restrict the random choice to one fault type.
    pub fn fault_type(mut self, fault_type: FaultType) -> Self {
        self.fault_type = Some(fault_type);
        self
    }

    pub fn timing(mut self, timing: ExperimentTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Claim the resource and create the experiment in `CREATED`.
    pub fn build(self) -> Result<Experiment, ChaosError> {
        let id = ExperimentId::new();
        if !self.resource.try_claim(id) {
            let holder = self
                .resource
                .claimed_by()
                .map(|h| h.to_string())
                .unwrap_or_default();
            return Err(ChaosError::IllegalState(format!(
                "{} is already under experiment {holder}",
                self.resource.display_name()
            )));
        }
        Ok(Experiment {
            id,
            resource: self.resource,
            operation: self.operation,
            fault_type: self.fault_type,
            timing: self.timing,
            notifier: self.notifier,
            state: ExperimentState::Created,
            recovery: Recovery::none(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            start_instant: None,
            finished_instant: None,
            self_healing_attempted: false,
            failure: None,
            last_health: None,
            polls: 0,
            repeats: 0,
        })
    }
}

pub struct Experiment {
    id: ExperimentId,
    resource: ResourceRef,
    operation: Option<OperationName>,
    fault_type: Option<FaultType>,
    timing: ExperimentTiming,
    notifier: Arc<dyn Notifier>,
    state: ExperimentState,
    recovery: Recovery,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    start_instant: Option<Instant>,
    finished_instant: Option<Instant>,
    self_healing_attempted: bool,
    failure: Option<FailureReason>,
    last_health: Option<ResourceHealth>,
    polls: u32,
    repeats: u32,
}

impl Experiment {
    pub fn builder(resource: ResourceRef) -> ExperimentBuilder {
        ExperimentBuilder {
            resource,
            operation: None,
            fault_type: None,
            timing: ExperimentTiming::default(),
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn id(&self) -> ExperimentId {
        self.id
    }

    pub fn state(&self) -> ExperimentState {
        self.state
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn operation(&self) -> Option<&OperationName> {
        self.operation.as_ref()
    }

    pub fn fault_type(&self) -> Option<FaultType> {
        self.fault_type
    }

    pub fn timing(&self) -> &ExperimentTiming {
        &self.timing
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn self_healing_attempted(&self) -> bool {
        self.self_healing_attempted
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Monotonic time the experiment reached a terminal state.
    pub fn finished_instant(&self) -> Option<Instant> {
        self.finished_instant
    }

    /// Pick (or validate) the operation, invoke it and move to `RUNNING`.
    ///
    /// On error the experiment stays in `CREATED` and nothing is recorded
    /// as started.
    pub fn start(&mut self, now: Instant) -> Result<(), ChaosError> {
        if self.state != ExperimentState::Created {
            return Err(ChaosError::IllegalState(format!(
                "experiment {} cannot start from {}",
                self.id, self.state
            )));
        }

        let capabilities = self.resource.capabilities();
        let operation = match &self.operation {
            Some(op) if !capabilities.supports(op) => {
                return Err(ChaosError::UnknownOperation {
                    resource_type: self.resource.kind().to_string(),
                    operation: op.0.clone(),
                });
            }
            Some(op) => op.clone(),
            None => capabilities
                .choose(self.fault_type, &mut rand::thread_rng())
                .ok_or_else(|| {
                    ChaosError::NoSupportedFaults(match self.fault_type {
                        Some(ft) => format!("{} (requested {ft})", self.resource.display_name()),
                        None => self.resource.display_name(),
                    })
                })?,
        };
        let fault_type = capabilities.get(&operation).map(|c| c.fault_type);

        let recovery = self.resource.begin_experiment(&operation)?;

        if let Some((minimum, maximum)) = self.resource.duration_bounds(&operation) {
            self.timing.minimum = minimum;
            self.timing.maximum = maximum;
        }
        self.operation = Some(operation);
        self.fault_type = fault_type;
        self.recovery = recovery;
        self.start_instant = Some(now);
        self.started_at = Some(Utc::now());
        self.transition(ExperimentState::Running);
        self.emit(EventKind::Started);
        Ok(())
    }

    /// Re-invoke the operation already in effect. The recovery strategy from
    /// the original start is kept.
    pub fn repeat(&mut self) -> Result<(), ChaosError> {
        if self.state == ExperimentState::Created || self.state.is_terminal() {
            return Err(ChaosError::IllegalState(format!(
                "experiment {} cannot repeat from {}",
                self.id, self.state
            )));
        }
        self.resource.repeat_experiment()?;
        self.repeats += 1;
        tracing::info!(experiment = %self.id, repeats = self.repeats, "operation repeated");
        Ok(())
    }

    /// Advance the state machine one step and return the resulting state.
    ///
    /// Polling a `CREATED` or terminal experiment is a no-op.
    pub fn poll(&mut self, now: Instant) -> ExperimentState {
        if self.state == ExperimentState::Created || self.state.is_terminal() {
            return self.state;
        }
        self.polls += 1;

        if self.state == ExperimentState::SelfHealing {
            self.run_self_healing();
            self.transition(ExperimentState::Verifying);
            return self.state;
        }

        let elapsed = self.elapsed(now);
        let reading = self.read_health();

        if reading == Some(ResourceHealth::DoesNotExist) {
            self.fail(FailureReason::ResourceVanished, now);
            return self.state;
        }

        if self.state == ExperimentState::Running {
            if elapsed < self.timing.minimum {
                return self.state;
            }
            self.transition(ExperimentState::Verifying);
        }

        if reading == Some(ResourceHealth::Normal) {
            self.finalize(now);
        } else if self.self_healing_pending() && elapsed >= self.timing.maximum {
            self.self_healing_attempted = true;
            self.transition(ExperimentState::SelfHealing);
            self.emit(EventKind::SelfHealingTriggered);
        } else if elapsed >= self.timing.deadline() {
            self.fail(FailureReason::Timeout, now);
        }
        self.state
    }

    /// How long to wait before the next [`Experiment::poll`].
    ///
    /// Exponential backoff between the configured poll bounds, cut short so
    /// the next timing milestone is never overshot.
    pub fn next_poll_delay(&self, now: Instant) -> Duration {
        let milestone = match self.state {
            ExperimentState::Running => self.timing.minimum,
            ExperimentState::Verifying if self.self_healing_pending() => self.timing.maximum,
            ExperimentState::Verifying => self.timing.deadline(),
            _ => return Duration::ZERO,
        };
        let exponent = self.polls.min(16);
        let backoff = self
            .timing
            .poll_interval_min
            .saturating_mul(1u32 << exponent)
            .min(self.timing.poll_interval_max);
        backoff.min(milestone.saturating_sub(self.elapsed(now)))
    }

    /// Force a terminal `FAILED` outcome. Returns `false` if already terminal.
    pub fn abandon(&mut self, now: Instant) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.fail(FailureReason::Abandoned, now);
        true
    }

    pub fn snapshot(&self) -> ExperimentSnapshot {
        ExperimentSnapshot {
            id: self.id,
            backend_type: self.resource.backend_type().clone(),
            resource_identity: self.resource.identity().clone(),
            resource_name: self.resource.display_name(),
            aggregation_key: self.resource.aggregation_key(),
            fault_type: self.fault_type,
            operation: self.operation.clone(),
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            failure: self.failure.clone(),
            self_healing_attempted: self.self_healing_attempted,
            last_health: self.last_health,
            polls: self.polls,
            repeats: self.repeats,
        }
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.start_instant
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    fn self_healing_pending(&self) -> bool {
        self.recovery.has_self_healing() && !self.self_healing_attempted
    }

    /// A failed check counts as "no reading"; the deadline still applies.
    fn read_health(&mut self) -> Option<ResourceHealth> {
        let result = match self.recovery.health_check() {
            Some(check) => check().map(|health| {
                self.resource.record_health(health);
                health
            }),
            None => self.resource.refresh_health(),
        };
        match result {
            Ok(health) => {
                self.last_health = Some(health);
                Some(health)
            }
            Err(err) => {
                tracing::warn!(experiment = %self.id, error = %err, "health check failed");
                None
            }
        }
    }

    fn run_self_healing(&self) {
        let Some(action) = self.recovery.self_healing() else {
            return;
        };
        tracing::info!(
            experiment = %self.id,
            resource = %self.resource.display_name(),
            "running self-healing",
        );
        if let Err(err) = action() {
            tracing::warn!(experiment = %self.id, error = %err, "self-healing failed");
        }
    }

    fn finalize(&mut self, now: Instant) {
        if let Some(action) = self.recovery.finalize() {
            if let Err(err) = action() {
                tracing::warn!(experiment = %self.id, error = %err, "finalize action failed");
            }
        }
        self.finish(ExperimentState::Finalized, now);
        self.emit(EventKind::Finalized);
    }

    fn fail(&mut self, reason: FailureReason, now: Instant) {
        self.failure = Some(reason);
        self.finish(ExperimentState::Failed, now);
        self.emit(EventKind::Failed);
    }

    fn finish(&mut self, state: ExperimentState, now: Instant) {
        self.transition(state);
        self.finished_at = Some(Utc::now());
        self.finished_instant = Some(now);
        self.resource.release(self.id);
    }

    fn transition(&mut self, next: ExperimentState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(experiment = %self.id, from = %self.state, to = %next, "experiment transition");
        self.state = next;
    }

    fn emit(&self, kind: EventKind) {
        let event = ExperimentEvent {
            kind,
            at: Utc::now(),
            experiment: self.snapshot(),
        };
        dispatch(self.notifier.as_ref(), &event);
    }
}

impl Drop for Experiment {
    fn drop(&mut self) {
        self.resource.release(self.id);
    }
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("id", &self.id)
            .field("resource", &self.resource.display_name())
            .field("operation", &self.operation)
            .field("state", &self.state)
            .finish()
    }
}
