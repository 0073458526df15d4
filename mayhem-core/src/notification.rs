//! Experiment lifecycle notifications.
//!
//! Delivery is fire-and-forget: [`dispatch`] logs a failing notifier and
//! carries on, so a broken sink can never stall an experiment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChaosError;
use crate::experiment::ExperimentSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    SelfHealingTriggered,
    Finalized,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub experiment: ExperimentSnapshot,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &ExperimentEvent) -> Result<(), ChaosError>;
}

/// Writes every event to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &ExperimentEvent) -> Result<(), ChaosError> {
        let exp = &event.experiment;
        let operation = exp.operation.as_ref().map(|o| o.0.as_str()).unwrap_or("-");
        match event.kind {
            EventKind::Failed => tracing::error!(
                experiment = %exp.id,
                resource = %exp.resource_name,
                operation,
                reason = ?exp.failure,
                "experiment failed",
            ),
            kind => tracing::info!(
                experiment = %exp.id,
                resource = %exp.resource_name,
                operation,
                event = ?kind,
                "experiment event",
            ),
        }
        Ok(())
    }
}

/// Deliver `event`, logging instead of propagating failures.
pub fn dispatch(notifier: &dyn Notifier, event: &ExperimentEvent) {
    if let Err(err) = notifier.notify(event) {
        tracing::warn!(
            experiment = %event.experiment.id,
            event = ?event.kind,
            error = %err,
            "notification delivery failed",
        );
    }
}
