//! Domain types shared by the engine.
//!
//! Newtypes wrap the identifiers that flow between backends, the registry and
//! experiments so they cannot be mixed up. Enums serialize in `snake_case`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChaosError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Tag naming one infrastructure kind (e.g. `aws-ec2`, `aws-rds`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendType(pub String);

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for BackendType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BackendType {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Grouping label reported by a backend (redundancy group, availability zone).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregationKey(pub String);

impl AggregationKey {
    /// Sentinel for resources that belong to no redundancy group.
    pub const UNGROUPED: &'static str = "ungrouped";

    pub fn ungrouped() -> Self {
        Self(Self::UNGROUPED.to_owned())
    }

    pub fn is_ungrouped(&self) -> bool {
        self.0 == Self::UNGROUPED
    }
}

impl Default for AggregationKey {
    fn default() -> Self {
        Self::ungrouped()
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for AggregationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AggregationKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Name of a fault or corrective operation a resource can perform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationName(pub String);

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for OperationName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OperationName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Hex SHA-256 fingerprint of a resource's identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity(pub String);

impl ResourceIdentity {
    /// First 12 hex characters, for log lines and tables.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(12);
        &self.0[..end]
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier of one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentId(pub Uuid);

impl ExperimentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExperimentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Health of a single resource as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceHealth {
    #[default]
    Normal,
    RunningExperiment,
    DoesNotExist,
    Failed,
}

impl ResourceHealth {
    /// Ordering used when several readings are folded into one; higher is worse.
    pub fn severity(self) -> u8 {
        match self {
            ResourceHealth::Normal => 0,
            ResourceHealth::RunningExperiment => 1,
            ResourceHealth::Failed => 2,
            ResourceHealth::DoesNotExist => 3,
        }
    }
}

impl fmt::Display for ResourceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHealth::Normal => write!(f, "normal"),
            ResourceHealth::RunningExperiment => write!(f, "running_experiment"),
            ResourceHealth::DoesNotExist => write!(f, "does_not_exist"),
            ResourceHealth::Failed => write!(f, "failed"),
        }
    }
}

/// Category of disruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultType {
    State,
    Network,
    Resource,
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultType::State => write!(f, "state"),
            FaultType::Network => write!(f, "network"),
            FaultType::Resource => write!(f, "resource"),
        }
    }
}

impl FromStr for FaultType {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "state" => Ok(FaultType::State),
            "network" => Ok(FaultType::Network),
            "resource" => Ok(FaultType::Resource),
            other => Err(ChaosError::Config(format!(
                "unknown fault type '{other}'; expected: state, network, resource"
            ))),
        }
    }
}

/// Service level of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendLevel {
    #[default]
    Iaas,
    Paas,
    Saas,
}

impl fmt::Display for BackendLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendLevel::Iaas => write!(f, "iaas"),
            BackendLevel::Paas => write!(f, "paas"),
            BackendLevel::Saas => write!(f, "saas"),
        }
    }
}

/// Aggregate health of every resource a backend reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealth {
    Ok,
    Degraded,
    Failed,
}

/// Liveness of a backend's control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Ok,
    Error,
}

/// Process-wide administrative gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    #[default]
    Starting,
    Started,
    Paused,
    Abort,
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::Starting => write!(f, "starting"),
            AdminState::Started => write!(f, "started"),
            AdminState::Paused => write!(f, "paused"),
            AdminState::Abort => write!(f, "abort"),
        }
    }
}

impl FromStr for AdminState {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starting" => Ok(AdminState::Starting),
            "started" => Ok(AdminState::Started),
            "paused" => Ok(AdminState::Paused),
            "abort" => Ok(AdminState::Abort),
            other => Err(ChaosError::Config(format!(
                "unknown admin state '{other}'; expected: starting, started, paused, abort"
            ))),
        }
    }
}

/// Lifecycle position of one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    #[default]
    Created,
    Running,
    Verifying,
    SelfHealing,
    Finalized,
    Failed,
}

impl ExperimentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExperimentState::Finalized | ExperimentState::Failed)
    }

    /// Whether the experiment is currently disrupting its resource.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ExperimentState::Running | ExperimentState::Verifying | ExperimentState::SelfHealing
        )
    }

    /// Allowed edges of the lifecycle graph.
    pub fn can_transition_to(self, next: ExperimentState) -> bool {
        use ExperimentState::*;
        match (self, next) {
            (Finalized | Failed, _) => false,
            (_, Failed) => true,
            (Created, Running) => true,
            (Running, Verifying) => true,
            (Verifying, Finalized | SelfHealing | Verifying) => true,
            (SelfHealing, Verifying) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExperimentState::Created => write!(f, "created"),
            ExperimentState::Running => write!(f, "running"),
            ExperimentState::Verifying => write!(f, "verifying"),
            ExperimentState::SelfHealing => write!(f, "self_healing"),
            ExperimentState::Finalized => write!(f, "finalized"),
            ExperimentState::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
