//! Mayhem core library: the chaos-experiment engine without a runtime.
//!
//! - [`registry`] deduplicates discovered resources by identity fingerprint
//! - [`backend`] / [`client`] discover resources and pick experiment candidates
//! - [`experiment`] is the per-experiment state machine
//! - [`admin`] gates whether experiments may run at all
//! - [`config`] loads `~/.mayhem/config.yaml`
//!
//! Nothing here spawns threads or tasks; `mayhem-daemon` drives it.

pub mod admin;
pub mod backend;
pub mod capability;
pub mod client;
pub mod config;
pub mod error;
pub mod experiment;
pub mod identity;
pub mod inventory;
pub mod notification;
pub mod registry;
pub mod resource;
pub mod safety;
pub mod script;
pub mod suite;
pub mod types;

pub use admin::{AdminController, AdminSnapshot};
pub use backend::Backend;
pub use capability::{Capability, CapabilityTable};
pub use config::{EngineConfig, LogFormat};
pub use error::ChaosError;
pub use experiment::{Experiment, ExperimentSnapshot, ExperimentTiming, FailureReason};
pub use notification::{EventKind, ExperimentEvent, Notifier, TracingNotifier};
pub use registry::ResourceRegistry;
pub use resource::{Recovery, Resource, ResourceRef, TrackedResource};
pub use safety::{AlwaysOpen, SafetyWindow};
pub use suite::ExperimentSuite;
pub use types::{
    AdminState, AggregationKey, ApiStatus, BackendHealth, BackendLevel, BackendType,
    ExperimentId, ExperimentState, FaultType, OperationName, ResourceHealth, ResourceIdentity,
};
