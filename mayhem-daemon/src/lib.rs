//! Mayhem daemon: orchestrator loop, experiment pollers, and the control
//! socket.

mod error;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use orchestrator::{Orchestrator, OrchestratorSettings, SkipReason, StatusReport, TickOutcome};
pub use protocol::{
    request, request_admin, request_automated, request_backoff, request_experiments,
    request_status, request_stop, request_suite, request_trigger, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, start_blocking};
