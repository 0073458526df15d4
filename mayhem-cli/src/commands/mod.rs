pub mod admin;
pub mod config;
pub mod daemon;
pub mod experiment;
pub mod settings;
pub mod status;
pub mod suite;

use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};

use mayhem_core::{AdminState, ExperimentState};
use mayhem_daemon::DaemonError;

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Map a daemon call failure to a user-facing error.
pub(crate) fn daemon_error(err: DaemonError, action: &str) -> anyhow::Error {
    match err {
        DaemonError::DaemonNotRunning { .. } => {
            anyhow::anyhow!("daemon is not running; start it with `mayhem daemon start`")
        }
        other => anyhow::Error::new(other).context(format!("failed to {action}")),
    }
}

pub(crate) fn admin_label(state: AdminState) -> ColoredString {
    let label = state.to_string().to_uppercase();
    match state {
        AdminState::Started => label.green(),
        AdminState::Starting => label.cyan(),
        AdminState::Paused => label.yellow(),
        AdminState::Abort => label.red().bold(),
    }
}

pub(crate) fn experiment_label(state: ExperimentState) -> ColoredString {
    let label = state.to_string().to_uppercase();
    match state {
        ExperimentState::Finalized => label.green(),
        ExperimentState::Failed => label.red(),
        ExperimentState::SelfHealing => label.magenta(),
        ExperimentState::Created => label.normal(),
        ExperimentState::Running | ExperimentState::Verifying => label.yellow(),
    }
}
