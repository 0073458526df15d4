//! Error types for mayhem-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::AdminState;

/// All errors that can arise from engine operations.
#[derive(Debug, Error)]
pub enum ChaosError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load, with the file path and serde_yaml line context.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// YAML serialization error (write path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A caller broke a lifecycle contract (e.g. repeating an experiment that never started).
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("operation '{operation}' is not supported by {resource_type}")]
    UnknownOperation {
        resource_type: String,
        operation: String,
    },

    #[error("resource {0} supports no fault types")]
    NoSupportedFaults(String),

    /// Error raised by a backend-specific client. Non-fatal errors are
    /// contained and retried on the next tick.
    #[error("{backend} client error: {message}")]
    Backend {
        backend: String,
        message: String,
        fatal: bool,
    },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("experiments cannot run while admin state is {0}")]
    AdminGate(AdminState),

    /// `dirs::home_dir()` returned `None`, so `~/.mayhem/` cannot be located.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

impl ChaosError {
    /// Recoverable backend error.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        ChaosError::Backend {
            backend: backend.into(),
            message: message.into(),
            fatal: false,
        }
    }

    /// Backend error explicitly classified as fatal.
    pub fn fatal_backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        ChaosError::Backend {
            backend: backend.into(),
            message: message.into(),
            fatal: true,
        }
    }

    /// Whether this error must stop the caller rather than be retried next tick.
    pub fn is_fatal(&self) -> bool {
        match self {
            ChaosError::Backend { fatal, .. } => *fatal,
            ChaosError::Config(_) | ChaosError::Parse { .. } | ChaosError::HomeNotFound => true,
            _ => false,
        }
    }
}

/// Convenience constructor for [`ChaosError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ChaosError {
    ChaosError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_are_recoverable_unless_marked_fatal() {
        assert!(!ChaosError::backend("aws-ec2", "throttled").is_fatal());
        assert!(ChaosError::fatal_backend("aws-ec2", "bad credentials").is_fatal());
    }

    #[test]
    fn config_errors_are_fatal() {
        assert!(ChaosError::Config("bad".into()).is_fatal());
        assert!(!ChaosError::IllegalState("repeat".into()).is_fatal());
    }

    #[test]
    fn admin_gate_message_names_state() {
        let msg = ChaosError::AdminGate(AdminState::Paused).to_string();
        assert!(msg.contains("paused"), "got: {msg}");
    }
}
