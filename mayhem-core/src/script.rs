//! Script-driven fault operations.
//!
//! A [`ScriptOperation`] describes a fault implemented as shell commands run
//! against a target rather than a native API call. Commands go through a
//! [`CommandRunner`] so the transport (local shell, remote session) stays
//! outside the engine.

use std::collections::BTreeSet;
use std::fmt;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityTable;
use crate::error::ChaosError;
use crate::identity::IdentityFields;
use crate::resource::{Recovery, Resource};
use crate::types::{AggregationKey, FaultType, OperationName, ResourceHealth};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOperation {
    pub name: OperationName,
    pub fault_type: FaultType,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_healing_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_command: Option<String>,
    /// Tools that must be present on the target.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
}

impl ScriptOperation {
    pub fn validate(&self) -> Result<(), ChaosError> {
        if self.name.0.trim().is_empty() {
            return Err(ChaosError::Config("script operation with blank name".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(ChaosError::Config(format!("script '{}' has no command", self.name)));
        }
        if self.health_check_command.is_some() != self.self_healing_command.is_some() {
            return Err(ChaosError::Config(format!(
                "script '{}' must declare health_check_command and self_healing_command together",
                self.name
            )));
        }
        if let (Some(min), Some(max)) = (self.minimum_duration_secs, self.maximum_duration_secs) {
            if min > max {
                return Err(ChaosError::Config(format!(
                    "script '{}': minimum duration {min}s exceeds maximum {max}s",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Without a health check there is no way to verify recovery, so the
    /// target must be disposable.
    pub fn requires_cattle(&self) -> bool {
        self.health_check_command.is_none()
    }

    /// Duration override, filling a missing bound from `defaults`. A filled-in
    /// bound is clamped so the pair never inverts.
    pub fn duration_bounds(&self, defaults: (Duration, Duration)) -> Option<(Duration, Duration)> {
        let minimum = self.minimum_duration_secs.map(Duration::from_secs);
        let maximum = self.maximum_duration_secs.map(Duration::from_secs);
        match (minimum, maximum) {
            (None, None) => None,
            (Some(min), Some(max)) => Some((min, max)),
            (Some(min), None) => Some((min, defaults.1.max(min))),
            (None, Some(max)) => Some((defaults.0.min(max), max)),
        }
    }

    pub fn missing_dependencies(&self, runner: &dyn CommandRunner) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|tool| !runner.is_available(tool))
            .cloned()
            .collect()
    }

    /// Run the fault command and build the recovery record from the
    /// remaining commands.
    pub fn execute(&self, runner: Arc<dyn CommandRunner>, target: &str) -> Result<Recovery, ChaosError> {
        let missing = self.missing_dependencies(runner.as_ref());
        if !missing.is_empty() {
            return Err(ChaosError::backend(
                "script",
                format!("'{}' needs missing tools: {}", self.name, missing.join(", ")),
            ));
        }
        run_checked(runner.as_ref(), target, &self.name, &self.command)?;
        Ok(self.recovery(runner, target))
    }

    /// Health check: exit 0 is NORMAL, anything else still under experiment.
    pub fn recovery(&self, runner: Arc<dyn CommandRunner>, target: &str) -> Recovery {
        let mut recovery = Recovery::none();
        if let Some(cmd) = &self.health_check_command {
            let (runner, target, cmd) = (runner.clone(), target.to_string(), cmd.clone());
            recovery = recovery.with_health_check(move || {
                Ok(match runner.run(&target, &cmd)? {
                    0 => ResourceHealth::Normal,
                    _ => ResourceHealth::RunningExperiment,
                })
            });
        }
        if let Some(cmd) = &self.self_healing_command {
            let (runner, target, cmd, name) =
                (runner.clone(), target.to_string(), cmd.clone(), self.name.clone());
            recovery = recovery
                .with_self_healing(move || run_checked(runner.as_ref(), &target, &name, &cmd));
        }
        if let Some(cmd) = &self.finalize_command {
            let (target, cmd, name) = (target.to_string(), cmd.clone(), self.name.clone());
            recovery =
                recovery.with_finalize(move || run_checked(runner.as_ref(), &target, &name, &cmd));
        }
        recovery
    }
}

fn run_checked(
    runner: &dyn CommandRunner,
    target: &str,
    name: &OperationName,
    command: &str,
) -> Result<(), ChaosError> {
    match runner.run(target, command)? {
        0 => Ok(()),
        code => Err(ChaosError::backend(
            "script",
            format!("'{name}' exited with status {code} on {target}"),
        )),
    }
}

/// Transport for script commands.
pub trait CommandRunner: Send + Sync {
    /// Run `command` against `target` and return its exit status.
    fn run(&self, target: &str, command: &str) -> Result<i32, ChaosError>;

    fn is_available(&self, tool: &str) -> bool;
}

/// Runs commands through the local `sh`, exposing the target as
/// `MAYHEM_TARGET`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalShell;

impl CommandRunner for LocalShell {
    fn run(&self, target: &str, command: &str) -> Result<i32, ChaosError> {
        tracing::debug!(target_resource = target, command, "running script command");
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("MAYHEM_TARGET", target)
            .status()
            .map_err(|e| ChaosError::backend("script", format!("failed to spawn sh: {e}")))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn is_available(&self, tool: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
            .unwrap_or(false)
    }
}

/// Adds script operations to another resource's capabilities.
///
/// Scripts that need a disposable target are only offered when the resource
/// is marked as cattle.
pub struct ScriptedResource {
    inner: Box<dyn Resource>,
    scripts: Vec<ScriptOperation>,
    capabilities: CapabilityTable,
    runner: Arc<dyn CommandRunner>,
    defaults: (Duration, Duration),
}

impl ScriptedResource {
    pub fn new(
        inner: Box<dyn Resource>,
        scripts: &[ScriptOperation],
        cattle: bool,
        runner: Arc<dyn CommandRunner>,
        defaults: (Duration, Duration),
    ) -> Self {
        let scripts: Vec<ScriptOperation> = scripts
            .iter()
            .filter(|s| cattle || !s.requires_cattle())
            .cloned()
            .collect();
        let mut capabilities = inner.capabilities().clone();
        for script in &scripts {
            capabilities = capabilities.with(script.name.clone(), script.fault_type);
        }
        Self {
            inner,
            scripts,
            capabilities,
            runner,
            defaults,
        }
    }

    fn script(&self, operation: &OperationName) -> Option<&ScriptOperation> {
        self.scripts.iter().find(|s| &s.name == operation)
    }
}

impl fmt::Debug for ScriptedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedResource")
            .field("inner", &self.inner)
            .field("scripts", &self.scripts.len())
            .finish()
    }
}

impl Resource for ScriptedResource {
    fn kind(&self) -> &str {
        self.inner.kind()
    }

    fn unique_key(&self) -> &str {
        self.inner.unique_key()
    }

    fn identity_fields(&self) -> IdentityFields {
        self.inner.identity_fields()
    }

    fn aggregation_key(&self) -> AggregationKey {
        self.inner.aggregation_key()
    }

    fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    fn check_health(&self) -> Result<ResourceHealth, ChaosError> {
        self.inner.check_health()
    }

    fn invoke(&self, operation: &OperationName) -> Result<Recovery, ChaosError> {
        match self.script(operation) {
            Some(script) => script.execute(self.runner.clone(), self.inner.unique_key()),
            None => self.inner.invoke(operation),
        }
    }

    fn duration_bounds(&self, operation: &OperationName) -> Option<(Duration, Duration)> {
        match self.script(operation) {
            Some(script) => script.duration_bounds(self.defaults),
            None => self.inner.duration_bounds(operation),
        }
    }

    fn display_name(&self) -> String {
        self.inner.display_name()
    }
}
