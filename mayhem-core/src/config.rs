//! Engine configuration, `~/.mayhem/config.yaml`.
//!
//! Follows the `fn_at(home)` / `fn()` pattern: the `_at` form takes an
//! explicit home directory, the short form resolves it with
//! `dirs::home_dir()`. Tests always use `_at`.
//!
//! A missing file yields the defaults. Everything is validated before the
//! runtime starts; a validation failure is fatal.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::capability::{Capability, CapabilityTable};
use crate::client::{ClientBackend, ClientSettings};
use crate::error::{io_err, ChaosError};
use crate::experiment::ExperimentTiming;
use crate::inventory::InventoryClient;
use crate::safety::SafetyWindowConfig;
use crate::script::{CommandRunner, ScriptOperation};
use crate::types::{BackendLevel, BackendType};

pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub automated_mode: bool,
    pub backoff_period_secs: u64,
    pub tick_interval_secs: u64,
    pub max_concurrent_discoveries: usize,
    /// How long finished experiments stay queryable.
    pub experiment_retention_secs: u64,
    /// Boot into PAUSED instead of STARTED.
    pub start_paused: bool,
    pub log_format: LogFormat,
    pub experiment: ExperimentDefaults,
    pub safety_window: SafetyWindowConfig,
    pub backends: Vec<BackendConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            automated_mode: true,
            backoff_period_secs: 300,
            tick_interval_secs: 15,
            max_concurrent_discoveries: 4,
            experiment_retention_secs: 3600,
            start_paused: false,
            log_format: LogFormat::Text,
            experiment: ExperimentDefaults::default(),
            safety_window: SafetyWindowConfig::AlwaysOpen,
            backends: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentDefaults {
    pub minimum_duration_secs: u64,
    pub maximum_duration_secs: u64,
    pub finalization_duration_secs: u64,
    pub poll_interval_min_secs: u64,
    pub poll_interval_max_secs: u64,
}

impl Default for ExperimentDefaults {
    fn default() -> Self {
        Self {
            minimum_duration_secs: 30,
            maximum_duration_secs: 300,
            finalization_duration_secs: 60,
            poll_interval_min_secs: 1,
            poll_interval_max_secs: 30,
        }
    }
}

impl ExperimentDefaults {
    pub fn timing(&self) -> ExperimentTiming {
        ExperimentTiming {
            minimum: Duration::from_secs(self.minimum_duration_secs),
            maximum: Duration::from_secs(self.maximum_duration_secs),
            finalization: Duration::from_secs(self.finalization_duration_secs),
            poll_interval_min: Duration::from_secs(self.poll_interval_min_secs),
            poll_interval_max: Duration::from_secs(self.poll_interval_max_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    #[serde(default)]
    pub level: BackendLevel,
    pub destruction_probability: f64,
    /// Attribute names tried in order to group resources.
    #[serde(default)]
    pub grouping_identifiers: Vec<String>,
    #[serde(default)]
    pub designated_survivor: bool,
    #[serde(default)]
    pub filter: BTreeMap<String, String>,
    #[serde(default)]
    pub self_identifiers: BTreeSet<String>,
    #[serde(default)]
    pub terminal_states: BTreeSet<String>,
    #[serde(default)]
    pub unhealthy_states: BTreeSet<String>,
    #[serde(default)]
    pub healthy_states: BTreeSet<String>,
    /// Resource kind -> operations it supports.
    #[serde(default)]
    pub capabilities: BTreeMap<String, Vec<Capability>>,
    #[serde(default)]
    pub scripts: Vec<ScriptOperation>,
    /// Resources are disposable; enables scripts without a health check.
    #[serde(default)]
    pub cattle: bool,
    /// Static inventory file, relative to the config directory.
    pub inventory: PathBuf,
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ChaosError> {
        let ty = &self.backend_type;
        if ty.0.trim().is_empty() {
            return Err(ChaosError::Config("backend with blank type".to_string()));
        }
        let p = self.destruction_probability;
        if p.is_nan() || !(0.0..=1.0).contains(&p) {
            return Err(ChaosError::Config(format!(
                "{ty}: destruction_probability {p} must be within [0, 1]"
            )));
        }
        if self.grouping_identifiers.iter().any(|g| g.trim().is_empty()) {
            return Err(ChaosError::Config(format!("{ty}: blank grouping identifier")));
        }
        if self.filter.keys().any(|k| k.trim().is_empty()) {
            return Err(ChaosError::Config(format!("{ty}: blank filter attribute")));
        }
        if self.designated_survivor && self.grouping_identifiers.is_empty() {
            return Err(ChaosError::Config(format!(
                "{ty}: designated_survivor needs at least one grouping identifier"
            )));
        }
        for script in &self.scripts {
            script.validate()?;
        }
        Ok(())
    }

    fn capability_tables(&self) -> BTreeMap<String, CapabilityTable> {
        self.capabilities
            .iter()
            .map(|(kind, caps)| {
                let mut table = CapabilityTable::new();
                for cap in caps {
                    table.register(cap.clone());
                }
                (kind.clone(), table)
            })
            .collect()
    }

    pub fn client_settings(&self, defaults: &ExperimentDefaults) -> ClientSettings {
        let timing = defaults.timing();
        ClientSettings {
            backend_type: self.backend_type.clone(),
            level: self.level,
            destruction_probability: self.destruction_probability,
            grouping_identifiers: self.grouping_identifiers.clone(),
            designated_survivor: self.designated_survivor,
            filter: self.filter.clone(),
            self_identifiers: self.self_identifiers.clone(),
            terminal_states: self.terminal_states.clone(),
            unhealthy_states: self.unhealthy_states.clone(),
            healthy_states: self.healthy_states.clone(),
            capabilities: self.capability_tables(),
            scripts: self.scripts.clone(),
            cattle: self.cattle,
            default_durations: (timing.minimum, timing.maximum),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ChaosError> {
        if self.tick_interval_secs == 0 {
            return Err(ChaosError::Config("tick_interval_secs must be positive".to_string()));
        }
        if self.max_concurrent_discoveries == 0 {
            return Err(ChaosError::Config(
                "max_concurrent_discoveries must be positive".to_string(),
            ));
        }
        let e = &self.experiment;
        if e.minimum_duration_secs == 0 || e.maximum_duration_secs == 0 || e.poll_interval_min_secs == 0 {
            return Err(ChaosError::Config(
                "experiment durations and poll interval must be positive".to_string(),
            ));
        }
        if e.minimum_duration_secs > e.maximum_duration_secs {
            return Err(ChaosError::Config(format!(
                "minimum_duration_secs {} exceeds maximum_duration_secs {}",
                e.minimum_duration_secs, e.maximum_duration_secs
            )));
        }
        if e.poll_interval_min_secs > e.poll_interval_max_secs {
            return Err(ChaosError::Config(format!(
                "poll_interval_min_secs {} exceeds poll_interval_max_secs {}",
                e.poll_interval_min_secs, e.poll_interval_max_secs
            )));
        }
        self.safety_window.validate()?;

        let mut seen = HashSet::new();
        for backend in &self.backends {
            backend.validate()?;
            if !seen.insert(&backend.backend_type) {
                return Err(ChaosError::Config(format!(
                    "backend type '{}' configured twice",
                    backend.backend_type
                )));
            }
        }
        Ok(())
    }

    pub fn backoff_period(&self) -> Duration {
        Duration::from_secs(self.backoff_period_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.experiment_retention_secs)
    }
}

// ---------------------------------------------------------------------------
// Paths and loading
// ---------------------------------------------------------------------------

/// `<home>/.mayhem/`
pub fn mayhem_root(home: &Path) -> PathBuf {
    home.join(".mayhem")
}

/// `<home>/.mayhem/config.yaml`; pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    mayhem_root(home).join(CONFIG_FILE)
}

/// Load and validate a config file. A missing file yields the defaults.
pub fn load_config_file(path: &Path) -> Result<EngineConfig, ChaosError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(EngineConfig::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let config: EngineConfig = serde_yaml::from_str(&contents).map_err(|source| ChaosError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

pub fn load_config_at(home: &Path) -> Result<EngineConfig, ChaosError> {
    load_config_file(&config_path_at(home))
}

/// `load_config_at` convenience wrapper.
pub fn load_config() -> Result<EngineConfig, ChaosError> {
    load_config_at(&home()?)
}

pub fn home() -> Result<PathBuf, ChaosError> {
    dirs::home_dir().ok_or(ChaosError::HomeNotFound)
}

/// Build one inventory-backed backend per configured entry. Relative
/// inventory paths resolve against `config_dir`.
pub fn build_backends(
    config: &EngineConfig,
    config_dir: &Path,
    runner: Arc<dyn CommandRunner>,
) -> Result<Vec<Arc<dyn Backend>>, ChaosError> {
    config
        .backends
        .iter()
        .map(|bc| {
            let path = if bc.inventory.is_absolute() {
                bc.inventory.clone()
            } else {
                config_dir.join(&bc.inventory)
            };
            let client = Arc::new(InventoryClient::load_at(&path)?);
            let backend = ClientBackend::new(bc.client_settings(&config.experiment), client, runner.clone());
            tracing::info!(
                backend = %bc.backend_type,
                level = %bc.level,
                probability = bc.destruction_probability,
                "backend configured",
            );
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        })
        .collect()
}
