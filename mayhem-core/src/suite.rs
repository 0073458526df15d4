//! Experiment suites.
//!
//! A suite maps aggregation keys to ordered operation lists for one backend:
//!
//! ```yaml
//! backend_type: inventory
//! experiments:
//!   az-1: [restart]
//!   az-2: [stop, isolate]
//! ```
//!
//! Two suites with the same content compare equal however they were built.
//! Files are YAML; JSON parses too since it is a YAML subset.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ChaosError};
use crate::experiment::ExperimentSnapshot;
use crate::types::{AggregationKey, BackendType, OperationName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSuite {
    pub backend_type: BackendType,
    #[serde(default)]
    pub experiments: BTreeMap<AggregationKey, Vec<OperationName>>,
}

impl ExperimentSuite {
    pub fn new(backend_type: impl Into<BackendType>) -> Self {
        Self {
            backend_type: backend_type.into(),
            experiments: BTreeMap::new(),
        }
    }

    pub fn with<I, O>(mut self, key: impl Into<AggregationKey>, operations: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<OperationName>,
    {
        self.experiments
            .entry(key.into())
            .or_default()
            .extend(operations.into_iter().map(Into::into));
        self
    }

    pub fn add(&mut self, key: AggregationKey, operation: OperationName) {
        self.experiments.entry(key).or_default().push(operation);
    }

    /// Every `(aggregation key, operation)` pair in key order, operations in
    /// declared order.
    pub fn pairs(&self) -> impl Iterator<Item = (&AggregationKey, &OperationName)> {
        self.experiments
            .iter()
            .flat_map(|(key, ops)| ops.iter().map(move |op| (key, op)))
    }

    pub fn len(&self) -> usize {
        self.experiments.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild a suite from experiments that ran against `backend_type`, for
    /// replaying a past run. Experiments that never picked an operation are
    /// skipped.
    pub fn from_experiments<'a>(
        backend_type: &BackendType,
        experiments: impl IntoIterator<Item = &'a ExperimentSnapshot>,
    ) -> Self {
        let mut suite = Self::new(backend_type.clone());
        for exp in experiments {
            if &exp.backend_type != backend_type {
                continue;
            }
            if let Some(op) = &exp.operation {
                suite.add(exp.aggregation_key.clone(), op.clone());
            }
        }
        suite
    }

    pub fn load_at(path: &Path) -> Result<Self, ChaosError> {
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_yaml::from_str(&contents).map_err(|source| ChaosError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write atomically via a sibling `.tmp` file.
    pub fn save_at(&self, path: &Path) -> Result<(), ChaosError> {
        let yaml = self.to_yaml()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);
        std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String, ChaosError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExperimentId, ExperimentState, ResourceIdentity};
    use chrono::Utc;
    use tempfile::TempDir;

    fn snapshot(backend: &str, key: &str, op: Option<&str>) -> ExperimentSnapshot {
        ExperimentSnapshot {
            id: ExperimentId::new(),
            backend_type: BackendType::from(backend),
            resource_identity: ResourceIdentity("abc".to_string()),
            resource_name: "db-1".to_string(),
            aggregation_key: AggregationKey::from(key),
            fault_type: None,
            operation: op.map(OperationName::from),
            state: ExperimentState::Finalized,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failure: None,
            self_healing_attempted: false,
            last_health: None,
            polls: 0,
            repeats: 0,
        }
    }

    #[test]
    fn equality_ignores_construction_order() {
        let a = ExperimentSuite::new("db")
            .with("az-1", ["restart"])
            .with("az-2", ["stop", "isolate"]);
        let b = ExperimentSuite::new("db")
            .with("az-2", ["stop", "isolate"])
            .with("az-1", ["restart"]);
        assert_eq!(a, b);
    }

    #[test]
    fn operation_order_within_key_matters() {
        let a = ExperimentSuite::new("db").with("az-1", ["stop", "restart"]);
        let b = ExperimentSuite::new("db").with("az-1", ["restart", "stop"]);
        assert_ne!(a, b);
    }

    #[test]
    fn pairs_flatten_in_order() {
        let suite = ExperimentSuite::new("db")
            .with("b", ["x"])
            .with("a", ["y", "z"]);
        let pairs: Vec<_> = suite.pairs().map(|(k, o)| (k.0.as_str(), o.0.as_str())).collect();
        assert_eq!(pairs, vec![("a", "y"), ("a", "z"), ("b", "x")]);
        assert_eq!(suite.len(), 3);
    }

    #[test]
    fn from_experiments_filters_backend_and_missing_operations() {
        let snaps = vec![
            snapshot("db", "az-1", Some("restart")),
            snapshot("vm", "az-1", Some("stop")),
            snapshot("db", "az-1", None),
            snapshot("db", "az-2", Some("isolate")),
        ];
        let suite = ExperimentSuite::from_experiments(&BackendType::from("db"), &snaps);
        let expected = ExperimentSuite::new("db")
            .with("az-1", ["restart"])
            .with("az-2", ["isolate"]);
        assert_eq!(suite, expected);
    }

    #[test]
    fn save_then_load_preserves_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("suite.yaml");
        let suite = ExperimentSuite::new("db").with("az-1", ["restart"]);
        suite.save_at(&path).unwrap();
        assert_eq!(ExperimentSuite::load_at(&path).unwrap(), suite);
    }

    #[test]
    fn json_suite_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("suite.json");
        std::fs::write(&path, r#"{"backend_type":"db","experiments":{"az-1":["restart"]}}"#).unwrap();
        let suite = ExperimentSuite::load_at(&path).unwrap();
        assert_eq!(suite.len(), 1);
    }

    #[test]
    fn malformed_suite_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "experiments: [not, a, map").unwrap();
        let err = ExperimentSuite::load_at(&path).unwrap_err();
        assert!(matches!(err, ChaosError::Parse { .. }), "got: {err}");
        assert!(err.to_string().contains("bad.yaml"));
    }
}
