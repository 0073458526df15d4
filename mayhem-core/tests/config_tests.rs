//! Config, inventory and suite files on disk.
//! Layout under test: <home>/.mayhem/config.yaml plus inventory/suite files beside it.

use std::fs;
use std::sync::Arc;

use assert_fs::prelude::*;
use mayhem_core::config::{self, build_backends};
use mayhem_core::script::LocalShell;
use mayhem_core::{BackendType, ChaosError, ExperimentSuite, FaultType, ResourceRegistry};
use predicates::prelude::predicate;

const CONFIG: &str = r#"
automated_mode: true
backoff_period_secs: 120
tick_interval_secs: 5
safety_window:
  kind: business_hours
  start_hour: 9
  end_hour: 17
  utc_offset_hours: 1
backends:
  - type: db
    level: paas
    destruction_probability: 0.25
    grouping_identifiers: [cluster, zone]
    designated_survivor: true
    terminal_states: [deleted]
    unhealthy_states: [failed, incompatible-parameters]
    healthy_states: [available]
    capabilities:
      db-instance:
        - operation: reboot
          fault_type: state
        - operation: isolate
          fault_type: network
          self_healing: restore-network
    inventory: db-inventory.yaml
"#;

const INVENTORY: &str = r#"
resources:
  - id: db-1
    kind: db-instance
    status: available
    attributes: { cluster: orders, zone: az-1 }
  - id: db-2
    kind: db-instance
    status: available
    attributes: { cluster: orders, zone: az-2 }
  - id: db-3
    kind: db-instance
    status: deleted
"#;

fn write_home() -> assert_fs::TempDir {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".mayhem/config.yaml").write_str(CONFIG).expect("config");
    home.child(".mayhem/db-inventory.yaml").write_str(INVENTORY).expect("inventory");
    home
}

#[test]
fn full_config_loads_and_validates() {
    let home = write_home();
    let cfg = config::load_config_at(home.path()).expect("load");
    assert_eq!(cfg.backoff_period_secs, 120);
    assert_eq!(cfg.backends.len(), 1);
    let db = &cfg.backends[0];
    assert_eq!(db.backend_type, BackendType::from("db"));
    assert_eq!(db.capabilities["db-instance"].len(), 2);
    assert_eq!(db.capabilities["db-instance"][1].fault_type, FaultType::Network);
}

#[test]
fn configured_backend_discovers_inventory() {
    let home = write_home();
    let cfg = config::load_config_at(home.path()).expect("load");
    let config_dir = config::mayhem_root(home.path());
    let backends = build_backends(&cfg, &config_dir, Arc::new(LocalShell)).expect("backends");

    let registry = ResourceRegistry::new();
    let roster = backends[0].discover(&registry).expect("discover");
    let keys: Vec<_> = roster.iter().map(|r| r.unique_key().to_string()).collect();
    assert_eq!(keys, vec!["db-1", "db-2"]);
    assert!(roster.iter().all(|r| r.aggregation_key().0 == "orders"));
    assert_eq!(backends[0].experiment_candidates(&roster).len(), 2);
}

#[test]
fn invalid_probability_fails_at_load() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".mayhem/config.yaml")
        .write_str(&CONFIG.replace("0.25", "2.0"))
        .expect("config");
    let err = config::load_config_at(home.path()).unwrap_err();
    assert!(matches!(err, ChaosError::Config(_)), "got: {err}");
    assert!(err.to_string().contains("destruction_probability"));
}

#[test]
fn wrong_shape_is_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".mayhem/config.yaml")
        .write_str("- this is a list, not a mapping\n")
        .expect("config");
    let err = config::load_config_at(home.path()).unwrap_err();
    assert!(matches!(err, ChaosError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn suite_file_written_beside_config() {
    let home = write_home();
    let path = config::mayhem_root(home.path()).join("replay.yaml");
    let suite = ExperimentSuite::new("db").with("orders", ["reboot", "isolate"]);
    suite.save_at(&path).expect("save");

    home.child(".mayhem/replay.yaml").assert(predicate::path::exists());
    home.child(".mayhem/replay.yaml.tmp").assert(predicate::path::missing());
    let text = fs::read_to_string(&path).expect("read");
    assert!(text.contains("orders"));
    assert_eq!(ExperimentSuite::load_at(&path).expect("load"), suite);
}
