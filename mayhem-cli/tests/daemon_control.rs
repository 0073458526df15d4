use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tempfile::TempDir;

const CONFIG: &str = r#"
automated_mode: false
tick_interval_secs: 1
backends:
  - type: vm
    destruction_probability: 1.0
    grouping_identifiers: [zone]
    capabilities:
      vm:
        - operation: restart
          fault_type: state
    inventory: vm-inventory.yaml
"#;

const INVENTORY: &str = r#"
resources:
  - id: vm-1
    kind: vm
    status: running
    attributes: { zone: az-1 }
  - id: vm-2
    kind: vm
    status: running
    attributes: { zone: az-2 }
"#;

fn mayhem_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mayhem"))
}

fn mayhem(home: &Path, args: &[&str]) -> Output {
    Command::new(mayhem_bin())
        .env("HOME", home)
        .env("USERPROFILE", home)
        .env("NO_COLOR", "1")
        .args(args)
        .output()
        .expect("run mayhem")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

struct DaemonProcess {
    child: Child,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(home: PathBuf) -> Self {
        let child = Command::new(mayhem_bin())
            .env("HOME", &home)
            .env("USERPROFILE", &home)
            .args(["daemon", "start"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self { child, home }
    }

    fn stop(&mut self) {
        let _ = mayhem(&self.home, &["daemon", "stop"]);

        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn daemon_running(home: &Path) -> bool {
    let output = mayhem(home, &["daemon", "status"]);
    if !output.status.success() {
        return false;
    }
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&output.stdout) else {
        return false;
    };
    value
        .get("running")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

fn write_home() -> TempDir {
    let home = TempDir::new().expect("home");
    let root = home.path().join(".mayhem");
    std::fs::create_dir_all(&root).expect("mkdir .mayhem");
    std::fs::write(root.join("config.yaml"), CONFIG).expect("config");
    std::fs::write(root.join("vm-inventory.yaml"), INVENTORY).expect("inventory");
    home
}

#[test]
fn admin_gate_controls_manual_triggers() {
    let home = write_home();
    let mut daemon = DaemonProcess::start(home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(5), || daemon_running(home.path())),
        "daemon did not come up"
    );

    let triggered = mayhem(home.path(), &["experiment", "trigger", "vm-1"]);
    assert!(triggered.status.success(), "{triggered:?}");
    assert!(stdout(&triggered).contains("restart on vm/vm-1"));

    let listed = mayhem(home.path(), &["experiment", "list", "--json"]);
    let experiments: serde_json::Value = serde_json::from_slice(&listed.stdout).expect("json");
    assert_eq!(experiments.as_array().map(Vec::len), Some(1));
    assert_eq!(experiments[0]["state"], "running");

    let paused = mayhem(home.path(), &["admin", "pause"]);
    assert!(stdout(&paused).contains("PAUSED"));

    let refused = mayhem(home.path(), &["experiment", "trigger", "vm-2"]);
    assert!(!refused.status.success());
    assert!(String::from_utf8_lossy(&refused.stderr).contains("paused"));

    let aborted = mayhem(home.path(), &["admin", "abort"]);
    assert!(stdout(&aborted).contains("abandoned 1"));

    let listed = mayhem(home.path(), &["experiment", "list", "--json"]);
    let experiments: serde_json::Value = serde_json::from_slice(&listed.stdout).expect("json");
    assert_eq!(experiments[0]["failure"], "abandoned");

    daemon.stop();
    assert!(!home.path().join(".mayhem").join("daemon.sock").exists());
}

#[test]
fn suite_runs_against_matching_group() {
    let home = write_home();
    let _daemon = DaemonProcess::start(home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(5), || daemon_running(home.path())),
        "daemon did not come up"
    );

    let suite = home.path().join("suite.yaml");
    std::fs::write(&suite, "backend_type: vm\nexperiments:\n  az-2: [restart]\n").expect("suite");
    let ran = mayhem(home.path(), &["suite", "run", suite.to_str().expect("utf8 path")]);
    assert!(ran.status.success(), "{ran:?}");
    assert!(stdout(&ran).contains("started 1 of 1"));
    assert!(stdout(&ran).contains("vm/vm-2"));

    let saved = home.path().join("replay.yaml");
    let save = mayhem(
        home.path(),
        &["suite", "save", saved.to_str().expect("utf8 path"), "--backend", "vm"],
    );
    assert!(save.status.success(), "{save:?}");
    let replay = std::fs::read_to_string(&saved).expect("replay suite");
    assert!(replay.contains("az-2"));
    assert!(replay.contains("restart"));

    let settings = mayhem(home.path(), &["settings", "backoff", "42"]);
    assert!(settings.status.success());
    let status = mayhem(home.path(), &["status", "--json"]);
    let status: serde_json::Value = serde_json::from_slice(&status.stdout).expect("status json");
    assert_eq!(status["backoff_period_secs"], 42);
    assert_eq!(status["active_experiments"], 1);
}
