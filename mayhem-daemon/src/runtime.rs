use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use mayhem_core::config::{build_backends, load_config_at, mayhem_root};
use mayhem_core::script::LocalShell;
use mayhem_core::{AdminController, AdminState, EngineConfig, LogFormat, TracingNotifier};

use crate::error::{io_err, DaemonError};
use crate::orchestrator::{Orchestrator, OrchestratorSettings, TickOutcome};
use crate::paths::socket_path;
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Load `~/.mayhem/config.yaml`, start the runtime, and block the current
/// thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    let config = load_config_at(home)?;
    init_tracing(config.log_format);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config))
}

/// Run the daemon: tick driver, socket server, and signal handler. Any task
/// exiting brings the others down; in-flight experiments are abandoned
/// before returning.
pub async fn run(home: PathBuf, config: EngineConfig) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let backends = build_backends(&config, &mayhem_root(&home), Arc::new(LocalShell))?;
    let safety = config.safety_window.build()?;
    let admin = Arc::new(AdminController::new(AdminState::Starting));
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorSettings::from(&config),
        backends,
        admin.clone(),
        safety,
        Arc::new(TracingNotifier),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let ticker_handle = {
        let shutdown = shutdown_tx.clone();
        let orchestrator = orchestrator.clone();
        let period = config.tick_interval();
        tokio::spawn(async move {
            let result = ticker_task(orchestrator, period, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let result =
                socket_server_task(home, orchestrator, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    admin.set_state(if config.start_paused {
        AdminState::Paused
    } else {
        AdminState::Started
    });
    tracing::info!(
        backends = config.backends.len(),
        automated = config.automated_mode,
        "mayhem daemon running",
    );

    let (ticker_result, socket_result, signal_result) =
        tokio::join!(ticker_handle, socket_handle, signal_handle);

    orchestrator.shutdown().await;

    handle_join("ticker", ticker_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn ticker_task(
    orchestrator: Arc<Orchestrator>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match orchestrator.tick().await {
                    TickOutcome::Skipped(reason) => tracing::debug!(?reason, "tick skipped"),
                    TickOutcome::Completed { started } if started.is_empty() => {
                        tracing::debug!("tick completed, nothing scheduled");
                    }
                    TickOutcome::Completed { started } => {
                        tracing::info!(started = started.len(), "tick scheduled experiments");
                    }
                }
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    home: PathBuf,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let root = mayhem_root(&home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }

    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let orchestrator = orchestrator.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, orchestrator, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    orchestrator: Arc<Orchestrator>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stopping = request.cmd == "stop";
        let response = handle_command(&orchestrator, request, &shutdown_tx).await;
        write_response(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }

    Ok(())
}

async fn handle_command(
    orchestrator: &Arc<Orchestrator>,
    request: DaemonRequest,
    shutdown_tx: &broadcast::Sender<()>,
) -> DaemonResponse {
    let admin = orchestrator.admin();
    match request.cmd.as_str() {
        "status" => respond(orchestrator.status().await),
        "experiments" => respond(orchestrator.experiments()),
        "pause" => {
            admin.set_state(AdminState::Paused);
            respond(admin.snapshot())
        }
        "resume" => {
            admin.set_state(AdminState::Started);
            respond(admin.snapshot())
        }
        "abort" => {
            admin.set_state(AdminState::Abort);
            let abandoned = orchestrator.abandon_all().await;
            DaemonResponse::ok(json!({ "state": admin.state(), "abandoned": abandoned }))
        }
        "trigger" => match request.resource {
            Some(resource) => match orchestrator.experiment_by_resource_id(&resource).await {
                Ok(snapshot) => respond(snapshot),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            None => DaemonResponse::error("trigger requires 'resource'"),
        },
        "suite" => match request.suite {
            Some(suite) => match orchestrator.schedule_experiment_suite(&suite).await {
                Ok(started) => respond(started),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            None => DaemonResponse::error("suite requires 'suite'"),
        },
        "automated" => match request.enabled {
            Some(enabled) => {
                orchestrator.set_automated_mode(enabled);
                DaemonResponse::ok(json!({ "automated_mode": enabled }))
            }
            None => DaemonResponse::error("automated requires 'enabled'"),
        },
        "backoff" => match request.seconds {
            Some(seconds) => {
                orchestrator.set_backoff_period(Duration::from_secs(seconds));
                DaemonResponse::ok(json!({ "backoff_period_secs": seconds }))
            }
            None => DaemonResponse::error("backoff requires 'seconds'"),
        },
        "stop" => {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn respond<T: Serialize>(payload: T) -> DaemonResponse {
    match serde_json::to_value(payload) {
        Ok(value) => DaemonResponse::ok(value),
        Err(err) => DaemonResponse::error(format!("failed to encode response: {err}")),
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = mayhem_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = match format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(false).try_init(),
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use mayhem_core::client::{ClientBackend, ClientSettings, RemoteResource};
    use mayhem_core::inventory::InventoryClient;
    use mayhem_core::{AlwaysOpen, Backend, CapabilityTable, ExperimentSuite, FaultType};

    use super::*;
    use crate::protocol::send_request;

    fn orchestrator() -> Arc<Orchestrator> {
        let mut settings = ClientSettings::new("vm");
        settings.destruction_probability = 1.0;
        settings.grouping_identifiers = vec!["zone".to_string()];
        settings
            .capabilities
            .insert("vm".to_string(), CapabilityTable::new().with("restart", FaultType::State));
        let client = Arc::new(InventoryClient::from_resources(vec![RemoteResource {
            id: "vm-1".to_string(),
            kind: "vm".to_string(),
            status: "running".to_string(),
            attributes: BTreeMap::from([("zone".to_string(), "az-1".to_string())]),
        }]));
        let backend: Arc<dyn Backend> =
            Arc::new(ClientBackend::new(settings, client, Arc::new(LocalShell)));

        Arc::new(Orchestrator::new(
            OrchestratorSettings::from(&EngineConfig::default()),
            vec![backend],
            Arc::new(AdminController::new(AdminState::Started)),
            Arc::new(AlwaysOpen),
            Arc::new(TracingNotifier),
        ))
    }

    #[tokio::test]
    async fn pause_blocks_trigger_until_resume() {
        let orch = orchestrator();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let paused = handle_command(&orch, DaemonRequest::new("pause"), &shutdown_tx).await;
        assert!(paused.ok);
        assert_eq!(paused.data.unwrap()["state"], "paused");

        let trigger = DaemonRequest {
            resource: Some("vm-1".to_string()),
            ..DaemonRequest::new("trigger")
        };
        let refused = handle_command(&orch, trigger.clone(), &shutdown_tx).await;
        assert!(!refused.ok);
        assert!(refused.error.unwrap().contains("paused"));

        handle_command(&orch, DaemonRequest::new("resume"), &shutdown_tx).await;
        let started = handle_command(&orch, trigger, &shutdown_tx).await;
        assert!(started.ok, "{:?}", started.error);
        assert_eq!(started.data.unwrap()["state"], "running");

        orch.shutdown().await;
    }

    #[tokio::test]
    async fn abort_abandons_running_experiments() {
        let orch = orchestrator();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let suite = DaemonRequest {
            suite: Some(ExperimentSuite::new("vm").with("az-1", ["restart"])),
            ..DaemonRequest::new("suite")
        };
        let started = handle_command(&orch, suite, &shutdown_tx).await;
        assert_eq!(started.data.unwrap().as_array().unwrap().len(), 1);

        let aborted = handle_command(&orch, DaemonRequest::new("abort"), &shutdown_tx).await;
        let data = aborted.data.unwrap();
        assert_eq!(data["state"], "abort");
        assert_eq!(data["abandoned"], 1);

        let listed = handle_command(&orch, DaemonRequest::new("experiments"), &shutdown_tx).await;
        assert_eq!(listed.data.unwrap()[0]["failure"], "abandoned");
    }

    #[tokio::test]
    async fn settings_commands_require_arguments() {
        let orch = orchestrator();
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        assert!(!handle_command(&orch, DaemonRequest::new("backoff"), &shutdown_tx).await.ok);
        assert!(!handle_command(&orch, DaemonRequest::new("automated"), &shutdown_tx).await.ok);
        assert!(!handle_command(&orch, DaemonRequest::new("trigger"), &shutdown_tx).await.ok);

        let backoff = DaemonRequest {
            seconds: Some(5),
            ..DaemonRequest::new("backoff")
        };
        assert!(handle_command(&orch, backoff, &shutdown_tx).await.ok);
        assert_eq!(orch.backoff_period(), Duration::from_secs(5));

        let unknown = handle_command(&orch, DaemonRequest::new("explode"), &shutdown_tx).await;
        assert_eq!(unknown.error.as_deref(), Some("unknown command 'explode'"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn socket_serves_status_and_stop() {
        let home = tempfile::tempdir().unwrap();
        let (shutdown_tx, _) = broadcast::channel::<()>(4);
        let server = tokio::spawn(socket_server_task(
            home.path().to_path_buf(),
            orchestrator(),
            shutdown_tx.clone(),
            shutdown_tx.subscribe(),
        ));

        let socket = socket_path(home.path());
        for _ in 0..50 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let client_home = home.path().to_path_buf();
        let (status, stop) = tokio::task::spawn_blocking(move || {
            let status = send_request(&client_home, &DaemonRequest::new("status")).unwrap();
            let stop = send_request(&client_home, &DaemonRequest::new("stop")).unwrap();
            (status, stop)
        })
        .await
        .unwrap();

        assert!(status.ok);
        assert_eq!(status.data.unwrap()["admin"]["state"], "started");
        assert!(stop.ok);

        server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[test]
    fn stale_socket_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        fs::write(&socket, b"").unwrap();
        prepare_socket_for_bind(&socket).unwrap();
        assert!(!socket.exists());
    }
}
