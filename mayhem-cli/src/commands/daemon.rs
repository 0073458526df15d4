//! `mayhem daemon`: foreground runtime and socket control.

use anyhow::{Context, Result};
use clap::Subcommand;

use mayhem_daemon::paths::socket_path;
use mayhem_daemon::{request_status, request_stop, start_blocking, DaemonError};

use super::home;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the orchestrator in the foreground (ticker + socket server).
    Start,
    /// Request graceful shutdown; in-flight experiments are abandoned.
    Stop,
    /// Print raw daemon status JSON.
    Status,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => {
            let payload = match request_status(&home) {
                Ok(status) => serde_json::json!({ "running": true, "status": status }),
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload)
                    .context("failed to render daemon status JSON")?
            );
        }
    }

    Ok(())
}
