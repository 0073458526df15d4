//! `mayhem admin`: flip the process-wide gate.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use mayhem_core::AdminState;
use mayhem_daemon::request_admin;

use super::{admin_label, daemon_error, home};

#[derive(Subcommand, Debug)]
pub enum AdminCommand {
    /// Stop scheduling new experiments; running ones continue.
    Pause,
    /// Allow scheduling again.
    Resume,
    /// Stop scheduling and abandon every in-flight experiment.
    Abort,
}

pub fn run(command: AdminCommand) -> Result<()> {
    let home = home()?;
    let action = match command {
        AdminCommand::Pause => "pause",
        AdminCommand::Resume => "resume",
        AdminCommand::Abort => "abort",
    };

    let data = request_admin(&home, action).map_err(|e| daemon_error(e, action))?;
    let state: AdminState = serde_json::from_value(data["state"].clone())
        .context("daemon returned an unexpected admin payload")?;
    println!("admin state: {}", admin_label(state));
    if let Some(abandoned) = data["abandoned"].as_u64() {
        if abandoned > 0 {
            println!("{}", format!("abandoned {abandoned} in-flight experiment(s)").red());
        }
    }
    Ok(())
}
