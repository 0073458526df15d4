//! `mayhem settings`: runtime scheduling knobs. Changes apply from the next
//! tick and are not written back to config.

use anyhow::Result;
use clap::{Subcommand, ValueEnum};

use mayhem_daemon::{request_automated, request_backoff};

use super::{daemon_error, home};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommand {
    /// Turn periodic Bernoulli scheduling on or off.
    Automated {
        #[arg(value_enum)]
        mode: Toggle,
    },
    /// Minimum seconds between ticks that start experiments.
    Backoff { seconds: u64 },
}

pub fn run(command: SettingsCommand) -> Result<()> {
    let home = home()?;
    match command {
        SettingsCommand::Automated { mode } => {
            let enabled = matches!(mode, Toggle::On);
            request_automated(&home, enabled).map_err(|e| daemon_error(e, "set automated mode"))?;
            println!("automated mode {}", if enabled { "on" } else { "off" });
        }
        SettingsCommand::Backoff { seconds } => {
            request_backoff(&home, seconds).map_err(|e| daemon_error(e, "set backoff period"))?;
            println!("backoff period {seconds}s");
        }
    }
    Ok(())
}
