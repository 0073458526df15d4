//! `mayhem suite`: run a suite file, or record the current experiments as
//! one for replay.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use mayhem_core::{BackendType, ExperimentSnapshot, ExperimentSuite};
use mayhem_daemon::{request_experiments, request_suite};

use super::{daemon_error, home};

#[derive(Subcommand, Debug)]
pub enum SuiteCommand {
    /// Start every (group, operation) pair in a suite file.
    Run {
        /// YAML or JSON suite file.
        file: PathBuf,
    },
    /// Write the daemon's retained experiments for one backend as a suite.
    Save {
        file: PathBuf,
        /// Backend type to record.
        #[arg(long)]
        backend: String,
    },
}

pub fn run(command: SuiteCommand) -> Result<()> {
    match command {
        SuiteCommand::Run { file } => {
            let suite = ExperimentSuite::load_at(&file)
                .with_context(|| format!("failed to load suite {}", file.display()))?;
            if suite.is_empty() {
                println!("suite {} has no experiments", file.display());
                return Ok(());
            }
            let pairs = suite.len();
            let data = request_suite(&home()?, suite).map_err(|e| daemon_error(e, "run suite"))?;
            let started: Vec<ExperimentSnapshot> =
                serde_json::from_value(data).context("daemon returned malformed experiments")?;
            println!("started {} of {pairs} suite experiment(s)", started.len());
            for snapshot in &started {
                println!(
                    "  {} {} on {}",
                    snapshot.aggregation_key,
                    snapshot
                        .operation
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                    snapshot.resource_name,
                );
            }
        }
        SuiteCommand::Save { file, backend } => {
            let data = request_experiments(&home()?).map_err(|e| daemon_error(e, "list experiments"))?;
            let experiments: Vec<ExperimentSnapshot> =
                serde_json::from_value(data).context("daemon returned malformed experiments")?;
            let suite = ExperimentSuite::from_experiments(&BackendType::from(backend), &experiments);
            suite
                .save_at(&file)
                .with_context(|| format!("failed to write suite {}", file.display()))?;
            println!("wrote {} experiment(s) to {}", suite.len(), file.display());
        }
    }
    Ok(())
}
