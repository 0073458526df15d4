//! `mayhem experiment`: list retained experiments, trigger one by hand.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use mayhem_core::ExperimentSnapshot;
use mayhem_daemon::{request_experiments, request_trigger};

use super::{daemon_error, experiment_label, home};

#[derive(Subcommand, Debug)]
pub enum ExperimentCommand {
    /// Show running and recently finished experiments.
    List(ListArgs),
    /// Start one experiment now, bypassing the random draw.
    Trigger {
        /// Identity fingerprint or backend resource id.
        resource: String,
    },
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ExperimentRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "resource")]
    resource: String,
    #[tabled(rename = "group")]
    group: String,
    #[tabled(rename = "operation")]
    operation: String,
    #[tabled(rename = "state")]
    state: String,
    #[tabled(rename = "age")]
    age: String,
}

pub fn run(command: ExperimentCommand) -> Result<()> {
    let home = home()?;
    match command {
        ExperimentCommand::List(args) => {
            let data = request_experiments(&home).map_err(|e| daemon_error(e, "list experiments"))?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&data).context("failed to render experiments JSON")?
                );
                return Ok(());
            }
            let experiments: Vec<ExperimentSnapshot> =
                serde_json::from_value(data).context("daemon returned malformed experiments")?;
            print_table(&experiments);
        }
        ExperimentCommand::Trigger { resource } => {
            let data = request_trigger(&home, &resource)
                .map_err(|e| daemon_error(e, "trigger experiment"))?;
            let snapshot: ExperimentSnapshot =
                serde_json::from_value(data).context("daemon returned a malformed experiment")?;
            println!(
                "started {} on {} ({})",
                snapshot
                    .operation
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string())
                    .bold(),
                snapshot.resource_name,
                snapshot.id,
            );
        }
    }
    Ok(())
}

fn print_table(experiments: &[ExperimentSnapshot]) {
    if experiments.is_empty() {
        println!("No experiments.");
        return;
    }
    let rows: Vec<ExperimentRow> = experiments.iter().map(row).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn row(snapshot: &ExperimentSnapshot) -> ExperimentRow {
    let mut state = experiment_label(snapshot.state).to_string();
    if let Some(failure) = &snapshot.failure {
        state.push_str(&format!(" ({})", format!("{failure:?}").to_lowercase()));
    }
    let age = Utc::now().signed_duration_since(snapshot.created_at);
    ExperimentRow {
        id: snapshot.id.to_string().chars().take(8).collect(),
        resource: snapshot.resource_name.clone(),
        group: snapshot.aggregation_key.to_string(),
        operation: snapshot
            .operation
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string()),
        state,
        age: format_age(age.num_seconds()),
    }
}

fn format_age(seconds: i64) -> String {
    match seconds.max(0) {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_are_compact() {
        assert_eq!(format_age(-3), "0s");
        assert_eq!(format_age(59), "59s");
        assert_eq!(format_age(61), "1m");
        assert_eq!(format_age(3720), "1h2m");
    }
}
