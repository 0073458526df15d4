//! `mayhem status`: admin gate, scheduling settings, backend health.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use mayhem_core::{ApiStatus, BackendHealth};
use mayhem_daemon::{request_status, DaemonError, StatusReport};

use super::{admin_label, home};

/// Arguments for `mayhem status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct BackendRow {
    #[tabled(rename = "backend")]
    backend: String,
    #[tabled(rename = "level")]
    level: String,
    #[tabled(rename = "health")]
    health: String,
    #[tabled(rename = "api")]
    api: String,
    #[tabled(rename = "probability")]
    probability: String,
    #[tabled(rename = "resources")]
    resources: usize,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;

        let data = match request_status(&home) {
            Ok(data) => data,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                if self.json {
                    println!("{}", serde_json::json!({ "running": false }));
                } else {
                    println!("daemon is not running");
                }
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&data).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        let report: StatusReport =
            serde_json::from_value(data).context("daemon returned a malformed status")?;
        print_report(&report);
        Ok(())
    }
}

fn print_report(report: &StatusReport) {
    println!(
        "Mayhem v{} | admin {} for {} | automated {} | backoff {}s | {} active",
        env!("CARGO_PKG_VERSION"),
        admin_label(report.admin.state),
        format_secs(report.admin.seconds_in_state),
        if report.automated_mode { "on" } else { "off" },
        report.backoff_period_secs,
        report.active_experiments,
    );
    match report.seconds_since_last_schedule {
        Some(secs) => println!("last scheduled {} ago", format_secs(secs)),
        None => println!("nothing scheduled yet"),
    }

    if report.backends.is_empty() {
        println!("No backends configured.");
        return;
    }

    let rows: Vec<BackendRow> = report
        .backends
        .iter()
        .map(|b| BackendRow {
            backend: b.backend_type.to_string(),
            level: b.level.to_string(),
            health: match b.health {
                BackendHealth::Ok => "ok".green().to_string(),
                BackendHealth::Degraded => "degraded".yellow().to_string(),
                BackendHealth::Failed => "failed".red().to_string(),
            },
            api: match b.api_status {
                ApiStatus::Ok => "ok".green().to_string(),
                ApiStatus::Error => "error".red().to_string(),
            },
            probability: format!("{:.2}", b.destruction_probability),
            resources: b.roster_size,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn format_secs(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
    }
}
