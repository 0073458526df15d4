//! `mayhem config check`: validate config and dry-run discovery without a
//! daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use mayhem_core::config::{build_backends, config_path_at, load_config_file};
use mayhem_core::script::LocalShell;
use mayhem_core::{ApiStatus, Backend, ResourceRegistry};

use super::home;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Parse, validate, and run one discovery pass per backend.
    Check {
        /// Config file (defaults to ~/.mayhem/config.yaml).
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct BackendRow {
    #[tabled(rename = "backend")]
    backend: String,
    #[tabled(rename = "level")]
    level: String,
    #[tabled(rename = "probability")]
    probability: String,
    #[tabled(rename = "api")]
    api: String,
    #[tabled(rename = "resources")]
    resources: String,
}

pub fn run(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Check { path } => {
            let path = match path {
                Some(path) => path,
                None => config_path_at(&home()?),
            };
            check(&path)
        }
    }
}

fn check(path: &Path) -> Result<()> {
    let config = load_config_file(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    config
        .safety_window
        .build()
        .context("invalid safety window")?;

    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let backends = build_backends(&config, config_dir, Arc::new(LocalShell))
        .context("failed to build backends")?;

    println!("{} {}", "config OK:".green(), path.display());
    println!(
        "automated {} | backoff {}s | tick {}s",
        if config.automated_mode { "on" } else { "off" },
        config.backoff_period_secs,
        config.tick_interval_secs,
    );
    if backends.is_empty() {
        println!("{}", "No backends configured; nothing will be scheduled.".yellow());
        return Ok(());
    }

    let registry = ResourceRegistry::new();
    let rows: Vec<BackendRow> = backends
        .iter()
        .map(|backend| discovery_row(backend.as_ref(), &registry))
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn discovery_row(backend: &dyn Backend, registry: &ResourceRegistry) -> BackendRow {
    let resources = match backend.discover(registry) {
        Ok(roster) => roster.len().to_string(),
        Err(err) => format!("error: {err}"),
    };
    let api = match backend.api_status() {
        ApiStatus::Ok => "ok".green().to_string(),
        ApiStatus::Error => "error".red().to_string(),
    };
    BackendRow {
        backend: backend.backend_type().to_string(),
        level: backend.level().to_string(),
        probability: format!("{:.2}", backend.destruction_probability()),
        api,
        resources,
    }
}
