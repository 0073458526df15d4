//! Mayhem: chaos experiment orchestrator CLI.
//!
//! # Usage
//!
//! ```text
//! mayhem daemon start|stop|status
//! mayhem status [--json]
//! mayhem admin pause|resume|abort
//! mayhem experiment list [--json]
//! mayhem experiment trigger <resource>
//! mayhem suite run <file>
//! mayhem suite save <file> --backend <type>
//! mayhem settings automated <on|off>
//! mayhem settings backoff <seconds>
//! mayhem config check [--path <file>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    admin::AdminCommand, config::ConfigCommand, daemon::DaemonCommand,
    experiment::ExperimentCommand, settings::SettingsCommand, status::StatusArgs,
    suite::SuiteCommand,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "mayhem",
    version,
    about = "Run controlled chaos experiments against discovered infrastructure",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or control the background orchestrator.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Show admin state, scheduling settings, and backend health.
    Status(StatusArgs),

    /// Change the process-wide admin gate.
    Admin {
        #[command(subcommand)]
        command: AdminCommand,
    },

    /// Inspect or manually start experiments.
    Experiment {
        #[command(subcommand)]
        command: ExperimentCommand,
    },

    /// Run or record experiment suites.
    Suite {
        #[command(subcommand)]
        command: SuiteCommand,
    },

    /// Change scheduling settings on the running daemon.
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },

    /// Validate configuration offline.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Status(args) => args.run(),
        Commands::Admin { command } => commands::admin::run(command),
        Commands::Experiment { command } => commands::experiment::run(command),
        Commands::Suite { command } => commands::suite::run(command),
        Commands::Settings { command } => commands::settings::run(command),
        Commands::Config { command } => commands::config::run(command),
    }
}
