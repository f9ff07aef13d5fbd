//! OtaCore CLI - operator surface for the update decision core.
//!
//! Runs update checks, inspects persisted attempt state, and manages the
//! client configuration. Payload download and installation are host
//! integrations and are not driven from here.

mod commands;
mod config;
mod error;
mod host;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::config::ConfigCommands;
use crate::error::CliError;

#[derive(Debug, Parser)]
#[command(name = "otacore", version, about = "Over-the-air update client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one update check against the configured server
    Check {
        /// Mark the check as user-initiated, which skips scattering and
        /// backoff deferrals
        #[arg(long)]
        interactive: bool,

        /// Send only the activity ping, without checking for an update
        #[arg(long, conflicts_with = "interactive")]
        ping_only: bool,
    },

    /// Show persisted update state
    Status,

    /// Clear persisted update state
    Reset,

    /// View and modify configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result: Result<(), CliError> = match cli.command {
        Commands::Check {
            interactive,
            ping_only,
        } => commands::check::run(interactive, ping_only),
        Commands::Status => commands::status::run(),
        Commands::Reset => commands::reset::run(),
        Commands::Config { command } => commands::config::run(command),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
