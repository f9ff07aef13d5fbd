//! `otacore check`: run one update check and print the decision.

use otacore::CheckDecision;

use crate::commands::common::build_core;
use crate::config::ConfigFile;
use crate::error::CliError;

pub fn run(interactive: bool, ping_only: bool) -> Result<(), CliError> {
    let config = ConfigFile::load()?;
    let mut core = build_core(&config, interactive)?;

    if ping_only {
        core.checker.perform_ping()?;
        println!("Ping sent.");
        return Ok(());
    }

    let outcome = core
        .checker
        .perform_check(&mut core.payload_state, interactive)?;

    match outcome.decision {
        CheckDecision::NoUpdate => {
            println!("No update available.");
        }
        CheckDecision::UpdateAvailable => {
            let response = &outcome.response;
            println!("Update available: {}", response.version);
            for package in &response.packages {
                println!(
                    "  package: {} ({} bytes{})",
                    package.name,
                    package.size,
                    if package.is_delta { ", delta" } else { "" }
                );
            }
            if let Some(url) = core.payload_state.current_url() {
                println!("  download from: {url}");
            }
            if !response.deadline.is_empty() {
                println!("  deadline: {}", response.deadline);
            }
            if response.is_rollback {
                println!("  offer is an enterprise rollback");
            }
        }
        CheckDecision::Deferred(code) => {
            println!("Update available but deferred ({code}).");
        }
        CheckDecision::Ignored(code) => {
            println!("Update offer ignored ({code}).");
        }
    }
    Ok(())
}
