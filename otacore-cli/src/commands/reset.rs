//! `otacore reset`: drop all local update state.
//!
//! The powerwash-safe store is deliberately left alone; the rollback
//! blacklist must outlive resets.

use otacore::prefs::PrefStore;

use crate::commands::common::open_prefs;
use crate::config::ConfigFile;
use crate::error::CliError;

pub fn run() -> Result<(), CliError> {
    let config = ConfigFile::load()?;
    let prefs = open_prefs(&config)?;
    prefs.clear()?;
    println!("Update state cleared in {}", config.prefs_dir.display());
    Ok(())
}
