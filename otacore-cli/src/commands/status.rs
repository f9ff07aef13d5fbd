//! `otacore status`: dump the persisted update state.

use otacore::prefs::{keys, PrefStore};

use crate::commands::common::open_prefs;
use crate::config::ConfigFile;
use crate::error::CliError;

pub fn run() -> Result<(), CliError> {
    let config = ConfigFile::load()?;
    let prefs = open_prefs(&config)?;

    println!("State directory: {}", config.prefs_dir.display());

    print_i64(&*prefs, "Payload attempts", keys::PAYLOAD_ATTEMPT_NUMBER)?;
    print_i64(
        &*prefs,
        "Full payload attempts",
        keys::FULL_PAYLOAD_ATTEMPT_NUMBER,
    )?;
    print_i64(&*prefs, "Current URL index", keys::CURRENT_URL_INDEX)?;
    print_i64(
        &*prefs,
        "Current URL failures",
        keys::CURRENT_URL_FAILURE_COUNT,
    )?;
    print_i64(&*prefs, "URL switches", keys::URL_SWITCH_COUNT)?;
    print_i64(&*prefs, "Responses seen", keys::NUM_RESPONSES_SEEN)?;
    print_i64(&*prefs, "Reboots this attempt", keys::NUM_REBOOTS)?;

    match prefs.get_i64(keys::BACKOFF_EXPIRY_TIME)? {
        Some(micros) if micros > 0 => match otacore::clock::from_micros(micros) {
            Some(expiry) => println!("Backoff until:        {}", expiry.to_rfc3339()),
            None => println!("Backoff until:        (malformed timestamp)"),
        },
        _ => println!("Backoff until:        (none)"),
    }

    match prefs.get_string(keys::PREVIOUS_VERSION)? {
        Some(version) => println!("Pending reboot from:  {version}"),
        None => println!("Pending reboot from:  (none)"),
    }

    print_i64(&*prefs, "Last active ping day", keys::LAST_ACTIVE_PING_DAY)?;
    print_i64(
        &*prefs,
        "Last roll call ping day",
        keys::LAST_ROLL_CALL_PING_DAY,
    )?;

    Ok(())
}

fn print_i64(prefs: &dyn PrefStore, label: &str, key: &str) -> Result<(), CliError> {
    let value = prefs.get_i64(key)?;
    match value {
        Some(v) => println!("{label}: {v}"),
        None => println!("{label}: (unset)"),
    }
    Ok(())
}
