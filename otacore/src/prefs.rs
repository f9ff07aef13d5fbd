//! Typed key-value persistence for update state.
//!
//! All durable counters of the payload state tracker live in a flat
//! string/int64/bool store behind the [`PrefStore`] trait. Writes are
//! synchronous: when a setter returns, the value is on disk. Two
//! implementations are provided:
//!
//! - [`MemoryPrefs`] - ephemeral, for tests and stateless hosts
//! - [`FilePrefs`] - one file per key under a directory
//!
//! A second store instance ("powerwash-safe") holds the rollback version
//! blacklist and the rollback-happened marker, which must survive a full
//! device wipe.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

/// Errors from the pref store.
#[derive(Debug, Error)]
pub enum PrefsError {
    /// Key contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid pref key: {0:?}")]
    InvalidKey(String),

    /// Stored value could not be interpreted as the requested type.
    #[error("pref {key} holds a malformed value: {value:?}")]
    MalformedValue { key: String, value: String },

    /// Underlying storage failed.
    #[error("pref storage I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

/// Flat, typed key-value store with synchronous write-through.
pub trait PrefStore: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError>;
    fn set_string(&self, key: &str, value: &str) -> Result<(), PrefsError>;

    fn get_i64(&self, key: &str) -> Result<Option<i64>, PrefsError>;
    fn set_i64(&self, key: &str, value: i64) -> Result<(), PrefsError>;

    fn get_bool(&self, key: &str) -> Result<Option<bool>, PrefsError>;
    fn set_bool(&self, key: &str, value: bool) -> Result<(), PrefsError>;

    fn exists(&self, key: &str) -> bool;
    fn remove(&self, key: &str) -> Result<(), PrefsError>;

    /// Remove every stored key. Used by corruption recovery and the CLI
    /// `reset` command.
    fn clear(&self) -> Result<(), PrefsError>;
}

/// Well-known pref keys.
///
/// The names are stable: they form the on-disk contract with previous
/// versions of the client, so renaming one silently resets that counter.
pub mod keys {
    pub const CURRENT_RESPONSE_SIGNATURE: &str = "current-response-signature";
    pub const PAYLOAD_ATTEMPT_NUMBER: &str = "payload-attempt-number";
    pub const FULL_PAYLOAD_ATTEMPT_NUMBER: &str = "full-payload-attempt-number";
    pub const CURRENT_URL_INDEX: &str = "current-url-index";
    pub const CURRENT_URL_FAILURE_COUNT: &str = "current-url-failure-count";
    pub const URL_SWITCH_COUNT: &str = "url-switch-count";
    pub const BACKOFF_EXPIRY_TIME: &str = "backoff-expiry-time";
    pub const UPDATE_TIMESTAMP_START: &str = "update-timestamp-start";
    pub const UPDATE_DURATION_UPTIME: &str = "update-duration-uptime";
    pub const CURRENT_BYTES_DOWNLOADED: &str = "current-bytes-downloaded";
    pub const TOTAL_BYTES_DOWNLOADED: &str = "total-bytes-downloaded";
    pub const NUM_REBOOTS: &str = "num-reboots";
    pub const NUM_RESPONSES_SEEN: &str = "num-responses-seen";
    pub const P2P_NUM_ATTEMPTS: &str = "p2p-num-attempts";
    pub const P2P_FIRST_ATTEMPT_TIMESTAMP: &str = "p2p-first-attempt-timestamp";
    pub const ATTEMPT_IN_PROGRESS: &str = "attempt-in-progress";
    pub const SYSTEM_UPDATED_MARKER: &str = "system-updated-marker";
    pub const TARGET_VERSION_UNIQUE_ID: &str = "target-version-unique-id";
    pub const TARGET_VERSION_ATTEMPT: &str = "target-version-attempt";
    pub const TARGET_VERSION_INSTALLED_FROM: &str = "target-version-installed-from";
    pub const PREVIOUS_VERSION: &str = "previous-version";
    pub const LAST_ACTIVE_PING_DAY: &str = "last-active-ping-day";
    pub const LAST_ROLL_CALL_PING_DAY: &str = "last-roll-call-ping-day";
    pub const UPDATE_FIRST_SEEN_AT: &str = "update-first-seen-at";
    pub const UPDATE_CHECK_COUNT: &str = "update-check-count";
    pub const WALL_CLOCK_SCATTERING_WAIT_PERIOD: &str = "wall-clock-scattering-wait-period";
    pub const UPDATE_OVER_CELLULAR_PERMISSION: &str = "update-over-cellular-permission";
    pub const UPDATE_OVER_CELLULAR_TARGET_VERSION: &str = "update-over-cellular-target-version";
    pub const UPDATE_OVER_CELLULAR_TARGET_SIZE: &str = "update-over-cellular-target-size";
    pub const INSTALL_DATE_DAYS: &str = "install-date-days";
    pub const NO_IGNORE_BACKOFF: &str = "no-ignore-backoff";
    pub const OMAHA_COHORT: &str = "omaha-cohort";
    pub const OMAHA_COHORT_HINT: &str = "omaha-cohort-hint";
    pub const OMAHA_COHORT_NAME: &str = "omaha-cohort-name";
    pub const OMAHA_EOL_STATUS: &str = "omaha-eol-status";

    // Powerwash-safe store only.
    pub const ROLLBACK_VERSION: &str = "rollback-version";
    pub const ROLLBACK_HAPPENED: &str = "rollback-happened";

    /// Per-download-source key, e.g. `current-bytes-downloaded-from-HttpsServer`.
    pub fn per_source(prefix: &str, source_name: &str) -> String {
        format!("{}-from-{}", prefix, source_name)
    }
}

fn validate_key(key: &str) -> Result<(), PrefsError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PrefsError::InvalidKey(key.to_string()))
    }
}

fn parse_i64(key: &str, raw: &str) -> Result<i64, PrefsError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| PrefsError::MalformedValue {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, PrefsError> {
    match raw.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(PrefsError::MalformedValue {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}

/// In-memory store for tests and hosts without persistent storage.
#[derive(Default)]
pub struct MemoryPrefs {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrefStore for MemoryPrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
        validate_key(key)?;
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        validate_key(key)?;
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_i64(&self, key: &str) -> Result<Option<i64>, PrefsError> {
        match self.get_string(key)? {
            Some(raw) => Ok(Some(parse_i64(key, &raw)?)),
            None => Ok(None),
        }
    }

    fn set_i64(&self, key: &str, value: i64) -> Result<(), PrefsError> {
        self.set_string(key, &value.to_string())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, PrefsError> {
        match self.get_string(key)? {
            Some(raw) => Ok(Some(parse_bool(key, &raw)?)),
            None => Ok(None),
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        self.set_string(key, if value { "true" } else { "false" })
    }

    fn exists(&self, key: &str) -> bool {
        self.values.lock().unwrap().contains_key(key)
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        validate_key(key)?;
        self.values.lock().unwrap().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), PrefsError> {
        self.values.lock().unwrap().clear();
        Ok(())
    }
}

/// Directory-backed store: one file per key, value stored as UTF-8 text.
///
/// The layout keeps each counter independently corruptible - a truncated
/// write damages one key, not the whole record - and makes manual
/// inspection trivial.
pub struct FilePrefs {
    dir: PathBuf,
}

impl FilePrefs {
    /// Open (creating if needed) a pref directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PrefsError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| PrefsError::Io {
            key: dir.display().to_string(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PrefsError> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }

    fn read(&self, key: &str) -> Result<Option<String>, PrefsError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PrefsError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        let path = self.path_for(key)?;
        write_atomically(&path, value).map_err(|e| PrefsError::Io {
            key: key.to_string(),
            source: e,
        })
    }
}

/// Write via a temp file + rename so readers never observe a torn value.
fn write_atomically(path: &Path, value: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, value)?;
    fs::rename(&tmp, path)
}

impl PrefStore for FilePrefs {
    fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
        self.read(key)
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        self.write(key, value)
    }

    fn get_i64(&self, key: &str) -> Result<Option<i64>, PrefsError> {
        match self.read(key)? {
            Some(raw) => Ok(Some(parse_i64(key, &raw)?)),
            None => Ok(None),
        }
    }

    fn set_i64(&self, key: &str, value: i64) -> Result<(), PrefsError> {
        self.write(key, &value.to_string())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, PrefsError> {
        match self.read(key)? {
            Some(raw) => Ok(Some(parse_bool(key, &raw)?)),
            None => Ok(None),
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        self.write(key, if value { "true" } else { "false" })
    }

    fn exists(&self, key: &str) -> bool {
        match self.path_for(key) {
            Ok(path) => path.is_file(),
            Err(_) => false,
        }
    }

    fn remove(&self, key: &str) -> Result<(), PrefsError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PrefsError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    fn clear(&self) -> Result<(), PrefsError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| PrefsError::Io {
            key: self.dir.display().to_string(),
            source: e,
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| PrefsError::Io {
                key: self.dir.display().to_string(),
                source: e,
            })?;
            if entry.path().is_file() {
                fs::remove_file(entry.path()).map_err(|e| PrefsError::Io {
                    key: entry.path().display().to_string(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_prefs_typed_round_trip() {
        let prefs = MemoryPrefs::new();
        prefs.set_string("a-string", "hello").unwrap();
        prefs.set_i64("an-int", -42).unwrap();
        prefs.set_bool("a-bool", true).unwrap();

        assert_eq!(prefs.get_string("a-string").unwrap().unwrap(), "hello");
        assert_eq!(prefs.get_i64("an-int").unwrap().unwrap(), -42);
        assert!(prefs.get_bool("a-bool").unwrap().unwrap());
        assert!(prefs.get_string("missing").unwrap().is_none());
    }

    #[test]
    fn test_invalid_key_rejected() {
        let prefs = MemoryPrefs::new();
        assert!(prefs.set_string("../escape", "x").is_err());
        assert!(prefs.set_string("", "x").is_err());
        assert!(prefs.set_string("with space", "x").is_err());
    }

    #[test]
    fn test_malformed_value_surfaces() {
        let prefs = MemoryPrefs::new();
        prefs.set_string("an-int", "not-a-number").unwrap();
        assert!(matches!(
            prefs.get_i64("an-int"),
            Err(PrefsError::MalformedValue { .. })
        ));
    }

    #[test]
    fn test_file_prefs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = FilePrefs::open(dir.path()).unwrap();

        prefs.set_i64(keys::CURRENT_URL_INDEX, 2).unwrap();
        prefs.set_bool(keys::ATTEMPT_IN_PROGRESS, true).unwrap();
        assert!(prefs.exists(keys::CURRENT_URL_INDEX));
        assert_eq!(prefs.get_i64(keys::CURRENT_URL_INDEX).unwrap().unwrap(), 2);

        // Survives a re-open, i.e. a process restart.
        drop(prefs);
        let prefs = FilePrefs::open(dir.path()).unwrap();
        assert_eq!(prefs.get_i64(keys::CURRENT_URL_INDEX).unwrap().unwrap(), 2);
        assert!(prefs.get_bool(keys::ATTEMPT_IN_PROGRESS).unwrap().unwrap());
    }

    #[test]
    fn test_file_prefs_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = FilePrefs::open(dir.path()).unwrap();

        prefs.set_string("one", "1").unwrap();
        prefs.set_string("two", "2").unwrap();
        prefs.remove("one").unwrap();
        assert!(!prefs.exists("one"));
        // Removing a missing key is not an error.
        prefs.remove("one").unwrap();

        prefs.clear().unwrap();
        assert!(!prefs.exists("two"));
    }

    #[test]
    fn test_per_source_key_shape() {
        assert_eq!(
            keys::per_source(keys::TOTAL_BYTES_DOWNLOADED, "HttpPeer"),
            "total-bytes-downloaded-from-HttpPeer"
        );
    }
}
