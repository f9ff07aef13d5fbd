//! INI-backed client configuration.
//!
//! Lives at `~/.config/otacore/config.ini` (or the platform equivalent).
//! Every field has a usable default so a fresh install can run `otacore
//! check` against a server with nothing but `server.url` set.

use std::path::PathBuf;
use std::str::FromStr;

use ini::Ini;

use crate::error::CliError;

/// Default check timeout in seconds when the config does not set one.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// Update server endpoint.
    pub server_url: String,
    /// Application id reported to the server.
    pub app_id: String,
    /// Version currently installed.
    pub app_version: String,
    /// Release channel.
    pub channel: String,
    /// Board / hardware platform name.
    pub board: String,
    /// Optional hardware class string.
    pub hardware_class: String,
    /// Whether delta payloads are acceptable.
    pub delta_okay: bool,
    /// Directory holding persistent update state.
    pub prefs_dir: PathBuf,
    /// HTTP timeout for checks and events, in seconds.
    pub timeout_secs: u64,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            app_id: String::new(),
            app_version: "0.0.0".to_string(),
            channel: "stable-channel".to_string(),
            board: String::new(),
            hardware_class: String::new(),
            delta_okay: true,
            prefs_dir: default_prefs_dir(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Path to the config file.
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("otacore")
        .join("config.ini")
}

fn default_prefs_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("otacore")
        .join("prefs")
}

impl ConfigFile {
    /// Load from the default path; missing file yields defaults.
    pub fn load() -> Result<Self, CliError> {
        Self::load_from(&config_file_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, CliError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path)
            .map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::default();

        if let Some(server) = ini.section(Some("server")) {
            if let Some(url) = server.get("url") {
                config.server_url = url.to_string();
            }
            if let Some(timeout) = server.get("timeout_secs") {
                config.timeout_secs = timeout.parse().map_err(|_| {
                    CliError::Config(format!("server.timeout_secs is not a number: {timeout:?}"))
                })?;
            }
        }
        if let Some(device) = ini.section(Some("device")) {
            if let Some(v) = device.get("app_id") {
                config.app_id = v.to_string();
            }
            if let Some(v) = device.get("version") {
                config.app_version = v.to_string();
            }
            if let Some(v) = device.get("channel") {
                config.channel = v.to_string();
            }
            if let Some(v) = device.get("board") {
                config.board = v.to_string();
            }
            if let Some(v) = device.get("hardware_class") {
                config.hardware_class = v.to_string();
            }
            if let Some(v) = device.get("delta_okay") {
                config.delta_okay = parse_bool("device.delta_okay", v)?;
            }
        }
        if let Some(state) = ini.section(Some("state")) {
            if let Some(v) = state.get("prefs_dir") {
                config.prefs_dir = PathBuf::from(v);
            }
        }
        Ok(config)
    }

    /// Save to the default path, creating parent directories.
    pub fn save(&self) -> Result<(), CliError> {
        self.save_to(&config_file_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), CliError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut ini = Ini::new();
        ini.with_section(Some("server"))
            .set("url", &self.server_url)
            .set("timeout_secs", self.timeout_secs.to_string());
        ini.with_section(Some("device"))
            .set("app_id", &self.app_id)
            .set("version", &self.app_version)
            .set("channel", &self.channel)
            .set("board", &self.board)
            .set("hardware_class", &self.hardware_class)
            .set("delta_okay", self.delta_okay.to_string());
        ini.with_section(Some("state"))
            .set("prefs_dir", self.prefs_dir.display().to_string());
        ini.write_to_file(path)
            .map_err(|e| CliError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, CliError> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(CliError::Config(format!(
            "{key} must be true or false, got {other:?}"
        ))),
    }
}

/// Addressable configuration keys for `config get` / `config set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    ServerUrl,
    TimeoutSecs,
    AppId,
    Version,
    Channel,
    Board,
    HardwareClass,
    DeltaOkay,
    PrefsDir,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 9] = [
        ConfigKey::ServerUrl,
        ConfigKey::TimeoutSecs,
        ConfigKey::AppId,
        ConfigKey::Version,
        ConfigKey::Channel,
        ConfigKey::Board,
        ConfigKey::HardwareClass,
        ConfigKey::DeltaOkay,
        ConfigKey::PrefsDir,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::ServerUrl => "server.url",
            ConfigKey::TimeoutSecs => "server.timeout_secs",
            ConfigKey::AppId => "device.app_id",
            ConfigKey::Version => "device.version",
            ConfigKey::Channel => "device.channel",
            ConfigKey::Board => "device.board",
            ConfigKey::HardwareClass => "device.hardware_class",
            ConfigKey::DeltaOkay => "device.delta_okay",
            ConfigKey::PrefsDir => "state.prefs_dir",
        }
    }

    pub fn get(self, config: &ConfigFile) -> String {
        match self {
            ConfigKey::ServerUrl => config.server_url.clone(),
            ConfigKey::TimeoutSecs => config.timeout_secs.to_string(),
            ConfigKey::AppId => config.app_id.clone(),
            ConfigKey::Version => config.app_version.clone(),
            ConfigKey::Channel => config.channel.clone(),
            ConfigKey::Board => config.board.clone(),
            ConfigKey::HardwareClass => config.hardware_class.clone(),
            ConfigKey::DeltaOkay => config.delta_okay.to_string(),
            ConfigKey::PrefsDir => config.prefs_dir.display().to_string(),
        }
    }

    pub fn set(self, config: &mut ConfigFile, value: &str) -> Result<(), CliError> {
        match self {
            ConfigKey::ServerUrl => config.server_url = value.to_string(),
            ConfigKey::TimeoutSecs => {
                config.timeout_secs = value.parse().map_err(|_| {
                    CliError::Config(format!("server.timeout_secs is not a number: {value:?}"))
                })?;
            }
            ConfigKey::AppId => config.app_id = value.to_string(),
            ConfigKey::Version => config.app_version = value.to_string(),
            ConfigKey::Channel => config.channel = value.to_string(),
            ConfigKey::Board => config.board = value.to_string(),
            ConfigKey::HardwareClass => config.hardware_class = value.to_string(),
            ConfigKey::DeltaOkay => config.delta_okay = parse_bool("device.delta_okay", value)?,
            ConfigKey::PrefsDir => config.prefs_dir = PathBuf::from(value),
        }
        Ok(())
    }
}

impl FromStr for ConfigKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or(())
    }
}
