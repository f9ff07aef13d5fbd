//! Shared wiring between commands: turning a [`ConfigFile`] into the
//! decision-core collaborators.

use std::sync::Arc;
use std::time::Duration;

use otacore::boot::BootControl;
use otacore::clock::SystemClock;
use otacore::http::ReqwestClient;
use otacore::metrics::LogMetrics;
use otacore::payload_state::PayloadState;
use otacore::policy::{ConsumerPolicy, DevicePolicy};
use otacore::prefs::{FilePrefs, PrefStore};
use otacore::protocol::request::RequestParams;
use otacore::UpdateChecker;

use crate::config::ConfigFile;
use crate::error::CliError;
use crate::host::{HostBoot, StaticConnection};

/// The rollback blacklist must survive a powerwash, so it lives in a
/// sibling directory the wipe is expected to preserve.
const POWERWASH_SAFE_SUBDIR: &str = "powerwash-safe";

pub struct Core {
    pub checker: UpdateChecker,
    pub payload_state: PayloadState,
    pub prefs: Arc<FilePrefs>,
}

pub fn open_prefs(config: &ConfigFile) -> Result<Arc<FilePrefs>, CliError> {
    Ok(Arc::new(FilePrefs::open(&config.prefs_dir)?))
}

/// Builds the checker and payload state from the host configuration.
pub fn build_core(config: &ConfigFile, interactive: bool) -> Result<Core, CliError> {
    if config.server_url.is_empty() {
        return Err(CliError::Config(
            "server.url is not set; run `otacore config set server.url <url>`".to_string(),
        ));
    }
    if config.app_id.is_empty() {
        return Err(CliError::Config(
            "device.app_id is not set; run `otacore config set device.app_id <id>`".to_string(),
        ));
    }

    let prefs = open_prefs(config)?;
    let powerwash_safe: Arc<dyn PrefStore> = Arc::new(FilePrefs::open(
        config.prefs_dir.join(POWERWASH_SAFE_SUBDIR),
    )?);
    let clock = Arc::new(SystemClock::new());
    let metrics = Arc::new(LogMetrics);
    let boot: Arc<dyn BootControl> = Arc::new(HostBoot::new(true));
    let policy: Arc<dyn DevicePolicy> = Arc::new(ConsumerPolicy);
    let http = Arc::new(ReqwestClient::new(Duration::from_secs(config.timeout_secs))?);

    let params = RequestParams {
        update_url: config.server_url.clone(),
        app_id: config.app_id.clone(),
        system_app_id: None,
        app_version: config.app_version.clone(),
        channel: config.channel.clone(),
        board: config.board.clone(),
        hardware_class: config.hardware_class.clone(),
        delta_okay: config.delta_okay,
        interactive,
        target_version_prefix: String::new(),
        rollback_allowed: false,
    };

    let checker = UpdateChecker::new(
        http,
        clock.clone(),
        prefs.clone(),
        boot.clone(),
        policy.clone(),
        Arc::new(StaticConnection),
        metrics.clone(),
        params,
    );
    let payload_state = PayloadState::new(
        prefs.clone(),
        powerwash_safe,
        clock,
        metrics,
        boot,
        policy,
    )?;

    Ok(Core {
        checker,
        payload_state,
        prefs,
    })
}
