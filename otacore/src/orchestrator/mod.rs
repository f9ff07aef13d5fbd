//! Attempt state machine tying the checker, payload state, and installer
//! together.
//!
//! The orchestrator runs one update attempt at a time and owns the status
//! visible to the host: check, download, verify, apply, reboot-pending.
//! It reports lifecycle events to the server at stage boundaries and
//! funnels every failure through the payload state so failover and
//! backoff bookkeeping stay consistent no matter where an attempt died.
//!
//! The actual byte moving lives behind [`PayloadInstaller`]; this module
//! only decides what to download from where and what counts as success.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::boot::BootControl;
use crate::checker::{CheckDecision, UpdateChecker};
use crate::errors::ErrorCode;
use crate::payload_state::PayloadState;
use crate::prefs::{keys, PrefStore, PrefsError};
use crate::protocol::request::{Event, EventType};
use crate::protocol::response::{Package, Response};

/// Externally visible state of the update client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Idle,
    CheckingForUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingErrorEvent,
    AttemptingRollback,
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpdateStatus::Idle => "IDLE",
            UpdateStatus::CheckingForUpdate => "CHECKING_FOR_UPDATE",
            UpdateStatus::UpdateAvailable => "UPDATE_AVAILABLE",
            UpdateStatus::Downloading => "DOWNLOADING",
            UpdateStatus::Verifying => "VERIFYING",
            UpdateStatus::Finalizing => "FINALIZING",
            UpdateStatus::UpdatedNeedReboot => "UPDATED_NEED_REBOOT",
            UpdateStatus::ReportingErrorEvent => "REPORTING_ERROR_EVENT",
            UpdateStatus::AttemptingRollback => "ATTEMPTING_ROLLBACK",
        };
        f.write_str(name)
    }
}

/// Everything the installer needs to fetch and apply one update.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub version: String,
    pub payloads: Vec<Package>,
    pub is_rollback: bool,
    pub powerwash_required: bool,
    pub public_key_rsa: String,
    /// Identity of the target image, used for expected-reboot tracking.
    pub target_version_uid: String,
}

impl InstallPlan {
    fn from_response(response: &Response) -> Self {
        let target_version_uid = response
            .packages
            .first()
            .map(|p| format!("{}:{}", p.hash, p.size))
            .unwrap_or_default();
        Self {
            version: response.version.clone(),
            payloads: response.packages.clone(),
            is_rollback: response.is_rollback,
            powerwash_required: response.powerwash_required,
            public_key_rsa: response.public_key_rsa.clone(),
            target_version_uid,
        }
    }
}

/// Moves and applies payload bytes. Implementations live in the host; the
/// orchestrator drives them and owns all bookkeeping.
pub trait PayloadInstaller: Send + Sync {
    /// Fetch one payload from `url`, reporting byte counts through
    /// `progress` as they arrive.
    fn download(
        &self,
        url: &str,
        package: &Package,
        progress: &mut dyn FnMut(u64),
    ) -> Result<(), ErrorCode>;

    /// Verify a fully downloaded payload against its hash and signature.
    fn verify(&self, package: &Package) -> Result<(), ErrorCode>;

    /// Write the update to the inactive slot and mark it bootable.
    fn apply(&self, plan: &InstallPlan) -> Result<(), ErrorCode>;
}

/// Errors surfaced to the caller of the orchestrator. Attempt failures
/// are not among them: those are absorbed into payload state and the
/// status, because a failed attempt is a normal outcome.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Prefs(#[from] PrefsError),
}

/// Single-attempt update driver.
pub struct UpdateOrchestrator {
    checker: UpdateChecker,
    payload_state: PayloadState,
    installer: Arc<dyn PayloadInstaller>,
    boot: Arc<dyn BootControl>,
    prefs: Arc<dyn PrefStore>,
    status: UpdateStatus,
    /// Error code of the last failed attempt, for status reporting.
    last_error: Option<ErrorCode>,
}

impl UpdateOrchestrator {
    pub fn new(
        checker: UpdateChecker,
        payload_state: PayloadState,
        installer: Arc<dyn PayloadInstaller>,
        boot: Arc<dyn BootControl>,
        prefs: Arc<dyn PrefStore>,
    ) -> Self {
        Self {
            checker,
            payload_state,
            installer,
            boot,
            prefs,
            status: UpdateStatus::Idle,
            last_error: None,
        }
    }

    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    pub fn payload_state(&self) -> &PayloadState {
        &self.payload_state
    }

    /// Startup housekeeping, run once per process start.
    ///
    /// Detects boots into (or back out of) a freshly applied update and
    /// reports attempts that died without a terminal record.
    pub fn on_started(&mut self, current_version: &str) {
        let rebooted = match self.prefs.get_string(keys::SYSTEM_UPDATED_MARKER) {
            Ok(Some(boot_id)) => {
                let rebooted = self.boot.system_rebooted_since(&boot_id);
                if rebooted {
                    if let Err(e) = self.prefs.remove(keys::SYSTEM_UPDATED_MARKER) {
                        warn!(error = %e, "failed to clear updated marker");
                    }
                }
                rebooted
            }
            _ => false,
        };
        self.payload_state.report_failed_boot_if_needed();
        self.payload_state.update_resumed(rebooted);
        info!(current_version, rebooted, "update client started");
    }

    /// Runs one update check and, when allowed, one full attempt.
    pub fn check_and_update(&mut self, interactive: bool) -> Result<UpdateStatus, OrchestratorError> {
        self.status = UpdateStatus::CheckingForUpdate;
        self.last_error = None;

        let outcome = match self.checker.perform_check(&mut self.payload_state, interactive) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "update check failed");
                self.fail_attempt(e.error_code(), false);
                return Ok(self.status);
            }
        };

        match outcome.decision {
            CheckDecision::NoUpdate => {
                self.status = UpdateStatus::Idle;
                return Ok(self.status);
            }
            CheckDecision::Ignored(code) | CheckDecision::Deferred(code) => {
                info!(%code, "update withheld");
                self.status = UpdateStatus::Idle;
                return Ok(self.status);
            }
            CheckDecision::UpdateAvailable => {}
        }

        let plan = match self.build_install_plan(&outcome.response) {
            Ok(plan) => plan,
            Err(code) => {
                self.fail_attempt(code, true);
                return Ok(self.status);
            }
        };

        self.status = if plan.is_rollback {
            UpdateStatus::AttemptingRollback
        } else {
            UpdateStatus::UpdateAvailable
        };
        info!(version = plan.version, rollback = plan.is_rollback, "starting update attempt");

        self.payload_state.update_restarted();
        self.payload_state.attempt_started();
        self.report_event(Event::success(EventType::UpdateDownloadStarted));

        self.status = UpdateStatus::Downloading;
        if let Err(code) = self.download_payloads(&plan) {
            self.fail_attempt(code, true);
            return Ok(self.status);
        }
        self.payload_state.download_complete();
        self.report_event(Event::success(EventType::UpdateDownloadFinished));

        self.status = UpdateStatus::Finalizing;
        if let Err(code) = self.installer.apply(&plan) {
            error!(%code, "failed to apply update");
            self.fail_attempt(code, true);
            return Ok(self.status);
        }

        self.finish_successful_attempt(&plan)?;
        Ok(self.status)
    }

    fn download_payloads(&mut self, plan: &InstallPlan) -> Result<(), ErrorCode> {
        for package in &plan.payloads {
            let url = match self.payload_state.current_url() {
                Some(url) => url.to_string(),
                None => {
                    error!("no usable download URL after policy filtering");
                    return Err(ErrorCode::OmahaResponseInvalid);
                }
            };
            info!(url, name = package.name, size = package.size, "downloading payload");

            // The borrow of payload_state inside the progress callback
            // keeps the installer call and the accounting separate.
            let mut downloaded: u64 = 0;
            self.installer
                .download(&url, package, &mut |bytes| downloaded += bytes)?;
            self.payload_state.download_progress(downloaded);

            self.status = UpdateStatus::Verifying;
            self.installer.verify(package)?;
            self.status = UpdateStatus::Downloading;

            if !self.payload_state.next_payload() {
                break;
            }
        }
        Ok(())
    }

    /// Validates the offered response against anti-rollback constraints
    /// and produces the install plan.
    fn build_install_plan(&self, response: &Response) -> Result<InstallPlan, ErrorCode> {
        if response.is_rollback {
            let keys = &response.rollback_key_versions;
            let image_kernel = combine_key_version(keys.kernel_key, keys.kernel);
            let image_firmware = combine_key_version(keys.firmware_key, keys.firmware);
            if let Some(min_kernel) = self.boot.min_kernel_key_version() {
                if image_kernel < min_kernel {
                    error!(
                        image_kernel,
                        min_kernel, "rollback image kernel key version is below the device minimum"
                    );
                    return Err(ErrorCode::RollbackVersionError);
                }
            }
            if let Some(min_firmware) = self.boot.min_firmware_key_version() {
                if image_firmware < min_firmware {
                    error!(
                        image_firmware,
                        min_firmware,
                        "rollback image firmware key version is below the device minimum"
                    );
                    return Err(ErrorCode::RollbackVersionError);
                }
            }
        }
        Ok(InstallPlan::from_response(response))
    }

    fn finish_successful_attempt(&mut self, plan: &InstallPlan) -> Result<(), OrchestratorError> {
        self.payload_state.update_succeeded();
        self.payload_state
            .expect_reboot_in_new_version(&plan.target_version_uid);

        // Remember what we are updating away from; the first check after
        // the reboot reports it to the server.
        self.prefs
            .set_string(keys::PREVIOUS_VERSION, &self.checker.params().app_version)?;
        self.prefs
            .set_string(keys::SYSTEM_UPDATED_MARKER, &self.boot.boot_id())?;

        if plan.is_rollback {
            // Blacklist the version we are leaving so the server cannot
            // bounce us straight back onto it.
            self.payload_state
                .set_rollback_version(&self.checker.params().app_version);
            self.payload_state.set_rollback_happened(true);
        }

        self.report_event(Event::success(EventType::UpdateComplete));
        self.status = UpdateStatus::UpdatedNeedReboot;
        info!(version = plan.version, "update applied, reboot pending");
        Ok(())
    }

    /// Terminal handling for a failed attempt: charge the failover state,
    /// tell the server, go idle.
    fn fail_attempt(&mut self, code: ErrorCode, charge_failover: bool) {
        self.status = UpdateStatus::ReportingErrorEvent;
        self.last_error = Some(code);
        if charge_failover {
            self.payload_state.update_failed(code);
        }
        self.report_event(Event::error(EventType::UpdateComplete, code));
        self.status = UpdateStatus::Idle;
    }

    fn report_event(&self, event: Event) {
        if let Err(e) = self.checker.send_event(event) {
            // Event loss is tolerable; the attempt outcome is already
            // recorded locally.
            warn!(error = %e, "failed to report event to update server");
        }
    }

    /// Drops all local update state. Used by the host's reset surface.
    pub fn reset(&mut self) -> Result<(), OrchestratorError> {
        self.prefs.clear()?;
        self.status = UpdateStatus::Idle;
        self.last_error = None;
        info!("update state reset");
        Ok(())
    }
}

/// Verified-boot key versions travel split into a key generation and a
/// version; the firmware compares them combined.
fn combine_key_version(key: u16, version: u16) -> u32 {
    ((key as u32) << 16) | version as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::tests::FakeBootControl;
    use crate::clock::testing::FakeClock;
    use crate::http::tests::MockHttpClient;
    use crate::metrics::tests::RecordingMetrics;
    use crate::policy::tests::{FakeConnection, FakePolicy};
    use crate::policy::{ConnectionType, Tethering};
    use crate::prefs::MemoryPrefs;
    use crate::protocol::request::RequestParams;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    const APP_ID: &str = "{app-id}";

    /// Scripted installer: each stage succeeds unless a failure is queued.
    #[derive(Default)]
    struct MockInstaller {
        download_error: Mutex<Option<ErrorCode>>,
        verify_error: Mutex<Option<ErrorCode>>,
        apply_error: Mutex<Option<ErrorCode>>,
        downloads: Mutex<Vec<String>>,
        applied: Mutex<Vec<String>>,
    }

    impl PayloadInstaller for MockInstaller {
        fn download(
            &self,
            url: &str,
            package: &Package,
            progress: &mut dyn FnMut(u64),
        ) -> Result<(), ErrorCode> {
            self.downloads.lock().unwrap().push(url.to_string());
            if let Some(code) = self.download_error.lock().unwrap().take() {
                return Err(code);
            }
            progress(package.size);
            Ok(())
        }

        fn verify(&self, _package: &Package) -> Result<(), ErrorCode> {
            match self.verify_error.lock().unwrap().take() {
                Some(code) => Err(code),
                None => Ok(()),
            }
        }

        fn apply(&self, plan: &InstallPlan) -> Result<(), ErrorCode> {
            if let Some(code) = self.apply_error.lock().unwrap().take() {
                return Err(code);
            }
            self.applied.lock().unwrap().push(plan.version.clone());
            Ok(())
        }
    }

    struct Harness {
        http: Arc<MockHttpClient>,
        prefs: Arc<MemoryPrefs>,
        boot: Arc<FakeBootControl>,
        metrics: Arc<RecordingMetrics>,
        installer: Arc<MockInstaller>,
        rollback_allowed: bool,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                http: Arc::new(MockHttpClient::new()),
                prefs: Arc::new(MemoryPrefs::new()),
                boot: Arc::new(FakeBootControl::new()),
                metrics: Arc::new(RecordingMetrics::default()),
                installer: Arc::new(MockInstaller::default()),
                rollback_allowed: false,
            }
        }

        fn orchestrator(&self) -> UpdateOrchestrator {
            let clock = Arc::new(FakeClock::new(
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            ));
            let policy: Arc<dyn crate::policy::DevicePolicy> = Arc::new(FakePolicy::default());
            let params = RequestParams {
                update_url: "https://update.example.com/service/update".to_string(),
                app_id: APP_ID.to_string(),
                system_app_id: None,
                app_version: "1.0.0".to_string(),
                channel: "stable-channel".to_string(),
                board: "x86-generic".to_string(),
                hardware_class: String::new(),
                delta_okay: true,
                interactive: false,
                target_version_prefix: String::new(),
                rollback_allowed: self.rollback_allowed,
            };
            let checker = UpdateChecker::new(
                self.http.clone(),
                clock.clone(),
                self.prefs.clone(),
                self.boot.clone(),
                policy.clone(),
                Arc::new(FakeConnection::new(
                    ConnectionType::Ethernet,
                    Tethering::NotDetected,
                )),
                self.metrics.clone(),
                params,
            );
            let payload_state = PayloadState::new(
                self.prefs.clone(),
                Arc::new(MemoryPrefs::new()),
                clock,
                self.metrics.clone(),
                self.boot.clone(),
                policy,
            )
            .unwrap();
            UpdateOrchestrator::new(
                checker,
                payload_state,
                self.installer.clone(),
                self.boot.clone(),
                self.prefs.clone(),
            )
        }
    }

    fn update_body(version: &str, extra_updatecheck: &str) -> String {
        format!(
            r#"<response protocol="3.0">
  <daystart elapsed_seconds="400"/>
  <app appid="{APP_ID}" status="ok">
    <updatecheck status="ok"{extra_updatecheck}>
      <urls><url codebase="https://cdn.example.com/"/></urls>
      <manifest version="{version}">
        <packages><package name="payload.bin" size="1000" hash_sha256="abcd"/></packages>
        <actions><action event="postinstall" MetadataSize="10"/></actions>
      </manifest>
    </updatecheck>
  </app>
</response>"#
        )
    }

    fn noupdate_body() -> String {
        format!(
            r#"<response protocol="3.0">
  <app appid="{APP_ID}" status="ok"><updatecheck status="noupdate"/></app>
</response>"#
        )
    }

    fn event_ok_body() -> &'static str {
        "<response protocol=\"3.0\"></response>"
    }

    #[test]
    fn test_successful_attempt_end_to_end() {
        let h = Harness::new();
        h.http.push_response(200, &update_body("2.0.0", ""));
        h.http.push_response(200, event_ok_body()); // download started
        h.http.push_response(200, event_ok_body()); // download finished
        h.http.push_response(200, event_ok_body()); // update complete

        let mut orchestrator = h.orchestrator();
        let status = orchestrator.check_and_update(false).unwrap();
        assert_eq!(status, UpdateStatus::UpdatedNeedReboot);

        // The payload was fetched from the server-preferred URL and
        // applied.
        assert_eq!(
            h.installer.downloads.lock().unwrap().as_slice(),
            ["https://cdn.example.com/payload.bin"]
        );
        assert_eq!(h.installer.applied.lock().unwrap().as_slice(), ["2.0.0"]);

        // Stage boundary events 13, 14, 3 followed the check request.
        let requests = h.http.requests();
        assert_eq!(requests.len(), 4);
        assert!(requests[1].1.contains("eventtype=\"13\""));
        assert!(requests[2].1.contains("eventtype=\"14\""));
        assert!(requests[3].1.contains("eventtype=\"3\" eventresult=\"1\""));

        // Reboot expectations were recorded.
        assert_eq!(
            h.prefs.get_string(keys::PREVIOUS_VERSION).unwrap().as_deref(),
            Some("1.0.0")
        );
        assert!(h.prefs.exists(keys::SYSTEM_UPDATED_MARKER));
        assert_eq!(
            h.prefs
                .get_string(keys::TARGET_VERSION_UNIQUE_ID)
                .unwrap()
                .as_deref(),
            Some("abcd:1000")
        );
    }

    #[test]
    fn test_noupdate_leaves_idle() {
        let h = Harness::new();
        h.http.push_response(200, &noupdate_body());
        let mut orchestrator = h.orchestrator();
        let status = orchestrator.check_and_update(false).unwrap();
        assert_eq!(status, UpdateStatus::Idle);
        assert!(h.installer.downloads.lock().unwrap().is_empty());
    }

    #[test]
    fn test_download_failure_reports_and_charges_failover() {
        let h = Harness::new();
        h.http.push_response(200, &update_body("2.0.0", ""));
        h.http.push_response(200, event_ok_body()); // download started
        h.http.push_response(200, event_ok_body()); // error event
        *h.installer.download_error.lock().unwrap() = Some(ErrorCode::DownloadTransferError);

        let mut orchestrator = h.orchestrator();
        let status = orchestrator.check_and_update(false).unwrap();
        assert_eq!(status, UpdateStatus::Idle);
        assert_eq!(
            orchestrator.last_error(),
            Some(ErrorCode::DownloadTransferError)
        );

        // The transient failure charged the current URL.
        assert_eq!(orchestrator.payload_state().url_failure_count(), 1);

        // The terminal error event carried the code.
        let requests = h.http.requests();
        let last = &requests.last().unwrap().1;
        assert!(last.contains("eventtype=\"3\""));
        assert!(last.contains("eventresult=\"0\""));
        assert!(last.contains(&format!(
            "errorcode=\"{}\"",
            ErrorCode::DownloadTransferError.code()
        )));
    }

    #[test]
    fn test_check_failure_does_not_touch_failover() {
        let h = Harness::new();
        h.http.push_response(500, "");
        h.http.push_response(200, event_ok_body()); // error event
        let mut orchestrator = h.orchestrator();
        let status = orchestrator.check_and_update(false).unwrap();
        assert_eq!(status, UpdateStatus::Idle);
        assert_eq!(orchestrator.last_error(), Some(ErrorCode::HttpResponse(500)));
        assert_eq!(orchestrator.payload_state().url_failure_count(), 0);
    }

    #[test]
    fn test_verify_failure_advances_url() {
        let h = Harness::new();
        h.http.push_response(200, &update_body("2.0.0", ""));
        h.http.push_response(200, event_ok_body());
        h.http.push_response(200, event_ok_body());
        *h.installer.verify_error.lock().unwrap() = Some(ErrorCode::PayloadHashMismatchError);

        let mut orchestrator = h.orchestrator();
        orchestrator.check_and_update(false).unwrap();
        // One URL only: the wrap ends the payload attempt.
        assert_eq!(orchestrator.payload_state().payload_attempt_number(), 1);
        assert!(orchestrator.payload_state().backoff_expiry().is_some());
    }

    #[test]
    fn test_rollback_blocked_when_key_version_too_old() {
        let mut h = Harness::new();
        h.rollback_allowed = true;
        // Device minimum is 0x00010001; image carries 1.0 = 0x00010000.
        let body = update_body(
            "0.9.0",
            " _rollback=\"true\" _kernel_version=\"1.0\" _firmware_version=\"1.0\"",
        );
        h.http.push_response(200, &body);
        h.http.push_response(200, event_ok_body()); // error event

        let mut orchestrator = h.orchestrator();
        let status = orchestrator.check_and_update(false).unwrap();
        assert_eq!(status, UpdateStatus::Idle);
        assert_eq!(
            orchestrator.last_error(),
            Some(ErrorCode::RollbackVersionError)
        );
        assert!(h.installer.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn test_rollback_applies_and_blacklists_old_version() {
        let mut h = Harness::new();
        h.rollback_allowed = true;
        // Image key versions match the device minimum exactly.
        let body = update_body(
            "0.9.0",
            " _rollback=\"true\" _kernel_version=\"1.1\" _firmware_version=\"1.1\"",
        );
        h.http.push_response(200, &body);
        h.http.push_response(200, event_ok_body());
        h.http.push_response(200, event_ok_body());
        h.http.push_response(200, event_ok_body());

        let mut orchestrator = h.orchestrator();
        let status = orchestrator.check_and_update(false).unwrap();
        assert_eq!(status, UpdateStatus::UpdatedNeedReboot);
        // The version we left is blacklisted against re-offers.
        assert_eq!(
            orchestrator.payload_state().rollback_version().as_deref(),
            Some("1.0.0")
        );
        assert!(orchestrator.payload_state().rollback_happened());
    }

    #[test]
    fn test_on_started_detects_failed_boot() {
        let h = Harness::new();
        h.http.push_response(200, &update_body("2.0.0", ""));
        h.http.push_response(200, event_ok_body());
        h.http.push_response(200, event_ok_body());
        h.http.push_response(200, event_ok_body());

        let mut orchestrator = h.orchestrator();
        orchestrator.check_and_update(false).unwrap();

        // Reboot happens, but the device comes back in the same slot.
        h.boot.reboot();
        let mut orchestrator = h.orchestrator();
        orchestrator.on_started("1.0.0");
        assert_eq!(
            h.metrics.failed_boots.lock().unwrap().as_slice(),
            ["abcd:1000"]
        );
    }

    #[test]
    fn test_reset_clears_state() {
        let h = Harness::new();
        h.prefs.set_i64(keys::CURRENT_URL_INDEX, 1).unwrap();
        let mut orchestrator = h.orchestrator();
        orchestrator.reset().unwrap();
        assert!(!h.prefs.exists(keys::CURRENT_URL_INDEX));
        assert_eq!(orchestrator.status(), UpdateStatus::Idle);
    }

    #[test]
    fn test_combine_key_version() {
        assert_eq!(combine_key_version(1, 1), 0x00010001);
        assert_eq!(combine_key_version(1, 0), 0x00010000);
        assert_eq!(combine_key_version(2, 3), 0x00020003);
    }
}
