//! Attempt and check metrics reporting.
//!
//! The payload state tracker produces a stream of observations (check
//! reactions, attempt results, per-source byte counts, time to update).
//! They leave the crate through [`MetricsReporter`]; the default
//! implementation logs them structured via `tracing`, and hosts with a
//! telemetry backend provide their own sink.

use std::collections::HashMap;
use std::time::Duration;

use tracing::info;

use crate::download::DownloadSource;
use crate::errors::ErrorCode;

/// How the client reacted to a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckReaction {
    Updating,
    Ignored,
    Deferring,
    Backoff,
    NoUpdate,
}

/// Terminal result of a single update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    InternalError,
    PayloadDownloadError,
    MetadataMalformed,
    OperationMalformed,
    OperationExecutionError,
    MetadataVerificationFailed,
    PayloadVerificationFailed,
    VerificationFailed,
    PostInstallFailed,
    AbnormalTermination,
}

impl AttemptResult {
    /// Buckets an attempt error code into a result category.
    pub fn from_error(code: ErrorCode) -> AttemptResult {
        use ErrorCode::*;
        match code {
            Success => AttemptResult::Success,
            DownloadTransferError | HttpResponse(_) => AttemptResult::PayloadDownloadError,
            DownloadInvalidMetadataMagicString
            | DownloadInvalidMetadataSize
            | DownloadManifestParseError => AttemptResult::MetadataMalformed,
            DownloadOperationHashMissingError | DownloadOperationHashMismatch => {
                AttemptResult::OperationMalformed
            }
            DownloadOperationExecutionError => AttemptResult::OperationExecutionError,
            DownloadMetadataSignatureError
            | DownloadMetadataSignatureVerificationError
            | DownloadMetadataSignatureMismatch
            | DownloadMetadataSignatureMissingError
            | DownloadInvalidMetadataSignature => AttemptResult::MetadataVerificationFailed,
            PayloadHashMismatchError
            | PayloadSizeMismatchError
            | DownloadPayloadVerificationError
            | DownloadPayloadPubKeyVerificationError => AttemptResult::PayloadVerificationFailed,
            NewRootfsVerificationError | NewKernelVerificationError | FilesystemVerifierError => {
                AttemptResult::VerificationFailed
            }
            PostinstallRunnerError | PostinstallBootedFromFirmwareB | PostinstallPowerwashError
            | PostinstallFirmwareRoNotUpdatable => AttemptResult::PostInstallFailed,
            _ => AttemptResult::InternalError,
        }
    }
}

/// Sink for update client observations.
#[allow(clippy::too_many_arguments)]
pub trait MetricsReporter: Send + Sync {
    /// One update check completed with this reaction (and, for failures,
    /// the download error code that caused it).
    fn report_update_check(&self, reaction: CheckReaction, error: Option<ErrorCode>);

    /// One update attempt terminated.
    fn report_update_attempt(
        &self,
        attempt_number: i64,
        result: AttemptResult,
        duration: Duration,
        duration_uptime: Duration,
        payload_bytes: u64,
        error: Option<ErrorCode>,
    );

    /// Download portion of an attempt, broken down by source.
    fn report_attempt_downloads(&self, payload_bytes_downloaded: u64, source: DownloadSource);

    /// A new image booted successfully after applying an update.
    fn report_successful_update(
        &self,
        attempt_count: i64,
        url_switch_count: i64,
        reboot_count: i64,
        total_duration: Duration,
        bytes_by_source: &HashMap<DownloadSource, u64>,
        payload_size: u64,
    );

    /// The previous attempt died without recording a terminal result.
    fn report_abnormally_terminated_attempt(&self);

    /// The new image was written but the device booted back into the old
    /// slot, i.e. the update failed to take.
    fn report_failed_boot(&self, target_version: &str);

    /// An enterprise rollback was initiated toward `version`.
    fn report_enterprise_rollback(&self, success: bool, version: &str);

    /// Verified-boot key versions observed during an update check.
    fn report_key_versions(&self, kernel_key_version: u32, firmware_key_version: u32);
}

/// Default reporter: structured log lines only.
pub struct LogMetrics;

impl MetricsReporter for LogMetrics {
    fn report_update_check(&self, reaction: CheckReaction, error: Option<ErrorCode>) {
        info!(?reaction, ?error, "metric: update check");
    }

    fn report_update_attempt(
        &self,
        attempt_number: i64,
        result: AttemptResult,
        duration: Duration,
        duration_uptime: Duration,
        payload_bytes: u64,
        error: Option<ErrorCode>,
    ) {
        info!(
            attempt_number,
            ?result,
            duration_secs = duration.as_secs(),
            uptime_secs = duration_uptime.as_secs(),
            payload_bytes,
            ?error,
            "metric: update attempt"
        );
    }

    fn report_attempt_downloads(&self, payload_bytes_downloaded: u64, source: DownloadSource) {
        info!(
            payload_bytes_downloaded,
            %source,
            "metric: attempt download"
        );
    }

    fn report_successful_update(
        &self,
        attempt_count: i64,
        url_switch_count: i64,
        reboot_count: i64,
        total_duration: Duration,
        bytes_by_source: &HashMap<DownloadSource, u64>,
        payload_size: u64,
    ) {
        for source in DownloadSource::ALL {
            let bytes = bytes_by_source.get(&source).copied().unwrap_or(0);
            if bytes > 0 {
                info!(%source, bytes, "metric: bytes by source");
            }
        }
        info!(
            attempt_count,
            url_switch_count,
            reboot_count,
            total_secs = total_duration.as_secs(),
            payload_size,
            "metric: successful update"
        );
    }

    fn report_abnormally_terminated_attempt(&self) {
        info!("metric: abnormally terminated attempt");
    }

    fn report_failed_boot(&self, target_version: &str) {
        info!(target_version, "metric: failed boot into new version");
    }

    fn report_enterprise_rollback(&self, success: bool, version: &str) {
        info!(success, version, "metric: enterprise rollback");
    }

    fn report_key_versions(&self, kernel_key_version: u32, firmware_key_version: u32) {
        info!(
            kernel_key_version,
            firmware_key_version, "metric: verified boot key versions"
        );
    }
}
