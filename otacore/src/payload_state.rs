//! Durable per-update bookkeeping: URL failover, backoff, attempt history.
//!
//! Every counter here survives process restarts and reboots through the
//! pref store, because an update attempt routinely spans several of both.
//! The state is keyed to one server response: a response with a different
//! signature resets everything, the same response seen again (even across
//! a reboot) must leave the counters untouched.
//!
//! # Failover model
//!
//! Each payload carries an ordered list of candidate URLs. Failures that
//! indict the payload bytes jump to the next URL immediately; transient
//! transport failures charge the current URL one failure and only advance
//! once the per-URL budget is spent. Wrapping past the last URL ends one
//! payload attempt and arms exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{info, warn};

use crate::boot::BootControl;
use crate::clock::{from_micros, to_micros, Clock};
use crate::download::DownloadSource;
use crate::errors::{ErrorCode, FailoverAction};
use crate::metrics::{AttemptResult, MetricsReporter};
use crate::policy::DevicePolicy;
use crate::prefs::{keys, PrefStore, PrefsError};
use crate::protocol::response::Response;

/// Upper bound on the exponential backoff interval.
const MAX_BACKOFF_DAYS: i64 = 16;

/// Retries are fuzzed by +/- 6 hours so a fleet that failed together does
/// not retry together.
const MAX_BACKOFF_FUZZ_SECONDS: i64 = 6 * 60 * 60;

/// Peer downloads are abandoned after this many attempts...
pub const MAX_P2P_ATTEMPTS: i64 = 10;
/// ...or once this many seconds have passed since the first attempt.
pub const MAX_P2P_ATTEMPT_PERIOD_SECONDS: i64 = 5 * 24 * 60 * 60;

/// Durable state of the current update, mirrored in memory.
pub struct PayloadState {
    prefs: Arc<dyn PrefStore>,
    powerwash_safe_prefs: Arc<dyn PrefStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsReporter>,
    boot: Arc<dyn BootControl>,
    policy: Arc<dyn DevicePolicy>,

    response: Response,
    response_signature: String,
    /// Candidate URLs per payload, already filtered by the HTTP policy.
    candidate_urls: Vec<Vec<String>>,
    payload_index: usize,

    payload_attempt_number: i64,
    full_payload_attempt_number: i64,
    url_index: i64,
    url_failure_count: i64,
    url_switch_count: i64,
    backoff_expiry: Option<DateTime<Utc>>,
    num_responses_seen: i64,
    num_reboots: i64,

    using_p2p_for_downloading: bool,
    p2p_num_attempts: i64,
    p2p_first_attempt: Option<DateTime<Utc>>,

    update_timestamp_start: Option<DateTime<Utc>>,
    update_duration_uptime: StdDuration,
    last_uptime_mark: StdDuration,

    current_bytes: HashMap<DownloadSource, u64>,
    total_bytes: HashMap<DownloadSource, u64>,

    attempt_in_progress: bool,
    attempt_start_mono: StdDuration,
    attempt_bytes_baseline: u64,
}

impl PayloadState {
    /// Loads persisted state from the pref store.
    pub fn new(
        prefs: Arc<dyn PrefStore>,
        powerwash_safe_prefs: Arc<dyn PrefStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsReporter>,
        boot: Arc<dyn BootControl>,
        policy: Arc<dyn DevicePolicy>,
    ) -> Result<Self, PrefsError> {
        let mono = clock.monotonic();
        let mut state = Self {
            prefs,
            powerwash_safe_prefs,
            clock,
            metrics,
            boot,
            policy,
            response: Response::default(),
            response_signature: String::new(),
            candidate_urls: Vec::new(),
            payload_index: 0,
            payload_attempt_number: 0,
            full_payload_attempt_number: 0,
            url_index: 0,
            url_failure_count: 0,
            url_switch_count: 0,
            backoff_expiry: None,
            num_responses_seen: 0,
            num_reboots: 0,
            using_p2p_for_downloading: false,
            p2p_num_attempts: 0,
            p2p_first_attempt: None,
            update_timestamp_start: None,
            update_duration_uptime: StdDuration::ZERO,
            last_uptime_mark: mono,
            current_bytes: HashMap::new(),
            total_bytes: HashMap::new(),
            attempt_in_progress: false,
            attempt_start_mono: mono,
            attempt_bytes_baseline: 0,
        };
        state.load_persisted()?;
        Ok(state)
    }

    fn load_persisted(&mut self) -> Result<(), PrefsError> {
        self.response_signature = self
            .prefs
            .get_string(keys::CURRENT_RESPONSE_SIGNATURE)?
            .unwrap_or_default();
        self.payload_attempt_number = self
            .prefs
            .get_i64(keys::PAYLOAD_ATTEMPT_NUMBER)?
            .unwrap_or(0);
        self.full_payload_attempt_number = self
            .prefs
            .get_i64(keys::FULL_PAYLOAD_ATTEMPT_NUMBER)?
            .unwrap_or(0);
        self.url_index = self.prefs.get_i64(keys::CURRENT_URL_INDEX)?.unwrap_or(0);
        self.url_failure_count = self
            .prefs
            .get_i64(keys::CURRENT_URL_FAILURE_COUNT)?
            .unwrap_or(0);
        self.url_switch_count = self.prefs.get_i64(keys::URL_SWITCH_COUNT)?.unwrap_or(0);
        self.backoff_expiry = self
            .prefs
            .get_i64(keys::BACKOFF_EXPIRY_TIME)?
            .and_then(from_micros);
        self.num_responses_seen = self.prefs.get_i64(keys::NUM_RESPONSES_SEEN)?.unwrap_or(0);
        self.num_reboots = self.prefs.get_i64(keys::NUM_REBOOTS)?.unwrap_or(0);
        self.p2p_num_attempts = self.prefs.get_i64(keys::P2P_NUM_ATTEMPTS)?.unwrap_or(0);
        self.p2p_first_attempt = self
            .prefs
            .get_i64(keys::P2P_FIRST_ATTEMPT_TIMESTAMP)?
            .and_then(from_micros);
        self.update_timestamp_start = self
            .prefs
            .get_i64(keys::UPDATE_TIMESTAMP_START)?
            .and_then(from_micros);
        self.update_duration_uptime = self
            .prefs
            .get_i64(keys::UPDATE_DURATION_UPTIME)?
            .map(|micros| StdDuration::from_micros(micros.max(0) as u64))
            .unwrap_or(StdDuration::ZERO);
        self.attempt_in_progress = self
            .prefs
            .get_bool(keys::ATTEMPT_IN_PROGRESS)?
            .unwrap_or(false);
        for source in DownloadSource::ALL {
            let current = self
                .prefs
                .get_i64(&keys::per_source(keys::CURRENT_BYTES_DOWNLOADED, source.pref_suffix()))?
                .unwrap_or(0);
            let total = self
                .prefs
                .get_i64(&keys::per_source(keys::TOTAL_BYTES_DOWNLOADED, source.pref_suffix()))?
                .unwrap_or(0);
            self.current_bytes.insert(source, current.max(0) as u64);
            self.total_bytes.insert(source, total.max(0) as u64);
        }
        Ok(())
    }

    // Persist helpers. A failed write degrades restart recovery but must
    // not abort the attempt in flight, so failures are logged and dropped.

    fn persist_i64(&self, key: &str, value: i64) {
        if let Err(e) = self.prefs.set_i64(key, value) {
            warn!(key, error = %e, "failed to persist pref");
        }
    }

    fn persist_string(&self, key: &str, value: &str) {
        if let Err(e) = self.prefs.set_string(key, value) {
            warn!(key, error = %e, "failed to persist pref");
        }
    }

    fn persist_bool(&self, key: &str, value: bool) {
        if let Err(e) = self.prefs.set_bool(key, value) {
            warn!(key, error = %e, "failed to persist pref");
        }
    }

    fn remove_pref(&self, key: &str) {
        if let Err(e) = self.prefs.remove(key) {
            warn!(key, error = %e, "failed to remove pref");
        }
    }

    /// Adopts a server response as the current update.
    ///
    /// Calling this twice with an equivalent response is a no-op for every
    /// counter; a response with any material difference resets the failover
    /// and backoff state and counts as a newly seen response.
    pub fn set_response(&mut self, response: Response) {
        let signature = Self::response_signature_of(&response);
        self.response = response;
        self.compute_candidate_urls();
        if self.response_signature != signature {
            self.response_signature = signature;
            self.persist_string(keys::CURRENT_RESPONSE_SIGNATURE, &self.response_signature);
            self.set_num_responses_seen(self.num_responses_seen + 1);
            self.reset_per_response_state();
            info!(
                num_responses_seen = self.num_responses_seen,
                "new response adopted, failover state reset"
            );
        } else if self.url_index < 0
            || self.url_index as usize >= self.current_url_count().max(1)
        {
            // A persisted index that does not fit the recomputed candidate
            // list is corruption, not history worth keeping.
            warn!(
                url_index = self.url_index,
                candidates = self.current_url_count(),
                "persisted URL index out of range, resetting failover state"
            );
            self.reset_per_response_state();
        }
    }

    /// Canonical rendering of every response field that affects how the
    /// payload is fetched. Two responses with equal signatures are
    /// interchangeable for failover purposes.
    fn response_signature_of(response: &Response) -> String {
        let mut sign = String::new();
        for (i, package) in response.packages.iter().enumerate() {
            sign.push_str(&format!(
                "Payload {}:\n  Size = {}\n  Sha256 Hash = {}\n  Metadata Size = {}\n  \
                 Metadata Signature = {}\n  Is Delta = {}\n  NumURLs = {}\n",
                i,
                package.size,
                package.hash,
                package.metadata_size,
                package.metadata_signature.as_deref().unwrap_or(""),
                package.is_delta,
                package.payload_urls.len(),
            ));
            for (u, url) in package.payload_urls.iter().enumerate() {
                sign.push_str(&format!("  Candidate Url{} = {}\n", u, url));
            }
        }
        sign.push_str(&format!(
            "Max Failure Count Per Url = {}\nDisable Payload Backoff = {}\n",
            response.max_failure_count_per_url, response.disable_payload_backoff,
        ));
        sign
    }

    /// Filters each payload's URL list by the HTTP download policy.
    /// Unofficial builds accept everything; official builds drop plain
    /// HTTP URLs when the administrator disabled them.
    fn compute_candidate_urls(&mut self) {
        let http_ok = !self.boot.is_official_build()
            || self.policy.http_downloads_enabled().unwrap_or(true);
        self.candidate_urls = self
            .response
            .packages
            .iter()
            .map(|package| {
                package
                    .payload_urls
                    .iter()
                    .filter(|url| {
                        let lower = url.to_ascii_lowercase();
                        lower.starts_with("https://") || (http_ok && lower.starts_with("http://"))
                    })
                    .cloned()
                    .collect()
            })
            .collect();
        if self.payload_index >= self.candidate_urls.len() {
            self.payload_index = 0;
        }
    }

    fn reset_per_response_state(&mut self) {
        self.payload_index = 0;
        self.set_payload_attempt_number(0);
        self.set_full_payload_attempt_number(0);
        self.set_url_index(0);
        self.set_url_failure_count(0);
        self.set_url_switch_count(0);
        self.update_backoff_expiry();
        self.set_num_reboots(0);
        self.update_timestamp_start = Some(self.clock.now());
        self.persist_i64(
            keys::UPDATE_TIMESTAMP_START,
            to_micros(self.update_timestamp_start.unwrap()),
        );
        self.update_duration_uptime = StdDuration::ZERO;
        self.persist_i64(keys::UPDATE_DURATION_UPTIME, 0);
        for source in DownloadSource::ALL {
            self.current_bytes.insert(source, 0);
            self.persist_i64(
                &keys::per_source(keys::CURRENT_BYTES_DOWNLOADED, source.pref_suffix()),
                0,
            );
        }
        self.p2p_num_attempts = 0;
        self.p2p_first_attempt = None;
        self.remove_pref(keys::P2P_NUM_ATTEMPTS);
        self.remove_pref(keys::P2P_FIRST_ATTEMPT_TIMESTAMP);
    }

    // Counter setters keep the in-memory mirror and the store in step.

    fn set_payload_attempt_number(&mut self, value: i64) {
        self.payload_attempt_number = value;
        self.persist_i64(keys::PAYLOAD_ATTEMPT_NUMBER, value);
    }

    fn set_full_payload_attempt_number(&mut self, value: i64) {
        self.full_payload_attempt_number = value;
        self.persist_i64(keys::FULL_PAYLOAD_ATTEMPT_NUMBER, value);
    }

    fn set_url_index(&mut self, value: i64) {
        self.url_index = value;
        self.persist_i64(keys::CURRENT_URL_INDEX, value);
    }

    fn set_url_failure_count(&mut self, value: i64) {
        self.url_failure_count = value;
        self.persist_i64(keys::CURRENT_URL_FAILURE_COUNT, value);
    }

    fn set_url_switch_count(&mut self, value: i64) {
        self.url_switch_count = value;
        self.persist_i64(keys::URL_SWITCH_COUNT, value);
    }

    fn set_num_responses_seen(&mut self, value: i64) {
        self.num_responses_seen = value;
        self.persist_i64(keys::NUM_RESPONSES_SEEN, value);
    }

    fn set_num_reboots(&mut self, value: i64) {
        self.num_reboots = value;
        self.persist_i64(keys::NUM_REBOOTS, value);
    }

    /// Records the outcome of a failed attempt and advances the failover
    /// state according to the error's classification.
    pub fn update_failed(&mut self, error: ErrorCode) {
        if self.current_url_count() == 0 {
            info!(%error, "ignoring failure, no response committed yet");
            return;
        }
        self.report_attempt_metrics(Some(error));
        match error.failover_action() {
            FailoverAction::NextUrl => {
                info!(%error, "payload error, advancing to next URL");
                self.increment_url_index();
            }
            FailoverAction::CountFailure => {
                info!(
                    %error,
                    failure_count = self.url_failure_count,
                    "transient error, charging current URL"
                );
                self.increment_failure_count();
            }
            FailoverAction::Ignore => {
                info!(%error, "error not attributable to a URL, failover state unchanged");
            }
        }
    }

    fn increment_url_index(&mut self) {
        let url_count = self.current_url_count() as i64;
        let next = self.url_index + 1;
        if next < url_count {
            self.set_url_index(next);
        } else {
            // Wrapped past the last URL: one full pass over all candidates
            // failed, which ends a payload attempt and arms backoff.
            self.set_url_index(0);
            self.increment_payload_attempt_number();
        }
        // A single-URL list has nothing to switch to.
        if url_count > 1 {
            self.set_url_switch_count(self.url_switch_count + 1);
        }
        self.set_url_failure_count(0);
    }

    fn increment_failure_count(&mut self) {
        if self.url_failure_count + 1 < self.response.max_failure_count_per_url as i64 {
            self.set_url_failure_count(self.url_failure_count + 1);
        } else {
            self.increment_url_index();
        }
    }

    fn increment_payload_attempt_number(&mut self) {
        self.set_payload_attempt_number(self.payload_attempt_number + 1);
        if !self.current_payload_is_delta() {
            self.set_full_payload_attempt_number(self.full_payload_attempt_number + 1);
            self.update_backoff_expiry();
        }
    }

    fn current_payload_is_delta(&self) -> bool {
        self.response
            .packages
            .get(self.payload_index)
            .map(|p| p.is_delta)
            .unwrap_or(false)
    }

    /// Recomputes the backoff expiry from the full-payload attempt count:
    /// 2^(n-1) days, capped, fuzzed by +/- 6 hours.
    fn update_backoff_expiry(&mut self) {
        if self.response.disable_payload_backoff || self.full_payload_attempt_number == 0 {
            self.backoff_expiry = None;
            self.remove_pref(keys::BACKOFF_EXPIRY_TIME);
            return;
        }
        let shift = (self.full_payload_attempt_number - 1).min(62) as u32;
        let days = 1i64.checked_shl(shift).unwrap_or(i64::MAX).min(MAX_BACKOFF_DAYS);
        let fuzz =
            rand::rng().random_range(-MAX_BACKOFF_FUZZ_SECONDS..=MAX_BACKOFF_FUZZ_SECONDS);
        let expiry = self.clock.now() + Duration::days(days) + Duration::seconds(fuzz);
        info!(
            attempt = self.full_payload_attempt_number,
            days,
            %expiry,
            "backoff armed"
        );
        self.backoff_expiry = Some(expiry);
        self.persist_i64(keys::BACKOFF_EXPIRY_TIME, to_micros(expiry));
    }

    /// Whether a download must wait for the backoff window to pass.
    /// Deltas, unofficial builds, and backoff-disabled responses never
    /// back off.
    pub fn should_backoff_download(&self) -> bool {
        if self.response.disable_payload_backoff {
            return false;
        }
        if !self.boot.is_official_build() && !self.prefs.exists(keys::NO_IGNORE_BACKOFF) {
            return false;
        }
        if self.current_payload_is_delta() {
            return false;
        }
        if self.using_p2p_for_downloading && self.current_url().is_some() {
            return false;
        }
        match self.backoff_expiry {
            Some(expiry) => self.clock.now() < expiry,
            None => false,
        }
    }

    /// The URL the next download should use, after policy filtering.
    pub fn current_url(&self) -> Option<&str> {
        self.candidate_urls
            .get(self.payload_index)?
            .get(self.url_index as usize)
            .map(String::as_str)
    }

    fn current_url_count(&self) -> usize {
        self.candidate_urls
            .get(self.payload_index)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Advances to the next payload of a multi-package response. Returns
    /// false when all payloads are done.
    pub fn next_payload(&mut self) -> bool {
        if self.payload_index + 1 >= self.candidate_urls.len() {
            return false;
        }
        self.payload_index += 1;
        self.set_url_index(0);
        self.set_url_failure_count(0);
        true
    }

    fn current_download_source(&self) -> Option<DownloadSource> {
        let url = self.current_url()?;
        DownloadSource::classify(url, self.using_p2p_for_downloading)
    }

    /// Accounts freshly downloaded bytes to the active source and rolls
    /// the uptime duration forward.
    pub fn download_progress(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        self.tick_update_duration();
        // Receiving any bytes proves the current path works.
        if self.url_failure_count > 0 {
            self.set_url_failure_count(0);
        }
        if let Some(source) = self.current_download_source() {
            let current = self.current_bytes.entry(source).or_insert(0);
            *current += count;
            let current = *current;
            let total = self.total_bytes.entry(source).or_insert(0);
            *total += count;
            let total = *total;
            self.persist_i64(
                &keys::per_source(keys::CURRENT_BYTES_DOWNLOADED, source.pref_suffix()),
                current as i64,
            );
            self.persist_i64(
                &keys::per_source(keys::TOTAL_BYTES_DOWNLOADED, source.pref_suffix()),
                total as i64,
            );
        }
    }

    fn tick_update_duration(&mut self) {
        let mono = self.clock.monotonic();
        if mono > self.last_uptime_mark {
            self.update_duration_uptime += mono - self.last_uptime_mark;
            self.persist_i64(
                keys::UPDATE_DURATION_UPTIME,
                self.update_duration_uptime.as_micros() as i64,
            );
        }
        self.last_uptime_mark = mono;
    }

    /// The payload finished downloading and verified; this closes one
    /// payload attempt successfully.
    pub fn download_complete(&mut self) {
        info!("payload download complete");
        self.increment_payload_attempt_number();
    }

    /// Marks the start of a download attempt for abnormal-termination
    /// detection and per-attempt byte accounting.
    pub fn attempt_started(&mut self) {
        self.attempt_in_progress = true;
        self.persist_bool(keys::ATTEMPT_IN_PROGRESS, true);
        self.attempt_start_mono = self.clock.monotonic();
        self.attempt_bytes_baseline = self.current_bytes.values().sum();
        if self.update_timestamp_start.is_none() {
            self.update_timestamp_start = Some(self.clock.now());
            self.persist_i64(
                keys::UPDATE_TIMESTAMP_START,
                to_micros(self.update_timestamp_start.unwrap()),
            );
        }
    }

    fn report_attempt_metrics(&mut self, error: Option<ErrorCode>) {
        if !self.attempt_in_progress {
            return;
        }
        self.attempt_in_progress = false;
        self.persist_bool(keys::ATTEMPT_IN_PROGRESS, false);
        let duration = self
            .clock
            .monotonic()
            .saturating_sub(self.attempt_start_mono);
        let bytes: u64 = self
            .current_bytes
            .values()
            .sum::<u64>()
            .saturating_sub(self.attempt_bytes_baseline);
        let result = match error {
            Some(code) => AttemptResult::from_error(code),
            None => AttemptResult::Success,
        };
        self.metrics.report_update_attempt(
            self.payload_attempt_number,
            result,
            duration,
            duration,
            bytes,
            error.filter(|c| *c != ErrorCode::Success),
        );
        if let Some(source) = self.current_download_source() {
            if bytes > 0 {
                self.metrics.report_attempt_downloads(bytes, source);
            }
        }
    }

    /// Called after the new image is fully written and verified.
    pub fn update_succeeded(&mut self) {
        self.report_attempt_metrics(None);
        self.tick_update_duration();
        let total_duration = self
            .update_timestamp_start
            .map(|start| (self.clock.now() - start).to_std().unwrap_or_default())
            .unwrap_or_default();
        self.metrics.report_successful_update(
            self.payload_attempt_number,
            self.url_switch_count,
            self.num_reboots,
            total_duration,
            &self.total_bytes,
            self.response.total_package_size(),
        );
        info!(
            attempts = self.payload_attempt_number,
            url_switches = self.url_switch_count,
            "update applied successfully"
        );
        // The update is done; nothing per-update is worth keeping across
        // the reboot, including the response identity.
        self.set_num_responses_seen(0);
        self.response_signature.clear();
        self.remove_pref(keys::CURRENT_RESPONSE_SIGNATURE);
        // Scattering bookkeeping belongs to the update that just finished;
        // the next offer must pick a fresh wait.
        self.remove_pref(keys::UPDATE_CHECK_COUNT);
        self.remove_pref(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD);
        self.remove_pref(keys::UPDATE_FIRST_SEEN_AT);
        self.reset_per_response_state();
    }

    /// A brand-new update attempt is beginning (not a resumption).
    pub fn update_restarted(&mut self) {
        self.set_num_reboots(0);
        self.update_timestamp_start = Some(self.clock.now());
        self.persist_i64(
            keys::UPDATE_TIMESTAMP_START,
            to_micros(self.update_timestamp_start.unwrap()),
        );
        self.update_duration_uptime = StdDuration::ZERO;
        self.persist_i64(keys::UPDATE_DURATION_UPTIME, 0);
        self.last_uptime_mark = self.clock.monotonic();
    }

    /// The process restarted while an attempt was in flight. Counts the
    /// reboot (when there was one) and reports the dead attempt.
    pub fn update_resumed(&mut self, rebooted: bool) {
        if rebooted {
            self.set_num_reboots(self.num_reboots + 1);
        }
        if self.attempt_in_progress {
            self.metrics.report_abnormally_terminated_attempt();
            self.attempt_in_progress = false;
            self.persist_bool(keys::ATTEMPT_IN_PROGRESS, false);
        }
        self.last_uptime_mark = self.clock.monotonic();
    }

    // Expected-reboot bookkeeping. After writing a new image we remember
    // what we installed and from which slot; if the next boot lands back
    // in the same slot, the new image failed to boot.

    /// Remember that the next reboot should land in `target_version_uid`.
    pub fn expect_reboot_in_new_version(&mut self, target_version_uid: &str) {
        self.persist_string(keys::TARGET_VERSION_UNIQUE_ID, target_version_uid);
        self.persist_string(keys::TARGET_VERSION_INSTALLED_FROM, &self.boot.current_slot());
        self.persist_i64(keys::TARGET_VERSION_ATTEMPT, self.payload_attempt_number);
    }

    /// On startup after a reboot: report a failed boot if we are back in
    /// the slot we updated from. Clears the expectation either way.
    pub fn report_failed_boot_if_needed(&mut self) {
        let target = match self.prefs.get_string(keys::TARGET_VERSION_UNIQUE_ID) {
            Ok(Some(target)) => target,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "could not read expected-reboot marker");
                return;
            }
        };
        let installed_from = self
            .prefs
            .get_string(keys::TARGET_VERSION_INSTALLED_FROM)
            .ok()
            .flatten()
            .unwrap_or_default();
        if installed_from == self.boot.current_slot() {
            warn!(target, "device booted back into the old image");
            self.metrics.report_failed_boot(&target);
        }
        self.remove_pref(keys::TARGET_VERSION_UNIQUE_ID);
        self.remove_pref(keys::TARGET_VERSION_INSTALLED_FROM);
        self.remove_pref(keys::TARGET_VERSION_ATTEMPT);
    }

    // Enterprise rollback markers live in the powerwash-safe store so the
    // wipe that accompanies a rollback cannot erase them.

    pub fn rollback_version(&self) -> Option<String> {
        self.powerwash_safe_prefs
            .get_string(keys::ROLLBACK_VERSION)
            .ok()
            .flatten()
            .filter(|v| !v.is_empty())
    }

    /// Blacklists `version`: we are rolling away from it and must not be
    /// offered it again.
    pub fn set_rollback_version(&mut self, version: &str) {
        if let Err(e) = self
            .powerwash_safe_prefs
            .set_string(keys::ROLLBACK_VERSION, version)
        {
            warn!(error = %e, "failed to persist rollback version");
        }
    }

    pub fn rollback_happened(&self) -> bool {
        self.powerwash_safe_prefs
            .get_bool(keys::ROLLBACK_HAPPENED)
            .ok()
            .flatten()
            .unwrap_or(false)
    }

    pub fn set_rollback_happened(&mut self, happened: bool) {
        if let Err(e) = self
            .powerwash_safe_prefs
            .set_bool(keys::ROLLBACK_HAPPENED, happened)
        {
            warn!(error = %e, "failed to persist rollback marker");
        }
        if happened {
            self.metrics
                .report_enterprise_rollback(true, &self.rollback_version().unwrap_or_default());
        }
    }

    // Peer download budget.

    /// Records one peer download attempt against the budget.
    pub fn p2p_new_attempt(&mut self) {
        if self.p2p_first_attempt.is_none() {
            let now = self.clock.now();
            self.p2p_first_attempt = Some(now);
            self.persist_i64(keys::P2P_FIRST_ATTEMPT_TIMESTAMP, to_micros(now));
        }
        self.p2p_num_attempts += 1;
        self.persist_i64(keys::P2P_NUM_ATTEMPTS, self.p2p_num_attempts);
    }

    /// Whether another peer download attempt fits the budget: at most
    /// [`MAX_P2P_ATTEMPTS`] attempts, all within
    /// [`MAX_P2P_ATTEMPT_PERIOD_SECONDS`] of the first.
    pub fn p2p_attempt_allowed(&self) -> bool {
        if self.p2p_num_attempts > MAX_P2P_ATTEMPTS {
            info!(
                attempts = self.p2p_num_attempts,
                "peer downloads exhausted the attempt budget"
            );
            return false;
        }
        if let Some(first) = self.p2p_first_attempt {
            if self.clock.now() > first + Duration::seconds(MAX_P2P_ATTEMPT_PERIOD_SECONDS) {
                info!("peer downloads exhausted the time budget");
                return false;
            }
        }
        true
    }

    pub fn set_using_p2p_for_downloading(&mut self, using: bool) {
        self.using_p2p_for_downloading = using;
    }

    pub fn using_p2p_for_downloading(&self) -> bool {
        self.using_p2p_for_downloading
    }

    // Read accessors for the checker, orchestrator, and status reporting.

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn payload_attempt_number(&self) -> i64 {
        self.payload_attempt_number
    }

    pub fn full_payload_attempt_number(&self) -> i64 {
        self.full_payload_attempt_number
    }

    pub fn url_index(&self) -> i64 {
        self.url_index
    }

    pub fn url_failure_count(&self) -> i64 {
        self.url_failure_count
    }

    pub fn url_switch_count(&self) -> i64 {
        self.url_switch_count
    }

    pub fn num_responses_seen(&self) -> i64 {
        self.num_responses_seen
    }

    pub fn backoff_expiry(&self) -> Option<DateTime<Utc>> {
        self.backoff_expiry
    }

    pub fn update_timestamp_start(&self) -> Option<DateTime<Utc>> {
        self.update_timestamp_start
    }
}
