//! Update check pipeline: request assembly, response handling, and the
//! policy gates between "the server offered an update" and "we may
//! download it now".
//!
//! One [`UpdateChecker::perform_check`] call does the whole round trip:
//!
//! 1. freeze or release the kernel key rollforward window
//! 2. compute ping day counts and pending event attributes
//! 3. POST the request and parse the response defensively
//! 4. persist ping days, install date, cohorts, and EOL status
//! 5. run the ignore gates (rollback guard, OOBE, metered connection)
//! 6. commit the response to [`PayloadState`]
//! 7. run the defer gates (scattering, check count, backoff)
//!
//! Persisting cohorts and ping bookkeeping happens before the gates on
//! purpose: a deferred or ignored update must still count the ping and
//! remember its cohort. The ignore gates run before the commit so an
//! update we refuse outright never disturbs failover state; the defer
//! gates run after it so a deferred update keeps accruing backoff and
//! scattering history.

use std::sync::Arc;

use chrono::Duration;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::boot::{BootControl, ROLL_FORWARD_INFINITY};
use crate::clock::{from_micros, to_micros, Clock};
use crate::errors::ErrorCode;
use crate::http::{HttpClient, HttpError};
use crate::metrics::{CheckReaction, MetricsReporter};
use crate::payload_state::PayloadState;
use crate::policy::{ConnectionMonitor, DevicePolicy};
use crate::prefs::{keys, PrefStore};
use crate::protocol::parser::{parse_response, ParseError};
use crate::protocol::request::{
    build_request_xml, is_valid_cohort, Event, RequestContext, RequestParams, PING_NEVER,
    PING_TIME_JUMP,
};
use crate::protocol::response::Response;

/// Check-count scattering picks a random number of checks to sit out,
/// bounded by these.
const MIN_UPDATE_CHECKS: i64 = 0;
const MAX_UPDATE_CHECKS: i64 = 8;

/// Upper bound on the staging wait, so a bad policy value cannot starve a
/// device of updates forever.
const MAX_STAGING_WAIT_DAYS: i64 = 28;

/// Errors that abort an update check before a decision could be made.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("update check transport failed: {0}")]
    Transport(#[from] HttpError),

    #[error("update server returned HTTP {0}")]
    ServerStatus(u16),

    #[error("failed to interpret server response: {0}")]
    Parse(#[from] ParseError),
}

impl CheckError {
    /// The wire error code reported back to the server for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CheckError::Transport(_) => ErrorCode::OmahaRequestError,
            CheckError::ServerStatus(status) => ErrorCode::HttpResponse(*status),
            CheckError::Parse(e) => e.error_code(),
        }
    }
}

/// What the client decided to do with a completed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDecision {
    /// An update is available and may be downloaded now.
    UpdateAvailable,
    /// The server had nothing for us.
    NoUpdate,
    /// An update exists but downloading waits (scattering, check count,
    /// or backoff). The response was committed; history keeps accruing.
    Deferred(ErrorCode),
    /// An update exists but policy refuses it outright. The response was
    /// not committed to payload state.
    Ignored(ErrorCode),
}

/// Result of one update check round trip.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub response: Response,
    pub decision: CheckDecision,
}

/// Performs update checks and event reports against the update server.
pub struct UpdateChecker {
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    prefs: Arc<dyn PrefStore>,
    boot: Arc<dyn BootControl>,
    policy: Arc<dyn DevicePolicy>,
    connection: Arc<dyn ConnectionMonitor>,
    metrics: Arc<dyn MetricsReporter>,
    params: RequestParams,
    p2p_enabled: bool,
}

impl UpdateChecker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        prefs: Arc<dyn PrefStore>,
        boot: Arc<dyn BootControl>,
        policy: Arc<dyn DevicePolicy>,
        connection: Arc<dyn ConnectionMonitor>,
        metrics: Arc<dyn MetricsReporter>,
        params: RequestParams,
    ) -> Self {
        Self {
            http,
            clock,
            prefs,
            boot,
            policy,
            connection,
            metrics,
            params,
            p2p_enabled: false,
        }
    }

    /// Enables peer downloads, subject to the per-update attempt budget.
    pub fn with_p2p_enabled(mut self, enabled: bool) -> Self {
        self.p2p_enabled = enabled;
        self
    }

    pub fn params(&self) -> &RequestParams {
        &self.params
    }

    /// Runs one full update check.
    pub fn perform_check(
        &self,
        payload_state: &mut PayloadState,
        interactive: bool,
    ) -> Result<CheckOutcome, CheckError> {
        self.update_kernel_rollforward();

        let ctx = self.build_context();
        let body = build_request_xml(&self.effective_params(), &ctx);
        info!(
            interactive,
            url = self.params.update_url,
            "performing update check"
        );

        let reply = self.http.post(&self.params.update_url, &body)?;
        if !reply.is_success() {
            warn!(status = reply.status, "update server rejected the check");
            return Err(CheckError::ServerStatus(reply.status));
        }

        let response = parse_response(
            &reply.body,
            &self.params.app_id,
            self.params.system_app_id.as_deref(),
            false,
        )?;

        // The piggybacked reboot event reached the server; don't repeat it.
        if ctx.previous_version.is_some() {
            self.remove_pref(keys::PREVIOUS_VERSION);
        }

        self.update_last_ping_days(
            &response,
            ctx.ping_active_days.is_some(),
            ctx.ping_roll_call_days.is_some(),
        );
        self.persist_install_date(&response);
        self.persist_cohorts(&response);
        if let Some(eol) = &response.eol_status {
            self.persist_string(keys::OMAHA_EOL_STATUS, eol);
        }

        if !response.update_exists {
            info!("no update available");
            self.metrics
                .report_update_check(CheckReaction::NoUpdate, None);
            return Ok(CheckOutcome {
                response,
                decision: CheckDecision::NoUpdate,
            });
        }

        if let Some(code) = self.should_ignore(&response, payload_state) {
            self.metrics
                .report_update_check(CheckReaction::Ignored, None);
            return Ok(CheckOutcome {
                response,
                decision: CheckDecision::Ignored(code),
            });
        }

        payload_state.set_response(response.clone());

        if self.p2p_enabled && !interactive && !response.disable_p2p_for_downloading {
            if payload_state.p2p_attempt_allowed() {
                payload_state.set_using_p2p_for_downloading(true);
                payload_state.p2p_new_attempt();
            } else {
                payload_state.set_using_p2p_for_downloading(false);
            }
        }

        if !interactive {
            if let Some(code) = self.should_defer_download(&response) {
                self.metrics
                    .report_update_check(CheckReaction::Deferring, None);
                return Ok(CheckOutcome {
                    response,
                    decision: CheckDecision::Deferred(code),
                });
            }
            if payload_state.should_backoff_download() {
                info!(expiry = ?payload_state.backoff_expiry(), "download in backoff");
                self.metrics
                    .report_update_check(CheckReaction::Backoff, None);
                return Ok(CheckOutcome {
                    response,
                    decision: CheckDecision::Deferred(ErrorCode::OmahaUpdateDeferredForBackoff),
                });
            }
        }

        self.metrics
            .report_update_check(CheckReaction::Updating, None);
        Ok(CheckOutcome {
            response,
            decision: CheckDecision::UpdateAvailable,
        })
    }

    /// Sends a ping-only request: activity reporting without an
    /// `<updatecheck>` element. A no-op when no ping is due.
    pub fn perform_ping(&self) -> Result<(), CheckError> {
        let mut ctx = self.build_context();
        ctx.ping_only = true;
        ctx.previous_version = None;
        if ctx.ping_active_days.is_none() && ctx.ping_roll_call_days.is_none() {
            info!("both pings already sent today");
            return Ok(());
        }
        let body = build_request_xml(&self.params, &ctx);
        let reply = self.http.post(&self.params.update_url, &body)?;
        if !reply.is_success() {
            return Err(CheckError::ServerStatus(reply.status));
        }
        let response = parse_response(&reply.body, &self.params.app_id, None, true)?;
        self.update_last_ping_days(
            &response,
            ctx.ping_active_days.is_some(),
            ctx.ping_roll_call_days.is_some(),
        );
        Ok(())
    }

    /// Reports an attempt lifecycle event to the server. Failures are
    /// returned but callers generally log and move on; losing an event
    /// must never block the update itself.
    pub fn send_event(&self, event: Event) -> Result<(), CheckError> {
        let ctx = RequestContext::for_event(event);
        let body = build_request_xml(&self.params, &ctx);
        let reply = self.http.post(&self.params.update_url, &body)?;
        if !reply.is_success() {
            return Err(CheckError::ServerStatus(reply.status));
        }
        Ok(())
    }

    /// Device-wide administrator policy overrides the host-supplied
    /// request parameters once a policy blob is loaded.
    fn effective_params(&self) -> RequestParams {
        let mut params = self.params.clone();
        if self.policy.is_loaded() {
            if let Some(prefix) = self.policy.target_version_prefix() {
                params.target_version_prefix = prefix;
            }
            params.rollback_allowed = self.rollback_allowed();
        }
        params
    }

    fn rollback_allowed(&self) -> bool {
        if self.policy.is_loaded() {
            return self
                .policy
                .rollback_allowed_milestones()
                .is_some_and(|milestones| milestones > 0);
        }
        self.params.rollback_allowed
    }

    /// Whether an enterprise rollback could still be ordered for this
    /// device. Unknown states count as possible: with no policy blob, or a
    /// loaded blob whose milestone setting is unreadable, the answer is
    /// true. Only consumer devices and an explicit milestone count of zero
    /// rule rollback out.
    fn rollback_possible(&self) -> bool {
        if self.policy.is_consumer_device() {
            return false;
        }
        if !self.policy.is_loaded() {
            return true;
        }
        self.policy
            .rollback_allowed_milestones()
            .map_or(true, |milestones| milestones > 0)
    }

    /// While the server may legitimately offer an enterprise rollback, the
    /// firmware must not roll its minimum kernel key version forward past
    /// the rollback target, so the rollforward window stays frozen at the
    /// current version until rollback is positively ruled out.
    fn update_kernel_rollforward(&self) {
        if let (Some(kernel), Some(firmware)) = (
            self.boot.min_kernel_key_version(),
            self.boot.min_firmware_key_version(),
        ) {
            self.metrics.report_key_versions(kernel, firmware);
        }
        if self.rollback_possible() {
            if let Some(kernel) = self.boot.min_kernel_key_version() {
                if !self.boot.set_kernel_key_max_rollforward(kernel) {
                    warn!("failed to freeze kernel key rollforward");
                }
            }
        } else if !self.boot.set_kernel_key_max_rollforward(ROLL_FORWARD_INFINITY) {
            warn!("failed to open kernel key rollforward window");
        }
    }

    fn build_context(&self) -> RequestContext {
        let mut ctx = RequestContext::default();
        let active = self.calculate_ping_days(keys::LAST_ACTIVE_PING_DAY);
        let roll_call = self.calculate_ping_days(keys::LAST_ROLL_CALL_PING_DAY);
        // A value of zero means "already pinged today": the attribute is
        // omitted rather than sent as 0.
        if active != 0 {
            ctx.ping_active_days = Some(active);
        }
        if roll_call != 0 {
            ctx.ping_roll_call_days = Some(roll_call);
        }
        ctx.install_date_days = self.prefs.get_i64(keys::INSTALL_DATE_DAYS).ok().flatten();
        ctx.cohort = self.get_pref_string(keys::OMAHA_COHORT);
        ctx.cohort_hint = self.get_pref_string(keys::OMAHA_COHORT_HINT);
        ctx.cohort_name = self.get_pref_string(keys::OMAHA_COHORT_NAME);
        ctx.previous_version = self
            .get_pref_string(keys::PREVIOUS_VERSION)
            .filter(|v| !v.is_empty());
        ctx
    }

    /// Days since the last ping of the given kind. [`PING_NEVER`] when no
    /// ping was ever sent, [`PING_TIME_JUMP`] when the clock went
    /// backwards past the recorded day.
    fn calculate_ping_days(&self, key: &str) -> i64 {
        match self.prefs.get_i64(key) {
            Ok(Some(micros)) if micros > 0 => match from_micros(micros) {
                Some(last) => {
                    let days = (self.clock.now() - last).num_days();
                    if days < 0 {
                        PING_TIME_JUMP
                    } else {
                        days
                    }
                }
                None => PING_NEVER,
            },
            Ok(_) => PING_NEVER,
            Err(e) => {
                warn!(key, error = %e, "could not read last ping day");
                PING_NEVER
            }
        }
    }

    /// Records the day boundary the server answered with, so the next
    /// ping interval is computed in server-local days.
    fn update_last_ping_days(&self, response: &Response, sent_active: bool, sent_roll_call: bool) {
        let Some(elapsed) = response.daystart_elapsed_seconds else {
            return;
        };
        let daystart = self.clock.now() - Duration::seconds(elapsed);
        if sent_active {
            self.persist_i64(keys::LAST_ACTIVE_PING_DAY, to_micros(daystart));
        }
        if sent_roll_call {
            self.persist_i64(keys::LAST_ROLL_CALL_PING_DAY, to_micros(daystart));
        }
    }

    /// The install date is provisioned once, rounded down to a whole week
    /// so it cannot be used to fingerprint a device.
    fn persist_install_date(&self, response: &Response) {
        if self.prefs.exists(keys::INSTALL_DATE_DAYS) {
            return;
        }
        if let Some(days) = response.daystart_elapsed_days {
            if days >= 0 {
                self.persist_i64(keys::INSTALL_DATE_DAYS, (days / 7) * 7);
            }
        }
    }

    fn persist_cohorts(&self, response: &Response) {
        for (value, key) in [
            (&response.cohort, keys::OMAHA_COHORT),
            (&response.cohort_hint, keys::OMAHA_COHORT_HINT),
            (&response.cohort_name, keys::OMAHA_COHORT_NAME),
        ] {
            let Some(value) = value else { continue };
            if value.is_empty() {
                self.remove_pref(key);
            } else if is_valid_cohort(value) {
                self.persist_string(key, value);
            } else {
                warn!(key, "server sent an invalid cohort value, not storing it");
            }
        }
    }

    /// Gates that reject an offered update outright. Evaluated before the
    /// response is committed to payload state.
    fn should_ignore(
        &self,
        response: &Response,
        payload_state: &PayloadState,
    ) -> Option<ErrorCode> {
        // Never update onto the version an enterprise rollback moved away
        // from.
        if let Some(blacklisted) = payload_state.rollback_version() {
            if blacklisted == response.version {
                warn!(
                    version = response.version,
                    "offered the version we rolled back from, ignoring"
                );
                return Some(ErrorCode::OmahaUpdateIgnoredPerPolicy);
            }
        }
        if response.is_rollback && !self.rollback_allowed() {
            warn!("server offered a rollback image but rollback is not permitted");
            return Some(ErrorCode::OmahaUpdateIgnoredPerPolicy);
        }
        // An administrator kill switch; deadlined (critical) updates still
        // go through.
        if self.policy.update_disabled().unwrap_or(false) && response.deadline.is_empty() {
            info!("updates disabled by policy, ignoring offer");
            return Some(ErrorCode::OmahaUpdateIgnoredPerPolicy);
        }
        // During out-of-box setup only critical (deadlined) updates may
        // interrupt the user. A device recovering from a rollback updates
        // regardless, since it is deliberately on an old image.
        if !self.boot.is_oobe_complete()
            && response.deadline.is_empty()
            && !payload_state.rollback_happened()
        {
            info!("non-critical update ignored during out-of-box setup");
            return Some(ErrorCode::NonCriticalUpdateInOobe);
        }
        if let Some(code) = self.check_connection(response) {
            return Some(code);
        }
        None
    }

    /// Metered connections need explicit permission: administrator policy
    /// when managed, otherwise a user consent pref, which may be scoped to
    /// one specific update (version plus size).
    fn check_connection(&self, response: &Response) -> Option<ErrorCode> {
        let (connection, tethering) = self.connection.connection();
        if !connection.is_metered(tethering) {
            if let Some(allowed) = self.policy.allowed_connection_types() {
                if !allowed.contains(&connection) {
                    info!(connection = ?connection, "connection type forbidden by policy");
                    return Some(ErrorCode::OmahaUpdateIgnoredPerPolicy);
                }
            }
            return None;
        }
        if let Some(allowed) = self.policy.metered_updates_enabled() {
            return if allowed {
                None
            } else {
                info!("update over metered connection forbidden by policy");
                Some(ErrorCode::OmahaUpdateIgnoredOverCellular)
            };
        }
        if self
            .prefs
            .get_bool(keys::UPDATE_OVER_CELLULAR_PERMISSION)
            .ok()
            .flatten()
            .unwrap_or(false)
        {
            return None;
        }
        let permitted_version = self.get_pref_string(keys::UPDATE_OVER_CELLULAR_TARGET_VERSION);
        let permitted_size = self
            .prefs
            .get_i64(keys::UPDATE_OVER_CELLULAR_TARGET_SIZE)
            .ok()
            .flatten();
        if permitted_version.as_deref() == Some(response.version.as_str())
            && permitted_size == Some(response.total_package_size() as i64)
        {
            return None;
        }
        info!("update over metered connection needs user consent");
        Some(ErrorCode::OmahaUpdateIgnoredOverCellular)
    }

    /// Gates that postpone the download of a committed update: staged
    /// rollout via a wall-clock wait, then the check-count wait.
    fn should_defer_download(&self, response: &Response) -> Option<ErrorCode> {
        // Deadlined updates are never scattered.
        if !response.deadline.is_empty() {
            return None;
        }

        let staging_days = self.policy.staging_wait_days().filter(|d| *d > 0);
        let scatter = self.policy.scatter_factor().filter(|s| *s > Duration::zero());
        if staging_days.is_none() && scatter.is_none() {
            // Scattering is off; a stale wait or count must not bleed into
            // a later policy that turns it back on.
            self.remove_pref(keys::UPDATE_CHECK_COUNT);
            self.remove_pref(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD);
            return None;
        }

        let (wait, max_wait) = if let Some(days) = staging_days {
            (
                Duration::days(days.min(MAX_STAGING_WAIT_DAYS)),
                Duration::days(MAX_STAGING_WAIT_DAYS),
            )
        } else {
            // Scattering only applies when the server allows it.
            if response.max_days_to_scatter <= 0 {
                return None;
            }
            let max_wait = Duration::days(response.max_days_to_scatter);
            (self.scattering_wait_period(scatter.unwrap(), max_wait), max_wait)
        };

        let first_seen = self.update_first_seen_at();
        let elapsed = self.clock.now() - first_seen;

        // Past the maximum window: stop scattering so the device cannot be
        // starved of the update.
        if elapsed > max_wait {
            return None;
        }
        if elapsed < wait {
            info!(
                remaining_secs = (wait - elapsed).num_seconds(),
                "download deferred by staged rollout"
            );
            return Some(ErrorCode::OmahaUpdateDeferredPerPolicy);
        }

        if staging_days.is_none()
            && !response.disable_repeated_updatechecks
            && !self.update_check_count_satisfied()
        {
            return Some(ErrorCode::OmahaUpdateDeferredPerPolicy);
        }
        None
    }

    /// The persisted scattering wait, or a fresh random one in
    /// `(0, min(scatter_factor, max_wait)]`.
    fn scattering_wait_period(&self, scatter_factor: Duration, max_wait: Duration) -> Duration {
        if let Ok(Some(secs)) = self.prefs.get_i64(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD) {
            if secs > 0 && secs <= max_wait.num_seconds() {
                return Duration::seconds(secs);
            }
        }
        let upper = scatter_factor.num_seconds().min(max_wait.num_seconds());
        let wait = if upper <= 1 {
            1
        } else {
            rand::rng().random_range(1..=upper)
        };
        info!(wait_secs = wait, "picked new scattering wait period");
        self.persist_i64(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD, wait);
        Duration::seconds(wait)
    }

    fn update_first_seen_at(&self) -> chrono::DateTime<chrono::Utc> {
        if let Ok(Some(micros)) = self.prefs.get_i64(keys::UPDATE_FIRST_SEEN_AT) {
            if let Some(time) = from_micros(micros) {
                return time;
            }
        }
        let now = self.clock.now();
        self.persist_i64(keys::UPDATE_FIRST_SEEN_AT, to_micros(now));
        now
    }

    /// Check-count based waiting: sit out a random number of periodic
    /// checks so devices that passed the wall-clock wait together still do
    /// not download together. Returns true once the count reaches zero.
    fn update_check_count_satisfied(&self) -> bool {
        let count = match self.prefs.get_i64(keys::UPDATE_CHECK_COUNT) {
            Ok(Some(count)) => count,
            Ok(None) => {
                let count = rand::rng().random_range(MIN_UPDATE_CHECKS..=MAX_UPDATE_CHECKS);
                info!(count, "picked new update check count");
                self.persist_i64(keys::UPDATE_CHECK_COUNT, count);
                return count == 0;
            }
            // Unreadable count: err on the side of updating.
            Err(e) => {
                warn!(error = %e, "could not read update check count");
                return true;
            }
        };
        if count <= 0 {
            return true;
        }
        if count > MAX_UPDATE_CHECKS {
            warn!(count, "implausible update check count, skipping the wait");
            return true;
        }
        let remaining = count - 1;
        self.persist_i64(keys::UPDATE_CHECK_COUNT, remaining);
        remaining <= 0
    }

    // Pref helpers: losing one of these writes costs bookkeeping fidelity,
    // not correctness, so they log instead of propagating.

    fn get_pref_string(&self, key: &str) -> Option<String> {
        self.prefs.get_string(key).ok().flatten()
    }

    fn persist_string(&self, key: &str, value: &str) {
        if let Err(e) = self.prefs.set_string(key, value) {
            warn!(key, error = %e, "failed to persist pref");
        }
    }

    fn persist_i64(&self, key: &str, value: i64) {
        if let Err(e) = self.prefs.set_i64(key, value) {
            warn!(key, error = %e, "failed to persist pref");
        }
    }

    fn remove_pref(&self, key: &str) {
        if let Err(e) = self.prefs.remove(key) {
            warn!(key, error = %e, "failed to remove pref");
        }
    }
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
    use chrono::{TimeZone, Utc};

    const APP_ID: &str = "{app-id}";

    struct Harness {
        http: Arc<MockHttpClient>,
        clock: Arc<FakeClock>,
        prefs: Arc<MemoryPrefs>,
        boot: Arc<FakeBootControl>,
        policy: FakePolicy,
        connection: Arc<FakeConnection>,
        metrics: Arc<RecordingMetrics>,
        rollback_allowed: bool,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                http: Arc::new(MockHttpClient::new()),
                clock: Arc::new(FakeClock::new(
                    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
                )),
                prefs: Arc::new(MemoryPrefs::new()),
                boot: Arc::new(FakeBootControl::new()),
                policy: FakePolicy::default(),
                connection: Arc::new(FakeConnection::new(
                    ConnectionType::Ethernet,
                    Tethering::NotDetected,
                )),
                metrics: Arc::new(RecordingMetrics::default()),
                rollback_allowed: false,
            }
        }

        fn checker(self) -> (UpdateChecker, PayloadState) {
            let policy: Arc<dyn DevicePolicy> = Arc::new(self.policy);
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
                self.clock.clone(),
                self.prefs.clone(),
                self.boot.clone(),
                policy.clone(),
                self.connection.clone(),
                self.metrics.clone(),
                params,
            );
            let state = PayloadState::new(
                self.prefs.clone(),
                Arc::new(MemoryPrefs::new()),
                self.clock.clone(),
                self.metrics.clone(),
                self.boot.clone(),
                policy,
            )
            .unwrap();
            (checker, state)
        }
    }

    fn update_body(version: &str) -> String {
        format!(
            r#"<response protocol="3.0">
  <daystart elapsed_seconds="400" elapsed_days="4200"/>
  <app appid="{APP_ID}" status="ok">
    <updatecheck status="ok">
      <urls><url codebase="https://cdn.example.com/"/></urls>
      <manifest version="{version}">
        <packages><package name="payload.bin" size="1000" hash_sha256="aa"/></packages>
        <actions><action event="postinstall" MetadataSize="10"/></actions>
      </manifest>
    </updatecheck>
  </app>
</response>"#
        )
    }

    fn deadlined_update_body(version: &str) -> String {
        update_body(version).replace(
            "MetadataSize=\"10\"",
            "MetadataSize=\"10\" deadline=\"now\"",
        )
    }

    fn noupdate_body() -> String {
        format!(
            r#"<response protocol="3.0">
  <daystart elapsed_seconds="400"/>
  <app appid="{APP_ID}" status="ok"><updatecheck status="noupdate"/></app>
</response>"#
        )
    }

    #[test]
    fn test_ping_only_request_carries_no_updatecheck() {
        let h = Harness::new();
        h.http.push_response(
            200,
            &format!(
                r#"<response protocol="3.0">
  <daystart elapsed_seconds="400"/>
  <app appid="{APP_ID}" status="ok"><ping status="ok"/></app>
</response>"#
            ),
        );
        let http = h.http.clone();
        let prefs = h.prefs.clone();
        let (checker, _state) = h.checker();
        checker.perform_ping().unwrap();

        let body = &http.requests()[0].1;
        assert!(body.contains("<ping"));
        assert!(!body.contains("<updatecheck"));
        // The daystart anchored both last-ping-day marks.
        assert!(prefs.exists(keys::LAST_ACTIVE_PING_DAY));
        assert!(prefs.exists(keys::LAST_ROLL_CALL_PING_DAY));
    }

    #[test]
    fn test_ping_only_skipped_when_already_pinged_today() {
        let h = Harness::new();
        h.prefs
            .set_i64(keys::LAST_ACTIVE_PING_DAY, to_micros(h.clock.now()))
            .unwrap();
        h.prefs
            .set_i64(keys::LAST_ROLL_CALL_PING_DAY, to_micros(h.clock.now()))
            .unwrap();
        let http = h.http.clone();
        let (checker, _state) = h.checker();
        checker.perform_ping().unwrap();
        assert!(http.requests().is_empty());
    }

    #[test]
    fn test_first_check_sends_never_pinged_sentinels() {
        let h = Harness::new();
        h.http.push_response(200, &noupdate_body());
        let http = h.http.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        let body = &http.requests()[0].1;
        assert!(body.contains("a=\"-1\""));
        assert!(body.contains("r=\"-1\""));
    }

    #[test]
    fn test_ping_days_counted_and_daystart_persisted() {
        let h = Harness::new();
        let five_days_ago = h.clock.now() - Duration::days(5);
        h.prefs
            .set_i64(keys::LAST_ACTIVE_PING_DAY, to_micros(five_days_ago))
            .unwrap();
        h.prefs
            .set_i64(keys::LAST_ROLL_CALL_PING_DAY, to_micros(five_days_ago))
            .unwrap();
        h.http.push_response(200, &noupdate_body());
        let http = h.http.clone();
        let prefs = h.prefs.clone();
        let clock = h.clock.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();

        let body = &http.requests()[0].1;
        assert!(body.contains("a=\"5\""));
        assert!(body.contains("r=\"5\""));

        // daystart elapsed_seconds=400: last ping day moves to now-400s.
        let stored = prefs.get_i64(keys::LAST_ACTIVE_PING_DAY).unwrap().unwrap();
        assert_eq!(
            stored,
            to_micros(clock.now() - Duration::seconds(400))
        );
    }

    #[test]
    fn test_same_day_ping_omitted() {
        let h = Harness::new();
        let today = h.clock.now() - Duration::hours(2);
        h.prefs
            .set_i64(keys::LAST_ACTIVE_PING_DAY, to_micros(today))
            .unwrap();
        h.prefs
            .set_i64(keys::LAST_ROLL_CALL_PING_DAY, to_micros(today))
            .unwrap();
        h.http.push_response(200, &noupdate_body());
        let http = h.http.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        assert!(!http.requests()[0].1.contains("<ping"));
    }

    #[test]
    fn test_clock_jump_sends_sentinel() {
        let h = Harness::new();
        let future = h.clock.now() + Duration::days(3);
        h.prefs
            .set_i64(keys::LAST_ROLL_CALL_PING_DAY, to_micros(future))
            .unwrap();
        h.http.push_response(200, &noupdate_body());
        let http = h.http.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        assert!(http.requests()[0].1.contains("r=\"-2\""));
    }

    #[test]
    fn test_noupdate_decision() {
        let h = Harness::new();
        h.http.push_response(200, &noupdate_body());
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::NoUpdate);
        assert_eq!(state.num_responses_seen(), 0);
    }

    #[test]
    fn test_update_available_commits_response() {
        let h = Harness::new();
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
        assert_eq!(state.num_responses_seen(), 1);
        assert_eq!(
            state.current_url(),
            Some("https://cdn.example.com/payload.bin")
        );
    }

    #[test]
    fn test_server_error_status() {
        let h = Harness::new();
        h.http.push_response(500, "");
        let (checker, mut state) = h.checker();
        let err = checker.perform_check(&mut state, false).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::HttpResponse(500));
    }

    #[test]
    fn test_transport_error_code() {
        let h = Harness::new();
        h.http.push_error();
        let (checker, mut state) = h.checker();
        let err = checker.perform_check(&mut state, false).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::OmahaRequestError);
    }

    #[test]
    fn test_oobe_blocks_non_critical_update() {
        let mut h = Harness::new();
        h.boot = Arc::new({
            let mut boot = FakeBootControl::new();
            boot.oobe_complete = false;
            boot
        });
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Ignored(ErrorCode::NonCriticalUpdateInOobe)
        );
        // Ignored updates never touch failover state.
        assert_eq!(state.num_responses_seen(), 0);
    }

    #[test]
    fn test_oobe_allows_deadlined_update() {
        let mut h = Harness::new();
        h.boot = Arc::new({
            let mut boot = FakeBootControl::new();
            boot.oobe_complete = false;
            boot
        });
        h.http.push_response(200, &deadlined_update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
    }

    #[test]
    fn test_metered_connection_needs_consent() {
        let h = Harness::new();
        h.connection.set(ConnectionType::Cellular, Tethering::NotDetected);
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Ignored(ErrorCode::OmahaUpdateIgnoredOverCellular)
        );
    }

    #[test]
    fn test_metered_connection_with_user_consent() {
        let h = Harness::new();
        h.connection.set(ConnectionType::Cellular, Tethering::NotDetected);
        h.prefs
            .set_bool(keys::UPDATE_OVER_CELLULAR_PERMISSION, true)
            .unwrap();
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
    }

    #[test]
    fn test_metered_connection_with_scoped_consent() {
        let h = Harness::new();
        h.connection.set(ConnectionType::Cellular, Tethering::NotDetected);
        h.prefs
            .set_string(keys::UPDATE_OVER_CELLULAR_TARGET_VERSION, "2.0.0")
            .unwrap();
        h.prefs
            .set_i64(keys::UPDATE_OVER_CELLULAR_TARGET_SIZE, 1000)
            .unwrap();
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
    }

    #[test]
    fn test_metered_policy_overrides_consent() {
        let mut h = Harness::new();
        h.connection.set(ConnectionType::Cellular, Tethering::NotDetected);
        h.policy.loaded = true;
        h.policy.metered_updates = Some(false);
        h.prefs
            .set_bool(keys::UPDATE_OVER_CELLULAR_PERMISSION, true)
            .unwrap();
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Ignored(ErrorCode::OmahaUpdateIgnoredOverCellular)
        );
    }

    #[test]
    fn test_policy_disallowed_connection_type_ignores_offer() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.allowed_connections = Some(vec![ConnectionType::Cellular]);
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        // The harness connection is ethernet, which the list omits.
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Ignored(ErrorCode::OmahaUpdateIgnoredPerPolicy)
        );
    }

    #[test]
    fn test_connection_types_unrestricted_without_policy_list() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.allowed_connections = None;
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
    }

    #[test]
    fn test_rolled_back_version_is_blacklisted() {
        let h = Harness::new();
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        state.set_rollback_version("2.0.0");
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Ignored(ErrorCode::OmahaUpdateIgnoredPerPolicy)
        );
    }

    #[test]
    fn test_update_disabled_policy_ignores_offer() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.disabled = Some(true);
        h.http.push_response(200, &update_body("2.0.0"));
        h.http.push_response(200, &deadlined_update_body("2.0.0"));
        let (checker, mut state) = h.checker();

        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Ignored(ErrorCode::OmahaUpdateIgnoredPerPolicy)
        );

        // Deadlined updates go through the kill switch.
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
    }

    #[test]
    fn test_policy_target_prefix_sent_in_request() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.version_prefix = Some("1412.".to_string());
        h.http.push_response(200, &noupdate_body());
        let http = h.http.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        assert!(http.requests()[0]
            .1
            .contains("targetversionprefix=\"1412.\""));
    }

    #[test]
    fn test_backoff_defers_background_but_not_interactive() {
        let h = Harness::new();
        h.http.push_response(200, &update_body("2.0.0"));
        h.http.push_response(200, &update_body("2.0.0"));
        h.http.push_response(200, &update_body("2.0.0"));
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();

        // Exhaust the single URL to arm backoff.
        state.update_failed(ErrorCode::PayloadHashMismatchError);
        assert!(state.should_backoff_download());

        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Deferred(ErrorCode::OmahaUpdateDeferredForBackoff)
        );
        // Interactive checks ride through the backoff window.
        let outcome = checker.perform_check(&mut state, true).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
    }

    #[test]
    fn test_scattering_defers_until_wait_elapses() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.scatter = Some(Duration::days(7));
        // Pin the wait so the test is deterministic.
        h.prefs
            .set_i64(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD, 3600)
            .unwrap();
        h.prefs.set_i64(keys::UPDATE_CHECK_COUNT, 0).unwrap();
        let body = update_body("2.0.0").replace(
            "MetadataSize=\"10\"",
            "MetadataSize=\"10\" MaxDaysToScatter=\"14\"",
        );
        h.http.push_response(200, &body);
        h.http.push_response(200, &body);
        let clock = h.clock.clone();
        let (checker, mut state) = h.checker();

        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Deferred(ErrorCode::OmahaUpdateDeferredPerPolicy)
        );
        // Deferral still committed the response.
        assert_eq!(state.num_responses_seen(), 1);

        clock.advance(Duration::hours(2));
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
    }

    #[test]
    fn test_check_count_wait_decrements_across_checks() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.scatter = Some(Duration::days(7));
        h.prefs
            .set_i64(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD, 1)
            .unwrap();
        h.prefs.set_i64(keys::UPDATE_CHECK_COUNT, 2).unwrap();
        // The wall-clock wait is already behind us.
        h.prefs
            .set_i64(
                keys::UPDATE_FIRST_SEEN_AT,
                to_micros(h.clock.now() - Duration::hours(1)),
            )
            .unwrap();
        let body = update_body("2.0.0").replace(
            "MetadataSize=\"10\"",
            "MetadataSize=\"10\" MaxDaysToScatter=\"14\"",
        );
        for _ in 0..3 {
            h.http.push_response(200, &body);
        }
        let prefs = h.prefs.clone();
        let (checker, mut state) = h.checker();

        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Deferred(ErrorCode::OmahaUpdateDeferredPerPolicy)
        );
        assert_eq!(prefs.get_i64(keys::UPDATE_CHECK_COUNT).unwrap(), Some(1));

        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
        assert_eq!(prefs.get_i64(keys::UPDATE_CHECK_COUNT).unwrap(), Some(0));
    }

    #[test]
    fn test_scattering_applies_again_after_completed_update() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.scatter = Some(Duration::days(7));
        // Leftovers from an update that already went through: the wait is
        // long spent and the check count is exhausted.
        h.prefs.set_i64(keys::UPDATE_CHECK_COUNT, 0).unwrap();
        h.prefs
            .set_i64(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD, 3600)
            .unwrap();
        h.prefs
            .set_i64(
                keys::UPDATE_FIRST_SEEN_AT,
                to_micros(h.clock.now() - Duration::days(400)),
            )
            .unwrap();
        let body = |version: &str| {
            update_body(version).replace(
                "MetadataSize=\"10\"",
                "MetadataSize=\"10\" MaxDaysToScatter=\"14\"",
            )
        };
        h.http.push_response(200, &body("2.0.0"));
        h.http.push_response(200, &body("3.0.0"));
        let prefs = h.prefs.clone();
        let (checker, mut state) = h.checker();

        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);

        state.update_succeeded();
        assert!(!prefs.exists(keys::UPDATE_CHECK_COUNT));
        assert!(!prefs.exists(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD));
        assert!(!prefs.exists(keys::UPDATE_FIRST_SEEN_AT));

        // The next offer starts a fresh wall-clock wait instead of riding
        // the spent one straight through.
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            outcome.decision,
            CheckDecision::Deferred(ErrorCode::OmahaUpdateDeferredPerPolicy)
        );
    }

    #[test]
    fn test_stale_scattering_prefs_cleared_when_policy_stops_scattering() {
        let h = Harness::new();
        h.prefs.set_i64(keys::UPDATE_CHECK_COUNT, 3).unwrap();
        h.prefs
            .set_i64(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD, 3600)
            .unwrap();
        h.http.push_response(200, &update_body("2.0.0"));
        let prefs = h.prefs.clone();
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, false).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
        assert!(!prefs.exists(keys::UPDATE_CHECK_COUNT));
        assert!(!prefs.exists(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD));
    }

    #[test]
    fn test_interactive_skips_scattering() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.scatter = Some(Duration::days(7));
        h.prefs
            .set_i64(keys::WALL_CLOCK_SCATTERING_WAIT_PERIOD, 86400)
            .unwrap();
        let body = update_body("2.0.0").replace(
            "MetadataSize=\"10\"",
            "MetadataSize=\"10\" MaxDaysToScatter=\"14\"",
        );
        h.http.push_response(200, &body);
        let (checker, mut state) = h.checker();
        let outcome = checker.perform_check(&mut state, true).unwrap();
        assert_eq!(outcome.decision, CheckDecision::UpdateAvailable);
    }

    #[test]
    fn test_cohort_persisted_and_echoed() {
        let h = Harness::new();
        let body = noupdate_body().replace(
            &format!("appid=\"{}\"", APP_ID),
            &format!("appid=\"{}\" cohort=\"1:c8/7:22\" cohortname=\"stable\"", APP_ID),
        );
        h.http.push_response(200, &body);
        h.http.push_response(200, &noupdate_body());
        let http = h.http.clone();
        let prefs = h.prefs.clone();
        let (checker, mut state) = h.checker();

        checker.perform_check(&mut state, false).unwrap();
        assert_eq!(
            prefs.get_string(keys::OMAHA_COHORT).unwrap().as_deref(),
            Some("1:c8/7:22")
        );

        checker.perform_check(&mut state, false).unwrap();
        let second_request = &http.requests()[1].1;
        assert!(second_request.contains("cohort=\"1:c8/7:22\""));
        assert!(second_request.contains("cohortname=\"stable\""));
    }

    #[test]
    fn test_invalid_cohort_not_persisted() {
        let h = Harness::new();
        let body = noupdate_body().replace(
            &format!("appid=\"{}\"", APP_ID),
            &format!("appid=\"{}\" cohort=\"bad\u{00e9}value\"", APP_ID),
        );
        h.http.push_response(200, &body);
        let prefs = h.prefs.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        assert!(prefs.get_string(keys::OMAHA_COHORT).unwrap().is_none());
    }

    #[test]
    fn test_previous_version_event_sent_once() {
        let h = Harness::new();
        h.prefs
            .set_string(keys::PREVIOUS_VERSION, "0.9.9")
            .unwrap();
        h.http.push_response(200, &noupdate_body());
        h.http.push_response(200, &noupdate_body());
        let http = h.http.clone();
        let (checker, mut state) = h.checker();

        checker.perform_check(&mut state, false).unwrap();
        assert!(http.requests()[0].1.contains("previousversion=\"0.9.9\""));

        checker.perform_check(&mut state, false).unwrap();
        assert!(!http.requests()[1].1.contains("previousversion"));
    }

    #[test]
    fn test_kernel_rollforward_frozen_without_policy() {
        // An enrolled device whose policy fetch has not landed yet must
        // not open the window: rollback could still be ordered.
        let h = Harness::new();
        h.http.push_response(200, &noupdate_body());
        let boot = h.boot.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        assert_eq!(boot.rollforward_writes(), vec![0x00010001]);
    }

    #[test]
    fn test_kernel_rollforward_frozen_when_milestones_unreadable() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.rollback_milestones = None;
        h.http.push_response(200, &noupdate_body());
        let boot = h.boot.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        assert_eq!(boot.rollforward_writes(), vec![0x00010001]);
    }

    #[test]
    fn test_kernel_rollforward_frozen_when_rollback_allowed() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.rollback_milestones = Some(4);
        h.http.push_response(200, &noupdate_body());
        let boot = h.boot.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        assert_eq!(boot.rollforward_writes(), vec![0x00010001]);
    }

    #[test]
    fn test_kernel_rollforward_opened_for_consumer_device() {
        let mut h = Harness::new();
        h.policy.consumer = true;
        h.http.push_response(200, &noupdate_body());
        let boot = h.boot.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        assert_eq!(boot.rollforward_writes(), vec![ROLL_FORWARD_INFINITY]);
    }

    #[test]
    fn test_kernel_rollforward_opened_when_rollback_explicitly_disabled() {
        let mut h = Harness::new();
        h.policy.loaded = true;
        h.policy.rollback_milestones = Some(0);
        h.http.push_response(200, &noupdate_body());
        let boot = h.boot.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        assert_eq!(boot.rollforward_writes(), vec![ROLL_FORWARD_INFINITY]);
    }

    #[test]
    fn test_install_date_rounded_to_week() {
        let h = Harness::new();
        h.http.push_response(200, &noupdate_body());
        let prefs = h.prefs.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        // noupdate_body has no elapsed_days, so nothing is stored.
        assert!(prefs.get_i64(keys::INSTALL_DATE_DAYS).unwrap().is_none());

        let h = Harness::new();
        h.http.push_response(200, &update_body("2.0.0"));
        let prefs = h.prefs.clone();
        let (checker, mut state) = h.checker();
        checker.perform_check(&mut state, false).unwrap();
        // elapsed_days=4200 is already a multiple of 7.
        assert_eq!(prefs.get_i64(keys::INSTALL_DATE_DAYS).unwrap(), Some(4200));
    }

    #[test]
    fn test_send_event() {
        let h = Harness::new();
        h.http.push_response(200, "<response protocol=\"3.0\"></response>");
        let http = h.http.clone();
        let (checker, _state) = h.checker();
        checker
            .send_event(Event::error(
                crate::protocol::request::EventType::UpdateComplete,
                ErrorCode::DownloadTransferError,
            ))
            .unwrap();
        let body = &http.requests()[0].1;
        assert!(body.contains("eventtype=\"3\""));
        assert!(body.contains("errorcode=\"9\""));
    }
}
