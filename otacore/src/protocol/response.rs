//! Parsed update server response.

/// Firmware and kernel key versions of a rollback target image, reported
/// by the server on rollback responses. `0xffff` marks a field the server
/// did not supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackKeyVersions {
    pub firmware_key: u16,
    pub firmware: u16,
    pub kernel_key: u16,
    pub kernel: u16,
}

impl Default for RollbackKeyVersions {
    fn default() -> Self {
        Self {
            firmware_key: u16::MAX,
            firmware: u16::MAX,
            kernel_key: u16::MAX,
            kernel: u16::MAX,
        }
    }
}

/// One downloadable payload within a response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Package {
    /// Candidate download URLs, in server preference order. Each is the
    /// join of a `<url codebase=..>` prefix with the package file name.
    pub payload_urls: Vec<String>,
    /// Payload file name as supplied by the server.
    pub name: String,
    /// Payload size in bytes.
    pub size: u64,
    /// Size of the metadata region at the head of the payload, when known.
    pub metadata_size: u64,
    /// Detached signature over the metadata region, when supplied.
    pub metadata_signature: Option<String>,
    /// Hex SHA-256 of the whole payload.
    pub hash: String,
    /// Whether this payload is a delta from the running version.
    pub is_delta: bool,
    /// Fingerprint label the server associates with this payload.
    pub fingerprint: Option<String>,
    /// Application this package belongs to (responses can carry packages
    /// for more than one app).
    pub app_id: String,
    /// Whether this package may be downloaded now or is present only for
    /// bookkeeping (e.g. from a non-critical sub-app).
    pub can_exclude: bool,
}

/// Typed result of a successful update check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// False for a `noupdate` response; all payload fields are then empty.
    pub update_exists: bool,
    /// Version offered by the server.
    pub version: String,
    /// Version of the companion system app, when one rode along.
    pub system_version: Option<String>,
    /// Payloads to download, primary app first.
    pub packages: Vec<Package>,

    /// Seconds since the server's day boundary, used to convert local ping
    /// bookkeeping to server-local days.
    pub daystart_elapsed_seconds: Option<i64>,
    /// Days since the server epoch, persisted once as the install date.
    pub daystart_elapsed_days: Option<i64>,

    /// Opaque cohort values to echo on future requests. `None` means the
    /// server did not mention the attribute; `Some` overwrites (an empty
    /// string clears).
    pub cohort: Option<String>,
    pub cohort_hint: Option<String>,
    pub cohort_name: Option<String>,

    /// Page the UI may send users to for release information.
    pub more_info_url: String,
    /// Whether the UI should prompt before applying.
    pub prompt: bool,
    /// Hard deadline attribute; non-empty means apply without prompting.
    pub deadline: String,

    /// Maximum days the client may scatter this update.
    pub max_days_to_scatter: i64,
    /// Per-URL failure budget before failover advances. Server override of
    /// the default.
    pub max_failure_count_per_url: u32,
    /// Server opted this payload out of backoff entirely.
    pub disable_payload_backoff: bool,
    /// Server disabled peer-to-peer downloading / sharing for this update.
    pub disable_p2p_for_downloading: bool,
    pub disable_p2p_for_sharing: bool,
    /// Server disabled the repeated-check wait mechanism.
    pub disable_repeated_updatechecks: bool,

    /// Base64 public key for payload signature verification, when rotated
    /// via the response.
    pub public_key_rsa: String,

    /// This response is an enterprise rollback image.
    pub is_rollback: bool,
    /// Key versions of the rollback image (only meaningful with
    /// `is_rollback`).
    pub rollback_key_versions: RollbackKeyVersions,

    /// Device end-of-life status string, persisted for the UI.
    pub eol_status: Option<String>,
    /// Whether applying this update schedules a powerwash.
    pub powerwash_required: bool,

    /// Server-suggested next poll interval in seconds, when present.
    pub poll_interval_seconds: Option<i64>,
}

/// Default per-URL failure budget when the server does not override it.
pub const DEFAULT_MAX_FAILURE_COUNT_PER_URL: u32 = 10;

impl Response {
    /// Sum of all package sizes, i.e. bytes needed to fetch everything.
    pub fn total_package_size(&self) -> u64 {
        self.packages.iter().map(|p| p.size).sum()
    }
}
