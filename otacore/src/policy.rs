//! Device policy and connection state inputs.
//!
//! Administrators can scatter updates over a window, pin a target version
//! prefix, allow enterprise rollback, or forbid downloads over expensive
//! links. Those knobs, plus the current network connection, come in through
//! the two traits here so the decision core never reads management state
//! directly.

use chrono::Duration;

/// The kind of network link currently carrying traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    Ethernet,
    Wifi,
    Cellular,
    Disconnected,
    Unknown,
}

/// Whether the current connection is suspected to be a tethered phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tethering {
    NotDetected,
    Suspected,
    Confirmed,
    Unknown,
}

/// Snapshot of the active network connection.
pub trait ConnectionMonitor: Send + Sync {
    fn connection(&self) -> (ConnectionType, Tethering);
}

impl ConnectionType {
    /// Metered links need explicit permission (policy or user consent)
    /// before payload bytes may flow. Tethered wifi counts as cellular.
    pub fn is_metered(self, tethering: Tethering) -> bool {
        match self {
            ConnectionType::Cellular => true,
            ConnectionType::Wifi => tethering == Tethering::Confirmed,
            _ => false,
        }
    }
}

/// Administrator-managed update policy.
///
/// Every getter returns `None` when the device is unmanaged or the policy
/// field is unset; callers fall back to consumer defaults.
pub trait DevicePolicy: Send + Sync {
    /// Whether a policy blob has been fetched at all. When false, every
    /// other getter returns `None`.
    fn is_loaded(&self) -> bool;

    /// Whether payload downloads over plain HTTP are permitted.
    fn http_downloads_enabled(&self) -> Option<bool>;

    /// Whether updates may be downloaded over metered connections.
    fn metered_updates_enabled(&self) -> Option<bool>;

    /// Connection types updates may use at all. `None` leaves every type
    /// allowed; metered types still need [`Self::metered_updates_enabled`]
    /// or user consent on top.
    fn allowed_connection_types(&self) -> Option<Vec<ConnectionType>>;

    /// Upper bound on the scatter window; the effective wait is the
    /// smaller of this and the server's `max_days_to_scatter`.
    fn scatter_factor(&self) -> Option<Duration>;

    /// Fixed staging wait in whole days, an alternative to scattering.
    fn staging_wait_days(&self) -> Option<i64>;

    /// Version prefix the device must stay on, e.g. `"1412."`.
    fn target_version_prefix(&self) -> Option<String>;

    /// How many milestones back enterprise rollback may go. `None` or a
    /// non-positive value means rollback is not allowed.
    fn rollback_allowed_milestones(&self) -> Option<i32>;

    /// Whether update checks are disabled entirely by the administrator.
    fn update_disabled(&self) -> Option<bool>;

    /// Whether this device has no enterprise enrollment at all. Consumer
    /// devices never receive enterprise rollback, so the kernel key
    /// rollforward window may open for them.
    fn is_consumer_device(&self) -> bool;
}

/// Unmanaged-device policy: everything unset.
pub struct ConsumerPolicy;

impl DevicePolicy for ConsumerPolicy {
    fn is_loaded(&self) -> bool {
        false
    }
    fn http_downloads_enabled(&self) -> Option<bool> {
        None
    }
    fn metered_updates_enabled(&self) -> Option<bool> {
        None
    }
    fn allowed_connection_types(&self) -> Option<Vec<ConnectionType>> {
        None
    }
    fn scatter_factor(&self) -> Option<Duration> {
        None
    }
    fn staging_wait_days(&self) -> Option<i64> {
        None
    }
    fn target_version_prefix(&self) -> Option<String> {
        None
    }
    fn rollback_allowed_milestones(&self) -> Option<i32> {
        None
    }
    fn update_disabled(&self) -> Option<bool> {
        None
    }
    fn is_consumer_device(&self) -> bool {
        true
    }
}
