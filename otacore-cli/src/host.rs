//! Host-side implementations of the platform traits.
//!
//! The CLI runs on ordinary Linux hosts without verified-boot firmware, so
//! the boot facts are best-effort: the boot id comes from the kernel, key
//! versions are absent, and the slot is fixed.

use std::fs;

use otacore::boot::BootControl;
use otacore::policy::{ConnectionMonitor, ConnectionType, Tethering};

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

pub struct HostBoot {
    official_build: bool,
}

impl HostBoot {
    pub fn new(official_build: bool) -> Self {
        Self { official_build }
    }
}

impl BootControl for HostBoot {
    fn min_kernel_key_version(&self) -> Option<u32> {
        None
    }

    fn min_firmware_key_version(&self) -> Option<u32> {
        None
    }

    fn set_kernel_key_max_rollforward(&self, _version: u32) -> bool {
        // No rollforward storage on a plain host.
        false
    }

    fn current_slot(&self) -> String {
        "A".to_string()
    }

    fn is_oobe_complete(&self) -> bool {
        true
    }

    fn is_official_build(&self) -> bool {
        self.official_build
    }

    fn system_rebooted_since(&self, boot_id: &str) -> bool {
        self.boot_id() != boot_id
    }

    fn boot_id(&self) -> String {
        fs::read_to_string(BOOT_ID_PATH)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

/// Connection monitor that reports a fixed unmetered link. Hosts with a
/// real connection manager should replace this.
pub struct StaticConnection;

impl ConnectionMonitor for StaticConnection {
    fn connection(&self) -> (ConnectionType, Tethering) {
        (ConnectionType::Ethernet, Tethering::NotDetected)
    }
}
