//! Platform facts the decision core needs from the boot stack.
//!
//! Verified-boot key versions, slot identity, and first-run state live in
//! firmware-managed storage that varies per platform, so they come in
//! through the [`BootControl`] trait. The production implementation is
//! host-specific and lives outside this crate; tests use [`FakeBootControl`].

/// Sentinel meaning "no kernel key version restriction": writing this to
/// the rollforward field lets the firmware roll the key version forward
/// freely on the next update.
pub const ROLL_FORWARD_INFINITY: u32 = 0xfffffffe;

/// Read/write access to verified-boot and first-run platform state.
pub trait BootControl: Send + Sync {
    /// Minimum kernel key version the firmware will currently boot.
    fn min_kernel_key_version(&self) -> Option<u32>;

    /// Minimum firmware key version the firmware will currently boot.
    fn min_firmware_key_version(&self) -> Option<u32>;

    /// Cap the kernel key version the firmware may roll forward to. Set to
    /// the current version while an enterprise rollback is possible, and to
    /// [`ROLL_FORWARD_INFINITY`] otherwise. Returns false if the platform
    /// rejected the write.
    fn set_kernel_key_max_rollforward(&self, version: u32) -> bool;

    /// Identifier of the currently booted slot, e.g. `"A"` or `"B"`.
    fn current_slot(&self) -> String;

    /// Whether out-of-box setup has completed on this device.
    fn is_oobe_complete(&self) -> bool;

    /// Whether this is a signed production image (as opposed to a developer
    /// build, which skips backoff and version pinning restrictions).
    fn is_official_build(&self) -> bool;

    /// Whether the host has rebooted since the marker file was written.
    /// Used to count reboots during a single update attempt.
    fn system_rebooted_since(&self, boot_id: &str) -> bool;

    /// Opaque identifier of the current boot, stable until reboot.
    fn boot_id(&self) -> String;
}
