//! PCIe identifiers.
//!
//! The AMC525 carries a Xilinx Virtex-7 behind a Xilinx PCIe endpoint, so the
//! vendor and device IDs are the generic Xilinx ones; the subsystem ID is what
//! identifies our firmware.

/// Xilinx vendor ID (PCI-SIG assigned).
pub const XILINX_VENDOR_ID: u16 = 0x10EE;

/// Device ID of the Virtex-7 PCIe endpoint on the AMC525 (`lspci: 10ee:7038`).
pub const AMC525_DEVICE_ID: u16 = 0x7038;

/// Subsystem vendor ID presented by our firmware.
pub const AMC525_SUBSYSTEM_VENDOR_ID: u16 = XILINX_VENDOR_ID;

/// Subsystem device ID presented by our firmware.
pub const AMC525_SUBSYSTEM_ID: u16 = 0x0007;

/// Boards are numbered `0..MAX_BOARDS`, each owning a block of minors.
pub const MAX_BOARDS: usize = 4;

/// Device nodes a single board may expose.
pub const MAX_MINORS_PER_BOARD: usize = 16;

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{XILINX_VENDOR_ID:04x}:{AMC525_DEVICE_ID:04x}")
}

/// Whether the (vendor, device, subsystem vendor, subsystem) quadruple names
/// an AMC525 running firmware this driver understands.
#[must_use]
pub const fn matches(vendor: u16, device: u16, sub_vendor: u16, sub_device: u16) -> bool {
    vendor == XILINX_VENDOR_ID
        && device == AMC525_DEVICE_ID
        && sub_vendor == AMC525_SUBSYSTEM_VENDOR_ID
        && sub_device == AMC525_SUBSYSTEM_ID
}
