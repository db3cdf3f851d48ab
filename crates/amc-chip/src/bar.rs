//! PCIe BAR layout.
//!
//! ```text
//! BAR  Size     Purpose
//! ──── ──────── ───────────────────────────────────────────────────────
//!  0   varies   Firmware register space, mapped by user applications
//!  2   16 KB    Driver control area: four 4 KB pages
//!                 0x0000  AXI CDMA controller (PG034)
//!                 0x1000  AXI interrupt controller (PG099)
//!                 0x2000  PROM window (device table, 4 KB)
//!                 0x3000  unused
//! ```

/// BAR carrying the firmware register space.
pub const REGISTER_BAR: u32 = 0;

/// BAR carrying the driver control area.
pub const CONTROL_BAR: u32 = 2;

/// Minimum length of the control BAR, four separate IO pages.
pub const CONTROL_BAR_LENGTH: usize = 16384;

/// Offset of the AXI CDMA controller within the control BAR.
pub const CDMA_OFFSET: usize = 0x0000;

/// Offset of the AXI interrupt controller within the control BAR.
pub const INTC_OFFSET: usize = 0x1000;

/// Offset of the PROM window within the control BAR.
pub const PROM_OFFSET: usize = 0x2000;

/// Size of each control page.
pub const PAGE_SIZE: usize = 0x1000;
