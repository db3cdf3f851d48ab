//! Pure Rust userspace driver core for the AMC525 FPGA MTCA card.
//!
//! The card describes itself: a small table ("PROM") at a fixed window in
//! BAR2 lists the firmware's name and the card memory regions reachable by
//! the on-card AXI CDMA engine. Attaching a card validates the table, lays
//! out one register node plus one node per memory region, and brings up the
//! DMA engine with a host bounce buffer.
//!
//! # Layers
//!
//! ```text
//! AmcCard ─┬─ RegisterEndpoint   BAR0, advisory exclusive lock
//!          └─ MemoryEndpoint     card memory through DmaControl
//!
//! DmaControl ── RegisterWindow ── RegisterBank ─┬─ MappedRegion (VFIO)
//!     │                                         └─ SoftwareCard
//!     └── HostBuffer ─┬─ DmaBuffer (VFIO, IOMMU mapped)
//!                     └─ SoftwareHostBuffer
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use amc_driver::{open_card, CardManager, DriverConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = CardManager::discover()?;
//! let info = manager.card(0)?;
//! let card = open_card(&info.pcie_address, info.index, &DriverConfig::from_env()?)?;
//!
//! let mut ddr0 = card.open_by_name("amc525_mbf.0.ddr0")?.into_memory().ok_or("not memory")?;
//! let mut block = vec![0u8; 4096];
//! let n = ddr0.read(&mut block)?;
//! println!("read {n} bytes");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod card;
mod checksum;
mod completion;
mod config;
mod discovery;
pub mod dma;
mod error;
mod locking;
pub mod mmio;
pub mod prom;
pub mod software;
pub mod vfio;

/// Hardware identification constants (re-exported from amc-chip).
pub mod pcie_ids {
    pub use amc_chip::pcie::{
        lspci_filter, AMC525_DEVICE_ID, AMC525_SUBSYSTEM_ID, AMC525_SUBSYSTEM_VENDOR_ID,
        MAX_BOARDS, MAX_MINORS_PER_BOARD, XILINX_VENDOR_ID,
    };
}

pub use card::{
    AmcCard, CardParts, ClientGate, Endpoint, MemoryEndpoint, Node, NodeKind, NodeLayout,
    RegisterEndpoint, Ticket,
};
pub use checksum::checksum16;
pub use completion::Completion;
pub use config::{DriverConfig, ENV_DMA_BLOCK_SHIFT, ENV_IOVA_BASE};
pub use discovery::{CardInfo, CardManager, SYSFS_PCI_DEVICES};
pub use dma::{Direction, DmaControl, DmaGuard, HostBuffer};
pub use error::{AmcError, Result};
pub use locking::{OpenerId, RegisterLocking};
pub use prom::{PromSource, PromTable};
pub use software::{attach_software, SoftwareCard};
pub use vfio::{open_card, VfioCard, VfioDevice};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AmcCard, AmcError, CardManager, Direction, DriverConfig, Endpoint, MemoryEndpoint,
        PromTable, RegisterEndpoint, Result,
    };
}
