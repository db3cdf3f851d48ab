//! Runtime card discovery
//!
//! Finds AMC525 cards by scanning PCIe sysfs for the Xilinx vendor/device
//! pair and the AMC525 subsystem ids. Board numbers are positions in the
//! sorted address list of one scan.

use crate::error::{AmcError, Result};
use amc_chip::pcie;
use std::path::{Path, PathBuf};

/// Default sysfs directory holding one entry per PCI function
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Card manager for runtime discovery
#[derive(Debug)]
pub struct CardManager {
    cards: Vec<CardInfo>,
}

/// Information about a discovered card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    /// Board number (0, 1, 2, ...)
    pub index: usize,

    /// PCIe bus address (0000:03:00.0, etc.)
    pub pcie_address: String,

    /// sysfs directory of the function
    pub sysfs_path: PathBuf,
}

impl CardManager {
    /// Discover all AMC525 cards on the system
    ///
    /// # Errors
    ///
    /// Returns `AmcError::NoDevicesFound` if no cards are detected.
    pub fn discover() -> Result<Self> {
        Self::discover_in(Path::new(SYSFS_PCI_DEVICES))
    }

    /// Discover cards below an alternative sysfs root
    ///
    /// # Errors
    ///
    /// Returns `NoDevicesFound` if no cards are detected, or `Io` if the
    /// directory cannot be read.
    pub fn discover_in(root: &Path) -> Result<Self> {
        tracing::info!("Discovering AMC525 cards...");

        let mut addresses = Vec::new();
        for entry in std::fs::read_dir(root)?.flatten() {
            let path = entry.path();
            let id = |name: &str| read_hex_sysfs(&path.join(name)).ok();
            let (Some(vendor), Some(device)) = (id("vendor"), id("device")) else {
                continue;
            };
            let sub_vendor = id("subsystem_vendor").unwrap_or(0);
            let sub_device = id("subsystem_device").unwrap_or(0);
            if pcie::matches(vendor, device, sub_vendor, sub_device) {
                addresses.push(entry.file_name().to_string_lossy().into_owned());
            } else if vendor == pcie::XILINX_VENDOR_ID && device == pcie::AMC525_DEVICE_ID {
                tracing::debug!(
                    "Skipping {}: subsystem {sub_vendor:04x}:{sub_device:04x}",
                    path.display()
                );
            }
        }

        // Sort to ensure consistent board numbering
        addresses.sort();

        if addresses.is_empty() {
            tracing::error!("No AMC525 cards found");
            return Err(AmcError::NoDevicesFound);
        }
        if addresses.len() > pcie::MAX_BOARDS {
            tracing::warn!(
                "{} cards found, only the first {} are used",
                addresses.len(),
                pcie::MAX_BOARDS
            );
            addresses.truncate(pcie::MAX_BOARDS);
        }

        let cards: Vec<_> = addresses
            .into_iter()
            .enumerate()
            .map(|(index, pcie_address)| CardInfo {
                index,
                sysfs_path: root.join(&pcie_address),
                pcie_address,
            })
            .collect();

        for card in &cards {
            tracing::info!("Board {}: {}", card.index, card.pcie_address);
        }
        Ok(Self { cards })
    }

    /// Number of discovered cards
    #[must_use]
    pub fn card_count(&self) -> usize {
        self.cards.len()
    }

    /// All discovered cards
    #[must_use]
    pub fn cards(&self) -> &[CardInfo] {
        &self.cards
    }

    /// Card info by board number
    ///
    /// # Errors
    ///
    /// Returns `InvalidIndex` if the index is out of bounds.
    pub fn card(&self, index: usize) -> Result<&CardInfo> {
        self.cards.get(index).ok_or(AmcError::InvalidIndex {
            index,
            count: self.cards.len(),
        })
    }

    /// Card info by PCIe address
    pub fn find(&self, pcie_address: &str) -> Option<&CardInfo> {
        self.cards.iter().find(|c| c.pcie_address == pcie_address)
    }
}

impl CardInfo {
    /// Driver currently bound to the function, if any
    pub fn bound_driver(&self) -> Option<String> {
        let link = std::fs::read_link(self.sysfs_path.join("driver")).ok()?;
        link.file_name().map(|n| n.to_string_lossy().into_owned())
    }
}

/// Read a hexadecimal value from sysfs
fn read_hex_sysfs(path: &Path) -> Result<u16> {
    let content = std::fs::read_to_string(path)?;
    let trimmed = content.trim().trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16).map_err(|e| {
        AmcError::hardware_error(format!("Invalid hex value in {}: {e}", path.display()))
    })
}
