//! Enumerate all AMC525 cards on the system
//!
//! This example demonstrates runtime card discovery.

use amc_driver::{CardManager, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("amc_driver=debug")
        .init();

    println!("AMC525 Card Enumeration\n");

    let manager = CardManager::discover()?;

    println!("Found {} card(s):\n", manager.card_count());

    for card in manager.cards() {
        println!("Board {}:", card.index);
        println!("   PCIe:       {}", card.pcie_address);
        println!("   sysfs:      {}", card.sysfs_path.display());
        println!(
            "   Driver:     {}",
            card.bound_driver().unwrap_or_else(|| "(none)".into())
        );
        match amc_driver::vfio::iommu_group(&card.pcie_address) {
            Ok(group) => println!("   IOMMU:      group {group}"),
            Err(e) => println!("   IOMMU:      {e}"),
        }
        println!();
    }

    Ok(())
}
