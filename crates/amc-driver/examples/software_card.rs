//! Drive the full stack against the software card
//!
//! Builds a device table, attaches a driver instance to a simulated card,
//! writes a block into card memory through DMA and reads it back.
//!
//! ```bash
//! cargo run --example software_card
//! ```

use amc_driver::prom::{Permissions, TableBuilder};
use amc_driver::software::{attach_software, SoftwareCard};
use amc_driver::{DriverConfig, Result};
use std::io::SeekFrom;
use std::sync::Arc;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("amc_driver=debug")
        .init();

    let mut builder = TableBuilder::new();
    builder.device("demo")?;
    builder.memory_region("ddr", 0x4000_0000, 0x10_0000, Permissions::READ_WRITE)?;
    let table = builder.build()?;
    println!("Device table: {} bytes", table.len());

    let card = Arc::new(SoftwareCard::new(Some(table)));
    let amc = attach_software(&card, 0, &DriverConfig::default())?;
    for node in amc.nodes() {
        println!("  minor {}: {}", node.minor, node.name);
    }

    let Some(mut ddr) = amc.open_by_name("demo.0.ddr")?.into_memory() else {
        unreachable!("ddr is a memory node");
    };
    let block: Vec<u8> = (0..=255).collect();
    ddr.write(&block)?;
    ddr.seek(SeekFrom::Start(0))?;
    let mut back = vec![0u8; block.len()];
    let n = ddr.read(&mut back)?;
    println!("Round trip of {n} bytes: {}", if back == block { "ok" } else { "MISMATCH" });

    drop(ddr);
    amc.shutdown();
    Ok(())
}
