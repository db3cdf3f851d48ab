//! `amc`: command-line interface for AMC525 FPGA cards.
//!
//! ```text
//! USAGE:
//!   amc enumerate                         List cards
//!   amc info <card>                       Table, nodes and IOMMU group of one card
//!   amc prom dump <card>|--software|--file <path>
//!   amc prom build --device <name> --region <spec>... [--out <path>] [--coe]
//!   amc checksum <file>                   Ones' complement checksum of a file
//!   amc read <card> <region> --offset <n> --count <n> [--out <path>]
//!   amc write <card> <region> --offset <n> --input <path>
//!   amc bind-vfio <pcie-addr>             Bind card to vfio-pci (root)
//!   amc unbind-vfio <pcie-addr>           Unbind from vfio-pci (root)
//!   amc iommu-group <pcie-addr>
//! ```
//!
//! `<card>` is a board number or a PCIe address.

use amc_driver::prom::{to_coe, Entry, Permissions, TableBuilder};
use amc_driver::software::{attach_software, SoftwareCard};
use amc_driver::{
    checksum16, open_card, CardManager, DriverConfig, MemoryEndpoint, NodeKind, PromTable,
};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "amc", about = "AMC525 FPGA card CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// List all AMC525 cards.
    Enumerate,
    /// Print the device table, nodes and IOMMU group of one card.
    Info {
        /// Board number (e.g. 0) or PCIe address (e.g. 0000:03:00.0).
        card: String,
    },
    /// Device table tools.
    #[command(subcommand)]
    Prom(PromCmd),
    /// Print the 16-bit ones' complement checksum of a file.
    Checksum {
        /// File to checksum.
        file: PathBuf,
    },
    /// Read card memory through a DMA region.
    Read {
        /// Board number or PCIe address.
        card: String,
        /// Region name (e.g. ddr0) or full node name.
        region: String,
        /// Byte offset within the region.
        #[arg(long, default_value = "0", value_parser = parse_number)]
        offset: u64,
        /// Bytes to read.
        #[arg(long, value_parser = parse_number)]
        count: u64,
        /// Write the data to this file instead of a hex dump.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Write a file into card memory through a DMA region.
    Write {
        /// Board number or PCIe address.
        card: String,
        /// Region name (e.g. ddr0) or full node name.
        region: String,
        /// Byte offset within the region.
        #[arg(long, default_value = "0", value_parser = parse_number)]
        offset: u64,
        /// File holding the data.
        #[arg(long)]
        input: PathBuf,
    },
    /// Bind a card to vfio-pci (requires root / CAP_SYS_ADMIN).
    BindVfio {
        /// PCIe address (e.g. 0000:03:00.0).
        pcie_addr: String,
    },
    /// Unbind a card from vfio-pci and re-bind to amc525_mbf (if loaded).
    UnbindVfio {
        /// PCIe address (e.g. 0000:03:00.0).
        pcie_addr: String,
    },
    /// Query the IOMMU group for a card.
    IommuGroup {
        /// PCIe address (e.g. 0000:03:00.0).
        pcie_addr: String,
    },
}

#[derive(Subcommand)]
enum PromCmd {
    /// Parse and print a device table.
    Dump(DumpArgs),
    /// Build a device table from flags.
    Build(BuildArgs),
}

#[derive(Args)]
struct DumpArgs {
    /// Board number or PCIe address.
    #[arg(conflicts_with_all = ["software", "file"], required_unless_present_any = ["software", "file"])]
    card: Option<String>,
    /// Dump the table of a software card with the built-in table.
    #[arg(long)]
    software: bool,
    /// Dump a table image from a file.
    #[arg(long, conflicts_with = "software")]
    file: Option<PathBuf>,
    /// Also print the raw bytes.
    #[arg(long)]
    hex: bool,
}

#[derive(Args)]
struct BuildArgs {
    /// Device name.
    #[arg(long)]
    device: String,
    /// Memory region as name:base:length:perm, perm one of r, w, rw.
    #[arg(long = "region", value_parser = parse_region)]
    regions: Vec<RegionSpec>,
    /// DMA addressing width in bits.
    #[arg(long)]
    dma_mask: Option<u8>,
    /// log2 of the DMA alignment.
    #[arg(long)]
    dma_align: Option<u8>,
    /// Output file; stdout if absent.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Emit a Xilinx .coe file instead of the binary image.
    #[arg(long)]
    coe: bool,
    /// Bytes per .coe word.
    #[arg(long, default_value_t = 4)]
    group: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RegionSpec {
    name: String,
    base: u64,
    length: u64,
    permissions: Permissions,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Enumerate => cmd_enumerate()?,
        Cmd::Info { card } => cmd_info(&card)?,
        Cmd::Prom(PromCmd::Dump(args)) => cmd_prom_dump(&args)?,
        Cmd::Prom(PromCmd::Build(args)) => cmd_prom_build(&args)?,
        Cmd::Checksum { file } => cmd_checksum(&file)?,
        Cmd::Read {
            card,
            region,
            offset,
            count,
            out,
        } => cmd_read(&card, &region, offset, count, out.as_deref())?,
        Cmd::Write {
            card,
            region,
            offset,
            input,
        } => cmd_write(&card, &region, offset, &input)?,
        Cmd::BindVfio { pcie_addr } => cmd_bind_vfio(&pcie_addr)?,
        Cmd::UnbindVfio { pcie_addr } => cmd_unbind_vfio(&pcie_addr)?,
        Cmd::IommuGroup { pcie_addr } => cmd_iommu_group(&pcie_addr)?,
    }

    Ok(())
}

fn parse_number(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => value.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("{value}: {e}"))
}

fn parse_region(value: &str) -> Result<RegionSpec, String> {
    let fields: Vec<&str> = value.split(':').collect();
    let [name, base, length, perm] = fields.as_slice() else {
        return Err(format!("{value}: expected name:base:length:perm"));
    };
    let permissions = match *perm {
        "r" => Permissions::READ,
        "w" => Permissions::WRITE,
        "rw" | "wr" => Permissions::READ_WRITE,
        other => return Err(format!("{other}: permissions must be r, w or rw")),
    };
    Ok(RegionSpec {
        name: (*name).to_string(),
        base: parse_number(base)?,
        length: parse_number(length)?,
        permissions,
    })
}

/// Resolve a board number or PCIe address to (address, board)
fn resolve_card(card: &str) -> Result<(String, usize)> {
    let mgr = CardManager::discover()?;
    let info = if let Ok(index) = card.parse::<usize>() {
        mgr.card(index)?
    } else {
        mgr.find(card)
            .ok_or_else(|| anyhow!("Card not found: {card}"))?
    };
    tracing::debug!("{card} is board {} at {}", info.index, info.pcie_address);
    Ok((info.pcie_address.clone(), info.index))
}

fn describe(entry: &Entry) -> String {
    match entry {
        Entry::Device(dev) => format!("device   {}", dev.name),
        Entry::Dma(region) | Entry::DmaExtended(region) => format!(
            "{} {:<8} {:#014x} +{:#x} {}",
            if matches!(entry, Entry::Dma(_)) { "dma     " } else { "dma64   " },
            region.name,
            region.base,
            region.length,
            region.permissions
        ),
        Entry::DmaMask(bits) => format!("dma-mask {bits} bits"),
        Entry::DmaAlign(shift) => format!("dma-align {} bytes", 1u64 << (*shift).min(63)),
        Entry::Unknown { tag, payload } => {
            format!("unknown  tag {tag:#04x}, {} bytes", payload.len())
        }
    }
}

fn print_table(prom: &PromTable, hex: bool) {
    println!(
        "Device table: {} bytes, {} entries{}",
        prom.raw_length(),
        prom.nentries(),
        if prom.is_default() { " (built-in default)" } else { "" }
    );
    for (index, entry) in prom.entries().enumerate() {
        let offset = prom.entry_offset(index).unwrap_or(0);
        println!("  [{index}] @{offset:#05x}  {}", describe(entry));
    }
    let settings = prom.dma_settings();
    println!(
        "DMA: {} regions, mask {} bits, alignment {} bytes",
        prom.dma_nentries(),
        settings.dma_mask,
        settings.alignment()
    );
    if hex {
        for (row, chunk) in prom.raw_bytes().chunks(16).enumerate() {
            let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            println!("  {:04x}: {}", row * 16, bytes.join(" "));
        }
    }
}

fn cmd_enumerate() -> Result<()> {
    let mgr = CardManager::discover()?;

    println!("AMC525 cards: {}", mgr.card_count());
    println!();

    for info in mgr.cards() {
        println!(
            "[{}] {}  driver: {}",
            info.index,
            info.pcie_address,
            info.bound_driver().unwrap_or_else(|| "(none)".into())
        );
    }

    Ok(())
}

fn cmd_info(card: &str) -> Result<()> {
    let (address, board) = resolve_card(card)?;
    let amc = open_card(&address, board, &DriverConfig::from_env()?)?;

    println!("PCIe address : {address}");
    println!("Board        : {board}");
    match amc_driver::vfio::iommu_group(&address) {
        Ok(g) => println!("IOMMU group  : {g}"),
        Err(_) => println!("IOMMU group  : (not available, IOMMU disabled?)"),
    }
    println!();
    print_table(amc.prom(), false);
    println!();
    for node in amc.nodes() {
        println!("  minor {:2}  {}", node.minor, node.name);
    }
    if let Some(dma) = amc.dma() {
        println!(
            "DMA buffer   : {} KB, max transfer {:#x}",
            dma.buffer_size() / 1024,
            dma.max_transfer()
        );
    }

    Ok(())
}

fn cmd_prom_dump(args: &DumpArgs) -> Result<()> {
    if let Some(path) = &args.file {
        let bytes =
            std::fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
        let prom = PromTable::from_bytes(&bytes)?;
        print_table(&prom, args.hex);
    } else if args.software {
        let card = Arc::new(SoftwareCard::new(None));
        let amc = attach_software(&card, 0, &DriverConfig::default())?;
        print_table(amc.prom(), args.hex);
    } else {
        let card = args
            .card
            .as_deref()
            .ok_or_else(|| anyhow!("No card given"))?;
        let (address, board) = resolve_card(card)?;
        let amc = open_card(&address, board, &DriverConfig::from_env()?)?;
        print_table(amc.prom(), args.hex);
    }
    Ok(())
}

fn build_table(args: &BuildArgs) -> Result<Vec<u8>> {
    let mut builder = TableBuilder::new();
    if let Some(bits) = args.dma_mask {
        builder.dma_mask(bits);
    }
    if let Some(shift) = args.dma_align {
        builder.dma_align(shift);
    }
    builder.device(&args.device)?;
    for region in &args.regions {
        builder.memory_region(&region.name, region.base, region.length, region.permissions)?;
    }
    let bytes = builder.build()?;
    // The image must parse back before anyone flashes it
    PromTable::from_bytes(&bytes).context("Built table does not validate")?;
    Ok(bytes)
}

fn cmd_prom_build(args: &BuildArgs) -> Result<()> {
    let bytes = build_table(args)?;
    let output = if args.coe {
        to_coe(&bytes, args.group)?.into_bytes()
    } else {
        bytes
    };
    match &args.out {
        Some(path) => {
            std::fs::write(path, &output)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            eprintln!("Wrote {} bytes to {}", output.len(), path.display());
        }
        None => std::io::stdout().write_all(&output)?,
    }
    Ok(())
}

fn cmd_checksum(file: &Path) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Cannot read {}", file.display()))?;
    let sum = checksum16(&bytes);
    println!("{sum:#06x}{}", if sum == 0 { "  (valid)" } else { "" });
    Ok(())
}

fn open_region(amc: &amc_driver::AmcCard, region: &str) -> Result<MemoryEndpoint> {
    let node = amc
        .nodes()
        .iter()
        .find(|node| match &node.kind {
            NodeKind::Memory(r) => r.name == region || node.name == region,
            NodeKind::Registers => false,
        })
        .ok_or_else(|| anyhow!("No memory region named {region}"))?;
    amc.open(node.minor)?
        .into_memory()
        .ok_or_else(|| anyhow!("{} is not a memory node", node.name))
}

fn read_region(mem: &mut MemoryEndpoint, offset: u64, count: u64) -> Result<Vec<u8>> {
    let available = mem.region_size().saturating_sub(offset);
    if count > available {
        bail!("{count:#x} bytes at {offset:#x} run past the region end ({available:#x} left)");
    }
    mem.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; usize::try_from(count)?];
    let mut done = 0;
    while done < data.len() {
        let n = mem.read(&mut data[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    data.truncate(done);
    Ok(data)
}

fn write_region(mem: &mut MemoryEndpoint, offset: u64, data: &[u8]) -> Result<()> {
    mem.seek(SeekFrom::Start(offset))?;
    for chunk in data.chunks(mem.buffer_size()) {
        let n = mem.write(chunk)?;
        if n != chunk.len() {
            bail!("Short write: {n} of {} bytes", chunk.len());
        }
    }
    Ok(())
}

fn cmd_read(card: &str, region: &str, offset: u64, count: u64, out: Option<&Path>) -> Result<()> {
    let (address, board) = resolve_card(card)?;
    let amc = open_card(&address, board, &DriverConfig::from_env()?)?;
    let mut mem = open_region(&amc, region)?;
    let data = read_region(&mut mem, offset, count)?;

    match out {
        Some(path) => {
            std::fs::write(path, &data)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            println!("Read {} bytes to {}", data.len(), path.display());
        }
        None => {
            for (row, chunk) in data.chunks(16).enumerate() {
                let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("{:#010x}: {}", offset + row as u64 * 16, bytes.join(" "));
            }
        }
    }
    Ok(())
}

fn cmd_write(card: &str, region: &str, offset: u64, input: &Path) -> Result<()> {
    let data = std::fs::read(input).with_context(|| format!("Cannot read {}", input.display()))?;
    let (address, board) = resolve_card(card)?;
    let amc = open_card(&address, board, &DriverConfig::from_env()?)?;
    let mut mem = open_region(&amc, region)?;
    write_region(&mut mem, offset, &data)?;
    println!("Wrote {} bytes at {offset:#x}", data.len());
    Ok(())
}

fn cmd_bind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Binding {pcie_addr} to vfio-pci ...");
    amc_driver::vfio::bind_to_vfio(pcie_addr)?;
    let group = amc_driver::vfio::iommu_group(pcie_addr)?;
    println!("Done. IOMMU group: {group}");
    println!("Grant access:  sudo chown $USER /dev/vfio/{group}");
    Ok(())
}

fn cmd_unbind_vfio(pcie_addr: &str) -> Result<()> {
    println!("Unbinding {pcie_addr} from vfio-pci ...");
    amc_driver::vfio::unbind_from_vfio(pcie_addr)?;
    println!("Done.");
    Ok(())
}

fn cmd_iommu_group(pcie_addr: &str) -> Result<()> {
    let group = amc_driver::vfio::iommu_group(pcie_addr)?;
    println!("IOMMU group for {pcie_addr}: {group}");
    println!("Device file: /dev/vfio/{group}");
    Ok(())
}
