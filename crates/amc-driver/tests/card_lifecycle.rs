//! Attach, endpoints and teardown against the software card

use amc_driver::prom::{Permissions, TableBuilder, DEFAULT_TABLE};
use amc_driver::software::{attach_software, SoftwareCard};
use amc_driver::{AmcCard, AmcError, DriverConfig, MemoryEndpoint};
use std::io::SeekFrom;
use std::sync::Arc;

const MEM_BASE: u64 = 0x10_0000;
const MEM_LENGTH: u64 = 0x4000;

fn small_config() -> DriverConfig {
    DriverConfig {
        dma_block_shift: 12,
        ..DriverConfig::default()
    }
}

fn rw_table() -> Vec<u8> {
    let mut builder = TableBuilder::new();
    builder.device("sim").unwrap();
    builder
        .memory_region("mem", MEM_BASE, MEM_LENGTH, Permissions::READ_WRITE)
        .unwrap();
    builder.build().unwrap()
}

fn rw_card() -> (Arc<SoftwareCard>, AmcCard) {
    let card = Arc::new(SoftwareCard::new(Some(rw_table())));
    let amc = attach_software(&card, 1, &small_config()).unwrap();
    (card, amc)
}

fn open_mem(amc: &AmcCard) -> MemoryEndpoint {
    amc.open_by_name("sim.1.mem").unwrap().into_memory().unwrap()
}

#[test]
fn default_table_nodes() {
    let card = Arc::new(SoftwareCard::new(None));
    let amc = attach_software(&card, 0, &DriverConfig::default()).unwrap();
    assert!(amc.prom().is_default());
    let names: Vec<_> = amc.nodes().iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, ["amc525_mbf.0.reg", "amc525_mbf.0.ddr0", "amc525_mbf.0.ddr1"]);

    let ddr0 = amc.open(1).unwrap().into_memory().unwrap();
    assert_eq!(ddr0.region().base, 0x8000_0000_0000);
    assert_eq!(ddr0.region_size(), 0x8000_0000);
    assert_eq!(ddr0.buffer_size(), 1 << 20);

    assert!(matches!(amc.open(3), Err(AmcError::InvalidIndex { index: 3, count: 3 })));
    assert!(matches!(
        amc.open_by_name("amc525_mbf.0.ddr2"),
        Err(AmcError::DeviceNotFound { .. })
    ));
}

#[test]
fn read_only_region_refuses_writes() {
    let card = Arc::new(SoftwareCard::new(None));
    let amc = attach_software(&card, 0, &small_config()).unwrap();
    card.write_dram(0x8000_0000_0000, b"firmware");

    let mut ddr0 = amc.open_by_name("amc525_mbf.0.ddr0").unwrap().into_memory().unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(ddr0.read(&mut buf).unwrap(), 8);
    assert_eq!(&buf, b"firmware");
    assert_eq!(ddr0.position(), 8);

    ddr0.seek(SeekFrom::Start(0)).unwrap();
    assert!(matches!(
        ddr0.write(&[0u8; 32]),
        Err(AmcError::PermissionDenied { access: "write", .. })
    ));
}

#[test]
fn write_then_read_back() {
    let (card, amc) = rw_card();
    let mut mem = open_mem(&amc);
    let data: Vec<u8> = (0..64u8).collect();

    assert_eq!(mem.write(&data).unwrap(), 64);
    assert_eq!(mem.position(), 64);
    assert_eq!(card.read_dram(MEM_BASE, 64), data);

    mem.seek(SeekFrom::Start(0)).unwrap();
    let mut back = vec![0u8; 64];
    assert_eq!(mem.read(&mut back).unwrap(), 64);
    assert_eq!(back, data);
}

#[test]
fn unaligned_read_returns_requested_bytes() {
    let (card, amc) = rw_card();
    let pattern: Vec<u8> = (0..=255u8).collect();
    card.write_dram(MEM_BASE, &pattern);

    let mut mem = open_mem(&amc);
    mem.seek(SeekFrom::Start(3)).unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(mem.read(&mut buf).unwrap(), 5);
    assert_eq!(buf, [3, 4, 5, 6, 7]);
    assert_eq!(mem.position(), 8);
}

#[test]
fn read_is_limited_by_buffer() {
    let (_card, amc) = rw_card();
    let mut mem = open_mem(&amc);
    let mut buf = vec![0u8; 0x2000];
    assert_eq!(mem.read(&mut buf).unwrap(), 0x1000);
    assert_eq!(mem.position(), 0x1000);
}

#[test]
fn position_wraps_at_region_end() {
    let (card, amc) = rw_card();
    card.write_dram(MEM_BASE + MEM_LENGTH - 32, &[0xa5; 32]);

    let mut mem = open_mem(&amc);
    mem.seek(SeekFrom::End(-32)).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(mem.read(&mut buf).unwrap(), 32);
    assert_eq!(&buf[..32], &[0xa5; 32]);
    assert_eq!(mem.position(), 0);

    mem.seek(SeekFrom::End(0)).unwrap();
    assert_eq!(mem.read(&mut buf).unwrap(), 0);
    assert_eq!(mem.write(&[0u8; 32]).unwrap(), 0);
}

#[test]
fn seek_stays_inside_region() {
    let (_card, amc) = rw_card();
    let mut mem = open_mem(&amc);
    assert_eq!(mem.seek(SeekFrom::Start(MEM_LENGTH)).unwrap(), MEM_LENGTH);
    assert!(matches!(
        mem.seek(SeekFrom::Start(MEM_LENGTH + 1)),
        Err(AmcError::InvalidArgument { .. })
    ));
    assert_eq!(mem.seek(SeekFrom::Start(0x40)).unwrap(), 0x40);
    assert_eq!(mem.seek(SeekFrom::Current(-0x20)).unwrap(), 0x20);
    assert!(mem.seek(SeekFrom::Current(-0x21)).is_err());
    assert!(mem.seek(SeekFrom::End(1)).is_err());
    assert_eq!(mem.position(), 0x20);
}

#[test]
fn write_limits() {
    let (card, amc) = rw_card();
    let mut mem = open_mem(&amc);

    mem.seek(SeekFrom::End(-32)).unwrap();
    assert!(matches!(
        mem.write(&[0u8; 64]),
        Err(AmcError::InvalidArgument { .. })
    ));

    mem.seek(SeekFrom::Start(0)).unwrap();
    assert!(matches!(
        mem.write(&vec![0u8; 0x2000]),
        Err(AmcError::InvalidArgument { .. })
    ));

    mem.seek(SeekFrom::Start(4)).unwrap();
    card.clear_log();
    assert!(matches!(
        mem.write(&[1u8; 32]),
        Err(AmcError::MisalignedTransfer { address, alignment: 32, .. }) if address == MEM_BASE + 4
    ));
    assert!(card.writes().is_empty());
    assert_eq!(mem.position(), 4);
}

#[test]
fn register_node_locking() {
    let (_card, amc) = rw_card();
    let first = amc.open(0).unwrap().into_registers().unwrap();
    first.lock().unwrap();
    // Locking again is idempotent for the holder
    first.lock().unwrap();

    let second = amc.open(0).unwrap().into_registers().unwrap();
    assert_eq!(amc.locking().reference_count(), 2);
    assert!(matches!(second.lock(), Err(AmcError::Busy { .. })));
    assert!(matches!(second.unlock(), Err(AmcError::NotHolder)));
    assert_eq!(amc.locking().locked_by(), Some(first.opener_id()));

    drop(first);
    assert_eq!(amc.locking().locked_by(), None);
    second.lock().unwrap();
    second.unlock().unwrap();
}

#[test]
fn shared_register_node_cannot_be_locked() {
    let (_card, amc) = rw_card();
    let first = amc.open(0).unwrap().into_registers().unwrap();
    let _second = amc.open(0).unwrap().into_registers().unwrap();
    assert!(matches!(first.lock(), Err(AmcError::Busy { .. })));
}

#[test]
fn register_access() {
    let (_card, amc) = rw_card();
    let regs = amc.open(0).unwrap().into_registers().unwrap();
    assert_eq!(regs.map_size(), 0x1_0000);
    regs.write32(0x100, 0xdead_beef).unwrap();
    assert_eq!(regs.read32(0x100).unwrap(), 0xdead_beef);

    assert!(matches!(
        regs.read32(0x1_0000),
        Err(AmcError::OutOfRange { .. })
    ));
    assert!(matches!(
        regs.read32(0x102),
        Err(AmcError::InvalidArgument { .. })
    ));
    regs.check_map(0, 0x1_0000).unwrap();
    assert!(regs.check_map(0x1000, 0x1_0000).is_err());
}

#[test]
fn shutdown_waits_for_endpoints() {
    let (_card, amc) = rw_card();
    let amc = Arc::new(amc);
    let mut mem = open_mem(&amc);
    assert_eq!(amc.clients(), 1);

    let closer = {
        let amc = Arc::clone(&amc);
        std::thread::spawn(move || amc.shutdown())
    };
    // Opens succeed until teardown starts; each one leaves again at once
    while !matches!(amc.open(0), Err(AmcError::Detached)) {
        std::thread::yield_now();
    }
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(!closer.is_finished());

    // Teardown has closed the engine under the endpoint still held
    let mut buf = [0u8; 32];
    assert!(matches!(mem.read(&mut buf), Err(AmcError::TransferKilled)));
    assert_eq!(mem.position(), 0);

    drop(mem);
    closer.join().unwrap();
    assert_eq!(amc.clients(), 0);
    assert!(amc.dma().is_none());
    assert!(matches!(amc.open(1), Err(AmcError::Detached)));
}

#[test]
fn too_many_nodes_for_a_board() {
    let card = Arc::new(SoftwareCard::new(None));
    let config = DriverConfig {
        max_minors_per_board: 2,
        ..DriverConfig::default()
    };
    assert!(matches!(
        attach_software(&card, 0, &config),
        Err(AmcError::InvalidTable { .. })
    ));
}

#[test]
fn corrupt_table_blocks_attach() {
    let mut blob = DEFAULT_TABLE.to_vec();
    blob[10] ^= 0x01;
    let card = Arc::new(SoftwareCard::new(Some(blob)));
    let err = attach_software(&card, 0, &DriverConfig::default()).unwrap_err();
    assert!(matches!(err, AmcError::ChecksumMismatch { .. }));
    assert!(err.is_table_error());

    let mut blob = DEFAULT_TABLE.to_vec();
    blob[4] = 2;
    let card = Arc::new(SoftwareCard::new(Some(blob)));
    assert!(matches!(
        attach_software(&card, 0, &DriverConfig::default()),
        Err(AmcError::UnsupportedVersion { found: 2, expected: 1 })
    ));
}

#[test]
fn region_before_device_blocks_attach() {
    let mut builder = TableBuilder::new();
    builder
        .memory_region("mem", 0, 0x1000, Permissions::READ)
        .unwrap();
    builder.device("late").unwrap();
    let card = Arc::new(SoftwareCard::new(Some(builder.build().unwrap())));
    assert!(matches!(
        attach_software(&card, 0, &DriverConfig::default()),
        Err(AmcError::InvalidTable { .. })
    ));
}

#[test]
fn table_without_regions_has_no_dma() {
    let mut builder = TableBuilder::new();
    builder.device("regs_only").unwrap();
    let card = Arc::new(SoftwareCard::new(Some(builder.build().unwrap())));
    let amc = attach_software(&card, 0, &DriverConfig::default()).unwrap();
    assert_eq!(amc.nodes().len(), 1);
    assert!(amc.dma().is_none());
    // Nothing touched the controller
    assert!(card.writes().is_empty());
}

#[test]
fn stuck_controller_blocks_attach() {
    let card = Arc::new(SoftwareCard::new(None));
    card.stick_in_reset(true);
    assert!(matches!(
        attach_software(&card, 0, &DriverConfig::default()),
        Err(AmcError::ResetTimeout { duration_us: 1000 })
    ));
}

fn top_of_memory_card(base: u64) -> amc_driver::Result<(Arc<SoftwareCard>, AmcCard)> {
    let mut builder = TableBuilder::new();
    builder.device("sim").unwrap();
    builder
        .memory_region("top", base, 0x1000, Permissions::READ_WRITE)
        .unwrap();
    let card = Arc::new(SoftwareCard::new(Some(builder.build().unwrap())));
    let amc = attach_software(&card, 0, &small_config())?;
    Ok((card, amc))
}

#[test]
fn region_ending_at_address_space_end_is_refused() {
    assert!(matches!(
        top_of_memory_card(0xFFFF_FFFF_FFFF_F000),
        Err(AmcError::InvalidTable { .. })
    ));
}

#[test]
fn region_just_below_address_space_end() {
    const BASE: u64 = 0xFFFF_FFFF_FFFF_E000;
    let (card, amc) = top_of_memory_card(BASE).unwrap();
    card.write_dram(BASE + 0xFE0, &[0x5a; 32]);

    let mut mem = amc.open_by_name("sim.0.top").unwrap().into_memory().unwrap();
    mem.seek(SeekFrom::Start(0x20)).unwrap();
    mem.write(&[0xc3; 32]).unwrap();
    assert_eq!(card.read_dram(BASE + 0x20, 32), vec![0xc3; 32]);

    mem.seek(SeekFrom::End(-32)).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(mem.read(&mut buf).unwrap(), 32);
    assert_eq!(&buf[..32], &[0x5a; 32]);
    assert_eq!(mem.position(), 0);
}
