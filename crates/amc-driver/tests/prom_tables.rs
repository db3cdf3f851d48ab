//! Device tables built with the builder, parsed back through card attach

use amc_driver::prom::{to_coe, Entry, Permissions, TableBuilder, Tag, DEFAULT_TABLE};
use amc_driver::software::{attach_software, SoftwareCard};
use amc_driver::{checksum16, AmcError, DriverConfig, NodeKind, PromTable};
use std::sync::Arc;

#[test]
fn default_table_is_self_consistent() {
    assert_eq!(checksum16(DEFAULT_TABLE), 0);
    let prom = PromTable::from_bytes(DEFAULT_TABLE).unwrap();
    assert_eq!(prom.raw_length(), DEFAULT_TABLE.len());
    assert_eq!(prom.nentries(), 3);
    assert_eq!(prom.dma_nentries(), 2);
    assert_eq!(prom.nentries_with_minor(), 3);
}

#[test]
fn settings_entries_reach_the_engine() {
    let mut builder = TableBuilder::new();
    builder.dma_mask(40).dma_align(6);
    builder.device("tuned").unwrap();
    builder
        .memory_region("bram", 0x2000, 0x1000, Permissions::READ_WRITE)
        .unwrap();
    let card = Arc::new(SoftwareCard::new(Some(builder.build().unwrap())));
    let amc = attach_software(&card, 0, &DriverConfig::default()).unwrap();

    assert!(!amc.prom().is_default());
    let dma = amc.dma().unwrap();
    assert_eq!(dma.dma_mask(), 40);
    assert_eq!(dma.alignment(), 64);
    assert_eq!(dma.max_transfer(), 1 << 20);
    assert_eq!(amc.nodes().len(), 2);
}

#[test]
fn extended_regions_round_trip_through_attach() {
    let mut builder = TableBuilder::new();
    builder.device("big").unwrap();
    builder
        .memory_region("high", 1 << 50, 0x1000, Permissions::READ)
        .unwrap();
    builder
        .memory_region("huge", 0, 1 << 33, Permissions::READ_WRITE)
        .unwrap();
    let card = Arc::new(SoftwareCard::new(Some(builder.build().unwrap())));
    let amc = attach_software(&card, 3, &DriverConfig::default()).unwrap();

    let tags: Vec<u8> = amc.prom().entries().map(Entry::tag).collect();
    let extended = u8::from(Tag::DmaExtended);
    assert_eq!(tags, [u8::from(Tag::Device), extended, extended]);

    let node = amc.layout().find("big.3.huge").unwrap();
    match &node.kind {
        NodeKind::Memory(region) => {
            assert_eq!(region.length, 1 << 33);
            assert!(region.permissions.can_write());
        }
        NodeKind::Registers => panic!("memory node expected"),
    }
}

#[test]
fn opaque_entries_are_skipped() {
    let mut builder = TableBuilder::new();
    builder.device("future").unwrap();
    builder.raw_entry(0x42, &[1, 2, 3]).unwrap();
    builder
        .memory_region("mem", 0, 0x1000, Permissions::READ)
        .unwrap();
    let prom = PromTable::from_bytes(&builder.build().unwrap()).unwrap();
    assert_eq!(prom.nentries(), 3);
    assert_eq!(prom.nentries_with_minor(), 2);
    assert!(matches!(
        prom.find_entry(1),
        Some(Entry::Unknown { tag: 0x42, .. })
    ));
}

#[test]
fn builder_limits() {
    let mut builder = TableBuilder::new();
    assert!(builder.raw_entry(0, &[]).is_err());
    assert!(builder.raw_entry(0x42, &[0u8; 256]).is_err());
    for _ in 0..20 {
        builder.raw_entry(0x42, &[0u8; 255]).unwrap();
    }
    assert!(matches!(
        builder.build(),
        Err(AmcError::InvalidArgument { .. })
    ));
}

#[test]
fn coe_output() {
    let coe = to_coe(&DEFAULT_TABLE[..6], 4).unwrap();
    assert_eq!(
        coe,
        "memory_initialization_radix=16;\nmemory_initialization_vector=\n47414944, 00000101;\n"
    );
    assert!(to_coe(DEFAULT_TABLE, 0).is_err());
}
