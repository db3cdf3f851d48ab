//! DMA engine behaviour under concurrency, faults and kills

use amc_chip::regs::{self, control, status};
use amc_driver::prom::{Permissions, TableBuilder};
use amc_driver::software::{attach_software, CompletionMode, SoftwareCard};
use amc_driver::{AmcCard, AmcError, DriverConfig};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BASE: u64 = 0x4000_0000;

fn setup() -> (Arc<SoftwareCard>, Arc<AmcCard>) {
    let mut builder = TableBuilder::new();
    builder.device("sim").unwrap();
    builder
        .memory_region("dram", BASE, 0x10_0000, Permissions::READ_WRITE)
        .unwrap();
    let card = Arc::new(SoftwareCard::new(Some(builder.build().unwrap())));
    let config = DriverConfig {
        dma_block_shift: 12,
        ..DriverConfig::default()
    };
    let amc = Arc::new(attach_software(&card, 0, &config).unwrap());
    card.clear_log();
    (card, amc)
}

fn wait_until(what: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !what() {
        assert!(Instant::now() < deadline, "timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn btt_writes(card: &SoftwareCard) -> usize {
    card.writes()
        .iter()
        .filter(|(offset, _)| *offset == regs::BTT)
        .count()
}

fn spawn_read(amc: &Arc<AmcCard>, offset: u64) -> std::thread::JoinHandle<Result<Vec<u8>, AmcError>> {
    let amc = Arc::clone(amc);
    std::thread::spawn(move || {
        let mut mem = amc.open(1)?.into_memory().ok_or(AmcError::Detached)?;
        mem.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; 32];
        let n = mem.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    })
}

#[test]
fn transfers_never_interleave() {
    let (card, amc) = setup();
    card.write_dram(BASE, &[1u8; 32]);
    card.write_dram(BASE + 0x1000, &[2u8; 32]);
    card.set_completion_mode(CompletionMode::Manual);

    let first = spawn_read(&amc, 0);
    let second = spawn_read(&amc, 0x1000);

    for started in 1..=2 {
        wait_until(|| card.transfer_pending());
        // The other reader must stay blocked while this transfer is in flight
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(btt_writes(&card), started);
        assert!(card.raise_interrupt());
    }

    let mut results = [first.join().unwrap().unwrap(), second.join().unwrap().unwrap()];
    results.sort();
    assert_eq!(results, [vec![1u8; 32], vec![2u8; 32]]);

    // Each transfer programs the addresses before the count
    let order: Vec<usize> = card.writes().iter().map(|(offset, _)| *offset).collect();
    for chunk in order
        .split(|&offset| offset == regs::CDMASR)
        .filter(|chunk| !chunk.is_empty())
    {
        assert_eq!(chunk, [regs::SA_MSB, regs::SA, regs::DA, regs::DA_MSB, regs::BTT]);
    }
}

#[test]
fn kill_ends_the_wait() {
    let (card, amc) = setup();
    card.set_completion_mode(CompletionMode::Manual);

    let reader = spawn_read(&amc, 0);
    wait_until(|| card.transfer_pending());
    amc.kill_transfers();
    assert!(matches!(reader.join().unwrap(), Err(AmcError::TransferKilled)));

    // The abandoned transfer left the engine busy: the next one resets it
    card.set_completion_mode(CompletionMode::Immediate);
    card.write_dram(BASE, b"after kill, data flows again.....");
    card.clear_log();
    let data = spawn_read(&amc, 0).join().unwrap().unwrap();
    assert_eq!(&data, b"after kill, data flows again....");
    assert_eq!(card.writes()[0], (regs::CDMACR, control::RESET));
}

#[test]
fn fault_is_reported_then_cleared() {
    let (card, amc) = setup();
    card.inject_fault(status::SLV_ERR);

    let err = spawn_read(&amc, 0).join().unwrap().unwrap_err();
    match err {
        AmcError::TransferFault { status: cdmasr } => {
            assert_ne!(cdmasr & status::SLV_ERR, 0);
        }
        other => panic!("expected a transfer fault, got {other}"),
    }

    card.clear_log();
    assert_eq!(spawn_read(&amc, 0).join().unwrap().unwrap().len(), 32);
    assert_eq!(card.writes()[0], (regs::CDMACR, control::RESET));
}

#[test]
fn wedged_engine_is_reset_before_use() {
    let (card, amc) = setup();
    card.wedge();
    assert_eq!(spawn_read(&amc, 0x20).join().unwrap().unwrap().len(), 32);
    assert_eq!(card.writes()[0], (regs::CDMACR, control::RESET));
    assert_eq!(
        card.writes()[1],
        (regs::CDMACR, control::IRQ_EN | control::ERR_IRQ_EN)
    );
}

#[test]
fn guard_gives_exclusive_buffer_access() {
    let (card, amc) = setup();
    let dma = amc.dma().unwrap();
    assert_eq!(dma.buffer_size(), 0x1000);
    assert_eq!(dma.alignment(), 32);

    let mut guard = dma.lock();
    guard.buffer_mut()[..4].copy_from_slice(b"abcd");
    guard.buffer_mut()[4..32].fill(0);
    assert_eq!(
        guard
            .transfer(BASE + 0x40, 32, amc_driver::Direction::ToDevice)
            .unwrap(),
        32
    );
    guard.unlock();
    assert_eq!(&card.read_dram(BASE + 0x40, 4), b"abcd");
}

#[test]
fn kill_with_no_transfer_in_flight_is_not_lost() {
    let (card, amc) = setup();
    card.set_completion_mode(CompletionMode::Manual);
    amc.kill_transfers();

    let dma = amc.dma().unwrap();
    let worker = std::thread::spawn(move || {
        dma.lock()
            .transfer(BASE, 32, amc_driver::Direction::FromDevice)
    });
    assert!(matches!(worker.join().unwrap(), Err(AmcError::TransferKilled)));
}

#[test]
fn transfers_after_close_fail() {
    let (card, amc) = setup();
    card.set_completion_mode(CompletionMode::Manual);

    let reader = spawn_read(&amc, 0);
    wait_until(|| card.transfer_pending());
    amc.close_transfers();
    assert!(matches!(reader.join().unwrap(), Err(AmcError::TransferKilled)));

    card.set_completion_mode(CompletionMode::Immediate);
    card.clear_log();
    assert!(matches!(
        spawn_read(&amc, 0).join().unwrap(),
        Err(AmcError::TransferKilled)
    ));
    assert_eq!(btt_writes(&card), 0);
}
