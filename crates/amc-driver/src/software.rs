//! Software model of the card
//!
//! Implements the control BAR (CDMA controller plus device table window) and
//! a scratch register BAR in plain Rust, so the whole driver stack can run
//! without hardware. The model follows the controller's observable protocol:
//!
//! - writing `RESET` to CDMACR returns the engine to idle and clears errors
//! - writing BTT starts a copy between card DRAM and the host buffer
//! - completion and error bits latch in CDMASR until written back
//! - a transfer with no end in the host buffer latches a decode error
//!
//! Faults can be injected to exercise the driver's recovery paths.
//!
//! ```
//! use amc_driver::software::{attach_software, SoftwareCard};
//! use amc_driver::DriverConfig;
//! use std::sync::Arc;
//!
//! let card = Arc::new(SoftwareCard::new(None));
//! let amc = attach_software(&card, 0, &DriverConfig::default())?;
//! assert_eq!(amc.nodes().len(), 3);
//! # Ok::<(), amc_driver::AmcError>(())
//! ```

use crate::card::{AmcCard, CardParts};
use crate::config::DriverConfig;
use crate::dma::{DmaControl, Direction, HostBuffer};
use crate::error::Result;
use crate::mmio::RegisterBank;
use crate::prom::PromSource;
use amc_chip::bar::{CONTROL_BAR_LENGTH, INTC_OFFSET, PAGE_SIZE, PROM_OFFSET};
use amc_chip::prom::MAX_LENGTH;
use amc_chip::regs::{self, control, status};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// When a finished transfer raises its interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Synchronously, from the BTT write
    #[default]
    Immediate,
    /// Only when [`SoftwareCard::raise_interrupt`] is called
    Manual,
}

/// Sparse byte-addressed card DRAM, zero where never written
#[derive(Debug, Default)]
struct SparseMemory {
    pages: HashMap<u64, Box<[u8]>>,
}

impl SparseMemory {
    const PAGE: u64 = PAGE_SIZE as u64;

    fn read(&self, address: u64, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            let addr = address.wrapping_add(i as u64);
            *byte = self
                .pages
                .get(&(addr / Self::PAGE))
                .map_or(0, |page| page[(addr % Self::PAGE) as usize]);
        }
    }

    fn write(&mut self, address: u64, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let addr = address.wrapping_add(i as u64);
            let page = self
                .pages
                .entry(addr / Self::PAGE)
                .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
            page[(addr % Self::PAGE) as usize] = byte;
        }
    }
}

#[derive(Debug)]
struct HostWindow {
    iova: u64,
    view: Arc<Mutex<Vec<u8>>>,
}

impl HostWindow {
    fn span(&self, address: u64, count: usize) -> Option<std::ops::Range<usize>> {
        let offset = usize::try_from(address.checked_sub(self.iova)?).ok()?;
        let end = offset.checked_add(count)?;
        (end <= lock(&self.view).len()).then_some(offset..end)
    }
}

#[derive(Debug, Default)]
struct CdmaState {
    cdmacr: u32,
    cdmasr: u32,
    sa: u32,
    sa_msb: u32,
    da: u32,
    da_msb: u32,
    stuck_in_reset: bool,
    pending_fault: u32,
    pending_irq: bool,
    mode: CompletionMode,
    writes: Vec<(usize, u32)>,
    reads: usize,
    dram: SparseMemory,
    host: Option<HostWindow>,
}

impl CdmaState {
    fn reset(&mut self) {
        self.cdmasr = status::IDLE;
        self.cdmacr = if self.stuck_in_reset { control::RESET } else { 0 };
        self.pending_irq = false;
    }

    /// Run the programmed transfer; returns whether an interrupt fires now.
    fn start(&mut self, btt: u32) -> bool {
        let count = btt as usize & regs::BTT_MAX;
        let source = (u64::from(self.sa_msb) << 32) | u64::from(self.sa);
        let destination = (u64::from(self.da_msb) << 32) | u64::from(self.da);
        self.cdmasr &= !status::IDLE;

        let mut error = std::mem::take(&mut self.pending_fault);
        if error == 0 {
            error = self.copy(source, destination, count);
        }

        self.cdmasr |= status::IDLE;
        let enabled = if error == 0 {
            self.cdmasr |= status::IOC_IRQ;
            self.cdmacr & control::IRQ_EN != 0
        } else {
            self.cdmasr |= error | status::ERR_IRQ;
            self.cdmacr & control::ERR_IRQ_EN != 0
        };
        if !enabled {
            return false;
        }
        match self.mode {
            CompletionMode::Immediate => true,
            CompletionMode::Manual => {
                self.cdmasr &= !status::IDLE;
                self.pending_irq = true;
                false
            }
        }
    }

    fn copy(&mut self, source: u64, destination: u64, count: usize) -> u32 {
        let Some(host) = &self.host else {
            return status::DEC_ERR;
        };
        if count == 0 {
            return status::INT_ERR;
        }
        match (host.span(source, count), host.span(destination, count)) {
            (Some(span), None) => {
                let data = lock(&host.view)[span].to_vec();
                self.dram.write(destination, &data);
                0
            }
            (None, Some(span)) => {
                let mut view = lock(&host.view);
                self.dram.read(source, &mut view[span]);
                0
            }
            _ => status::DEC_ERR,
        }
    }
}

/// Simulated card: control BAR, device table and DRAM
pub struct SoftwareCard {
    state: Mutex<CdmaState>,
    prom: Option<Vec<u8>>,
    handler: Mutex<Option<InterruptHandler>>,
}

impl std::fmt::Debug for SoftwareCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareCard")
            .field("prom", &self.prom.as_ref().map(Vec::len))
            .finish_non_exhaustive()
    }
}

impl SoftwareCard {
    /// Card whose table window holds `prom`, or nothing (so the driver falls
    /// back to the built-in table)
    pub fn new(prom: Option<Vec<u8>>) -> Self {
        let mut state = CdmaState::default();
        state.reset();
        Self {
            state: Mutex::new(state),
            prom,
            handler: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, CdmaState> {
        lock(&self.state)
    }

    /// Allocate a host buffer of `size` bytes visible to the card at `iova`.
    ///
    /// Replaces any earlier buffer.
    pub fn host_buffer(&self, size: usize, iova: u64) -> SoftwareHostBuffer {
        let view = Arc::new(Mutex::new(vec![0u8; size]));
        self.state().host = Some(HostWindow {
            iova,
            view: Arc::clone(&view),
        });
        SoftwareHostBuffer {
            cpu: vec![0u8; size],
            device: view,
            iova,
        }
    }

    /// Call `handler` for every interrupt the card raises
    pub fn set_interrupt_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *lock(&self.handler) = Some(Arc::new(handler));
    }

    /// Deliver interrupts to `dma` for as long as it is alive
    pub fn route_interrupts_to(&self, dma: &Arc<DmaControl>) {
        let dma: Weak<DmaControl> = Arc::downgrade(dma);
        self.set_interrupt_handler(move || {
            if let Some(dma) = dma.upgrade() {
                dma.interrupt();
            }
        });
    }

    fn fire(&self) {
        let handler = lock(&self.handler).clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Select when completion interrupts are raised
    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.state().mode = mode;
    }

    /// Whether a transfer is waiting for [`SoftwareCard::raise_interrupt`]
    pub fn transfer_pending(&self) -> bool {
        self.state().pending_irq
    }

    /// Finish the pending transfer in manual mode; false if none was pending
    pub fn raise_interrupt(&self) -> bool {
        {
            let mut state = self.state();
            if !state.pending_irq {
                return false;
            }
            state.pending_irq = false;
            state.cdmasr |= status::IDLE;
        }
        self.fire();
        true
    }

    /// Make the next transfer fail with the given status error bits
    pub fn inject_fault(&self, bits: u32) {
        self.state().pending_fault = bits & status::ERROR_MASK;
    }

    /// Leave the engine busy, as after a lost transfer
    pub fn wedge(&self) {
        self.state().cdmasr &= !status::IDLE;
    }

    /// Keep the reset bit set after a reset request
    pub fn stick_in_reset(&self, stuck: bool) {
        self.state().stuck_in_reset = stuck;
    }

    /// Register writes to the controller since the last [`SoftwareCard::clear_log`]
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state().writes.clone()
    }

    /// Register reads from the controller since the last clear
    pub fn register_reads(&self) -> usize {
        self.state().reads
    }

    /// Forget logged register accesses
    pub fn clear_log(&self) {
        let mut state = self.state();
        state.writes.clear();
        state.reads = 0;
    }

    /// Read card DRAM directly
    pub fn read_dram(&self, address: u64, count: usize) -> Vec<u8> {
        let mut out = vec![0u8; count];
        self.state().dram.read(address, &mut out);
        out
    }

    /// Write card DRAM directly
    pub fn write_dram(&self, address: u64, data: &[u8]) {
        self.state().dram.write(address, data);
    }
}

impl RegisterBank for SoftwareCard {
    fn read32(&self, offset: usize) -> u32 {
        if (PROM_OFFSET..PROM_OFFSET + MAX_LENGTH).contains(&offset) {
            return self
                .prom
                .as_ref()
                .map_or(0, |prom| prom.read32(offset - PROM_OFFSET));
        }
        let mut state = self.state();
        if offset < regs::REGISTER_SPAN {
            state.reads += 1;
        }
        match offset {
            regs::CDMACR => state.cdmacr,
            regs::CDMASR => state.cdmasr,
            regs::SA => state.sa,
            regs::SA_MSB => state.sa_msb,
            regs::DA => state.da,
            regs::DA_MSB => state.da_msb,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let fire = {
            let mut state = self.state();
            if offset < INTC_OFFSET {
                state.writes.push((offset, value));
            }
            match offset {
                regs::CDMACR if value & control::RESET != 0 => {
                    state.reset();
                    false
                }
                regs::CDMACR => {
                    state.cdmacr = value;
                    false
                }
                regs::CDMASR => {
                    state.cdmasr &= !(value & status::IRQ_MASK);
                    false
                }
                regs::SA => {
                    state.sa = value;
                    false
                }
                regs::SA_MSB => {
                    state.sa_msb = value;
                    false
                }
                regs::DA => {
                    state.da = value;
                    false
                }
                regs::DA_MSB => {
                    state.da_msb = value;
                    false
                }
                regs::BTT => state.start(value),
                _ => false,
            }
        };
        if fire {
            self.fire();
        }
    }

    fn size(&self) -> usize {
        CONTROL_BAR_LENGTH
    }
}

/// Host buffer with separate CPU and device views
///
/// Data only moves between the views on sync, so a missing sync shows up as
/// stale data exactly as it would with a non-coherent cache.
#[derive(Debug)]
pub struct SoftwareHostBuffer {
    cpu: Vec<u8>,
    device: Arc<Mutex<Vec<u8>>>,
    iova: u64,
}

impl HostBuffer for SoftwareHostBuffer {
    fn as_slice(&self) -> &[u8] {
        &self.cpu
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.cpu
    }

    fn device_address(&self) -> u64 {
        self.iova
    }

    fn size(&self) -> usize {
        self.cpu.len()
    }

    fn sync_for_device(&mut self, direction: Direction) {
        if direction == Direction::ToDevice {
            lock(&self.device).copy_from_slice(&self.cpu);
        }
    }

    fn sync_for_cpu(&mut self, direction: Direction) {
        if direction == Direction::FromDevice {
            self.cpu.copy_from_slice(&lock(&self.device));
        }
    }
}

/// Scratch register BAR: every register reads back what was last written
#[derive(Debug)]
pub struct SoftwareRegisters {
    values: Mutex<HashMap<usize, u32>>,
    size: usize,
}

impl SoftwareRegisters {
    /// A register BAR of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            size,
        }
    }
}

impl RegisterBank for SoftwareRegisters {
    fn read32(&self, offset: usize) -> u32 {
        lock(&self.values).get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: usize, value: u32) {
        lock(&self.values).insert(offset, value);
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// Attach a driver instance to a software card.
///
/// The card gets a 64 KB scratch register BAR and a host buffer sized by
/// `config`, and its interrupts are routed to the card's DMA engine.
///
/// # Errors
///
/// Returns any error from [`AmcCard::attach`].
pub fn attach_software(
    card: &Arc<SoftwareCard>,
    board: usize,
    config: &DriverConfig,
) -> Result<AmcCard> {
    let host_buffer = card.host_buffer(config.dma_block_size(), config.iova_base);
    let parts = CardParts {
        board,
        control_bar: Arc::clone(card) as Arc<dyn RegisterBank>,
        register_bar: Some(Arc::new(SoftwareRegisters::new(0x1_0000))),
        host_buffer: Some(Box::new(host_buffer)),
    };
    let amc = AmcCard::attach(parts, config)?;
    if let Some(dma) = amc.dma() {
        card.route_interrupts_to(&dma);
    }
    Ok(amc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prom::{Permissions, TableBuilder};

    #[test]
    fn reset_returns_to_idle() {
        let card = SoftwareCard::new(None);
        card.wedge();
        assert_eq!(card.read32(regs::CDMASR) & status::IDLE, 0);
        card.write32(regs::CDMACR, control::RESET);
        assert_eq!(card.read32(regs::CDMASR), status::IDLE);
        assert_eq!(card.read32(regs::CDMACR), 0);
    }

    #[test]
    fn status_irq_bits_clear_on_write_back() {
        let card = SoftwareCard::new(None);
        let _buffer = card.host_buffer(0x1000, 0x1000);
        card.write32(regs::CDMACR, control::IRQ_EN | control::ERR_IRQ_EN);
        card.write32(regs::SA, 0x1000);
        card.write32(regs::DA, 0x8000);
        card.write32(regs::BTT, 0x20);
        let cdmasr = card.read32(regs::CDMASR);
        assert_eq!(cdmasr, status::IDLE | status::IOC_IRQ);
        card.write32(regs::CDMASR, cdmasr);
        assert_eq!(card.read32(regs::CDMASR), status::IDLE);
    }

    #[test]
    fn errors_survive_write_back() {
        let card = SoftwareCard::new(None);
        card.inject_fault(status::DEC_ERR);
        card.write32(regs::BTT, 0x20);
        let cdmasr = card.read32(regs::CDMASR);
        card.write32(regs::CDMASR, cdmasr);
        assert_eq!(card.read32(regs::CDMASR) & status::DEC_ERR, status::DEC_ERR);
    }

    #[test]
    fn transfer_without_host_side_is_a_decode_error() {
        let card = SoftwareCard::new(None);
        let _buffer = card.host_buffer(0x1000, 0x1000);
        card.write32(regs::SA, 0x9000);
        card.write32(regs::DA, 0xa000);
        card.write32(regs::BTT, 0x20);
        assert_ne!(card.read32(regs::CDMASR) & status::DEC_ERR, 0);
    }

    #[test]
    fn prom_window_serves_table() {
        let mut builder = TableBuilder::new();
        builder.device("sim").unwrap();
        builder
            .memory_region("ddr", 0, 0x1000, Permissions::READ_WRITE)
            .unwrap();
        let table = builder.build().unwrap();
        let card = SoftwareCard::new(Some(table.clone()));
        assert_eq!(card.read32(PROM_OFFSET).to_le_bytes(), *b"DIAG");
        assert_eq!(
            card.read32(PROM_OFFSET + 4).to_le_bytes(),
            [table[4], table[5], table[6], table[7]]
        );
        assert_eq!(card.read32(PROM_OFFSET + MAX_LENGTH - 4), 0);
    }

    #[test]
    fn host_buffer_views_meet_on_sync() {
        let card = SoftwareCard::new(None);
        let mut buffer = card.host_buffer(0x100, 0x4000);
        buffer.as_mut_slice()[0] = 0x42;
        buffer.sync_for_device(Direction::FromDevice);
        assert_eq!(lock(&buffer.device)[0], 0);
        buffer.sync_for_device(Direction::ToDevice);
        assert_eq!(lock(&buffer.device)[0], 0x42);

        lock(&buffer.device)[1] = 0x17;
        buffer.sync_for_cpu(Direction::ToDevice);
        assert_eq!(buffer.as_slice()[1], 0);
        buffer.sync_for_cpu(Direction::FromDevice);
        assert_eq!(buffer.as_slice()[1], 0x17);
    }

    #[test]
    fn manual_completion_waits_for_raise() {
        let card = SoftwareCard::new(None);
        let _buffer = card.host_buffer(0x1000, 0x1000);
        card.set_completion_mode(CompletionMode::Manual);
        card.write32(regs::CDMACR, control::IRQ_EN | control::ERR_IRQ_EN);
        let fired = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&fired);
        card.set_interrupt_handler(move || *lock(&counter) += 1);

        card.write32(regs::SA, 0x1000);
        card.write32(regs::DA, 0x8000);
        card.write32(regs::BTT, 0x20);
        assert!(card.transfer_pending());
        assert_eq!(card.read32(regs::CDMASR) & status::IDLE, 0);
        assert_eq!(*lock(&fired), 0);

        assert!(card.raise_interrupt());
        assert!(!card.raise_interrupt());
        assert_eq!(*lock(&fired), 1);
    }
}
