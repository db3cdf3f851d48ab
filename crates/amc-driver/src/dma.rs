//! DMA transfer engine
//!
//! Drives the AXI CDMA controller in BAR2 to move data between card DRAM and
//! a single pinned host buffer. Each transfer follows a fixed protocol:
//!
//! ```text
//! clamp -> alignment check -> sync for device -> reset if unhealthy
//!       -> re-arm completion -> refuse if closed -> program SA/DA -> BTT (trigger)
//!       -> wait (killable) -> sync for CPU -> check error bits
//! ```
//!
//! The host buffer is owned by [`DmaControl`] behind a mutex. Holding the
//! [`DmaGuard`] returned by [`DmaControl::lock`] is the only way to touch the
//! buffer or start a transfer, so transfers never interleave and buffer
//! contents stay with the caller that produced them.
//!
//! [`DmaControl::close`] starts teardown: the transfer in flight is killed and
//! every later one fails with `TransferKilled` before reaching the registers.

use crate::completion::Completion;
use crate::error::{AmcError, Result};
use crate::mmio::RegisterWindow;
use crate::prom::DmaSettings;
use amc_chip::regs::{self, control, status};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Direction of a transfer, relative to the card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host buffer to card memory
    ToDevice,
    /// Card memory to host buffer
    FromDevice,
}

/// Pinned host memory the DMA engine reads from and writes into
///
/// Implementations own the cache maintenance: `sync_for_device` before the
/// engine touches the buffer, `sync_for_cpu` before the CPU reads it back.
pub trait HostBuffer: Send + std::fmt::Debug {
    /// CPU view of the buffer
    fn as_slice(&self) -> &[u8];

    /// Mutable CPU view of the buffer
    fn as_mut_slice(&mut self) -> &mut [u8];

    /// Address the card uses to reach the buffer
    fn device_address(&self) -> u64;

    /// Buffer size in bytes
    fn size(&self) -> usize {
        self.as_slice().len()
    }

    /// Hand the buffer to the device
    fn sync_for_device(&mut self, direction: Direction);

    /// Hand the buffer back to the CPU
    fn sync_for_cpu(&mut self, direction: Direction);
}

/// The DMA controller and its host buffer
#[derive(Debug)]
pub struct DmaControl {
    regs: RegisterWindow,
    buffer: Mutex<Box<dyn HostBuffer>>,
    completion: Completion,
    closed: AtomicBool,
    settings: DmaSettings,
    buffer_size: usize,
    max_transfer: usize,
    reset_timeout: Duration,
}

impl DmaControl {
    /// Take ownership of the controller and buffer, and reset the controller.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if the buffer size is not a power of two, the buffer
    ///   is not reachable under the addressing mask, or the alignment is unusable
    /// - `ResetTimeout` if the controller does not come out of reset
    pub fn new(
        regs: RegisterWindow,
        buffer: Box<dyn HostBuffer>,
        settings: DmaSettings,
        reset_timeout: Duration,
    ) -> Result<Self> {
        let buffer_size = buffer.size();
        if !buffer_size.is_power_of_two() {
            return Err(AmcError::invalid_config(format!(
                "DMA buffer size {buffer_size:#x} is not a power of two"
            )));
        }

        if settings.dma_mask == 0 || settings.dma_mask > 64 {
            return Err(AmcError::invalid_config(format!(
                "DMA mask of {} bits",
                settings.dma_mask
            )));
        }
        let limit = u64::MAX >> (64 - u32::from(settings.dma_mask));
        let address = buffer.device_address();
        let last = address
            .checked_add(buffer_size as u64 - 1)
            .filter(|&last| last <= limit)
            .ok_or_else(|| {
                AmcError::invalid_config(format!(
                    "DMA buffer at {address:#x} not reachable with a {}-bit mask",
                    settings.dma_mask
                ))
            })?;

        let alignment = 1usize
            .checked_shl(u32::from(settings.alignment_shift))
            .ok_or_else(|| {
                AmcError::invalid_config(format!(
                    "DMA alignment shift {}",
                    settings.alignment_shift
                ))
            })?;
        if address % alignment as u64 != 0 {
            return Err(AmcError::invalid_config(format!(
                "DMA buffer at {address:#x} is not {alignment} byte aligned"
            )));
        }
        let max_transfer = (regs::BTT_MAX & !(alignment - 1)).min(buffer_size);
        if max_transfer == 0 {
            return Err(AmcError::invalid_config(format!(
                "alignment {alignment} leaves no usable transfer size"
            )));
        }

        let dma = Self {
            regs,
            buffer: Mutex::new(buffer),
            completion: Completion::new(),
            closed: AtomicBool::new(false),
            settings,
            buffer_size,
            max_transfer,
            reset_timeout,
        };
        dma.reset()?;
        tracing::info!(
            "DMA ready: buffer {buffer_size:#x} at {address:#x}..={last:#x}, \
             align {alignment}, mask {} bits, max transfer {max_transfer:#x}",
            settings.dma_mask
        );
        Ok(dma)
    }

    /// Soft reset the controller and re-enable its interrupts.
    ///
    /// # Errors
    ///
    /// Returns `ResetTimeout` if the reset bit does not clear in time.
    pub fn reset(&self) -> Result<()> {
        self.regs.write32(regs::CDMACR, control::RESET);

        let deadline = Instant::now() + self.reset_timeout;
        let mut polls = 0u32;
        let mut cdmacr = self.regs.read32(regs::CDMACR);
        while cdmacr & control::RESET != 0 && Instant::now() < deadline {
            polls += 1;
            cdmacr = self.regs.read32(regs::CDMACR);
        }
        if cdmacr & control::RESET != 0 {
            tracing::error!("DMA controller stuck in reset after {polls} polls");
            return Err(AmcError::ResetTimeout {
                duration_us: u64::try_from(self.reset_timeout.as_micros()).unwrap_or(u64::MAX),
            });
        }

        self.regs
            .write32(regs::CDMACR, control::IRQ_EN | control::ERR_IRQ_EN);
        tracing::debug!("DMA controller reset ({polls} polls)");
        Ok(())
    }

    /// Completion interrupt handler: acknowledge latched status and wake
    /// the waiting transfer.
    pub fn interrupt(&self) {
        let cdmasr = self.regs.read32(regs::CDMASR);
        self.regs.write32(regs::CDMASR, cdmasr);
        tracing::trace!("DMA interrupt, status {cdmasr:#010x}");
        self.completion.complete();
    }

    /// Forcefully terminate a transfer blocked waiting for completion
    pub fn kill(&self) {
        tracing::warn!("Killing DMA wait");
        self.completion.kill();
    }

    /// Refuse all further transfers and kill the one in flight
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Closing DMA engine");
        }
        self.completion.kill();
    }

    /// Whether [`DmaControl::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take exclusive use of the buffer and engine, blocking until available
    pub fn lock(&self) -> DmaGuard<'_> {
        DmaGuard {
            control: self,
            buffer: self.buffer.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Host buffer size in bytes
    pub const fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Required transfer alignment in bytes
    pub const fn alignment(&self) -> usize {
        self.settings.alignment()
    }

    /// log2 of [`DmaControl::alignment`]
    pub const fn alignment_shift(&self) -> u8 {
        self.settings.alignment_shift
    }

    /// Addressing width in bits
    pub const fn dma_mask(&self) -> u8 {
        self.settings.dma_mask
    }

    /// Largest byte count a single transfer moves
    pub const fn max_transfer(&self) -> usize {
        self.max_transfer
    }

    fn transfer(
        &self,
        buffer: &mut dyn HostBuffer,
        start: u64,
        count: usize,
        direction: Direction,
    ) -> Result<usize> {
        if count == 0 {
            return Err(AmcError::invalid_argument("zero length DMA transfer"));
        }
        let count = count.min(self.max_transfer);

        // The engine locks up silently on a misaligned transfer
        let alignment = self.alignment();
        let mask = alignment as u64 - 1;
        let buffer_address = buffer.device_address();
        if start & mask != 0 || buffer_address & mask != 0 || count as u64 & mask != 0 {
            return Err(AmcError::MisalignedTransfer {
                address: start,
                buffer_address,
                count,
                alignment,
            });
        }

        buffer.sync_for_device(direction);

        let cdmasr = self.regs.read32(regs::CDMASR);
        if cdmasr & status::ERROR_MASK != 0 || cdmasr & status::IDLE == 0 {
            tracing::warn!("Forcing reset of DMA controller (status = {cdmasr:#010x})");
            self.reset()?;
        }
        self.completion.reinit();
        // A close after this point leaves its kill pending for the wait below
        if self.is_closed() {
            return Err(AmcError::TransferKilled);
        }

        let (source, destination) = match direction {
            Direction::ToDevice => (buffer_address, start),
            Direction::FromDevice => (start, buffer_address),
        };
        tracing::debug!("DMA {direction:?} {source:#x} -> {destination:#x}, {count:#x} bytes");
        self.regs.write32(regs::SA_MSB, high(source));
        self.regs.write32(regs::SA, low(source));
        self.regs.write32(regs::DA, low(destination));
        self.regs.write32(regs::DA_MSB, high(destination));
        #[allow(clippy::cast_possible_truncation)]
        self.regs.write32(regs::BTT, count as u32);

        self.completion.wait_killable()?;

        buffer.sync_for_cpu(direction);

        let cdmasr = self.regs.read32(regs::CDMASR);
        if cdmasr & status::ERROR_MASK != 0 {
            tracing::error!("DMA error code: {cdmasr:#010x}");
            return Err(AmcError::TransferFault { status: cdmasr });
        }
        Ok(count)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn low(address: u64) -> u32 {
    address as u32
}

#[allow(clippy::cast_possible_truncation)]
const fn high(address: u64) -> u32 {
    (address >> 32) as u32
}

/// Exclusive use of the DMA buffer and engine
///
/// Dropping the guard releases it.
#[derive(Debug)]
pub struct DmaGuard<'a> {
    control: &'a DmaControl,
    buffer: MutexGuard<'a, Box<dyn HostBuffer>>,
}

impl DmaGuard<'_> {
    /// Buffer contents as last synced for the CPU
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Buffer contents, for staging data before a `ToDevice` transfer
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    /// Move `count` bytes between card address `start` and the start of the
    /// buffer, returning the number of bytes moved.
    ///
    /// `count` is clamped to [`DmaControl::max_transfer`] first.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for a zero count
    /// - `MisalignedTransfer` if `start`, the buffer address or the clamped
    ///   count is not aligned; no register is touched
    /// - `ResetTimeout` if a required reset fails
    /// - `TransferKilled` if the wait was killed, a kill was pending, or the
    ///   engine is closed
    /// - `TransferFault` if the controller reports an error
    pub fn transfer(&mut self, start: u64, count: usize, direction: Direction) -> Result<usize> {
        self.control
            .transfer(&mut **self.buffer, start, count, direction)
    }

    /// The controller this guard belongs to
    pub const fn control(&self) -> &DmaControl {
        self.control
    }

    /// Release exclusive use
    pub fn unlock(self) {}
}
