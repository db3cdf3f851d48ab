//! Memory-mapped register access
//!
//! [`RegisterBank`] is the seam between the driver logic and the card: a real
//! card is reached through a VFIO-mapped BAR ([`MappedRegion`]), the software
//! card implements the same trait in plain Rust.

// Hardware register access requires exact type casts for mmap/ioctl APIs
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_ptr_alignment)]

use crate::error::{AmcError, Result};
use crate::prom::PromSource;
use crate::vfio::ioctls;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::File;
use std::os::unix::io::{AsFd, AsRawFd};
use std::sync::Arc;

/// 32-bit register access to one BAR
pub trait RegisterBank: Send + Sync + std::fmt::Debug {
    /// Read the register at byte `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Write the register at byte `offset`
    fn write32(&self, offset: usize, value: u32);

    /// Size of the bank in bytes
    fn size(&self) -> usize;
}

/// A sub-range of a shared register bank
#[derive(Debug, Clone)]
pub struct RegisterWindow {
    bank: Arc<dyn RegisterBank>,
    base: usize,
}

impl RegisterWindow {
    /// Window starting at `base` within `bank`
    pub fn new(bank: Arc<dyn RegisterBank>, base: usize) -> Self {
        Self { bank, base }
    }

    /// Read the register at `offset` from the window base
    pub fn read32(&self, offset: usize) -> u32 {
        self.bank.read32(self.base + offset)
    }

    /// Write the register at `offset` from the window base
    pub fn write32(&self, offset: usize, value: u32) {
        tracing::trace!("reg[{:#x}] <= {value:#010x}", self.base + offset);
        self.bank.write32(self.base + offset, value);
    }

    /// Byte offset of the window within its bank
    pub const fn base(&self) -> usize {
        self.base
    }
}

impl PromSource for RegisterWindow {
    fn read32(&self, offset: usize) -> u32 {
        Self::read32(self, offset)
    }
}

/// VFIO region info structure
#[repr(C)]
#[derive(Debug, Default)]
pub struct VfioRegionInfo {
    /// Size of this structure (for versioning)
    pub argsz: u32,
    /// Region flags (capabilities, permissions)
    pub flags: u32,
    /// Region index (BAR number)
    pub index: u32,
    /// Offset to extended capabilities
    pub cap_offset: u32,
    /// Size of the region in bytes
    pub size: u64,
    /// Offset from mmap base
    pub offset: u64,
}

/// Mapped BAR region for MMIO access
pub struct MappedRegion {
    ptr: *mut u8,
    size: usize,
    bar: u32,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("bar", &self.bar)
            .finish()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively. Moving between threads
// doesn't invalidate the mapping (mmap'd memory is process-wide).
unsafe impl Send for MappedRegion {}

// SAFETY: Sync - every access is a single bounds-checked volatile 32-bit load or
// store; the card serialises concurrent register accesses itself.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map a BAR region via VFIO
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The VFIO ioctl to get region info fails
    /// - The region is empty
    /// - Memory mapping the BAR region fails
    pub fn map(device_fd: &File, bar: u32) -> Result<Self> {
        let mut region_info = VfioRegionInfo {
            argsz: std::mem::size_of::<VfioRegionInfo>() as u32,
            index: bar,
            ..Default::default()
        };

        // SAFETY: VFIO_DEVICE_GET_REGION_INFO fills region_info for the BAR.
        // Invariants: (1) device_fd is an open VFIO device; (2) argsz and index
        // initialised; (3) layout matches the kernel's vfio_region_info.
        let ret = unsafe {
            libc::ioctl(
                device_fd.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_REGION_INFO as _,
                &raw mut region_info,
            )
        };

        if ret < 0 {
            return Err(AmcError::vfio(format!(
                "Failed to get BAR{bar} info: {}",
                std::io::Error::last_os_error()
            )));
        }
        if region_info.size == 0 {
            return Err(AmcError::vfio(format!("BAR{bar} is not implemented")));
        }

        tracing::debug!(
            "BAR{bar}: size={:#x}, offset={:#x}, flags={:#x}",
            region_info.size,
            region_info.offset,
            region_info.flags
        );

        // SAFETY: maps the BAR into the process address space.
        // Invariants: (1) device_fd valid; (2) size/offset from a successful
        // region info ioctl; (3) ptr valid for size bytes or Err.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                region_info.size as usize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                device_fd.as_fd(),
                region_info.offset,
            )
            .map_err(|e| AmcError::vfio(format!("Failed to mmap BAR{bar}: {e}")))?
        };

        tracing::info!("Mapped BAR{bar} at {ptr:p}, size={:#x}", region_info.size);

        Ok(Self {
            ptr: ptr.cast(),
            size: region_info.size as usize,
            bar,
        })
    }

    /// BAR index
    pub const fn bar(&self) -> u32 {
        self.bar
    }
}

impl RegisterBank for MappedRegion {
    fn read32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: read_volatile necessary for MMIO - hardware can change value.
        // Invariants: (1) ptr from mmap, valid for self.size; (2) offset+4 <= size;
        // (3) register offsets are u32 aligned.
        unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<u32>()) }
    }

    fn write32(&self, offset: usize, value: u32) {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side effects.
        // Invariants: (1) ptr from mmap; (2) offset+4 <= size; (3) u32 aligned.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<u32>(), value);
        }
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size are exactly the mapping made in map(); Drop
        // runs once and no references into the mapping outlive self.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
        tracing::debug!("Unmapped BAR{}", self.bar);
    }
}
