//! VFIO plumbing for a real AMC525
//!
//! Linux VFIO gives a userspace driver everything the card needs:
//!
//! - BAR mapping (register space and the driver control area)
//! - IOMMU-mapped host memory for the CDMA engine
//! - MSI delivery through an eventfd
//!
//! # Requirements
//!
//! 1. IOMMU enabled in BIOS and kernel (`intel_iommu=on` or `amd_iommu=on`)
//! 2. Card bound to `vfio-pci` (see [`bind_to_vfio`])
//! 3. User in `vfio` group or root permissions
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   AmcCard   │────▶│  VFIO API   │────▶│   IOMMU     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │ MSI               ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  IrqThread  │◀────│  eventfd    │     │  AXI CDMA   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! VFIO ioctls use libc directly: they take ints, struct pointers, fd
//! pointers and C strings, which does not fit one rustix `Ioctl` impl.

// FFI/ioctl casts are intentional - VFIO API requires specific types
#![allow(clippy::cast_possible_truncation)]

use crate::card::{AmcCard, CardParts};
use crate::config::DriverConfig;
use crate::dma::{Direction, DmaControl, HostBuffer};
use crate::error::{AmcError, Result};
use crate::mmio::{MappedRegion, RegisterBank};
use amc_chip::bar::{CONTROL_BAR, CONTROL_BAR_LENGTH, REGISTER_BAR};
use rustix::event::{eventfd, poll, EventfdFlags, PollFd, PollFlags};
use rustix::io::Errno;
use rustix::mm::{mlock, munlock};
use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

/// VFIO ioctl numbers (from Linux kernel headers)
///
/// Every VFIO ioctl is `_IO(';', VFIO_BASE + n)`, where
/// `_IO(type, nr) = (type << 8) | nr`.
pub(crate) mod ioctls {
    use std::os::raw::c_ulong;

    const fn io(ty: u8, nr: u8) -> c_ulong {
        ((ty as c_ulong) << 8) | (nr as c_ulong)
    }

    pub const VFIO_TYPE: u8 = b';';
    pub const VFIO_BASE: u8 = 100;

    // Container
    pub const VFIO_GET_API_VERSION: c_ulong = io(VFIO_TYPE, VFIO_BASE);
    pub const VFIO_CHECK_EXTENSION: c_ulong = io(VFIO_TYPE, VFIO_BASE + 1);
    pub const VFIO_SET_IOMMU: c_ulong = io(VFIO_TYPE, VFIO_BASE + 2);

    // Group
    pub const VFIO_GROUP_GET_STATUS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 3);
    pub const VFIO_GROUP_SET_CONTAINER: c_ulong = io(VFIO_TYPE, VFIO_BASE + 4);
    pub const VFIO_GROUP_GET_DEVICE_FD: c_ulong = io(VFIO_TYPE, VFIO_BASE + 6);

    // Device
    pub const VFIO_DEVICE_GET_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 7);
    pub const VFIO_DEVICE_GET_REGION_INFO: c_ulong = io(VFIO_TYPE, VFIO_BASE + 8);
    pub const VFIO_DEVICE_SET_IRQS: c_ulong = io(VFIO_TYPE, VFIO_BASE + 10);

    // IOMMU DMA mapping
    pub const VFIO_IOMMU_MAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 13);
    pub const VFIO_IOMMU_UNMAP_DMA: c_ulong = io(VFIO_TYPE, VFIO_BASE + 14);

    pub const VFIO_API_VERSION: i32 = 0;
    pub const VFIO_TYPE1V2_IOMMU: u32 = 3;

    pub const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

    pub const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
    pub const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;

    // vfio-pci interrupt indices and SET_IRQS flags
    pub const VFIO_PCI_MSI_IRQ_INDEX: u32 = 1;
    pub const VFIO_IRQ_SET_DATA_NONE: u32 = 1 << 0;
    pub const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
    pub const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDeviceInfo {
    argsz: u32,
    flags: u32,
    num_regions: u32,
    num_irqs: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioDmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// `vfio_irq_set` with room for a single eventfd
#[repr(C)]
#[derive(Debug, Default)]
struct VfioIrqSet {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
    fd: i32,
}

const PAGE: usize = 4096;

/// Pinned, IOMMU-mapped host memory for the CDMA engine
#[derive(Debug)]
pub struct DmaBuffer {
    /// Virtual address (user-space)
    vaddr: *mut u8,
    /// IOVA (device-visible address)
    iova: u64,
    /// Size in bytes, a whole number of pages
    size: usize,
    /// Container the mapping lives in
    container: Arc<File>,
}

impl DmaBuffer {
    fn new(container: Arc<File>, size: usize, iova: u64) -> Result<Self> {
        if size == 0 || size % PAGE != 0 || iova % PAGE as u64 != 0 {
            return Err(AmcError::invalid_argument(format!(
                "DMA buffer of {size:#x} bytes at IOVA {iova:#x} is not page aligned"
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, PAGE)
            .map_err(|e| AmcError::vfio(format!("Invalid DMA buffer layout: {e}")))?;

        // SAFETY: Raw alloc_zeroed necessary for a page-aligned DMA buffer.
        // Invariants: (1) layout from from_size_align, size > 0, align 4096;
        // (2) returns a valid ptr for layout.size() bytes or null on OOM;
        // (3) dealloc in Drop with the same layout.
        let vaddr = unsafe { std::alloc::alloc_zeroed(layout) };
        if vaddr.is_null() {
            return Err(AmcError::vfio("Failed to allocate DMA buffer"));
        }

        // SAFETY: mlock keeps the pages resident while the IOMMU maps them.
        // Invariants: (1) vaddr from alloc_zeroed, valid for size bytes;
        // (2) region [vaddr, vaddr+size) entirely within the allocation.
        if let Err(e) = unsafe { mlock(vaddr.cast(), size) } {
            // SAFETY: vaddr allocated above with layout, not yet shared.
            unsafe { std::alloc::dealloc(vaddr, layout) };
            return Err(AmcError::vfio(format!("Failed to lock DMA memory: {e}")));
        }

        let dma_map = VfioDmaMap {
            argsz: std::mem::size_of::<VfioDmaMap>() as u32,
            flags: ioctls::VFIO_DMA_MAP_FLAG_READ | ioctls::VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: vaddr as u64,
            iova,
            size: size as u64,
        };

        // SAFETY: VFIO_IOMMU_MAP_DMA maps the user buffer at iova.
        // Invariants: (1) container is an open VFIO container with an IOMMU
        // set; (2) dma_map fully initialised from our allocation; (3) layout
        // matches the kernel's vfio_iommu_type1_dma_map.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_IOMMU_MAP_DMA as _,
                &raw const dma_map,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: vaddr was allocated and mlock'd above and never mapped.
            unsafe {
                let _ = munlock(vaddr.cast(), size);
                std::alloc::dealloc(vaddr, layout);
            };
            return Err(AmcError::vfio(format!(
                "Failed to map DMA buffer at IOVA {iova:#x}: {err}"
            )));
        }

        tracing::debug!("Created DMA buffer: vaddr={vaddr:p}, iova={iova:#x}, size={size:#x}");
        Ok(Self {
            vaddr,
            iova,
            size,
            container,
        })
    }

    /// Device-visible address
    #[must_use]
    pub const fn iova(&self) -> u64 {
        self.iova
    }
}

impl HostBuffer for DmaBuffer {
    fn as_slice(&self) -> &[u8] {
        // SAFETY: (1) vaddr valid for size until Drop; (2) &self excludes
        // CPU writers; the engine only writes between sync calls.
        unsafe { std::slice::from_raw_parts(self.vaddr, self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: (1) vaddr valid for size; (2) &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.vaddr, self.size) }
    }

    fn device_address(&self) -> u64 {
        self.iova
    }

    fn size(&self) -> usize {
        self.size
    }

    // IOMMU-mapped memory is cache coherent on the supported hosts: syncing
    // only has to order CPU accesses against the doorbell write.
    fn sync_for_device(&mut self, _direction: Direction) {
        fence(Ordering::SeqCst);
    }

    fn sync_for_cpu(&mut self, _direction: Direction) {
        fence(Ordering::SeqCst);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        let dma_unmap = VfioDmaUnmap {
            argsz: std::mem::size_of::<VfioDmaUnmap>() as u32,
            flags: 0,
            iova: self.iova,
            size: self.size as u64,
        };

        // SAFETY: VFIO_IOMMU_UNMAP_DMA removes our mapping before dealloc.
        // Invariants: (1) container still open, we hold an Arc; (2) iova and
        // size are the ones mapped in new().
        let ret = unsafe {
            libc::ioctl(
                self.container.as_raw_fd(),
                ioctls::VFIO_IOMMU_UNMAP_DMA as _,
                &raw const dma_unmap,
            )
        };
        if ret < 0 {
            // The device may still reach the pages: leak them
            tracing::error!(
                "Failed to unmap DMA buffer at IOVA {:#x}: {}",
                self.iova,
                std::io::Error::last_os_error()
            );
            return;
        }

        // SAFETY: vaddr was mlock'd in new() for exactly size bytes.
        unsafe {
            let _ = munlock(self.vaddr.cast(), self.size);
        };

        if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, PAGE) {
            // SAFETY: (1) vaddr from alloc_zeroed in new() with this layout;
            // (2) unmapped from the IOMMU above; (3) no references remain.
            unsafe { std::alloc::dealloc(self.vaddr, layout) };
        }
        tracing::debug!("Freed DMA buffer at iova={:#x}", self.iova);
    }
}

// SAFETY: DmaBuffer owns its memory exclusively
unsafe impl Send for DmaBuffer {}

// SAFETY: shared access is read-only through &self
unsafe impl Sync for DmaBuffer {}

/// An AMC525 opened through VFIO
#[derive(Debug)]
pub struct VfioDevice {
    pcie_address: String,
    container: Arc<File>,
    /// Kept open for the lifetime of the device
    _group: File,
    device: File,
    num_regions: u32,
    num_irqs: u32,
}

impl VfioDevice {
    /// Open a card that is bound to `vfio-pci`
    ///
    /// # Errors
    ///
    /// Returns `VfioSetup` if any step of the container, group or device
    /// setup fails.
    pub fn open(pcie_address: &str) -> Result<Self> {
        tracing::info!("Opening {pcie_address} through VFIO");

        let iommu_group = iommu_group(pcie_address)?;

        let container = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vfio/vfio")
            .map_err(|e| AmcError::vfio(format!("Cannot open /dev/vfio/vfio: {e}")))?;

        // SAFETY: VFIO_GET_API_VERSION takes no argument and returns an int.
        let api_version =
            unsafe { libc::ioctl(container.as_raw_fd(), ioctls::VFIO_GET_API_VERSION as _) };
        if api_version != ioctls::VFIO_API_VERSION {
            return Err(AmcError::vfio(format!(
                "Unsupported VFIO API version: {api_version}"
            )));
        }

        // SAFETY: VFIO_CHECK_EXTENSION takes the extension id by value and
        // returns 1 if supported.
        let has_type1 = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_CHECK_EXTENSION as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if has_type1 != 1 {
            return Err(AmcError::vfio("VFIO Type1v2 IOMMU not supported"));
        }

        let group_path = format!("/dev/vfio/{iommu_group}");
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|e| AmcError::vfio(format!("Cannot open {group_path}: {e}")))?;

        let mut group_status = VfioGroupStatus {
            argsz: std::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };
        // SAFETY: VFIO_GROUP_GET_STATUS fills group_status.
        // Invariants: (1) group fd valid; (2) layout matches vfio_group_status.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_STATUS as _,
                &raw mut group_status,
            )
        };
        if ret < 0 || (group_status.flags & ioctls::VFIO_GROUP_FLAGS_VIABLE) == 0 {
            return Err(AmcError::vfio(
                "VFIO group not viable (all devices must be bound to vfio-pci)",
            ));
        }

        // SAFETY: VFIO_GROUP_SET_CONTAINER reads the container fd through
        // the pointer; both fds are open.
        let ret = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_SET_CONTAINER as _,
                std::ptr::from_ref(&container.as_raw_fd()),
            )
        };
        if ret < 0 {
            return Err(AmcError::vfio(format!(
                "Failed to set container: {}",
                std::io::Error::last_os_error()
            )));
        }

        // SAFETY: VFIO_SET_IOMMU takes the IOMMU type by value; the group is
        // attached and Type1v2 was checked above.
        let ret = unsafe {
            libc::ioctl(
                container.as_raw_fd(),
                ioctls::VFIO_SET_IOMMU as _,
                ioctls::VFIO_TYPE1V2_IOMMU,
            )
        };
        if ret < 0 {
            return Err(AmcError::vfio(format!(
                "Failed to set IOMMU: {}",
                std::io::Error::last_os_error()
            )));
        }

        let address = std::ffi::CString::new(pcie_address)
            .map_err(|e| AmcError::vfio(format!("Invalid PCIe address: {e}")))?;
        // SAFETY: VFIO_GROUP_GET_DEVICE_FD reads a NUL terminated string and
        // returns a new fd or -1.
        let device_fd = unsafe {
            libc::ioctl(
                group.as_raw_fd(),
                ioctls::VFIO_GROUP_GET_DEVICE_FD as _,
                address.as_ptr(),
            )
        };
        if device_fd < 0 {
            return Err(AmcError::vfio(format!(
                "Failed to get device fd: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: device_fd is a fresh fd from the kernel (checked >= 0);
        // File takes ownership and closes it.
        let device = unsafe { File::from_raw_fd(device_fd) };

        let mut device_info = VfioDeviceInfo {
            argsz: std::mem::size_of::<VfioDeviceInfo>() as u32,
            ..Default::default()
        };
        // SAFETY: VFIO_DEVICE_GET_INFO fills device_info.
        // Invariants: (1) device fd valid; (2) layout matches vfio_device_info.
        let ret = unsafe {
            libc::ioctl(
                device.as_raw_fd(),
                ioctls::VFIO_DEVICE_GET_INFO as _,
                &raw mut device_info,
            )
        };
        if ret < 0 {
            return Err(AmcError::vfio(format!(
                "Failed to get device info: {}",
                std::io::Error::last_os_error()
            )));
        }

        tracing::info!(
            "{pcie_address}: IOMMU group {iommu_group}, {} regions, {} IRQ indices",
            device_info.num_regions,
            device_info.num_irqs
        );

        Ok(Self {
            pcie_address: pcie_address.to_string(),
            container: Arc::new(container),
            _group: group,
            device,
            num_regions: device_info.num_regions,
            num_irqs: device_info.num_irqs,
        })
    }

    /// PCIe address the device was opened at
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// Map a BAR
    ///
    /// # Errors
    ///
    /// Returns `VfioSetup` if the BAR does not exist or cannot be mapped.
    pub fn map_bar(&self, index: u32) -> Result<MappedRegion> {
        if index >= self.num_regions {
            return Err(AmcError::vfio(format!(
                "BAR{index} out of range ({} regions)",
                self.num_regions
            )));
        }
        MappedRegion::map(&self.device, index)
    }

    /// Allocate and IOMMU-map a host buffer at `iova`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for unaligned sizes and `VfioSetup` if the
    /// allocation or mapping fails.
    pub fn alloc_dma(&self, size: usize, iova: u64) -> Result<DmaBuffer> {
        DmaBuffer::new(Arc::clone(&self.container), size.div_ceil(PAGE) * PAGE, iova)
    }

    /// Route the card's MSI to a new eventfd
    ///
    /// # Errors
    ///
    /// Returns `VfioSetup` if the device has no MSI or the kernel refuses.
    pub fn enable_msi(&self) -> Result<IrqEventFd> {
        if self.num_irqs <= ioctls::VFIO_PCI_MSI_IRQ_INDEX {
            return Err(AmcError::vfio("Device has no MSI interrupt"));
        }
        let irq = IrqEventFd::new()?;
        self.set_msi(
            ioctls::VFIO_IRQ_SET_DATA_EVENTFD | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            1,
            irq.fd.as_raw_fd(),
        )?;
        tracing::debug!("MSI routed to eventfd {}", irq.fd.as_raw_fd());
        Ok(irq)
    }

    /// Tear down MSI delivery
    ///
    /// # Errors
    ///
    /// Returns `VfioSetup` if the kernel refuses.
    pub fn disable_msi(&self) -> Result<()> {
        self.set_msi(
            ioctls::VFIO_IRQ_SET_DATA_NONE | ioctls::VFIO_IRQ_SET_ACTION_TRIGGER,
            0,
            -1,
        )
    }

    fn set_msi(&self, flags: u32, count: u32, fd: i32) -> Result<()> {
        let mut irq_set = VfioIrqSet {
            argsz: std::mem::size_of::<VfioIrqSet>() as u32,
            flags,
            index: ioctls::VFIO_PCI_MSI_IRQ_INDEX,
            start: 0,
            count,
            fd,
        };
        if count == 0 {
            irq_set.argsz -= std::mem::size_of::<i32>() as u32;
        }
        // SAFETY: VFIO_DEVICE_SET_IRQS reads argsz bytes of irq_set.
        // Invariants: (1) device fd valid; (2) the header matches
        // vfio_irq_set and is followed by `count` eventfds.
        let ret = unsafe {
            libc::ioctl(
                self.device.as_raw_fd(),
                ioctls::VFIO_DEVICE_SET_IRQS as _,
                &raw const irq_set,
            )
        };
        if ret < 0 {
            return Err(AmcError::vfio(format!(
                "VFIO_DEVICE_SET_IRQS failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// Eventfd the kernel signals on every MSI
#[derive(Debug)]
pub struct IrqEventFd {
    fd: OwnedFd,
}

impl IrqEventFd {
    /// Create an unsignalled eventfd
    ///
    /// # Errors
    ///
    /// Returns `Io` if the kernel refuses.
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::CLOEXEC).map_err(std::io::Error::from)?;
        Ok(Self { fd })
    }

    /// Another handle to the same eventfd
    ///
    /// # Errors
    ///
    /// Returns `Io` if the fd cannot be duplicated.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    /// Signal the eventfd as the kernel does on an interrupt
    ///
    /// # Errors
    ///
    /// Returns `Io` if the write fails.
    pub fn signal(&self) -> Result<()> {
        rustix::io::write(&self.fd, &1u64.to_ne_bytes()).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Consume pending signals, returning how many arrived
    fn drain(&self) -> Result<u64> {
        let mut count = [0u8; 8];
        rustix::io::read(&self.fd, &mut count).map_err(std::io::Error::from)?;
        Ok(u64::from_ne_bytes(count))
    }
}

/// Thread forwarding each MSI to a handler
#[derive(Debug)]
pub struct IrqThread {
    stop: IrqEventFd,
    handle: Option<JoinHandle<()>>,
}

impl IrqThread {
    /// Start forwarding signals on `irq` to `handler`
    ///
    /// # Errors
    ///
    /// Returns `Io` if the stop eventfd or the thread cannot be created.
    pub fn spawn(irq: IrqEventFd, handler: impl Fn() + Send + 'static) -> Result<Self> {
        let stop = IrqEventFd::new()?;
        let stop_rx = stop.try_clone()?;
        let handle = std::thread::Builder::new()
            .name("amc-irq".into())
            .spawn(move || irq_loop(&irq, &stop_rx, &handler))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = self.stop.signal() {
            tracing::error!("Cannot stop interrupt thread: {e}");
            return;
        }
        if handle.join().is_err() {
            tracing::error!("Interrupt thread panicked");
        }
    }
}

impl Drop for IrqThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn irq_loop(irq: &IrqEventFd, stop: &IrqEventFd, handler: &dyn Fn()) {
    tracing::debug!("Interrupt thread running");
    loop {
        let mut fds = [
            PollFd::new(&irq.fd, PollFlags::IN),
            PollFd::new(&stop.fd, PollFlags::IN),
        ];
        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(Errno::INTR) => continue,
            Err(e) => {
                tracing::error!("Interrupt poll failed: {e}");
                return;
            }
        }
        let (irq_ready, stop_ready) = (!fds[0].revents().is_empty(), !fds[1].revents().is_empty());
        if stop_ready {
            break;
        }
        if irq_ready {
            match irq.drain() {
                Ok(count) => {
                    if count > 1 {
                        tracing::trace!("{count} interrupts coalesced");
                    }
                    handler();
                }
                Err(e) => {
                    tracing::error!("Interrupt eventfd read failed: {e}");
                    return;
                }
            }
        }
    }
    tracing::debug!("Interrupt thread stopped");
}

/// A card attached through VFIO, with its interrupt thread running
///
/// Dropping it stops interrupts, drains clients and releases the hardware.
#[derive(Debug)]
pub struct VfioCard {
    irq: Option<IrqThread>,
    card: AmcCard,
    device: VfioDevice,
}

impl VfioCard {
    /// The attached card
    #[must_use]
    pub const fn card(&self) -> &AmcCard {
        &self.card
    }

    /// The underlying VFIO device
    #[must_use]
    pub const fn device(&self) -> &VfioDevice {
        &self.device
    }
}

impl std::ops::Deref for VfioCard {
    type Target = AmcCard;

    fn deref(&self) -> &AmcCard {
        &self.card
    }
}

impl Drop for VfioCard {
    fn drop(&mut self) {
        if let Some(mut irq) = self.irq.take() {
            self.card.close_transfers();
            irq.stop();
            if let Err(e) = self.device.disable_msi() {
                tracing::warn!("{e}");
            }
        }
        self.card.shutdown();
        tracing::info!("Released {}", self.device.pcie_address());
    }
}

/// Open a `vfio-pci` bound card and attach the driver to it as `board`
///
/// BAR2 must hold the control area; BAR0 is optional. The host buffer is
/// `config.dma_block_size()` bytes at `config.iova_base`.
///
/// # Errors
///
/// Returns VFIO setup errors, `InvalidConfig` if BAR2 is too small, and any
/// error from [`AmcCard::attach`].
pub fn open_card(pcie_address: &str, board: usize, config: &DriverConfig) -> Result<VfioCard> {
    config.validate()?;
    let device = VfioDevice::open(pcie_address)?;

    let control = device.map_bar(CONTROL_BAR)?;
    if control.size() < CONTROL_BAR_LENGTH {
        return Err(AmcError::invalid_config(format!(
            "BAR{CONTROL_BAR} is {:#x} bytes, need {CONTROL_BAR_LENGTH:#x}",
            control.size()
        )));
    }
    let registers = match device.map_bar(REGISTER_BAR) {
        Ok(bar) => Some(Arc::new(bar) as Arc<dyn RegisterBank>),
        Err(e) => {
            tracing::warn!("No register space: {e}");
            None
        }
    };
    let buffer = device.alloc_dma(config.dma_block_size(), config.iova_base)?;

    let card = AmcCard::attach(
        CardParts {
            board,
            control_bar: Arc::new(control),
            register_bar: registers,
            host_buffer: Some(Box::new(buffer)),
        },
        config,
    )?;

    let irq = match card.dma() {
        Some(dma) => {
            let events = device.enable_msi()?;
            let dma: Weak<DmaControl> = Arc::downgrade(&dma);
            Some(IrqThread::spawn(events, move || {
                if let Some(dma) = dma.upgrade() {
                    dma.interrupt();
                }
            })?)
        }
        None => None,
    };

    Ok(VfioCard { irq, card, device })
}

// ── VFIO device binding helpers ───────────────────────────────────────────────

/// Bind a card to `vfio-pci`, unbinding any existing driver.
///
/// Steps:
/// 1. Unbind from current driver (e.g., `amc525_mbf`)
/// 2. Write vendor:device to `vfio-pci/new_id`
/// 3. Bind the device
///
/// Requires root or `CAP_SYS_ADMIN`.
///
/// # Errors
///
/// Returns an error if any sysfs write fails (usually permission denied).
pub fn bind_to_vfio(pcie_address: &str) -> Result<()> {
    use amc_chip::pcie::{AMC525_DEVICE_ID, XILINX_VENDOR_ID};

    tracing::info!("Binding {} to vfio-pci", pcie_address);

    let driver_unbind = format!("/sys/bus/pci/devices/{pcie_address}/driver/unbind");
    if Path::new(&driver_unbind).exists() {
        std::fs::write(&driver_unbind, pcie_address).map_err(|e| {
            AmcError::hardware_error(format!("Cannot unbind {pcie_address}: {e}"))
        })?;
        tracing::info!("Unbound from existing driver");
    }

    let new_id = "/sys/bus/pci/drivers/vfio-pci/new_id";
    if Path::new(new_id).exists() {
        // EEXIST once the id is known; the bind below still applies
        if let Err(e) = std::fs::write(
            new_id,
            format!("{XILINX_VENDOR_ID:04x} {AMC525_DEVICE_ID:04x}"),
        ) {
            tracing::debug!("vfio-pci/new_id: {e}");
        }
    }

    let bind_path = "/sys/bus/pci/drivers/vfio-pci/bind";
    if let Err(e) = std::fs::write(bind_path, pcie_address) {
        let bound = std::fs::read_link(format!("/sys/bus/pci/devices/{pcie_address}/driver"))
            .ok()
            .and_then(|link| link.file_name().map(|n| n == "vfio-pci"))
            .unwrap_or(false);
        if !bound {
            return Err(AmcError::hardware_error(format!(
                "Cannot bind to vfio-pci: {e}"
            )));
        }
    }

    tracing::info!("{pcie_address} bound to vfio-pci");
    Ok(())
}

/// Unbind from `vfio-pci` and re-bind to the `amc525_mbf` kernel module
/// if it is loaded.
///
/// # Errors
///
/// Returns an error if sysfs writes fail.
pub fn unbind_from_vfio(pcie_address: &str) -> Result<()> {
    let unbind = "/sys/bus/pci/drivers/vfio-pci/unbind";
    std::fs::write(unbind, pcie_address)
        .map_err(|e| AmcError::hardware_error(format!("Cannot unbind from vfio-pci: {e}")))?;

    let bind = "/sys/bus/pci/drivers/amc525_mbf/bind";
    if Path::new(bind).exists() {
        std::fs::write(bind, pcie_address)
            .map_err(|e| AmcError::hardware_error(format!("Cannot bind to amc525_mbf: {e}")))?;
        tracing::info!("{pcie_address} re-bound to amc525_mbf");
    } else {
        tracing::info!("{pcie_address} unbound (amc525_mbf not loaded)");
    }

    Ok(())
}

/// Find the IOMMU group number for a PCIe device.
///
/// Reads the `/sys/bus/pci/devices/{addr}/iommu_group` symlink.
///
/// # Errors
///
/// Returns `VfioSetup` if the symlink cannot be read or parsed.
pub fn iommu_group(pcie_address: &str) -> Result<u32> {
    let link = format!("/sys/bus/pci/devices/{pcie_address}/iommu_group");
    let target = std::fs::read_link(&link).map_err(|e| {
        AmcError::vfio(format!(
            "Cannot read IOMMU group for {pcie_address}: {e}. Is IOMMU enabled?"
        ))
    })?;
    parse_group(&target)
}

fn parse_group(target: &Path) -> Result<u32> {
    let group = target
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| AmcError::vfio(format!("Cannot parse IOMMU group from {target:?}")))?;
    tracing::debug!("IOMMU group {group}");
    Ok(group)
}
