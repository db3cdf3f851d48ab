//! Card attach, device nodes and endpoints
//!
//! An attached card exposes one node per table entry that needs one: the
//! register node for the `Device` entry and a memory node per DMA region.
//! Opening a node yields an [`Endpoint`]; every endpoint holds a ticket on the
//! card's [`ClientGate`], so [`AmcCard::shutdown`] can wait for all users to
//! leave before the DMA engine and its buffer are released.

use crate::config::DriverConfig;
use crate::dma::{DmaControl, Direction, HostBuffer};
use crate::error::{AmcError, Result};
use crate::locking::{OpenerId, RegisterLocking};
use crate::mmio::{RegisterBank, RegisterWindow};
use crate::prom::{DmaRegion, Entry, PromTable};
use amc_chip::bar::{CDMA_OFFSET, PROM_OFFSET};
use std::io::SeekFrom;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// What a device node gives access to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The register BAR
    Registers,
    /// A DMA region of card memory
    Memory(DmaRegion),
}

/// One device node of a card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Minor number within the card
    pub minor: usize,
    /// Node name, `{device}.{board}.reg` or `{device}.{board}.{region}`
    pub name: String,
    /// What the node accesses
    pub kind: NodeKind,
}

/// Device nodes derived from a table
#[derive(Debug, Clone, Default)]
pub struct NodeLayout {
    nodes: Vec<Node>,
}

impl NodeLayout {
    /// Derive the nodes for `table` on board `board`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTable` if there is more than one `Device` entry, a DMA
    /// entry precedes it, or a region runs past the end of the address space.
    pub fn build(table: &PromTable, board: usize) -> Result<Self> {
        let mut device: Option<&str> = None;
        let mut nodes = Vec::with_capacity(table.nentries_with_minor());

        for (minor, entry) in table.entries().filter(|e| e.requires_minor()).enumerate() {
            let (name, kind) = match entry {
                Entry::Device(dev) => {
                    if device.is_some() {
                        return Err(AmcError::invalid_table("more than one device entry"));
                    }
                    device = Some(&dev.name);
                    (format!("{}.{board}.reg", dev.name), NodeKind::Registers)
                }
                Entry::Dma(region) | Entry::DmaExtended(region) => {
                    let Some(device) = device else {
                        return Err(AmcError::invalid_table(format!(
                            "DMA entry {} precedes the device entry",
                            region.name
                        )));
                    };
                    if region.end().is_none() {
                        return Err(AmcError::invalid_table(format!(
                            "region {} at {:#x} of {:#x} bytes wraps the address space",
                            region.name, region.base, region.length
                        )));
                    }
                    (
                        format!("{device}.{board}.{}", region.name),
                        NodeKind::Memory(region.clone()),
                    )
                }
                _ => continue,
            };
            nodes.push(Node { minor, name, kind });
        }
        Ok(Self { nodes })
    }

    /// All nodes in minor order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node with the given minor
    pub fn get(&self, minor: usize) -> Option<&Node> {
        self.nodes.get(minor)
    }

    /// Node with the given name
    pub fn find(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[derive(Debug, Default)]
struct GateState {
    clients: usize,
    closing: bool,
}

/// Counts live endpoints and blocks teardown until they are gone
#[derive(Debug, Default)]
pub struct ClientGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl ClientGate {
    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit one client.
    ///
    /// # Errors
    ///
    /// Returns `Detached` once [`ClientGate::close_and_drain`] has started.
    pub fn enter(self: &Arc<Self>) -> Result<Ticket> {
        let mut state = self.state();
        if state.closing {
            return Err(AmcError::Detached);
        }
        state.clients += 1;
        Ok(Ticket {
            gate: Arc::clone(self),
        })
    }

    /// Stop admitting and wait until every ticket has been dropped
    pub fn close_and_drain(&self) {
        let mut state = self.state();
        state.closing = true;
        while state.clients > 0 {
            tracing::debug!("Waiting for {} clients to close", state.clients);
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of admitted clients
    pub fn clients(&self) -> usize {
        self.state().clients
    }

    /// Whether teardown has started
    pub fn is_closing(&self) -> bool {
        self.state().closing
    }
}

/// Proof of admission through a [`ClientGate`]; dropping it leaves
#[derive(Debug)]
pub struct Ticket {
    gate: Arc<ClientGate>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut state = self.gate.state();
        state.clients = state.clients.saturating_sub(1);
        if state.clients == 0 {
            self.gate.drained.notify_all();
        }
    }
}

/// Hardware handed to [`AmcCard::attach`]
#[derive(Debug)]
pub struct CardParts {
    /// Board number, used in node names
    pub board: usize,
    /// BAR2: DMA controller, interrupt controller and device table
    pub control_bar: Arc<dyn RegisterBank>,
    /// BAR0, exposed through the register node
    pub register_bar: Option<Arc<dyn RegisterBank>>,
    /// Host buffer for the DMA engine; required when the table has DMA regions
    pub host_buffer: Option<Box<dyn HostBuffer>>,
}

/// An attached card
#[derive(Debug)]
pub struct AmcCard {
    board: usize,
    prom: PromTable,
    layout: NodeLayout,
    register_bar: Option<Arc<dyn RegisterBank>>,
    dma: Mutex<Option<Arc<DmaControl>>>,
    locking: Arc<RegisterLocking>,
    gate: Arc<ClientGate>,
}

impl AmcCard {
    /// Read the card's table and bring up its DMA engine.
    ///
    /// # Errors
    ///
    /// - any table validation error; nothing is created
    /// - `InvalidTable` if the table needs more nodes than a board has, or
    ///   its entries are out of order
    /// - `InvalidArgument` if the table has DMA regions but no host buffer was
    ///   supplied
    /// - DMA construction errors (`InvalidConfig`, `ResetTimeout`)
    pub fn attach(parts: CardParts, config: &DriverConfig) -> Result<Self> {
        let CardParts {
            board,
            control_bar,
            register_bar,
            host_buffer,
        } = parts;

        let window = RegisterWindow::new(Arc::clone(&control_bar), PROM_OFFSET);
        let prom = PromTable::load(Some(&window))?;
        if prom.nentries_with_minor() > config.max_minors_per_board {
            return Err(AmcError::invalid_table(format!(
                "{} nodes requested, a board has {}",
                prom.nentries_with_minor(),
                config.max_minors_per_board
            )));
        }
        let layout = NodeLayout::build(&prom, board)?;

        let dma = if prom.has_dma() {
            let buffer = host_buffer
                .ok_or_else(|| AmcError::invalid_argument("DMA regions need a host buffer"))?;
            let regs = RegisterWindow::new(control_bar, CDMA_OFFSET);
            let dma = DmaControl::new(regs, buffer, prom.dma_settings(), config.reset_timeout)?;
            Some(Arc::new(dma))
        } else {
            None
        };

        tracing::info!(
            "Attached board {board}: {} nodes, {} DMA regions{}",
            layout.nodes().len(),
            prom.dma_nentries(),
            if prom.is_default() { " (default table)" } else { "" }
        );

        Ok(Self {
            board,
            prom,
            layout,
            register_bar,
            dma: Mutex::new(dma),
            locking: Arc::new(RegisterLocking::new()),
            gate: Arc::new(ClientGate::default()),
        })
    }

    /// Board number
    pub const fn board(&self) -> usize {
        self.board
    }

    /// The validated device table
    pub const fn prom(&self) -> &PromTable {
        &self.prom
    }

    /// Device nodes
    pub fn nodes(&self) -> &[Node] {
        self.layout.nodes()
    }

    /// Node layout
    pub const fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    /// Register interface locking state
    pub fn locking(&self) -> &RegisterLocking {
        &self.locking
    }

    /// Number of open endpoints
    pub fn clients(&self) -> usize {
        self.gate.clients()
    }

    fn dma_slot(&self) -> MutexGuard<'_, Option<Arc<DmaControl>>> {
        self.dma.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The DMA engine, absent without DMA regions or after shutdown
    pub fn dma(&self) -> Option<Arc<DmaControl>> {
        self.dma_slot().clone()
    }

    /// Open the node with the given minor.
    ///
    /// # Errors
    ///
    /// - `InvalidIndex` if there is no such node
    /// - `Detached` once shutdown has started
    pub fn open(&self, minor: usize) -> Result<Endpoint> {
        let node = self.layout.get(minor).ok_or(AmcError::InvalidIndex {
            index: minor,
            count: self.layout.nodes().len(),
        })?;
        let ticket = self.gate.enter()?;

        match &node.kind {
            NodeKind::Registers => Ok(Endpoint::Registers(RegisterEndpoint::open(
                Arc::clone(&self.locking),
                self.register_bar.clone(),
                ticket,
            ))),
            NodeKind::Memory(region) => {
                let dma = self.dma().ok_or(AmcError::Detached)?;
                Ok(Endpoint::Memory(MemoryEndpoint {
                    dma,
                    region: region.clone(),
                    position: 0,
                    _ticket: ticket,
                }))
            }
        }
    }

    /// Open the node with the given name.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` if no node has that name, otherwise as [`AmcCard::open`].
    pub fn open_by_name(&self, name: &str) -> Result<Endpoint> {
        let node = self
            .layout
            .find(name)
            .ok_or_else(|| AmcError::device_not_found(name))?;
        self.open(node.minor)
    }

    /// Forcefully terminate the transfer blocked waiting for completion, or
    /// the next one to wait if none is
    pub fn kill_transfers(&self) {
        if let Some(dma) = self.dma() {
            dma.kill();
        }
    }

    /// Kill the transfer in flight and fail every later one with
    /// `TransferKilled`
    pub fn close_transfers(&self) {
        if let Some(dma) = self.dma() {
            dma.close();
        }
    }

    /// Detach: refuse new opens and transfers, wait for every endpoint to be
    /// dropped, then release the DMA engine and its buffer.
    ///
    /// Blocks for as long as any endpoint is alive.
    pub fn shutdown(&self) {
        tracing::info!("Detaching board {}", self.board);
        self.close_transfers();
        self.gate.close_and_drain();
        if let Some(dma) = self.dma_slot().take() {
            let others = Arc::strong_count(&dma) - 1;
            if others > 0 {
                tracing::warn!("DMA engine still referenced {others} times at detach");
            }
        }
        tracing::info!("Board {} detached", self.board);
    }
}

/// An open device node
#[derive(Debug)]
pub enum Endpoint {
    /// Register node
    Registers(RegisterEndpoint),
    /// Memory node
    Memory(MemoryEndpoint),
}

impl Endpoint {
    /// The register endpoint, if this is one
    pub fn into_registers(self) -> Option<RegisterEndpoint> {
        match self {
            Self::Registers(regs) => Some(regs),
            Self::Memory(_) => None,
        }
    }

    /// The memory endpoint, if this is one
    pub fn into_memory(self) -> Option<MemoryEndpoint> {
        match self {
            Self::Memory(mem) => Some(mem),
            Self::Registers(_) => None,
        }
    }
}

/// Open register node
#[derive(Debug)]
pub struct RegisterEndpoint {
    locking: Arc<RegisterLocking>,
    id: OpenerId,
    bar: Option<Arc<dyn RegisterBank>>,
    _ticket: Ticket,
}

impl RegisterEndpoint {
    fn open(
        locking: Arc<RegisterLocking>,
        bar: Option<Arc<dyn RegisterBank>>,
        ticket: Ticket,
    ) -> Self {
        let id = locking.open();
        Self {
            locking,
            id,
            bar,
            _ticket: ticket,
        }
    }

    /// Identity of this open
    pub const fn opener_id(&self) -> OpenerId {
        self.id
    }

    /// Take exclusive access.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if locked by another opener or the node is shared.
    pub fn lock(&self) -> Result<()> {
        self.locking.acquire_lock(self.id)
    }

    /// Release exclusive access.
    ///
    /// # Errors
    ///
    /// Returns `NotHolder` if this endpoint does not hold the lock.
    pub fn unlock(&self) -> Result<()> {
        self.locking.release_lock(self.id)
    }

    /// Size of the register BAR
    pub fn map_size(&self) -> usize {
        self.bar.as_ref().map_or(0, |bar| bar.size())
    }

    /// Check that `size` bytes at `offset` lie inside the register BAR.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` otherwise.
    pub fn check_map(&self, offset: usize, size: usize) -> Result<()> {
        let limit = self.map_size();
        match offset.checked_add(size) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(AmcError::OutOfRange {
                offset: offset as u64,
                limit: limit as u64,
            }),
        }
    }

    fn bar_at(&self, offset: usize) -> Result<&Arc<dyn RegisterBank>> {
        if offset % 4 != 0 {
            return Err(AmcError::invalid_argument(format!(
                "register offset {offset:#x} is not word aligned"
            )));
        }
        self.check_map(offset, 4)?;
        self.bar
            .as_ref()
            .ok_or_else(|| AmcError::hardware_error("register BAR not mapped"))
    }

    /// Read a register.
    ///
    /// # Errors
    ///
    /// `OutOfRange` or `InvalidArgument` for a bad offset.
    pub fn read32(&self, offset: usize) -> Result<u32> {
        Ok(self.bar_at(offset)?.read32(offset))
    }

    /// Write a register.
    ///
    /// # Errors
    ///
    /// `OutOfRange` or `InvalidArgument` for a bad offset.
    pub fn write32(&self, offset: usize, value: u32) -> Result<()> {
        self.bar_at(offset)?.write32(offset, value);
        Ok(())
    }
}

impl Drop for RegisterEndpoint {
    fn drop(&mut self) {
        self.locking.close(self.id);
    }
}

/// Open memory node: a position within one DMA region
#[derive(Debug)]
pub struct MemoryEndpoint {
    dma: Arc<DmaControl>,
    region: DmaRegion,
    position: u64,
    _ticket: Ticket,
}

impl MemoryEndpoint {
    /// The region this node covers
    pub const fn region(&self) -> &DmaRegion {
        &self.region
    }

    /// Region length in bytes
    pub const fn region_size(&self) -> u64 {
        self.region.length
    }

    /// DMA buffer size, the most one write moves
    pub fn buffer_size(&self) -> usize {
        self.dma.buffer_size()
    }

    /// Current offset within the region
    pub const fn position(&self) -> u64 {
        self.position
    }

    fn check_position(&self) -> Result<Option<u64>> {
        let length = self.region.length;
        if self.position == length {
            return Ok(None);
        }
        if self.position > length {
            return Err(AmcError::OutOfRange {
                offset: self.position,
                limit: length,
            });
        }
        Ok(Some(self.position))
    }

    /// Card address of `offset` and the end of the region
    fn card_span(&self, offset: u64) -> Result<(u64, u64)> {
        let out_of_range = || AmcError::OutOfRange {
            offset,
            limit: self.region.length,
        };
        let address = self.region.base.checked_add(offset).ok_or_else(out_of_range)?;
        let end = self.region.end().ok_or_else(out_of_range)?;
        Ok((address, end))
    }

    fn advance(&mut self, count: usize) {
        self.position += count as u64;
        if self.position >= self.region.length {
            self.position = 0;
        }
    }

    /// Read from the current position into `buf`, returning the bytes read.
    ///
    /// The transfer is widened to aligned boundaries and clamped to the
    /// region and DMA buffer; reaching the end of the region wraps the
    /// position back to zero. Returns 0 at exactly the region end.
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` for a region without read permission
    /// - `OutOfRange` past the region end, or where no aligned transfer fits
    /// - any transfer error
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.region.permissions.can_read() {
            return Err(AmcError::PermissionDenied {
                region: self.region.name.clone(),
                access: "read",
            });
        }
        let Some(offset) = self.check_position()? else {
            return Ok(0);
        };
        if buf.is_empty() {
            return Ok(0);
        }

        let alignment = self.dma.alignment() as u64;
        let low_mask = alignment - 1;
        let in_offset = offset & low_mask;
        let (address, region_end) = self.card_span(offset)?;
        let dma_addr = address - in_offset;
        let mut dma_count = (buf.len() as u64 + in_offset + low_mask) & !low_mask;
        if dma_count > region_end - dma_addr {
            dma_count = (region_end - dma_addr) & !low_mask;
        }
        if dma_count == 0 {
            return Err(AmcError::OutOfRange {
                offset,
                limit: self.region.length,
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let (in_offset, dma_count) = (in_offset as usize, dma_count as usize);
        let mut guard = self.dma.lock();
        let moved = guard.transfer(dma_addr, dma_count, Direction::FromDevice)?;
        let count = buf.len().min(moved - in_offset);
        buf[..count].copy_from_slice(&guard.buffer()[in_offset..in_offset + count]);
        guard.unlock();

        self.advance(count);
        Ok(count)
    }

    /// Write `data` at the current position, returning the bytes written.
    ///
    /// The position and length must satisfy the DMA alignment.
    ///
    /// # Errors
    ///
    /// - `PermissionDenied` for a region without write permission
    /// - `OutOfRange` past the region end
    /// - `InvalidArgument` if `data` overruns the region or DMA buffer
    /// - `MisalignedTransfer` and any other transfer error
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.region.permissions.can_write() {
            return Err(AmcError::PermissionDenied {
                region: self.region.name.clone(),
                access: "write",
            });
        }
        let Some(offset) = self.check_position()? else {
            return Ok(0);
        };
        if data.is_empty() {
            return Ok(0);
        }
        if data.len() as u64 > self.region.length - offset || data.len() > self.buffer_size() {
            return Err(AmcError::invalid_argument(format!(
                "write of {:#x} bytes at {offset:#x} overruns region or buffer",
                data.len()
            )));
        }

        let (address, _) = self.card_span(offset)?;
        let mut guard = self.dma.lock();
        guard.buffer_mut()[..data.len()].copy_from_slice(data);
        let moved = guard.transfer(address, data.len(), Direction::ToDevice)?;
        guard.unlock();

        self.advance(moved);
        Ok(moved)
    }

    /// Move the position, returning the new one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a target before the start or past the
    /// end of the region.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let length = self.region.length;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => length.checked_add_signed(delta),
        };
        match target {
            Some(target) if target <= length => {
                self.position = target;
                Ok(target)
            }
            _ => Err(AmcError::invalid_argument(format!(
                "seek outside region of {length:#x} bytes"
            ))),
        }
    }
}
