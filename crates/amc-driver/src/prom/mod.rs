//! Device table ("PROM") parser
//!
//! The card describes itself with a table of tagged, variable-length records
//! held in a 4 KB window of the control BAR. Everything the driver creates
//! (device nodes, the DMA engine's alignment and addressing width) is derived
//! from this table, so it is validated completely before anything trusts it:
//!
//! 1. version byte
//! 2. entry walk, bounds-checked on every advance
//! 3. end marker present, with a 2 or 3 byte checksum payload
//! 4. ones' complement checksum over the consumed span is zero
//! 5. every known entry decodes into its typed variant
//!
//! A card whose window does not start with the magic gets the built-in
//! [`DEFAULT_TABLE`] instead.
//!
//! ```
//! use amc_driver::prom::{PromTable, Tag};
//!
//! let table = PromTable::load(None)?;
//! assert!(table.is_default());
//! for entry in table.entries() {
//!     println!("{:?}", entry.name());
//! }
//! assert!(table.find_entry_by_tag(Tag::DmaMask).is_none());
//! # Ok::<(), amc_driver::AmcError>(())
//! ```

mod builder;
mod entry;

pub use builder::{to_coe, TableBuilder};
pub use entry::{DeviceEntry, DmaRegion, Entry, Permissions, Tag};

use crate::checksum::checksum16;
use crate::error::{AmcError, Result};
use amc_chip::prom::{
    tag, CHECKSUM_SIZE, DEFAULT_DMA_ALIGNMENT_SHIFT, DEFAULT_DMA_MASK, ENTRY_HEADER_SIZE,
    FIRST_ENTRY_OFFSET, MAGIC, MAX_LENGTH, VERSION, VERSION_OFFSET,
};

/// Built-in table used when the card carries none.
///
/// Describes the `amc525_mbf` firmware: the register device and the two DDR
/// banks, both read-only.
pub const DEFAULT_TABLE: &[u8] = b"DIAG\x01\
    \x01\x0bamc525_mbf\x00\
    \x02\x10\x00\x00\x00\x00\x00\x80\x00\x00\x00\x80\x04ddr0\x00\
    \x02\x10\x00\x00\x00\x80\x00\x80\x00\x00\x00\x08\x04ddr1\x00\
    \x00\x02\x89\xde";

/// Word-addressed view of card memory holding the table.
///
/// Card memory can only be read in aligned 32-bit words.
pub trait PromSource {
    /// Read the 32-bit word at byte `offset` (a multiple of 4)
    fn read32(&self, offset: usize) -> u32;
}

/// A byte slice stands in for card memory; bytes past the end read as zero.
impl PromSource for [u8] {
    fn read32(&self, offset: usize) -> u32 {
        let mut word = [0u8; 4];
        for (i, byte) in word.iter_mut().enumerate() {
            *byte = self.get(offset + i).copied().unwrap_or(0);
        }
        u32::from_le_bytes(word)
    }
}

impl PromSource for Vec<u8> {
    fn read32(&self, offset: usize) -> u32 {
        self.as_slice().read32(offset)
    }
}

/// Copy `buf.len()` bytes of card memory starting at `offset`.
///
/// Reads whole words and keeps only the requested bytes. The read is limited
/// to the table window; the number of bytes copied is returned.
///
/// # Errors
///
/// Returns `OutOfRange` if `offset` lies beyond the window.
pub fn read_window<S: PromSource + ?Sized>(
    source: &S,
    offset: usize,
    buf: &mut [u8],
) -> Result<usize> {
    if offset > MAX_LENGTH {
        return Err(AmcError::OutOfRange {
            offset: offset as u64,
            limit: MAX_LENGTH as u64,
        });
    }
    let count = buf.len().min(MAX_LENGTH - offset);
    let mut copied = 0;
    while copied < count {
        let addr = offset + copied;
        let aligned = addr & !3;
        let word = source.read32(aligned).to_le_bytes();
        let skip = addr - aligned;
        let take = (4 - skip).min(count - copied);
        buf[copied..copied + take].copy_from_slice(&word[skip..skip + take]);
        copied += take;
    }
    Ok(count)
}

/// DMA engine parameters carried by the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSettings {
    /// log2 of the alignment every transfer must respect
    pub alignment_shift: u8,
    /// Number of usable bits in a DMA address
    pub dma_mask: u8,
}

impl Default for DmaSettings {
    fn default() -> Self {
        Self {
            alignment_shift: DEFAULT_DMA_ALIGNMENT_SHIFT,
            dma_mask: DEFAULT_DMA_MASK,
        }
    }
}

impl DmaSettings {
    /// Alignment in bytes
    pub const fn alignment(&self) -> usize {
        1usize << self.alignment_shift
    }
}

/// A validated, immutable device table
#[derive(Debug, Clone)]
pub struct PromTable {
    buffer: Vec<u8>,
    data_len: usize,
    entries: Vec<Entry>,
    offsets: Vec<usize>,
    dma_nentries: usize,
    nentries_with_minor: usize,
    from_default: bool,
}

impl PromTable {
    /// Load the table from card memory.
    ///
    /// If `source` is absent, or its first word is not the magic, the
    /// built-in [`DEFAULT_TABLE`] is used instead.
    ///
    /// # Errors
    ///
    /// Returns a validation error (`UnsupportedVersion`, `TruncatedTable`,
    /// `MalformedEntry` or `ChecksumMismatch`); no table is produced.
    pub fn load(source: Option<&dyn PromSource>) -> Result<Self> {
        let mut buffer = vec![0u8; MAX_LENGTH];
        let from_default = match source {
            Some(source) if source.read32(0).to_le_bytes() == MAGIC => {
                let count = read_window(source, 0, &mut buffer)?;
                if count != MAX_LENGTH {
                    return Err(AmcError::hardware_error("Could not read PROM"));
                }
                false
            }
            _ => {
                tracing::info!("PROM memory not found, falling back to default");
                buffer[..DEFAULT_TABLE.len()].copy_from_slice(DEFAULT_TABLE);
                true
            }
        };
        Self::parse(buffer, from_default)
    }

    /// Validate a table held in memory. The magic is not checked.
    ///
    /// Shorter blobs are zero padded to the window size.
    ///
    /// # Errors
    ///
    /// Returns `TruncatedTable` if `bytes` is longer than the window, or any
    /// validation error from [`PromTable::load`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_LENGTH {
            return Err(AmcError::truncated(
                MAX_LENGTH,
                format!("table of {} bytes exceeds {MAX_LENGTH}", bytes.len()),
            ));
        }
        let mut buffer = vec![0u8; MAX_LENGTH];
        buffer[..bytes.len()].copy_from_slice(bytes);
        Self::parse(buffer, false)
    }

    fn parse(buffer: Vec<u8>, from_default: bool) -> Result<Self> {
        let version = buffer[VERSION_OFFSET];
        if version != VERSION {
            tracing::error!("PROM version {version} is not supported");
            return Err(AmcError::UnsupportedVersion {
                found: version,
                expected: VERSION,
            });
        }

        // Walk the records without trusting any of them
        let mut records = Vec::new();
        let mut offset = FIRST_ENTRY_OFFSET;
        let data_len = loop {
            if offset + ENTRY_HEADER_SIZE > MAX_LENGTH {
                return Err(AmcError::truncated(offset, "PROM end marker not found"));
            }
            let raw_tag = buffer[offset];
            let size = usize::from(buffer[offset + 1]);
            let end = offset + ENTRY_HEADER_SIZE + size;
            if end > MAX_LENGTH {
                return Err(AmcError::truncated(
                    offset,
                    format!("entry of {size} bytes runs past the end of the table"),
                ));
            }
            if raw_tag == tag::END {
                if size != CHECKSUM_SIZE && size != CHECKSUM_SIZE + 1 {
                    return Err(AmcError::truncated(
                        offset,
                        format!("end marker of {size} bytes, expected 2 or 3"),
                    ));
                }
                // The window always keeps at least one byte past the table
                if end >= MAX_LENGTH {
                    return Err(AmcError::truncated(offset, "end marker fills the whole window"));
                }
                break end;
            }
            records.push((offset, raw_tag, offset + ENTRY_HEADER_SIZE..end));
            offset = end;
        };

        let residual = checksum16(&buffer[..data_len]);
        if residual != 0 {
            tracing::error!("Invalid PROM data: checksum residual {residual:#06x}");
            return Err(AmcError::ChecksumMismatch {
                residual,
                length: data_len,
            });
        }

        let mut entries = Vec::with_capacity(records.len());
        let mut offsets = Vec::with_capacity(records.len());
        for (offset, raw_tag, payload) in records {
            entries.push(Entry::decode(offset, raw_tag, &buffer[payload])?);
            offsets.push(offset);
        }

        let dma_nentries = entries.iter().filter(|e| e.is_dma()).count();
        let nentries_with_minor = entries.iter().filter(|e| e.requires_minor()).count();

        tracing::debug!(
            "PROM: {} entries, {dma_nentries} DMA, {nentries_with_minor} with minor, {data_len} bytes",
            entries.len()
        );

        Ok(Self {
            buffer,
            data_len,
            entries,
            offsets,
            dma_nentries,
            nentries_with_minor,
            from_default,
        })
    }

    /// Entries in table order, end marker excluded
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            inner: self.entries.iter(),
        }
    }

    /// Entry at position `index` over all entries
    pub fn find_entry(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    /// Entry at position `index` counting only entries that get a device node
    pub fn find_entry_requiring_minor(&self, index: usize) -> Option<&Entry> {
        self.entries.iter().filter(|e| e.requires_minor()).nth(index)
    }

    /// First entry with the given tag
    pub fn find_entry_by_tag(&self, tag: Tag) -> Option<&Entry> {
        let raw = u8::from(tag);
        self.entries.iter().find(|e| e.tag() == raw)
    }

    /// Byte offset of the entry at position `index`
    pub fn entry_offset(&self, index: usize) -> Option<usize> {
        self.offsets.get(index).copied()
    }

    /// Number of entries
    pub fn nentries(&self) -> usize {
        self.entries.len()
    }

    /// Number of DMA and DMA-Extended entries
    pub const fn dma_nentries(&self) -> usize {
        self.dma_nentries
    }

    /// Number of entries that get a device node
    pub const fn nentries_with_minor(&self) -> usize {
        self.nentries_with_minor
    }

    /// Whether the card exposes any DMA region
    pub const fn has_dma(&self) -> bool {
        self.dma_nentries > 0
    }

    /// Whether the built-in table was substituted
    pub const fn is_default(&self) -> bool {
        self.from_default
    }

    /// The validated span, header through end marker
    pub fn raw_bytes(&self) -> &[u8] {
        &self.buffer[..self.data_len]
    }

    /// Length of the validated span
    pub const fn raw_length(&self) -> usize {
        self.data_len
    }

    /// The whole window as loaded, including bytes after the end marker
    pub fn full_buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Diagnostic read-back of the loaded window.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `offset` lies beyond the window.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        read_window(self.buffer.as_slice(), offset, buf)
    }

    /// DMA alignment and addressing width, defaulted where absent
    pub fn dma_settings(&self) -> DmaSettings {
        let mut settings = DmaSettings::default();
        if let Some(Entry::DmaMask(bits)) = self.find_entry_by_tag(Tag::DmaMask) {
            settings.dma_mask = *bits;
        }
        if let Some(Entry::DmaAlign(shift)) = self.find_entry_by_tag(Tag::DmaAlign) {
            settings.alignment_shift = *shift;
        }
        settings
    }
}

/// Iterator over the entries of a [`PromTable`]
#[derive(Debug, Clone)]
pub struct Entries<'a> {
    inner: std::slice::Iter<'a, Entry>,
}

impl<'a> Iterator for Entries<'a> {
    type Item = &'a Entry;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Entries<'_> {}

impl std::iter::FusedIterator for Entries<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Device, three DMA regions; mirrors the firmware test asset
    fn test_table() -> Vec<u8> {
        let mut builder = TableBuilder::new();
        builder.device("test_dev").unwrap();
        builder
            .memory_region("memA", 0, 0x1213_1415, Permissions::READ)
            .unwrap();
        builder
            .memory_region("memB", 0xabcd_1122_3344, 0x0891_2345, Permissions::WRITE)
            .unwrap();
        builder
            .memory_region("memC", 0x4261_6263, 0x100, Permissions::READ_WRITE)
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn load_validation_ok() {
        let bytes = test_table();
        let table = PromTable::load(Some(&bytes)).unwrap();
        assert!(!table.is_default());
        assert_eq!(table.raw_bytes(), bytes.as_slice());
        assert_eq!(table.raw_length(), bytes.len());
        assert_eq!(checksum16(table.raw_bytes()), 0);
    }

    #[test]
    fn missing_magic_falls_back_to_default() {
        let mut bytes = test_table();
        bytes[0] = b'X';
        let table = PromTable::load(Some(&bytes)).unwrap();
        assert!(table.is_default());
        assert_eq!(table.raw_bytes(), DEFAULT_TABLE);
    }

    #[test]
    fn default_table_contents() {
        let table = PromTable::load(None).unwrap();
        assert_eq!(table.nentries(), 3);
        assert_eq!(table.dma_nentries(), 2);
        assert_eq!(table.nentries_with_minor(), 3);
        assert_eq!(table.find_entry(0).and_then(Entry::name), Some("amc525_mbf"));

        let ddr0 = table.find_entry(1).and_then(Entry::dma_region).unwrap();
        assert_eq!(ddr0.name, "ddr0");
        assert_eq!(ddr0.base, 0x8000_0000_0000);
        assert_eq!(ddr0.length, 0x8000_0000);
        assert_eq!(ddr0.permissions, Permissions::READ);

        let ddr1 = table.find_entry(2).and_then(Entry::dma_region).unwrap();
        assert_eq!(ddr1.name, "ddr1");
        assert_eq!(ddr1.base, 0x8000_8000_0000);
        assert_eq!(ddr1.length, 0x0800_0000);

        let settings = table.dma_settings();
        assert_eq!(settings, DmaSettings::default());
        assert!(ddr0.length < 1u64 << settings.dma_mask);
    }

    #[test]
    fn entries_walk_in_order() {
        let table = PromTable::from_bytes(&test_table()).unwrap();
        let names: Vec<_> = table.entries().filter_map(Entry::name).collect();
        assert_eq!(names, ["test_dev", "memA", "memB", "memC"]);

        let regions: Vec<_> = table.entries().filter_map(Entry::dma_region).collect();
        assert_eq!(regions[1].base, 0xabcd_1122_3344);
        assert_eq!(regions[1].length, 0x0891_2345);
        assert_eq!(regions[1].permissions, Permissions::WRITE);
        assert_eq!(regions[2].base, 0x4261_6263);
        assert_eq!(regions[2].permissions.bits(), 6);
    }

    #[test]
    fn entries_is_restartable_and_exact() {
        let table = PromTable::from_bytes(&test_table()).unwrap();
        let iter = table.entries();
        assert_eq!(iter.len(), table.nentries());
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        assert_eq!(first, second);
        assert!(table.entries().all(|e| e.tag() != tag::END));
    }

    #[test]
    fn find_entry_matches_iteration() {
        let table = PromTable::from_bytes(&test_table()).unwrap();
        for (i, entry) in table.entries().enumerate() {
            assert_eq!(table.find_entry(i), Some(entry));
        }
        assert!(table.find_entry(table.nentries()).is_none());
    }

    #[test]
    fn find_entry_requiring_minor_skips_config_entries() {
        let mut builder = TableBuilder::new();
        builder.dma_mask(64).dma_align(6);
        builder.device("card").unwrap();
        builder.raw_entry(0x42, b"opaque").unwrap();
        builder
            .memory_region("a", 0, 0x1000, Permissions::READ)
            .unwrap();
        builder
            .memory_region("b", 0x1000, 0x1000, Permissions::READ)
            .unwrap();
        let table = PromTable::from_bytes(&builder.build().unwrap()).unwrap();

        assert_eq!(table.nentries(), 6);
        assert_eq!(table.nentries_with_minor(), 3);
        assert_eq!(table.find_entry_requiring_minor(0).and_then(Entry::name), Some("card"));
        assert_eq!(table.find_entry_requiring_minor(1).and_then(Entry::name), Some("a"));
        assert_eq!(table.find_entry_requiring_minor(2).and_then(Entry::name), Some("b"));
        assert!(table.find_entry_requiring_minor(3).is_none());
    }

    #[test]
    fn config_entries_override_defaults() {
        let mut builder = TableBuilder::new();
        builder.dma_mask(64).dma_align(6);
        builder.device("card").unwrap();
        builder
            .memory_region("ddr", 0, 0x4000, Permissions::READ_WRITE)
            .unwrap();
        let table = PromTable::from_bytes(&builder.build().unwrap()).unwrap();

        assert_eq!(table.find_entry_by_tag(Tag::DmaMask), Some(&Entry::DmaMask(64)));
        assert_eq!(table.find_entry_by_tag(Tag::DmaAlign), Some(&Entry::DmaAlign(6)));
        let settings = table.dma_settings();
        assert_eq!(settings.dma_mask, 64);
        assert_eq!(settings.alignment(), 64);
    }

    #[test]
    fn register_only_table_is_valid() {
        let mut builder = TableBuilder::new();
        builder.device("regs").unwrap();
        let table = PromTable::from_bytes(&builder.build().unwrap()).unwrap();
        assert!(!table.has_dma());
        assert_eq!(table.nentries_with_minor(), 1);
    }

    #[test]
    fn bad_version_rejected() {
        let mut bytes = test_table();
        bytes[VERSION_OFFSET] = 2;
        assert!(matches!(
            PromTable::from_bytes(&bytes),
            Err(AmcError::UnsupportedVersion { found: 2, expected: 1 })
        ));
    }

    #[test]
    fn checksum_corruption_rejected() {
        let mut bytes = test_table();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            PromTable::from_bytes(&bytes),
            Err(AmcError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn every_single_byte_corruption_rejected() {
        let bytes = test_table();
        for i in VERSION_OFFSET..bytes.len() {
            for flip in [0x01u8, 0x80, 0xff] {
                let mut corrupt = bytes.clone();
                corrupt[i] ^= flip;
                let result = PromTable::from_bytes(&corrupt);
                assert!(
                    result.as_ref().is_err_and(AmcError::is_table_error),
                    "corrupting byte {i} with {flip:#04x} was accepted"
                );
            }
        }
    }

    #[test]
    fn missing_end_marker_is_truncated() {
        // Records of 255-byte padding entries fill the window with no end tag
        let mut bytes = vec![0u8; MAX_LENGTH];
        bytes[..4].copy_from_slice(&MAGIC);
        bytes[VERSION_OFFSET] = VERSION;
        let mut offset = FIRST_ENTRY_OFFSET;
        while offset + 2 <= MAX_LENGTH {
            bytes[offset] = 0x7f;
            bytes[offset + 1] = 0xff;
            offset += 257;
        }
        assert!(matches!(
            PromTable::from_bytes(&bytes),
            Err(AmcError::TruncatedTable { .. })
        ));
    }

    /// Valid table of opaque padding entries whose end marker finishes at `end`
    fn padded_table(end: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; MAX_LENGTH];
        bytes[..4].copy_from_slice(&MAGIC);
        bytes[VERSION_OFFSET] = VERSION;
        let mut offset = FIRST_ENTRY_OFFSET;
        let body_end = end - ENTRY_HEADER_SIZE - CHECKSUM_SIZE;
        while offset < body_end {
            let size = (body_end - offset - ENTRY_HEADER_SIZE).min(255);
            bytes[offset] = 0x7f;
            bytes[offset + 1] = u8::try_from(size).unwrap();
            offset += ENTRY_HEADER_SIZE + size;
        }
        assert_eq!(offset, body_end);
        bytes[offset..offset + 2].copy_from_slice(&[tag::END, 2]);
        let trailer = checksum16(&bytes[..end]);
        bytes[end - 2..end].copy_from_slice(&trailer.to_le_bytes());
        bytes
    }

    #[test]
    fn end_marker_must_leave_room_in_window() {
        let fits = PromTable::from_bytes(&padded_table(MAX_LENGTH - 2)).unwrap();
        assert_eq!(fits.raw_length(), MAX_LENGTH - 2);

        assert!(matches!(
            PromTable::from_bytes(&padded_table(MAX_LENGTH)),
            Err(AmcError::TruncatedTable { .. })
        ));
    }

    #[test]
    fn bad_end_marker_size_is_truncated() {
        let mut bytes = b"DIAG\x01\x00\x04\x00\x00\x00\x00".to_vec();
        bytes.resize(32, 0);
        assert!(matches!(
            PromTable::from_bytes(&bytes),
            Err(AmcError::TruncatedTable { offset: 5, .. })
        ));
    }

    #[test]
    fn oversize_blob_rejected() {
        let bytes = vec![0u8; MAX_LENGTH + 1];
        assert!(matches!(
            PromTable::from_bytes(&bytes),
            Err(AmcError::TruncatedTable { .. })
        ));
    }

    #[test]
    fn read_window_handles_unaligned_spans() {
        let bytes = test_table();
        let mut out = [0u8; 7];
        let n = read_window(bytes.as_slice(), 3, &mut out).unwrap();
        assert_eq!(n, 7);
        assert_eq!(&out, &bytes[3..10]);

        let mut tail = [0u8; 16];
        assert_eq!(read_window(bytes.as_slice(), MAX_LENGTH - 5, &mut tail).unwrap(), 5);
        assert!(read_window(bytes.as_slice(), MAX_LENGTH + 1, &mut tail).is_err());
    }

    #[test]
    fn read_at_returns_loaded_window() {
        let table = PromTable::load(None).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(table.read_at(0, &mut out).unwrap(), 8);
        assert_eq!(&out, b"DIAG\x01\x01\x0ba");
        assert_eq!(table.full_buffer().len(), MAX_LENGTH);
    }
}
