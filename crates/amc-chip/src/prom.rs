//! Binary format of the device table ("PROM").
//!
//! The firmware exposes a 4 KB window of self-describing records in the
//! control BAR. Layout:
//!
//! ```text
//! offset 0   "DIAG"                       magic, only checked on hardware
//! offset 4   version                      must equal VERSION
//! offset 5   [tag:1][size:1][payload]...  entries, contiguous
//!            [0][2 or 3][checksum]        end marker
//! ```
//!
//! The next entry is always at `offset + size + 2`. The 16-bit ones'
//! complement checksum over everything from offset 0 up to and including the
//! end marker is zero.
//!
//! All multi-byte fields are little-endian.

/// Magic bytes at the start of a table in card memory.
pub const MAGIC: [u8; 4] = *b"DIAG";

/// The only table version this driver understands.
pub const VERSION: u8 = 1;

/// Offset of the version byte.
pub const VERSION_OFFSET: usize = 4;

/// Offset of the first entry.
pub const FIRST_ENTRY_OFFSET: usize = 5;

/// Maximum table length in bytes.
pub const MAX_LENGTH: usize = 4096;

/// Size of the tag and size bytes preceding every payload.
pub const ENTRY_HEADER_SIZE: usize = 2;

/// Size of the checksum carried by the end marker.
pub const CHECKSUM_SIZE: usize = 2;

/// Tag values.
pub mod tag {
    /// End marker carrying the checksum.
    pub const END: u8 = 0;
    /// Device description, name only.
    pub const DEVICE: u8 = 1;
    /// DMA region with a 48-bit base and 32-bit length.
    pub const DMA: u8 = 2;
    /// DMA region with 64-bit base and length.
    pub const DMA_EXTENDED: u8 = 3;
    /// DMA addressing width in bits.
    pub const DMA_MASK: u8 = 4;
    /// log2 of the required DMA alignment.
    pub const DMA_ALIGN: u8 = 5;
}

/// Permission bits of a DMA region.
pub mod perm {
    /// Region may be written.
    pub const WRITE: u8 = 2;
    /// Region may be read.
    pub const READ: u8 = 4;
}

/// `DMA` payload: 3×u16 base, u32 length, u8 permissions, then the name.
pub const DMA_FIXED_SIZE: usize = 6 + 4 + 1;

/// `DMA-Extended` payload: u64 base, u64 length, u8 permissions, then the name.
pub const DMA_EXTENDED_FIXED_SIZE: usize = 8 + 8 + 1;

/// Bases at or above this need a `DMA-Extended` entry.
pub const DMA_BASE_LIMIT: u64 = 1 << 48;

/// Default DMA addressing width when the table has no `DMA-Mask` entry.
pub const DEFAULT_DMA_MASK: u8 = 47;

/// Default alignment shift when the table has no `DMA-Align` entry.
///
/// All DMA transfers must be 32-byte aligned. If this is violated the DMA
/// engine locks up without reporting an error.
pub const DEFAULT_DMA_ALIGNMENT_SHIFT: u8 = 5;
