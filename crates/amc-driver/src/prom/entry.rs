//! Typed device table entries

use crate::error::{AmcError, Result};
use amc_chip::prom::{perm, tag, DMA_EXTENDED_FIXED_SIZE, DMA_FIXED_SIZE};

/// Entry tags understood by this driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// End marker carrying the checksum
    End = tag::END,
    /// Device description
    Device = tag::DEVICE,
    /// DMA region, 48-bit base
    Dma = tag::DMA,
    /// DMA region, 64-bit base and length
    DmaExtended = tag::DMA_EXTENDED,
    /// DMA addressing width
    DmaMask = tag::DMA_MASK,
    /// DMA alignment shift
    DmaAlign = tag::DMA_ALIGN,
}

impl TryFrom<u8> for Tag {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            tag::END => Ok(Self::End),
            tag::DEVICE => Ok(Self::Device),
            tag::DMA => Ok(Self::Dma),
            tag::DMA_EXTENDED => Ok(Self::DmaExtended),
            tag::DMA_MASK => Ok(Self::DmaMask),
            tag::DMA_ALIGN => Ok(Self::DmaAlign),
            other => Err(other),
        }
    }
}

impl From<Tag> for u8 {
    fn from(tag: Tag) -> Self {
        tag as u8
    }
}

/// Access permissions of a DMA region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Permissions(u8);

impl Permissions {
    /// Region may be written
    pub const WRITE: Self = Self(perm::WRITE);
    /// Region may be read
    pub const READ: Self = Self(perm::READ);
    /// Region may be read and written
    pub const READ_WRITE: Self = Self(perm::READ | perm::WRITE);

    /// Wrap a raw permission byte, keeping unknown bits
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw permission byte
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether reads are permitted
    pub const fn can_read(self) -> bool {
        self.0 & perm::READ != 0
    }

    /// Whether writes are permitted
    pub const fn can_write(self) -> bool {
        self.0 & perm::WRITE != 0
    }
}

impl std::ops::BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = if self.can_read() { 'r' } else { '-' };
        let w = if self.can_write() { 'w' } else { '-' };
        write!(f, "{r}{w}")
    }
}

/// Device description entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Device name, used as the prefix of every node name
    pub name: String,
}

/// A DMA-reachable region of card memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaRegion {
    /// Card address of the first byte
    pub base: u64,
    /// Length in bytes
    pub length: u64,
    /// Permitted accesses
    pub permissions: Permissions,
    /// Region name, used as the node name suffix
    pub name: String,
}

impl DmaRegion {
    /// One past the last card address, `None` if the region wraps
    pub const fn end(&self) -> Option<u64> {
        self.base.checked_add(self.length)
    }
}

/// One record of the device table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// Device description
    Device(DeviceEntry),
    /// DMA region with a 48-bit base and 32-bit length
    Dma(DmaRegion),
    /// DMA region with a 64-bit base and length
    DmaExtended(DmaRegion),
    /// DMA addressing width in bits, applies to the whole card
    DmaMask(u8),
    /// log2 of the required alignment for every transfer
    DmaAlign(u8),
    /// A tag outside the known set, carried opaquely
    Unknown {
        /// Raw tag byte
        tag: u8,
        /// Raw payload
        payload: Vec<u8>,
    },
}

impl Entry {
    /// Decode the payload of the record at `offset`
    ///
    /// # Errors
    ///
    /// Returns `MalformedEntry` if the payload is shorter than the variant's
    /// fixed fields.
    pub(crate) fn decode(offset: usize, raw_tag: u8, payload: &[u8]) -> Result<Self> {
        let Ok(tag) = Tag::try_from(raw_tag) else {
            tracing::debug!("Opaque entry tag {raw_tag:#04x} at offset {offset}");
            return Ok(Self::Unknown {
                tag: raw_tag,
                payload: payload.to_vec(),
            });
        };

        let entry = match tag {
            Tag::Device => Self::Device(DeviceEntry {
                name: c_name(payload),
            }),
            Tag::Dma => {
                require(offset, raw_tag, payload, DMA_FIXED_SIZE)?;
                let word = |i: usize| u64::from(u16::from_le_bytes([payload[i], payload[i + 1]]));
                let base = word(0) | (word(2) << 16) | (word(4) << 32);
                let length = u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]);
                Self::Dma(DmaRegion {
                    base,
                    length: u64::from(length),
                    permissions: Permissions::from_bits(payload[10]),
                    name: c_name(&payload[DMA_FIXED_SIZE..]),
                })
            }
            Tag::DmaExtended => {
                require(offset, raw_tag, payload, DMA_EXTENDED_FIXED_SIZE)?;
                let mut base = [0u8; 8];
                let mut length = [0u8; 8];
                base.copy_from_slice(&payload[0..8]);
                length.copy_from_slice(&payload[8..16]);
                Self::DmaExtended(DmaRegion {
                    base: u64::from_le_bytes(base),
                    length: u64::from_le_bytes(length),
                    permissions: Permissions::from_bits(payload[16]),
                    name: c_name(&payload[DMA_EXTENDED_FIXED_SIZE..]),
                })
            }
            Tag::DmaMask => {
                require(offset, raw_tag, payload, 1)?;
                Self::DmaMask(payload[0])
            }
            Tag::DmaAlign => {
                require(offset, raw_tag, payload, 1)?;
                Self::DmaAlign(payload[0])
            }
            Tag::End => {
                return Err(AmcError::malformed(
                    offset,
                    raw_tag,
                    "end marker cannot be decoded as an entry",
                ))
            }
        };
        Ok(entry)
    }

    /// Raw tag byte of this entry
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Device(_) => tag::DEVICE,
            Self::Dma(_) => tag::DMA,
            Self::DmaExtended(_) => tag::DMA_EXTENDED,
            Self::DmaMask(_) => tag::DMA_MASK,
            Self::DmaAlign(_) => tag::DMA_ALIGN,
            Self::Unknown { tag, .. } => *tag,
        }
    }

    /// Whether the driver creates a device node for this entry
    pub const fn requires_minor(&self) -> bool {
        matches!(self, Self::Device(_) | Self::Dma(_) | Self::DmaExtended(_))
    }

    /// Whether this entry describes a DMA region
    pub const fn is_dma(&self) -> bool {
        matches!(self, Self::Dma(_) | Self::DmaExtended(_))
    }

    /// The DMA region carried by a `Dma` or `DmaExtended` entry
    pub const fn dma_region(&self) -> Option<&DmaRegion> {
        match self {
            Self::Dma(region) | Self::DmaExtended(region) => Some(region),
            _ => None,
        }
    }

    /// Name carried by device and DMA entries
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Device(dev) => Some(&dev.name),
            Self::Dma(region) | Self::DmaExtended(region) => Some(&region.name),
            _ => None,
        }
    }
}

fn require(offset: usize, tag: u8, payload: &[u8], min: usize) -> Result<()> {
    if payload.len() < min {
        return Err(AmcError::malformed(
            offset,
            tag,
            format!("payload of {} bytes, need at least {min}", payload.len()),
        ));
    }
    Ok(())
}

/// Names are NUL terminated; a missing terminator ends at the payload end.
fn c_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_device() {
        let entry = Entry::decode(5, tag::DEVICE, b"test_dev\0").unwrap();
        assert_eq!(
            entry,
            Entry::Device(DeviceEntry {
                name: "test_dev".into()
            })
        );
        assert!(entry.requires_minor());
        assert!(!entry.is_dma());
    }

    #[test]
    fn decode_dma_48bit_base() {
        let payload = b"\x14\x13\x12\x11\x10\x80\x94\x93\x92\x91\x04test_name\0";
        let entry = Entry::decode(5, tag::DMA, payload).unwrap();
        let region = entry.dma_region().unwrap();
        assert_eq!(region.base, 0x8010_1112_1314);
        assert_eq!(region.length, 0x9192_9394);
        assert_eq!(region.permissions, Permissions::READ);
        assert_eq!(region.name, "test_name");
    }

    #[test]
    fn decode_dma_extended() {
        let payload = b"\x00\x01\x02\x03\x04\x05\x06\x07\
                        \x0f\x0e\x0d\x0c\x0b\x0a\x09\x08\x06test_name\0";
        let entry = Entry::decode(5, tag::DMA_EXTENDED, payload).unwrap();
        let Entry::DmaExtended(region) = entry else {
            panic!("expected extended entry");
        };
        assert_eq!(region.base, 0x0706_0504_0302_0100);
        assert_eq!(region.length, 0x0809_0a0b_0c0d_0e0f);
        assert_eq!(region.permissions, Permissions::READ_WRITE);
    }

    #[test]
    fn short_payloads_rejected() {
        let err = Entry::decode(9, tag::DMA, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, AmcError::MalformedEntry { offset: 9, tag: 2, .. }));
        assert!(Entry::decode(9, tag::DMA_EXTENDED, &[0u8; 16]).is_err());
        assert!(Entry::decode(9, tag::DMA_MASK, &[]).is_err());
        assert!(Entry::decode(9, tag::DMA_ALIGN, &[]).is_err());
    }

    #[test]
    fn unknown_tags_are_opaque() {
        let entry = Entry::decode(5, 0x42, b"xyz").unwrap();
        assert_eq!(entry.tag(), 0x42);
        assert!(!entry.requires_minor());
        assert_eq!(entry.name(), None);
    }

    #[test]
    fn missing_terminator_uses_whole_payload() {
        let entry = Entry::decode(5, tag::DEVICE, b"abc").unwrap();
        assert_eq!(entry.name(), Some("abc"));
    }

    #[test]
    fn permissions_display() {
        assert_eq!(Permissions::READ.to_string(), "r-");
        assert_eq!(Permissions::READ_WRITE.to_string(), "rw");
        assert_eq!((Permissions::WRITE | Permissions::READ).bits(), 6);
    }
}
