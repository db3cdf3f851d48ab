//! Device table generation
//!
//! Used by firmware builds to produce the blob loaded into the table window,
//! and by tests to produce valid and deliberately broken tables.

use super::Permissions;
use crate::checksum::trailer_for;
use crate::error::{AmcError, Result};
use amc_chip::prom::{tag, DMA_BASE_LIMIT, MAGIC, MAX_LENGTH, VERSION};
use std::fmt::Write as _;

/// Incremental writer for a device table
///
/// ```
/// use amc_driver::prom::{Permissions, PromTable, TableBuilder};
///
/// let mut builder = TableBuilder::new();
/// builder.device("amc525_mbf")?;
/// builder.memory_region("ddr0", 0x8000_0000_0000, 0x8000_0000, Permissions::READ)?;
/// let bytes = builder.build()?;
/// assert_eq!(PromTable::from_bytes(&bytes)?.nentries(), 2);
/// # Ok::<(), amc_driver::AmcError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TableBuilder {
    body: Vec<u8>,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Start a table with the magic and version header
    pub fn new() -> Self {
        let mut body = Vec::with_capacity(256);
        body.extend_from_slice(&MAGIC);
        body.push(VERSION);
        Self { body }
    }

    /// Append the device description
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the name does not fit one entry.
    pub fn device(&mut self, name: &str) -> Result<&mut Self> {
        let mut payload = Vec::with_capacity(name.len() + 1);
        push_name(&mut payload, name);
        self.raw_entry(tag::DEVICE, &payload)
    }

    /// Append a memory region description.
    ///
    /// Regions whose base needs more than 48 bits, or whose length needs more
    /// than 32, are written as extended entries.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the name does not fit one entry.
    pub fn memory_region(
        &mut self,
        name: &str,
        base: u64,
        length: u64,
        permissions: Permissions,
    ) -> Result<&mut Self> {
        let mut payload = Vec::with_capacity(32);
        let entry_tag = match u32::try_from(length) {
            Ok(short_length) if base < DMA_BASE_LIMIT => {
                payload.extend_from_slice(&base.to_le_bytes()[..6]);
                payload.extend_from_slice(&short_length.to_le_bytes());
                tag::DMA
            }
            _ => {
                payload.extend_from_slice(&base.to_le_bytes());
                payload.extend_from_slice(&length.to_le_bytes());
                tag::DMA_EXTENDED
            }
        };
        payload.push(permissions.bits());
        push_name(&mut payload, name);
        self.raw_entry(entry_tag, &payload)
    }

    /// Append a DMA addressing width entry
    pub fn dma_mask(&mut self, bits: u8) -> &mut Self {
        self.push_entry(tag::DMA_MASK, &[bits]);
        self
    }

    /// Append a DMA alignment entry (log2 of the alignment)
    pub fn dma_align(&mut self, shift: u8) -> &mut Self {
        self.push_entry(tag::DMA_ALIGN, &[shift]);
        self
    }

    /// Append an arbitrary entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for the end tag or a payload over 255 bytes.
    pub fn raw_entry(&mut self, raw_tag: u8, payload: &[u8]) -> Result<&mut Self> {
        if raw_tag == tag::END {
            return Err(AmcError::invalid_argument(
                "end marker is written by build()",
            ));
        }
        if payload.len() > usize::from(u8::MAX) {
            return Err(AmcError::invalid_argument(format!(
                "entry payload of {} bytes does not fit the size byte",
                payload.len()
            )));
        }
        self.push_entry(raw_tag, payload);
        Ok(self)
    }

    fn push_entry(&mut self, raw_tag: u8, payload: &[u8]) {
        self.body.push(raw_tag);
        #[allow(clippy::cast_possible_truncation)]
        self.body.push(payload.len() as u8);
        self.body.extend_from_slice(payload);
    }

    /// Close the table with the end marker and checksum.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the finished table does not fit inside the window.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut bytes = self.body.clone();
        if bytes.len() % 2 == 0 {
            bytes.extend_from_slice(&[tag::END, 2]);
        } else {
            bytes.extend_from_slice(&[tag::END, 3, 0]);
        }
        let trailer = trailer_for(&bytes);
        bytes.extend_from_slice(&trailer.to_le_bytes());

        if bytes.len() >= MAX_LENGTH {
            return Err(AmcError::invalid_argument(format!(
                "table of {} bytes does not fit below {MAX_LENGTH}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

fn push_name(payload: &mut Vec<u8>, name: &str) {
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
}

/// Render `bytes` as a Xilinx `.coe` memory initialisation file.
///
/// Bytes are grouped into little-endian words of `group` bytes; a short final
/// word is zero extended.
///
/// # Errors
///
/// Returns `InvalidArgument` if `group` is zero.
pub fn to_coe(bytes: &[u8], group: usize) -> Result<String> {
    if group == 0 {
        return Err(AmcError::invalid_argument("coe grouping must be non-zero"));
    }
    let words: Vec<String> = bytes
        .chunks(group)
        .map(|chunk| {
            let mut word = String::with_capacity(group * 2);
            for i in (0..group).rev() {
                let _ = write!(word, "{:02x}", chunk.get(i).copied().unwrap_or(0));
            }
            word
        })
        .collect();
    Ok(format!(
        "memory_initialization_radix=16;\nmemory_initialization_vector=\n{};\n",
        words.join(", ")
    ))
}
