//! 16-bit ones' complement checksum used to validate the device table.

/// Compute the checksum of `bytes`.
///
/// Bytes are summed as little-endian 16-bit words. A trailing odd byte is
/// added shifted into the high half. The carry is folded back twice and the
/// ones' complement of the result returned, so a region that already
/// contains its own correct checksum yields zero.
pub fn checksum16(bytes: &[u8]) -> u16 {
    let mut words = bytes.chunks_exact(2);
    let mut sum: u32 = words
        .by_ref()
        .map(|w| u32::from(u16::from_le_bytes([w[0], w[1]])))
        .sum();
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum = (sum & 0xffff) + (sum >> 16);
    sum = (sum & 0xffff) + (sum >> 16);
    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    !folded
}

/// The checksum word to append to an even-length `bytes` so that the whole
/// span sums to zero.
pub(crate) fn trailer_for(bytes: &[u8]) -> u16 {
    debug_assert!(bytes.len() % 2 == 0, "trailer must start on a word boundary");
    checksum16(bytes)
}
