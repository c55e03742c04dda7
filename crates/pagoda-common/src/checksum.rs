//! Checksum utilities for pages and checkpoint files
//!
//! Pages are protected by CRC32C computed over the whole page with the
//! checksum field itself treated as zero.

/// CRC32C of a page, skipping the 4-byte checksum field at `checksum_offset`
#[must_use]
pub fn page_crc(page: &[u8], checksum_offset: usize) -> u32 {
    let crc = crc32c::crc32c(&page[..checksum_offset]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &page[checksum_offset + 4..])
}

/// Streaming checksum calculator for checkpoint files
pub struct ChecksumCalculator {
    crc: u32,
    bytes: u64,
}

impl ChecksumCalculator {
    /// Create a new calculator
    #[must_use]
    pub const fn new() -> Self {
        Self { crc: 0, bytes: 0 }
    }

    /// Feed data into the calculator
    pub fn update(&mut self, data: &[u8]) {
        self.crc = crc32c::crc32c_append(self.crc, data);
        self.bytes += data.len() as u64;
    }

    /// Bytes processed so far
    #[must_use]
    pub const fn bytes_processed(&self) -> u64 {
        self.bytes
    }

    /// Final checksum
    #[must_use]
    pub const fn finalize(&self) -> u32 {
        self.crc
    }
}

impl Default for ChecksumCalculator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_crc_ignores_checksum_field() {
        let mut page = vec![7u8; 64];
        let before = page_crc(&page, 8);
        page[8..12].copy_from_slice(&0xabcd_ef01u32.to_le_bytes());
        assert_eq!(page_crc(&page, 8), before);

        page[40] ^= 1;
        assert_ne!(page_crc(&page, 8), before);
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let mut calc = ChecksumCalculator::new();
        calc.update(&data[..10]);
        calc.update(&data[10..]);
        assert_eq!(calc.finalize(), crc32c::crc32c(data));
        assert_eq!(calc.bytes_processed(), data.len() as u64);
    }
}
