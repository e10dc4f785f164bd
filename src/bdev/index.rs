//! Bitmap Index Pages
//!
//! One `BintIndex` is a single 4 KiB page of a block interface's allocation
//! bitmap. The first `BMAP_ENTRIES` bytes hold one bit per allocation unit
//! (`1` = allocated); the last 8 bytes are a trailer carrying a 16-bit
//! checksum of the bitmap bytes.

use super::{BMAP_ENTRIES, PAGE_SIZE};
use crate::error::{Result, RustVtlError};
use tracing::warn;

/// Byte offset of the checksum trailer inside a page
pub const TRAILER_OFFSET: usize = BMAP_ENTRIES;

/// One's-complement sum of little-endian 16-bit words
pub fn csum16(buf: &[u8]) -> u16 {
    let mut csum: u16 = 0;
    for word in buf.chunks(2) {
        let val = if word.len() == 2 {
            u16::from_le_bytes([word[0], word[1]])
        } else {
            word[0] as u16
        };
        csum = csum.wrapping_add(val);
    }
    !csum
}

/// Allocate a zero-filled page buffer, surfacing exhaustion as an error
pub(crate) fn alloc_page() -> Result<Vec<u8>> {
    let mut page = Vec::new();
    page.try_reserve_exact(PAGE_SIZE)?;
    page.resize(PAGE_SIZE, 0);
    Ok(page)
}

/// A single bitmap page covering `UNITS_PER_INDEX` allocation units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BintIndex {
    index_id: u32,
    page: Vec<u8>,
}

impl BintIndex {
    /// Create a zero-initialised page (every unit free)
    pub fn zeroed(index_id: u32) -> Result<Self> {
        Ok(Self {
            index_id,
            page: alloc_page()?,
        })
    }

    /// Build a page from raw on-disk bytes, verifying the trailer checksum
    pub fn from_page(index_id: u32, page: Vec<u8>) -> Result<Self> {
        if page.len() != PAGE_SIZE {
            return Err(RustVtlError::corrupt(format!(
                "index {} page has {} bytes, expected {}",
                index_id,
                page.len(),
                PAGE_SIZE
            )));
        }

        let index = Self { index_id, page };
        let computed = csum16(index.bitmap());
        let stored = index.stored_checksum();
        if computed != stored {
            warn!(
                "Mismatch in index {} csum got {:#06x} stored {:#06x}",
                index_id, computed, stored
            );
            return Err(RustVtlError::corrupt(format!(
                "index {} checksum mismatch",
                index_id
            )));
        }

        Ok(index)
    }

    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    /// Bitmap bytes (without trailer)
    pub fn bitmap(&self) -> &[u8] {
        &self.page[..BMAP_ENTRIES]
    }

    pub fn bitmap_mut(&mut self) -> &mut [u8] {
        &mut self.page[..BMAP_ENTRIES]
    }

    pub fn is_set(&self, entry_id: usize, pos_id: u8) -> bool {
        self.page[entry_id] & (1u8 << pos_id) != 0
    }

    /// Set a bit, returning whether it was already set
    pub fn set(&mut self, entry_id: usize, pos_id: u8) -> bool {
        let was_set = self.is_set(entry_id, pos_id);
        self.page[entry_id] |= 1u8 << pos_id;
        was_set
    }

    /// Clear a bit, returning whether it was set
    pub fn clear(&mut self, entry_id: usize, pos_id: u8) -> bool {
        let was_set = self.is_set(entry_id, pos_id);
        self.page[entry_id] &= !(1u8 << pos_id);
        was_set
    }

    /// Number of set bits over the first `entries` bytes
    pub fn popcount(&self, entries: usize) -> u64 {
        self.page[..entries]
            .iter()
            .map(|b| b.count_ones() as u64)
            .sum()
    }

    pub fn stored_checksum(&self) -> u16 {
        u16::from_le_bytes([self.page[TRAILER_OFFSET], self.page[TRAILER_OFFSET + 1]])
    }

    /// Recompute the trailer checksum and return the full page for writing
    pub fn seal(&mut self) -> &[u8] {
        let csum = csum16(self.bitmap());
        self.page[TRAILER_OFFSET..TRAILER_OFFSET + 2].copy_from_slice(&csum.to_le_bytes());
        &self.page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_page_checksum() {
        // all-zero words sum to zero, complement is 0xFFFF
        assert_eq!(csum16(&[0u8; 16]), 0xFFFF);
        assert_eq!(csum16(&[1, 0, 2, 0]), !3u16);
    }

    #[test]
    fn test_set_and_clear_bits() {
        let mut index = BintIndex::zeroed(3).unwrap();
        assert!(!index.set(10, 7));
        assert!(index.set(10, 7));
        assert!(index.is_set(10, 7));
        assert_eq!(index.bitmap()[10], 0x80);
        assert_eq!(index.popcount(BMAP_ENTRIES), 1);

        assert!(index.clear(10, 7));
        assert!(!index.clear(10, 7));
        assert_eq!(index.popcount(BMAP_ENTRIES), 0);
    }

    #[test]
    fn test_sealed_page_validates() {
        let mut index = BintIndex::zeroed(1).unwrap();
        index.set(0, 4);
        index.set(4000, 0);
        let page = index.seal().to_vec();

        let loaded = BintIndex::from_page(1, page).unwrap();
        assert_eq!(loaded, index);
    }

    #[test]
    fn test_corrupt_page_rejected() {
        let mut index = BintIndex::zeroed(2).unwrap();
        index.set(1, 1);
        let mut page = index.seal().to_vec();
        page[1] ^= 0x40;

        let result = BintIndex::from_page(2, page);
        assert!(matches!(result, Err(RustVtlError::Corrupt(_))));

        // an unsealed zero page carries a zero checksum, which never matches
        let result = BintIndex::from_page(2, vec![0u8; PAGE_SIZE]);
        assert!(result.is_err());
    }
}
