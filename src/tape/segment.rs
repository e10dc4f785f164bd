//! Tape Segment Maps
//!
//! A segment map is one 4 KiB page of packed `TapeSegmentEntry` values that
//! maps a partition's logical segments to physical blocks. Maps are filled
//! front to back; the first zero entry ends the populated prefix.

use crate::bdev::index::csum16;
use crate::bdev::{BlockAddress, LBA_SIZE, MAX_DISKS};
use crate::error::{Result, RustVtlError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Entries per map page (one page minus the 8-byte trailer)
pub const MAP_MAX_SEGMENTS: usize = (LBA_SIZE - 8) / 8;
/// Maps per kind a partition can ever carry
pub const MAX_MAPS_PER_KIND: u32 = 1024;

const ENTRY_VERSION_SHIFT: u32 = 62;
const ENTRY_VERSION_V1: u64 = 0b01;
const ENTRY_BID_SHIFT: u32 = 48;
const ENTRY_BID_MASK: u64 = 0x3FF;
const ENTRY_LBA_MASK: u64 = (1 << 48) - 1;
const MAP_TRAILER_OFFSET: usize = MAP_MAX_SEGMENTS * 8;

/// Segment families of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Meta,
    Data,
}

impl SegmentKind {
    pub const ALL: [SegmentKind; 2] = [SegmentKind::Meta, SegmentKind::Data];
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Meta => write!(f, "meta"),
            SegmentKind::Data => write!(f, "data"),
        }
    }
}

/// Packed on-disk key: version in bits 63..62, bid in 57..48, LBA in 47..0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TapeSegmentEntry(u64);

impl TapeSegmentEntry {
    pub const SENTINEL: TapeSegmentEntry = TapeSegmentEntry(0);

    pub fn encode(addr: BlockAddress) -> Result<Self> {
        if addr.bid as usize >= MAX_DISKS || addr.bid as u64 > ENTRY_BID_MASK {
            return Err(RustVtlError::parameter_validation(format!(
                "bid {} does not fit a segment entry",
                addr.bid
            )));
        }
        if addr.block > ENTRY_LBA_MASK {
            return Err(RustVtlError::parameter_validation(format!(
                "block {} does not fit a segment entry",
                addr.block
            )));
        }

        Ok(Self(
            (ENTRY_VERSION_V1 << ENTRY_VERSION_SHIFT)
                | ((addr.bid as u64) << ENTRY_BID_SHIFT)
                | addr.block,
        ))
    }

    /// `None` for the sentinel
    pub fn decode(self) -> Result<Option<BlockAddress>> {
        if self.is_sentinel() {
            return Ok(None);
        }

        let version = self.0 >> ENTRY_VERSION_SHIFT;
        if version != ENTRY_VERSION_V1 {
            return Err(RustVtlError::corrupt(format!(
                "segment entry {:#018x} has unknown layout version {}",
                self.0, version
            )));
        }

        Ok(Some(BlockAddress {
            bid: ((self.0 >> ENTRY_BID_SHIFT) & ENTRY_BID_MASK) as u32,
            block: self.0 & ENTRY_LBA_MASK,
        }))
    }

    pub fn is_sentinel(self) -> bool {
        self.0 == 0
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// One loaded segment map page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeSegmentMap {
    kind: SegmentKind,
    map_id: u32,
    location: BlockAddress,
    entries: Vec<TapeSegmentEntry>,
}

impl TapeSegmentMap {
    pub fn empty(kind: SegmentKind, map_id: u32, location: BlockAddress) -> Self {
        Self {
            kind,
            map_id,
            location,
            entries: vec![TapeSegmentEntry::SENTINEL; MAP_MAX_SEGMENTS],
        }
    }

    /// Parse a raw page. An all-zero page is an empty map.
    pub fn from_page(
        kind: SegmentKind,
        map_id: u32,
        location: BlockAddress,
        page: &[u8],
    ) -> Result<Self> {
        if page.len() != LBA_SIZE {
            return Err(RustVtlError::corrupt(format!(
                "{} map {} page has {} bytes",
                kind,
                map_id,
                page.len()
            )));
        }

        if page.iter().all(|&b| b == 0) {
            return Ok(Self::empty(kind, map_id, location));
        }

        let stored = u16::from_le_bytes([page[MAP_TRAILER_OFFSET], page[MAP_TRAILER_OFFSET + 1]]);
        let computed = csum16(&page[..MAP_TRAILER_OFFSET]);
        if stored != computed {
            warn!(
                "Mismatch in {} map {} csum at {} got {:#06x} stored {:#06x}",
                kind, map_id, location, computed, stored
            );
            return Err(RustVtlError::corrupt(format!(
                "{} map {} at {} checksum mismatch",
                kind, map_id, location
            )));
        }

        let entries = page[..MAP_TRAILER_OFFSET]
            .chunks_exact(8)
            .map(|raw| {
                let mut word = [0u8; 8];
                word.copy_from_slice(raw);
                TapeSegmentEntry(u64::from_le_bytes(word))
            })
            .collect();

        Ok(Self {
            kind,
            map_id,
            location,
            entries,
        })
    }

    /// Serialize with a fresh checksum trailer
    pub fn to_page(&self) -> Vec<u8> {
        let mut page = vec![0u8; LBA_SIZE];
        for (raw, entry) in page[..MAP_TRAILER_OFFSET]
            .chunks_exact_mut(8)
            .zip(&self.entries)
        {
            raw.copy_from_slice(&entry.0.to_le_bytes());
        }
        let csum = csum16(&page[..MAP_TRAILER_OFFSET]);
        page[MAP_TRAILER_OFFSET..MAP_TRAILER_OFFSET + 2].copy_from_slice(&csum.to_le_bytes());
        page
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    pub fn location(&self) -> BlockAddress {
        self.location
    }

    pub fn entries(&self) -> &[TapeSegmentEntry] {
        &self.entries
    }

    pub fn entry(&self, idx: usize) -> Option<TapeSegmentEntry> {
        self.entries.get(idx).copied()
    }

    /// Length of the populated prefix
    pub fn populated(&self) -> usize {
        self.entries
            .iter()
            .position(|e| e.is_sentinel())
            .unwrap_or(self.entries.len())
    }

    pub fn is_full(&self) -> bool {
        self.populated() == self.entries.len()
    }

    /// Append behind the populated prefix, returning the entry index
    pub fn push(&mut self, entry: TapeSegmentEntry) -> Result<usize> {
        if entry.is_sentinel() {
            return Err(RustVtlError::parameter_validation(
                "cannot append a sentinel entry",
            ));
        }
        let idx = self.populated();
        if idx >= self.entries.len() {
            return Err(RustVtlError::allocation(format!(
                "{} map {} is full",
                self.kind, self.map_id
            )));
        }
        self.entries[idx] = entry;
        Ok(idx)
    }

    /// Consume the map. Only logs; the page buffer is freed when `self`
    /// drops at the end of this call.
    pub fn unload(self) {
        debug!(
            "Unloading {} map {} at {}",
            self.kind, self.map_id, self.location
        );
    }
}
