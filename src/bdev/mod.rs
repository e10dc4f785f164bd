//! Block Interfaces
//!
//! A block interface ("bint") is one backing disk carved into 64 MiB
//! allocation units. Allocation state lives in a persisted bitmap split into
//! 4 KiB `BintIndex` pages; the interface keeps a running free-space counter
//! that must always equal `UNIT_SIZE` times the number of free allocatable
//! units across its pages.
//!
//! ## On-disk layout
//!
//! ```text
//! LBA 0            header (magic, bid, usable size, checksum)
//! 1 MiB + n*4 KiB  bitmap page n
//! units 0..4       reserved, never handed out to tape data
//! units 4..        allocatable
//! ```
//!
//! Blocks are addressed in 4 KiB LBAs throughout the crate.

pub mod index;
pub mod store;

pub use index::BintIndex;
pub use store::{BlockStore, FileBlockStore, MemoryBlockStore};

use crate::error::{Result, RustVtlError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const LBA_SHIFT: u32 = 12;
pub const LBA_SIZE: usize = 1 << LBA_SHIFT;

/// Allocation unit: 64 MiB
pub const UNIT_SHIFT: u32 = 26;
pub const UNIT_SIZE: u64 = 1 << UNIT_SHIFT;
/// LBAs per allocation unit, as a shift
pub const UNIT_LBA_SHIFT: u32 = UNIT_SHIFT - LBA_SHIFT;

/// Units at the start of every interface that never hold tape data
pub const RESERVED_UNITS: u64 = 4;

pub const PAGE_SIZE: usize = LBA_SIZE;
pub const PAGE_TRAILER_SIZE: usize = 8;
/// Meaningful bitmap bytes in a full page
pub const BMAP_ENTRIES: usize = PAGE_SIZE - PAGE_TRAILER_SIZE;
pub const UNITS_PER_INDEX: u64 = (BMAP_ENTRIES * 8) as u64;

/// Byte offset of bitmap page 0
pub const INDEX_META_OFFSET: u64 = 1024 * 1024;
/// Production pages kept in memory per interface
pub const INDEX_CACHE_MAX: usize = 8;

/// Capacity of the disk registry
pub const MAX_DISKS: usize = 512;

pub const BINT_MAGIC: &[u8; 8] = b"VTLBINT1";

/// Position of one allocation unit inside the bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockLocation {
    pub index_id: u32,
    pub entry_id: usize,
    pub pos_id: u8,
}

/// A block on a specific interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockAddress {
    pub bid: u32,
    pub block: u64,
}

impl BlockAddress {
    pub fn new(bid: u32, block: u64) -> Self {
        Self { bid, block }
    }
}

impl fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bid, self.block)
    }
}

/// Write durability for `persist`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Sync,
    Async,
}

/// Translate a block number into (page, byte, bit)
pub fn locate(block: u64) -> BlockLocation {
    let unit = block >> UNIT_LBA_SHIFT;
    let bits = unit % UNITS_PER_INDEX;
    BlockLocation {
        index_id: (unit / UNITS_PER_INDEX) as u32,
        entry_id: (bits / 8) as usize,
        pos_id: (bits & 0x7) as u8,
    }
}

/// First LBA of an allocation unit
pub fn unit_to_block(unit: u64) -> u64 {
    unit << UNIT_LBA_SHIFT
}

pub fn block_to_unit(block: u64) -> u64 {
    block >> UNIT_LBA_SHIFT
}

/// Whole allocation units inside `usable_size` bytes
pub fn units_for_size(usable_size: u64) -> u64 {
    usable_size >> UNIT_SHIFT
}

/// Number of bitmap pages needed for `usable_size` bytes
pub fn index_count(usable_size: u64) -> u32 {
    let units = units_for_size(usable_size);
    let mut count = units / UNITS_PER_INDEX;
    if units % UNITS_PER_INDEX != 0 {
        count += 1;
    }
    count as u32
}

/// LBA holding bitmap page `index_id`
pub fn index_lba(index_id: u32) -> u64 {
    (INDEX_META_OFFSET >> LBA_SHIFT) + index_id as u64
}

/// Production page cache, oldest first
#[derive(Debug, Default)]
struct IndexCache {
    pages: VecDeque<BintIndex>,
}

impl IndexCache {
    fn position(&self, index_id: u32) -> Option<usize> {
        self.pages.iter().position(|p| p.index_id() == index_id)
    }

    fn insert(&mut self, index: BintIndex) -> usize {
        if self.pages.len() >= INDEX_CACHE_MAX {
            if let Some(evicted) = self.pages.pop_front() {
                debug!("Evicting cached index {}", evicted.index_id());
            }
        }
        self.pages.push_back(index);
        self.pages.len() - 1
    }

    fn remove(&mut self, index_id: u32) -> Option<BintIndex> {
        let pos = self.position(index_id)?;
        self.pages.remove(pos)
    }
}

/// One backing disk and its allocation bitmap
pub struct BlockInterface {
    bid: u32,
    usable_size: u64,
    free: u64,
    /// Some page failed to load at open; `free` only covers readable pages
    degraded: bool,
    store: Arc<dyn BlockStore>,
    indexes: IndexCache,
}

impl fmt::Debug for BlockInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockInterface")
            .field("bid", &self.bid)
            .field("usable_size", &self.usable_size)
            .field("free", &self.free)
            .field("degraded", &self.degraded)
            .field("store", &self.store.describe())
            .finish()
    }
}

impl BlockInterface {
    /// Initialise a fresh interface: write the header and a zeroed bitmap
    pub fn format(bid: u32, usable_size: u64, store: Arc<dyn BlockStore>) -> Result<Self> {
        if bid as usize >= MAX_DISKS {
            return Err(RustVtlError::parameter_validation(format!(
                "bid {} exceeds maximum {}",
                bid,
                MAX_DISKS - 1
            )));
        }

        let units = units_for_size(usable_size);
        if units <= RESERVED_UNITS {
            return Err(RustVtlError::parameter_validation(format!(
                "usable size {} leaves no allocatable units",
                usable_size
            )));
        }

        let mut bint = Self {
            bid,
            usable_size,
            free: 0,
            degraded: false,
            store,
            indexes: IndexCache::default(),
        };

        info!(
            "Formatting bint {} on {}: {} units, {} index pages",
            bid,
            bint.store.describe(),
            units,
            bint.nindexes()
        );

        bint.write_header()?;
        for index_id in 0..bint.nindexes() {
            let mut index = BintIndex::zeroed(index_id)?;
            bint.store
                .write_block(index_lba(index_id), index.seal(), true)?;
        }
        bint.drop_cached_indexes();
        bint.free = bint.count_free_units()? * UNIT_SIZE;

        Ok(bint)
    }

    /// Open a formatted interface and compute its free space from the bitmap
    pub fn open(bid: u32, store: Arc<dyn BlockStore>) -> Result<Self> {
        let mut page = index::alloc_page()?;
        store.read_block(0, &mut page)?;

        let stored = u16::from_le_bytes([page[index::TRAILER_OFFSET], page[index::TRAILER_OFFSET + 1]]);
        if index::csum16(&page[..BMAP_ENTRIES]) != stored {
            return Err(RustVtlError::corrupt(format!(
                "bint {} header checksum mismatch",
                bid
            )));
        }
        if &page[0..8] != BINT_MAGIC {
            return Err(RustVtlError::corrupt(format!("bint {} magic mismatch", bid)));
        }

        let raw_bid = u32::from_le_bytes([page[8], page[9], page[10], page[11]]);
        if raw_bid != bid {
            return Err(RustVtlError::corrupt(format!(
                "raw bid {} mismatch with bid {}",
                raw_bid, bid
            )));
        }

        let mut raw_size = [0u8; 8];
        raw_size.copy_from_slice(&page[16..24]);
        let usable_size = u64::from_le_bytes(raw_size);
        if units_for_size(usable_size) <= RESERVED_UNITS {
            return Err(RustVtlError::corrupt(format!(
                "bint {} header size {} leaves no allocatable units",
                bid, usable_size
            )));
        }

        let mut bint = Self {
            bid,
            usable_size,
            free: 0,
            degraded: false,
            store,
            indexes: IndexCache::default(),
        };

        let free_units = bint.count_readable_free_units()?;
        bint.free = free_units * UNIT_SIZE;
        debug!(
            "Opened bint {}: usize {} free {}{}",
            bid,
            usable_size,
            bint.free,
            if bint.degraded { " (degraded)" } else { "" }
        );
        Ok(bint)
    }

    /// Free units over the pages that load. A page that does not marks the
    /// interface degraded and is left out of the count.
    fn count_readable_free_units(&mut self) -> Result<u64> {
        let mut free = 0;
        for index_id in 0..self.nindexes() {
            match self.page_free_units(index_id) {
                Ok(units) => free += units,
                Err(RustVtlError::Allocation(msg)) => return Err(RustVtlError::Allocation(msg)),
                Err(e) => {
                    warn!("bint {} index {} unreadable at open: {}", self.bid, index_id, e);
                    self.degraded = true;
                }
            }
        }
        Ok(free)
    }

    fn write_header(&self) -> Result<()> {
        let mut page = index::alloc_page()?;
        page[0..8].copy_from_slice(BINT_MAGIC);
        page[8..12].copy_from_slice(&self.bid.to_le_bytes());
        page[16..24].copy_from_slice(&self.usable_size.to_le_bytes());
        let csum = index::csum16(&page[..BMAP_ENTRIES]);
        page[index::TRAILER_OFFSET..index::TRAILER_OFFSET + 2].copy_from_slice(&csum.to_le_bytes());
        self.store.write_block(0, &page, true)
    }

    pub fn bid(&self) -> u32 {
        self.bid
    }

    pub fn usable_size(&self) -> u64 {
        self.usable_size
    }

    /// Free bytes, always a multiple of `UNIT_SIZE`
    pub fn free(&self) -> u64 {
        self.free
    }

    pub fn used(&self) -> u64 {
        (self.allocatable_units() * UNIT_SIZE).saturating_sub(self.free)
    }

    /// Whether a bitmap page could not be loaded when the interface was
    /// opened. A degraded interface hands out no units.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn total_units(&self) -> u64 {
        units_for_size(self.usable_size)
    }

    pub fn allocatable_units(&self) -> u64 {
        self.total_units() - RESERVED_UNITS
    }

    pub fn nindexes(&self) -> u32 {
        index_count(self.usable_size)
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn locate(&self, block: u64) -> BlockLocation {
        locate(block)
    }

    /// Whether `block` falls inside the usable size
    pub fn contains_block(&self, block: u64) -> bool {
        block_to_unit(block) < self.total_units()
    }

    /// Meaningful bytes of page `index_id`; the last page may be partial
    pub fn page_entry_count(&self, index_id: u32) -> usize {
        let units = self.total_units();
        let start = index_id as u64 * UNITS_PER_INDEX;
        if start >= units {
            return 0;
        }
        let covered = std::cmp::min(UNITS_PER_INDEX, units - start);
        ((covered + 7) / 8) as usize
    }

    /// Bits of byte `entry_id` in page `index_id` that count toward free
    /// space: excludes the reserved units and bits past the usable size
    pub fn countable_mask(&self, index_id: u32, entry_id: usize) -> u8 {
        let base = index_id as u64 * UNITS_PER_INDEX + entry_id as u64 * 8;
        let units = self.total_units();
        let mut mask = 0u8;
        for pos in 0..8u64 {
            let unit = base + pos;
            if unit >= RESERVED_UNITS && unit < units {
                mask |= 1 << pos;
            }
        }
        mask
    }

    /// Return the production page for `index_id`, loading it from disk when
    /// it is not cached. With `allow_create`, a page that cannot be loaded is
    /// replaced by a new zeroed page registered with this interface.
    pub fn get_or_create_index(
        &mut self,
        index_id: u32,
        allow_create: bool,
    ) -> Result<Option<&mut BintIndex>> {
        if let Some(pos) = self.indexes.position(index_id) {
            return Ok(self.indexes.pages.get_mut(pos));
        }

        let index = match self.load_index(index_id) {
            Ok(index) => index,
            Err(RustVtlError::Allocation(msg)) => return Err(RustVtlError::Allocation(msg)),
            Err(e) => {
                if !allow_create {
                    warn!(
                        "Cannot locate index at id {} for bint {}: {}",
                        index_id, self.bid, e
                    );
                    return Ok(None);
                }
                debug!("Creating index {} for bint {}", index_id, self.bid);
                BintIndex::zeroed(index_id)?
            }
        };

        let pos = self.indexes.insert(index);
        Ok(self.indexes.pages.get_mut(pos))
    }

    /// Production page for `index_id`, or a structural error
    pub fn index(&mut self, index_id: u32) -> Result<&mut BintIndex> {
        let bid = self.bid;
        self.get_or_create_index(index_id, false)?.ok_or_else(|| {
            RustVtlError::structural(format!("cannot locate index {} on bint {}", index_id, bid))
        })
    }

    fn load_index(&self, index_id: u32) -> Result<BintIndex> {
        let mut page = index::alloc_page()?;
        self.store.read_block(index_lba(index_id), &mut page)?;
        BintIndex::from_page(index_id, page)
    }

    /// Write a cached page back to the store
    pub fn persist(&mut self, index_id: u32, mode: IoMode) -> Result<()> {
        let pos = self.indexes.position(index_id).ok_or_else(|| {
            RustVtlError::structural(format!(
                "index {} of bint {} is not loaded",
                index_id, self.bid
            ))
        })?;
        let store = Arc::clone(&self.store);
        let index = &mut self.indexes.pages[pos];
        store.write_block(index_lba(index_id), index.seal(), mode == IoMode::Sync)
    }

    /// Drop a cached page so the next access reloads it from disk
    pub fn evict_index(&mut self, index_id: u32) {
        self.indexes.remove(index_id);
    }

    pub fn drop_cached_indexes(&mut self) {
        self.indexes.pages.clear();
    }

    pub fn cached_indexes(&self) -> usize {
        self.indexes.pages.len()
    }

    /// Free allocatable units in one page
    pub fn page_free_units(&mut self, index_id: u32) -> Result<u64> {
        let entries = self.page_entry_count(index_id);
        let masks: Vec<u8> = (0..entries)
            .map(|entry| self.countable_mask(index_id, entry))
            .collect();
        let index = self.index(index_id)?;
        Ok(index.bitmap()[..entries]
            .iter()
            .zip(masks)
            .map(|(val, mask)| (!val & mask).count_ones() as u64)
            .sum())
    }

    /// Allocatable units covered by one page
    pub fn page_allocatable_units(&self, index_id: u32) -> u64 {
        (0..self.page_entry_count(index_id))
            .map(|entry| self.countable_mask(index_id, entry).count_ones() as u64)
            .sum()
    }

    /// Scan every page and count free allocatable units
    pub fn count_free_units(&mut self) -> Result<u64> {
        let mut free = 0;
        for index_id in 0..self.nindexes() {
            free += self.page_free_units(index_id)?;
        }
        Ok(free)
    }

    /// Reset the free counter from the bitmap contents
    pub fn recompute_free(&mut self) -> Result<u64> {
        self.free = self.count_free_units()? * UNIT_SIZE;
        self.degraded = false;
        Ok(self.free)
    }

    pub(crate) fn credit_free(&mut self, units: u64) {
        self.free += units * UNIT_SIZE;
    }

    pub(crate) fn debit_free(&mut self, units: u64) {
        let bytes = units * UNIT_SIZE;
        if bytes > self.free {
            warn!(
                "bint {} free {} smaller than debit {}, clamping",
                self.bid, self.free, bytes
            );
            self.free = 0;
        } else {
            self.free -= bytes;
        }
    }

    pub fn is_allocated(&mut self, block: u64) -> Result<bool> {
        if !self.contains_block(block) {
            return Err(RustVtlError::parameter_validation(format!(
                "block {} beyond bint {} usable size",
                block, self.bid
            )));
        }
        let loc = locate(block);
        Ok(self.index(loc.index_id)?.is_set(loc.entry_id, loc.pos_id))
    }

    /// First-fit allocation of one unit. Returns the unit's first block, or
    /// `None` when the interface is full.
    pub fn allocate_unit(&mut self) -> Result<Option<u64>> {
        if self.degraded {
            debug!("bint {} is degraded, not allocating", self.bid);
            return Ok(None);
        }
        if self.free < UNIT_SIZE {
            return Ok(None);
        }

        for index_id in 0..self.nindexes() {
            let entries = self.page_entry_count(index_id);
            let masks: Vec<u8> = (0..entries)
                .map(|entry| self.countable_mask(index_id, entry))
                .collect();

            let index = self.index(index_id)?;
            let mut found = None;
            for (entry_id, mask) in masks.iter().enumerate() {
                let free_bits = !index.bitmap()[entry_id] & mask;
                if free_bits == 0 {
                    continue;
                }
                let pos_id = free_bits.trailing_zeros() as u8;
                index.set(entry_id, pos_id);
                found = Some((entry_id, pos_id));
                break;
            }

            let Some((entry_id, pos_id)) = found else {
                continue;
            };

            if let Err(e) = self.persist(index_id, IoMode::Sync) {
                warn!(
                    "index sync failed for index_id {} bid {}: {}",
                    index_id, self.bid, e
                );
                self.index(index_id)?.clear(entry_id, pos_id);
                return Err(e);
            }

            let unit = index_id as u64 * UNITS_PER_INDEX + entry_id as u64 * 8 + pos_id as u64;
            self.debit_free(1);
            debug!("bint {} allocated unit {}", self.bid, unit);
            return Ok(Some(unit_to_block(unit)));
        }

        warn!(
            "bint {} reports free {} but no free unit was found",
            self.bid, self.free
        );
        Ok(None)
    }

    /// Return a previously allocated unit to the free pool
    pub fn release_unit(&mut self, block: u64) -> Result<()> {
        if !self.contains_block(block) {
            return Err(RustVtlError::parameter_validation(format!(
                "block {} beyond bint {} usable size",
                block, self.bid
            )));
        }
        let unit = block_to_unit(block);
        if unit < RESERVED_UNITS {
            return Err(RustVtlError::parameter_validation(format!(
                "block {} lies in the reserved area of bint {}",
                block, self.bid
            )));
        }

        let loc = locate(block);
        let index = self.index(loc.index_id)?;
        if !index.clear(loc.entry_id, loc.pos_id) {
            warn!("block {} was not alloced on bint {}", block, self.bid);
            return Err(RustVtlError::allocation(format!(
                "block {} on bint {} is not allocated",
                block, self.bid
            )));
        }

        if let Err(e) = self.persist(loc.index_id, IoMode::Sync) {
            warn!("index write failed for bint {}: {}", self.bid, e);
            self.index(loc.index_id)?.set(loc.entry_id, loc.pos_id);
            return Err(e);
        }

        self.credit_free(1);
        debug!("bint {} released unit {}", self.bid, unit);
        Ok(())
    }
}

/// Fixed-capacity table of block interfaces indexed by `bid`
pub struct BintRegistry {
    pub(crate) disks: Vec<Option<BlockInterface>>,
    rotor: usize,
}

impl Default for BintRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BintRegistry {
    pub fn new() -> Self {
        Self {
            disks: (0..MAX_DISKS).map(|_| None).collect(),
            rotor: 0,
        }
    }

    pub fn add(&mut self, bint: BlockInterface) -> Result<()> {
        let bid = bint.bid() as usize;
        match self.disks.get_mut(bid) {
            None => Err(RustVtlError::parameter_validation(format!(
                "bid {} out of range",
                bid
            ))),
            Some(Some(_)) => Err(RustVtlError::parameter_validation(format!(
                "bid {} already registered",
                bid
            ))),
            Some(slot) => {
                *slot = Some(bint);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, bid: u32) -> Option<BlockInterface> {
        self.disks.get_mut(bid as usize).and_then(Option::take)
    }

    pub fn get(&self, bid: u32) -> Option<&BlockInterface> {
        self.disks.get(bid as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, bid: u32) -> Option<&mut BlockInterface> {
        self.disks.get_mut(bid as usize).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockInterface> {
        self.disks.iter().filter_map(Option::as_ref)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BlockInterface> {
        self.disks.iter_mut().filter_map(Option::as_mut)
    }

    pub fn bids(&self) -> Vec<u32> {
        self.iter().map(BlockInterface::bid).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate one unit, trying `preferred` first and then rotating
    /// through the other interfaces that still report free space
    pub fn allocate_unit(&mut self, preferred: Option<u32>) -> Result<BlockAddress> {
        let mut order: Vec<u32> = Vec::new();
        if let Some(bid) = preferred {
            if self.get(bid).is_some() {
                order.push(bid);
            }
        }
        let bids = self.bids();
        if !bids.is_empty() {
            let start = self.rotor % bids.len();
            for bid in bids[start..].iter().chain(bids[..start].iter()) {
                if Some(*bid) != preferred {
                    order.push(*bid);
                }
            }
        }

        for bid in order {
            let Some(bint) = self.get_mut(bid) else {
                continue;
            };
            if bint.free() < UNIT_SIZE {
                continue;
            }
            if let Some(block) = bint.allocate_unit()? {
                self.rotor = self.rotor.wrapping_add(1);
                return Ok(BlockAddress::new(bid, block));
            }
        }

        Err(RustVtlError::allocation("no free allocation units on any disk"))
    }

    pub fn release_unit(&mut self, addr: BlockAddress) -> Result<()> {
        let bint = self.get_mut(addr.bid).ok_or_else(|| {
            RustVtlError::structural(format!("cannot locate bint at {}", addr.bid))
        })?;
        bint.release_unit(addr.block)
    }
}
