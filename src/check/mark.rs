//! Mark phase: walk the device graph and build shadow bitmaps
//!
//! Every cartridge reachable from a drive or changer is walked partition by
//! partition (metadata maps, then data maps, then the map storage unit). The
//! blocks that land on the disk under check are set in transient shadow
//! pages that the reconcile phase compares against the production bitmap.

use super::CheckError;
use crate::bdev::{locate, BintIndex};
use crate::library::Library;
use crate::tape::{CartridgeId, SegmentKind, TapeSegmentMap};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Where a reachable block was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Segment {
        kind: SegmentKind,
        map_id: u32,
        entry: usize,
    },
    MapStorage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachableBlock {
    pub block: u64,
    pub cartridge: CartridgeId,
    pub partition: u8,
    pub source: BlockSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Maps(SegmentKind),
    MapStorage,
    Done,
}

/// Lazy walk over every block on one disk that live tape data references.
/// At most one segment map is loaded at a time; the walk stops for good
/// after the first error.
pub struct ReachableBlocks<'a> {
    library: &'a Library,
    bid: u32,
    cartridges: Vec<CartridgeId>,
    cart_pos: usize,
    part_pos: usize,
    stage: Stage,
    map_id: u32,
    current: Option<(TapeSegmentMap, usize)>,
    failed: bool,
}

impl<'a> ReachableBlocks<'a> {
    pub fn new(library: &'a Library, bid: u32) -> Self {
        Self {
            library,
            bid,
            cartridges: library.devices.reachable_cartridges(),
            cart_pos: 0,
            part_pos: 0,
            stage: Stage::Maps(SegmentKind::Meta),
            map_id: 0,
            current: None,
            failed: false,
        }
    }

    fn release_map(&mut self) {
        if let Some((map, _)) = self.current.take() {
            map.unload();
        }
    }

    fn next_stage(&mut self) {
        self.release_map();
        self.map_id = 0;
        self.stage = match self.stage {
            Stage::Maps(SegmentKind::Meta) => Stage::Maps(SegmentKind::Data),
            Stage::Maps(SegmentKind::Data) => Stage::MapStorage,
            Stage::MapStorage | Stage::Done => Stage::Done,
        };
    }

    fn next_partition(&mut self) {
        self.release_map();
        self.part_pos += 1;
        self.map_id = 0;
        self.stage = Stage::Maps(SegmentKind::Meta);
    }

    fn next_cartridge(&mut self) {
        self.next_partition();
        self.cart_pos += 1;
        self.part_pos = 0;
    }

    fn fail(&mut self, error: CheckError) -> Option<Result<ReachableBlock, CheckError>> {
        self.release_map();
        self.failed = true;
        Some(Err(error))
    }
}

impl<'a> Iterator for ReachableBlocks<'a> {
    type Item = Result<ReachableBlock, CheckError>;

    fn next(&mut self) -> Option<Self::Item> {
        let library = self.library;
        loop {
            if self.failed {
                return None;
            }

            let cartridge_id = *self.cartridges.get(self.cart_pos)?;
            let Some(cartridge) = library.cartridges.get(cartridge_id) else {
                warn!("Device references missing cartridge {}", cartridge_id);
                self.next_cartridge();
                continue;
            };
            let Some(partition) = cartridge.partitions().get(self.part_pos) else {
                self.next_cartridge();
                continue;
            };

            match self.stage {
                Stage::Maps(kind) => {
                    if self.current.is_none() {
                        if self.map_id >= partition.max_maps(kind) {
                            self.next_stage();
                            continue;
                        }
                        match partition.locate_map(&library.bints, kind, self.map_id) {
                            Ok(map) => self.current = Some((map, 0)),
                            Err(e) => {
                                return self.fail(CheckError::map_load(cartridge.label(), partition, e))
                            }
                        }
                    }

                    let Some((map, idx)) = self.current.as_mut() else {
                        continue;
                    };
                    let Some(entry) = map.entry(*idx) else {
                        self.release_map();
                        self.map_id += 1;
                        continue;
                    };
                    let entry_idx = *idx;
                    *idx += 1;

                    let addr = match entry.decode() {
                        Ok(Some(addr)) => addr,
                        Ok(None) => {
                            self.next_stage();
                            continue;
                        }
                        Err(e) => {
                            return self.fail(CheckError::map_load(cartridge.label(), partition, e))
                        }
                    };

                    if addr.bid != self.bid
                        || library
                            .exclusion()
                            .is_excluded(partition, kind, self.map_id, entry_idx)
                    {
                        continue;
                    }

                    return Some(Ok(ReachableBlock {
                        block: addr.block,
                        cartridge: cartridge_id,
                        partition: partition.partition_id(),
                        source: BlockSource::Segment {
                            kind,
                            map_id: self.map_id,
                            entry: entry_idx,
                        },
                    }));
                }
                Stage::MapStorage => {
                    self.next_stage();
                    if partition.maps_addr().bid == self.bid {
                        return Some(Ok(ReachableBlock {
                            block: partition.maps_addr().block,
                            cartridge: cartridge_id,
                            partition: partition.partition_id(),
                            source: BlockSource::MapStorage,
                        }));
                    }
                }
                Stage::Done => self.next_partition(),
            }
        }
    }
}

/// Transient bitmap pages built from reachability, keyed by `index_id`.
/// Never persisted.
#[derive(Debug)]
pub struct ShadowSet {
    bid: u32,
    pages: BTreeMap<u32, BintIndex>,
    marked: u64,
    multiple_refs: u64,
    out_of_range: u64,
}

impl ShadowSet {
    pub fn new(bid: u32) -> Self {
        Self {
            bid,
            pages: BTreeMap::new(),
            marked: 0,
            multiple_refs: 0,
            out_of_range: 0,
        }
    }

    pub fn bid(&self) -> u32 {
        self.bid
    }

    /// Set the bit for `block`, creating its shadow page on first touch.
    /// Returns `false` when the bit was already set by another reference.
    pub fn mark(&mut self, block: u64) -> Result<bool, CheckError> {
        let loc = locate(block);
        let page = match self.pages.entry(loc.index_id) {
            Entry::Occupied(page) => page.into_mut(),
            Entry::Vacant(slot) => {
                let page = BintIndex::zeroed(loc.index_id).map_err(|_| {
                    CheckError::PageAllocation {
                        bid: self.bid,
                        index_id: loc.index_id,
                    }
                })?;
                slot.insert(page)
            }
        };

        self.marked += 1;
        if page.set(loc.entry_id, loc.pos_id) {
            warn!("Multiple refs for block {} on bint {}", block, self.bid);
            self.multiple_refs += 1;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn is_marked(&self, block: u64) -> bool {
        let loc = locate(block);
        self.pages
            .get(&loc.index_id)
            .map(|page| page.is_set(loc.entry_id, loc.pos_id))
            .unwrap_or(false)
    }

    /// Hand out the shadow page for `index_id`, if one was created
    pub fn take(&mut self, index_id: u32) -> Option<BintIndex> {
        self.pages.remove(&index_id)
    }

    pub fn touched_indexes(&self) -> Vec<u32> {
        self.pages.keys().copied().collect()
    }

    pub fn marked(&self) -> u64 {
        self.marked
    }

    pub fn multiple_refs(&self) -> u64 {
        self.multiple_refs
    }

    pub fn out_of_range(&self) -> u64 {
        self.out_of_range
    }
}

/// Build the shadow bitmap of disk `bid` from everything the device graph
/// keeps alive
pub fn device_check_block(library: &Library, bid: u32) -> Result<ShadowSet, CheckError> {
    let bint = library
        .bints
        .get(bid)
        .ok_or(CheckError::UnknownDisk(bid))?;

    let mut shadow = ShadowSet::new(bid);
    for item in ReachableBlocks::new(library, bid) {
        let reachable = item?;
        if !bint.contains_block(reachable.block) {
            warn!(
                "Cartridge {} partition {} references block {} beyond bint {} size",
                reachable.cartridge, reachable.partition, reachable.block, bid
            );
            shadow.out_of_range += 1;
            continue;
        }
        shadow.mark(reachable.block)?;
    }

    debug!(
        "Mark phase for bint {}: {} blocks, {} shadow pages, {} multiple refs",
        bid,
        shadow.marked,
        shadow.pages.len(),
        shadow.multiple_refs
    );
    Ok(shadow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdev::{block_to_unit, UNIT_SIZE};
    use crate::device::ElementType;
    use crate::library::tests::memory_library;
    use crate::tape::FormatVersion;

    fn blocks(library: &Library, bid: u32) -> Vec<u64> {
        ReachableBlocks::new(library, bid)
            .map(|item| item.unwrap().block)
            .collect()
    }

    #[test]
    fn test_walk_order_and_disk_filter() {
        let (mut library, _) = memory_library(&[(1, 64), (2, 64)]);
        let drive = library.add_drive("drive0").unwrap();
        let cart = library
            .create_cartridge("VTL001", FormatVersion::V1, &[8 * UNIT_SIZE], Some(1))
            .unwrap();
        let data = library.write_segment(cart, 0, SegmentKind::Data).unwrap();
        let meta = library.write_segment(cart, 0, SegmentKind::Meta).unwrap();
        library.load_drive(drive, cart).unwrap();

        let maps = library.cartridges().get(cart).unwrap().partitions()[0].maps_addr();
        let on_disk: Vec<u64> = [meta, data, maps]
            .iter()
            .filter(|a| a.bid == 1)
            .map(|a| a.block)
            .collect();
        assert_eq!(blocks(&library, 1), on_disk);

        let elsewhere: Vec<u64> = [meta, data]
            .iter()
            .filter(|a| a.bid == 2)
            .map(|a| a.block)
            .collect();
        assert_eq!(blocks(&library, 2), elsewhere);
    }

    #[test]
    fn test_unreferenced_cartridges_are_not_walked() {
        let (mut library, _) = memory_library(&[(1, 64)]);
        let cart = library
            .create_cartridge("VTL001", FormatVersion::V1, &[8 * UNIT_SIZE], Some(1))
            .unwrap();
        library.write_segment(cart, 0, SegmentKind::Data).unwrap();
        assert!(blocks(&library, 1).is_empty());
    }

    #[test]
    fn test_v2_first_meta_segment_excluded() {
        let (mut library, _) = memory_library(&[(1, 64)]);
        let changer = library.add_changer("changer0", Default::default()).unwrap();
        let cart = library
            .create_cartridge("VTL001", FormatVersion::V2, &[8 * UNIT_SIZE], Some(1))
            .unwrap();
        let first = library.write_segment(cart, 0, SegmentKind::Meta).unwrap();
        library
            .changer_place(changer, ElementType::Import, 0, cart)
            .unwrap();

        let walked = blocks(&library, 1);
        assert!(!walked.contains(&first.block));

        // only the map storage unit: the first segment lives inside it
        assert_eq!(walked.len(), 1);
        assert_eq!(block_to_unit(walked[0]), block_to_unit(first.block));
    }

    #[test]
    fn test_shadow_marks_multiple_refs() {
        let mut shadow = ShadowSet::new(1);
        let block = crate::bdev::unit_to_block(9);
        assert!(shadow.mark(block).unwrap());
        assert!(!shadow.mark(block + 1).unwrap());
        assert_eq!(shadow.multiple_refs(), 1);
        assert!(shadow.is_marked(block));
        assert_eq!(shadow.touched_indexes(), vec![0]);

        assert!(shadow.take(0).is_some());
        assert!(shadow.take(0).is_none());
    }

    #[test]
    fn test_unknown_disk() {
        let (library, _) = memory_library(&[(1, 64)]);
        assert!(matches!(
            device_check_block(&library, 7),
            Err(CheckError::UnknownDisk(7))
        ));
    }
}
