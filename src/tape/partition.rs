//! Tape Partitions
//!
//! Every partition owns one allocation unit ("map storage") holding its
//! segment maps:
//!
//! ```text
//! +0 MiB   metadata maps, one 4 KiB page each
//! +4 MiB   data maps
//! +8 MiB   first metadata segment (format v2 only)
//! ```
//!
//! Segments themselves are whole allocation units handed out by the disk
//! registry.

use super::cartridge::FormatVersion;
use super::segment::{
    SegmentKind, TapeSegmentEntry, TapeSegmentMap, MAP_MAX_SEGMENTS, MAX_MAPS_PER_KIND,
};
use crate::bdev::{BintRegistry, BlockAddress, BlockStore, LBA_SHIFT, LBA_SIZE, UNIT_SHIFT};
use crate::error::{Result, RustVtlError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// LBA offset of the data maps inside the map storage unit
pub const DATA_MAPS_LBA_OFFSET: u64 = (4 * 1024 * 1024) >> LBA_SHIFT;
/// LBA offset of the v2 first metadata segment inside the map storage unit
pub const FIRST_META_SEGMENT_LBA_OFFSET: u64 = (8 * 1024 * 1024) >> LBA_SHIFT;

/// Decides which map entries are accounted elsewhere and must be skipped
/// when enumerating reachable blocks or releasing segments
pub trait SegmentExclusion {
    fn is_excluded(
        &self,
        partition: &TapePartition,
        kind: SegmentKind,
        map_id: u32,
        entry_index: usize,
    ) -> bool;
}

/// On v2 cartridges the first metadata segment sits inside the map
/// storage unit, so metadata map 0 entry 0 is already covered by it
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstMetaSegmentExclusion;

impl SegmentExclusion for FirstMetaSegmentExclusion {
    fn is_excluded(
        &self,
        partition: &TapePartition,
        kind: SegmentKind,
        map_id: u32,
        entry_index: usize,
    ) -> bool {
        partition.format() == FormatVersion::V2
            && kind == SegmentKind::Meta
            && map_id == 0
            && entry_index == 0
    }
}

/// Excludes nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExclusion;

impl SegmentExclusion for NoExclusion {
    fn is_excluded(&self, _: &TapePartition, _: SegmentKind, _: u32, _: usize) -> bool {
        false
    }
}

/// One partition of a cartridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapePartition {
    partition_id: u8,
    size: u64,
    format: FormatVersion,
    maps_addr: BlockAddress,
}

impl TapePartition {
    /// Rebuild a partition descriptor for an already laid out map storage
    pub fn new(partition_id: u8, size: u64, format: FormatVersion, maps_addr: BlockAddress) -> Self {
        Self {
            partition_id,
            size,
            format,
            maps_addr,
        }
    }

    /// Allocate and zero the map storage unit of a new partition
    pub fn create(
        bints: &mut BintRegistry,
        partition_id: u8,
        size: u64,
        format: FormatVersion,
        preferred_bid: Option<u32>,
    ) -> Result<Self> {
        let maps_addr = bints.allocate_unit(preferred_bid)?;
        let partition = Self::new(partition_id, size, format, maps_addr);

        if let Err(e) = partition.zero_maps(bints) {
            warn!(
                "Failed to initialise map storage at {}: {}",
                maps_addr, e
            );
            bints.release_unit(maps_addr)?;
            return Err(e);
        }

        info!(
            "Created partition {} ({} bytes, {}) with map storage at {}",
            partition_id, size, format, maps_addr
        );
        Ok(partition)
    }

    fn zero_maps(&self, bints: &BintRegistry) -> Result<()> {
        let store = self.map_store(bints)?;
        let zero = vec![0u8; LBA_SIZE];
        for kind in SegmentKind::ALL {
            for map_id in 0..self.max_maps(kind) {
                store.write_block(self.map_lba(kind, map_id), &zero, false)?;
            }
        }
        Ok(())
    }

    pub fn partition_id(&self) -> u8 {
        self.partition_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn format(&self) -> FormatVersion {
        self.format
    }

    /// First block of the unit holding this partition's maps
    pub fn maps_addr(&self) -> BlockAddress {
        self.maps_addr
    }

    /// Maps of `kind` this partition may carry
    pub fn max_maps(&self, kind: SegmentKind) -> u32 {
        let units = self.size >> UNIT_SHIFT;
        let per_map = MAP_MAX_SEGMENTS as u64;
        let data = std::cmp::max((units + per_map - 1) / per_map, 1);
        let count = match kind {
            SegmentKind::Data => data,
            SegmentKind::Meta => std::cmp::max(data >> 2, 1),
        };
        std::cmp::min(count, MAX_MAPS_PER_KIND as u64) as u32
    }

    /// LBA of map `map_id` of `kind` on the map storage disk
    pub fn map_lba(&self, kind: SegmentKind, map_id: u32) -> u64 {
        let base = match kind {
            SegmentKind::Meta => 0,
            SegmentKind::Data => DATA_MAPS_LBA_OFFSET,
        };
        self.maps_addr.block + base + map_id as u64
    }

    pub fn first_meta_segment(&self) -> BlockAddress {
        BlockAddress::new(
            self.maps_addr.bid,
            self.maps_addr.block + FIRST_META_SEGMENT_LBA_OFFSET,
        )
    }

    fn map_store(&self, bints: &BintRegistry) -> Result<Arc<dyn BlockStore>> {
        bints
            .get(self.maps_addr.bid)
            .map(|bint| bint.store().clone())
            .ok_or_else(|| {
                RustVtlError::structural(format!(
                    "cannot locate bint {} holding partition {} maps",
                    self.maps_addr.bid, self.partition_id
                ))
            })
    }

    /// Load map `map_id` of `kind`. The caller owns the result and hands it
    /// back through `TapeSegmentMap::unload`.
    pub fn locate_map(
        &self,
        bints: &BintRegistry,
        kind: SegmentKind,
        map_id: u32,
    ) -> Result<TapeSegmentMap> {
        if map_id >= self.max_maps(kind) {
            return Err(RustVtlError::parameter_validation(format!(
                "{} map {} beyond partition {} limit {}",
                kind,
                map_id,
                self.partition_id,
                self.max_maps(kind)
            )));
        }

        let store = self.map_store(bints)?;
        let lba = self.map_lba(kind, map_id);
        let mut page = vec![0u8; LBA_SIZE];
        store.read_block(lba, &mut page)?;

        debug!(
            "Loaded {} map {} of partition {} from {}:{}",
            kind, map_id, self.partition_id, self.maps_addr.bid, lba
        );
        TapeSegmentMap::from_page(kind, map_id, BlockAddress::new(self.maps_addr.bid, lba), &page)
    }

    fn write_map(&self, bints: &BintRegistry, map: &TapeSegmentMap) -> Result<()> {
        let store = self.map_store(bints)?;
        store.write_block(map.location().block, &map.to_page(), true)
    }

    /// Fill the next free segment slot of `kind` and return the segment's
    /// address
    pub fn append_segment(
        &self,
        bints: &mut BintRegistry,
        kind: SegmentKind,
    ) -> Result<BlockAddress> {
        for map_id in 0..self.max_maps(kind) {
            let mut map = self.locate_map(bints, kind, map_id)?;
            if map.is_full() {
                map.unload();
                continue;
            }

            let in_map_storage = self.format == FormatVersion::V2
                && kind == SegmentKind::Meta
                && map_id == 0
                && map.populated() == 0;

            let addr = if in_map_storage {
                self.first_meta_segment()
            } else {
                bints.allocate_unit(Some(self.maps_addr.bid))?
            };

            let stored = TapeSegmentEntry::encode(addr)
                .and_then(|entry| map.push(entry))
                .and_then(|_| self.write_map(bints, &map));
            map.unload();

            if let Err(e) = stored {
                warn!("Failed to record {} segment {}: {}", kind, addr, e);
                if !in_map_storage {
                    bints.release_unit(addr)?;
                }
                return Err(e);
            }

            debug!(
                "Partition {} appended {} segment {} in map {}",
                self.partition_id, kind, addr, map_id
            );
            return Ok(addr);
        }

        Err(RustVtlError::allocation(format!(
            "partition {} has no free {} map slots",
            self.partition_id, kind
        )))
    }

    /// Addresses of every populated, non-excluded segment
    pub fn segments(
        &self,
        bints: &BintRegistry,
        exclusion: &dyn SegmentExclusion,
    ) -> Result<Vec<BlockAddress>> {
        let mut out = Vec::new();
        for kind in SegmentKind::ALL {
            'maps: for map_id in 0..self.max_maps(kind) {
                let map = self.locate_map(bints, kind, map_id)?;
                let mut ended = false;
                for (idx, entry) in map.entries().iter().enumerate() {
                    let Some(addr) = entry.decode()? else {
                        ended = true;
                        break;
                    };
                    if !exclusion.is_excluded(self, kind, map_id, idx) {
                        out.push(addr);
                    }
                }
                map.unload();
                if ended {
                    break 'maps;
                }
            }
        }
        Ok(out)
    }

    /// Free every segment and the map storage unit
    pub fn release_segments(
        &self,
        bints: &mut BintRegistry,
        exclusion: &dyn SegmentExclusion,
    ) -> Result<()> {
        let segments = self.segments(bints, exclusion)?;
        for addr in &segments {
            bints.release_unit(*addr)?;
        }
        bints.release_unit(self.maps_addr)?;

        info!(
            "Released partition {}: {} segments and map storage {}",
            self.partition_id,
            segments.len(),
            self.maps_addr
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdev::tests::memory_bint;
    use crate::bdev::{block_to_unit, UNIT_SIZE};

    fn registry(units: u64) -> BintRegistry {
        let mut bints = BintRegistry::new();
        let (bint, _) = memory_bint(1, units * UNIT_SIZE);
        bints.add(bint).unwrap();
        bints
    }

    #[test]
    fn test_max_maps() {
        let part = TapePartition::new(0, 100 * UNIT_SIZE, FormatVersion::V1, BlockAddress::new(1, 0));
        assert_eq!(part.max_maps(SegmentKind::Data), 1);
        assert_eq!(part.max_maps(SegmentKind::Meta), 1);

        let part = TapePartition::new(0, 511 * 9 * UNIT_SIZE, FormatVersion::V1, BlockAddress::new(1, 0));
        assert_eq!(part.max_maps(SegmentKind::Data), 9);
        assert_eq!(part.max_maps(SegmentKind::Meta), 2);

        let part = TapePartition::new(0, (511 * 9 + 1) * UNIT_SIZE, FormatVersion::V1, BlockAddress::new(1, 0));
        assert_eq!(part.max_maps(SegmentKind::Data), 10);

        let huge = TapePartition::new(0, u64::MAX, FormatVersion::V1, BlockAddress::new(1, 0));
        assert_eq!(huge.max_maps(SegmentKind::Data), MAX_MAPS_PER_KIND);
    }

    #[test]
    fn test_create_and_append() {
        let mut bints = registry(32);
        let part = TapePartition::create(&mut bints, 0, 16 * UNIT_SIZE, FormatVersion::V1, Some(1)).unwrap();
        assert_eq!(block_to_unit(part.maps_addr().block), 4);

        let meta = part.append_segment(&mut bints, SegmentKind::Meta).unwrap();
        let data = part.append_segment(&mut bints, SegmentKind::Data).unwrap();
        assert_ne!(meta, data);

        let map = part.locate_map(&bints, SegmentKind::Data, 0).unwrap();
        assert_eq!(map.populated(), 1);
        assert_eq!(map.entry(0).unwrap().decode().unwrap(), Some(data));
        map.unload();

        let segments = part.segments(&bints, &NoExclusion).unwrap();
        assert_eq!(segments, vec![meta, data]);
    }

    #[test]
    fn test_v2_first_meta_segment_lives_in_map_storage() {
        let mut bints = registry(32);
        let part = TapePartition::create(&mut bints, 0, 16 * UNIT_SIZE, FormatVersion::V2, Some(1)).unwrap();
        let free_before = bints.get(1).unwrap().free();

        let first = part.append_segment(&mut bints, SegmentKind::Meta).unwrap();
        assert_eq!(first, part.first_meta_segment());
        assert_eq!(block_to_unit(first.block), block_to_unit(part.maps_addr().block));
        assert_eq!(bints.get(1).unwrap().free(), free_before);

        let second = part.append_segment(&mut bints, SegmentKind::Meta).unwrap();
        assert_ne!(block_to_unit(second.block), block_to_unit(part.maps_addr().block));

        let excluded = part.segments(&bints, &FirstMetaSegmentExclusion).unwrap();
        assert_eq!(excluded, vec![second]);
        let all = part.segments(&bints, &NoExclusion).unwrap();
        assert_eq!(all, vec![first, second]);
    }

    #[test]
    fn test_locate_map_out_of_range() {
        let mut bints = registry(32);
        let part = TapePartition::create(&mut bints, 0, 16 * UNIT_SIZE, FormatVersion::V1, None).unwrap();
        assert!(part.locate_map(&bints, SegmentKind::Meta, 1).is_err());
    }

    #[test]
    fn test_release_segments() {
        let mut bints = registry(32);
        let free_start = bints.get(1).unwrap().free();

        let part = TapePartition::create(&mut bints, 0, 16 * UNIT_SIZE, FormatVersion::V2, Some(1)).unwrap();
        for _ in 0..3 {
            part.append_segment(&mut bints, SegmentKind::Data).unwrap();
        }
        part.append_segment(&mut bints, SegmentKind::Meta).unwrap();
        assert_eq!(bints.get(1).unwrap().free(), free_start - 4 * UNIT_SIZE);

        part.release_segments(&mut bints, &FirstMetaSegmentExclusion).unwrap();
        assert_eq!(bints.get(1).unwrap().free(), free_start);
    }

    #[test]
    fn test_append_fails_when_disk_full() {
        let mut bints = registry(6);
        let part = TapePartition::create(&mut bints, 0, 16 * UNIT_SIZE, FormatVersion::V1, None).unwrap();
        part.append_segment(&mut bints, SegmentKind::Data).unwrap();
        let result = part.append_segment(&mut bints, SegmentKind::Data);
        assert!(matches!(result, Err(RustVtlError::Allocation(_))));

        let map = part.locate_map(&bints, SegmentKind::Data, 0).unwrap();
        assert_eq!(map.populated(), 1);
    }
}
