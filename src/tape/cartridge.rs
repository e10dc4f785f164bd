//! Virtual Tape Cartridges
//!
//! Cartridges live in an arena owned by the library; devices refer to them
//! only by `CartridgeId`.

use super::partition::{SegmentExclusion, TapePartition};
use crate::bdev::BintRegistry;
use crate::error::{Result, RustVtlError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Partitions per cartridge
pub const MAX_PARTITIONS: usize = 4;

/// Stable arena index of a cartridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CartridgeId(pub u32);

impl fmt::Display for CartridgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Segment map layout generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FormatVersion {
    V1,
    #[default]
    V2,
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatVersion::V1 => write!(f, "v1"),
            FormatVersion::V2 => write!(f, "v2"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CartridgeState {
    #[default]
    Created,
    Loaded,
    Exported,
    Unloaded,
    Deleted,
}

impl CartridgeState {
    pub fn can_become(self, next: CartridgeState) -> bool {
        use CartridgeState::*;
        matches!(
            (self, next),
            (Created, Loaded)
                | (Unloaded, Loaded)
                | (Exported, Loaded)
                | (Loaded, Loaded)
                | (Loaded, Unloaded)
                | (Loaded, Exported)
                | (Created, Deleted)
                | (Unloaded, Deleted)
                | (Exported, Deleted)
        )
    }
}

impl fmt::Display for CartridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CartridgeState::Created => "created",
            CartridgeState::Loaded => "loaded",
            CartridgeState::Exported => "exported",
            CartridgeState::Unloaded => "unloaded",
            CartridgeState::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

/// A virtual volume: an ordered list of partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeCartridge {
    id: CartridgeId,
    label: String,
    format: FormatVersion,
    state: CartridgeState,
    partitions: Vec<TapePartition>,
}

impl TapeCartridge {
    pub fn new(id: CartridgeId, label: impl Into<String>, format: FormatVersion) -> Self {
        Self {
            id,
            label: label.into(),
            format,
            state: CartridgeState::Created,
            partitions: Vec::new(),
        }
    }

    pub fn id(&self) -> CartridgeId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn format(&self) -> FormatVersion {
        self.format
    }

    pub fn state(&self) -> CartridgeState {
        self.state
    }

    pub fn partitions(&self) -> &[TapePartition] {
        &self.partitions
    }

    pub fn partition(&self, partition_id: u8) -> Option<&TapePartition> {
        self.partitions
            .iter()
            .find(|p| p.partition_id() == partition_id)
    }

    pub fn set_state(&mut self, next: CartridgeState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(RustVtlError::device(format!(
                "cartridge {} cannot go from {} to {}",
                self.label, self.state, next
            )));
        }
        debug!("Cartridge {} {} -> {}", self.label, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Take a persisted state as is, without transition checks
    pub(crate) fn restore_state(&mut self, state: CartridgeState) {
        self.state = state;
    }

    /// Attach a descriptor whose map storage already exists on disk
    pub fn attach_partition(&mut self, partition: TapePartition) -> Result<()> {
        if self.partitions.len() >= MAX_PARTITIONS {
            return Err(RustVtlError::parameter_validation(format!(
                "cartridge {} already has {} partitions",
                self.label, MAX_PARTITIONS
            )));
        }
        if self.partition(partition.partition_id()).is_some() {
            return Err(RustVtlError::parameter_validation(format!(
                "cartridge {} already has partition {}",
                self.label,
                partition.partition_id()
            )));
        }
        self.partitions.push(partition);
        Ok(())
    }

    /// Lay out a new partition of `size` bytes
    pub fn add_partition(
        &mut self,
        bints: &mut BintRegistry,
        size: u64,
        preferred_bid: Option<u32>,
    ) -> Result<&TapePartition> {
        if self.partitions.len() >= MAX_PARTITIONS {
            return Err(RustVtlError::parameter_validation(format!(
                "cartridge {} already has {} partitions",
                self.label, MAX_PARTITIONS
            )));
        }
        let partition_id = self.partitions.len() as u8;
        let partition = TapePartition::create(bints, partition_id, size, self.format, preferred_bid)?;
        self.partitions.push(partition);
        Ok(&self.partitions[self.partitions.len() - 1])
    }

    /// Release every partition's storage and mark the cartridge deleted
    pub fn destroy(&mut self, bints: &mut BintRegistry, exclusion: &dyn SegmentExclusion) -> Result<()> {
        if !self.state.can_become(CartridgeState::Deleted) {
            return Err(RustVtlError::device(format!(
                "cartridge {} is {} and cannot be deleted",
                self.label, self.state
            )));
        }
        for partition in &self.partitions {
            partition.release_segments(bints, exclusion)?;
        }
        self.partitions.clear();
        self.state = CartridgeState::Deleted;
        info!("Deleted cartridge {}", self.label);
        Ok(())
    }
}

/// Arena of cartridges with explicit liveness
#[derive(Debug, Default)]
pub struct CartridgeRegistry {
    slots: Vec<Option<TapeCartridge>>,
}

impl CartridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cartridge in the first free slot
    pub fn create(&mut self, label: &str, format: FormatVersion) -> Result<CartridgeId> {
        if self.find_by_label(label).is_some() {
            return Err(RustVtlError::parameter_validation(format!(
                "cartridge label {} already in use",
                label
            )));
        }
        let pos = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len());
        let id = CartridgeId(pos as u32);
        let cartridge = TapeCartridge::new(id, label, format);
        if pos == self.slots.len() {
            self.slots.push(Some(cartridge));
        } else {
            self.slots[pos] = Some(cartridge);
        }
        Ok(id)
    }

    /// Insert a cartridge at its own id, as when restoring a configuration
    pub fn insert(&mut self, cartridge: TapeCartridge) -> Result<()> {
        let pos = cartridge.id().0 as usize;
        if self.slots.len() <= pos {
            self.slots.resize_with(pos + 1, || None);
        }
        if self.slots[pos].is_some() {
            return Err(RustVtlError::parameter_validation(format!(
                "cartridge id {} already in use",
                cartridge.id()
            )));
        }
        self.slots[pos] = Some(cartridge);
        Ok(())
    }

    pub fn remove(&mut self, id: CartridgeId) -> Option<TapeCartridge> {
        self.slots.get_mut(id.0 as usize).and_then(Option::take)
    }

    pub fn get(&self, id: CartridgeId) -> Option<&TapeCartridge> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: CartridgeId) -> Option<&mut TapeCartridge> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn require(&self, id: CartridgeId) -> Result<&TapeCartridge> {
        self.get(id)
            .ok_or_else(|| RustVtlError::device(format!("no cartridge with id {}", id)))
    }

    pub fn require_mut(&mut self, id: CartridgeId) -> Result<&mut TapeCartridge> {
        self.get_mut(id)
            .ok_or_else(|| RustVtlError::device(format!("no cartridge with id {}", id)))
    }

    pub fn find_by_label(&self, label: &str) -> Option<&TapeCartridge> {
        self.iter().find(|c| c.label() == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TapeCartridge> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bdev::tests::memory_bint;
    use crate::bdev::UNIT_SIZE;
    use crate::tape::partition::FirstMetaSegmentExclusion;
    use crate::tape::segment::SegmentKind;

    #[test]
    fn test_state_transitions() {
        use CartridgeState::*;
        assert!(Created.can_become(Loaded));
        assert!(Loaded.can_become(Exported));
        assert!(Exported.can_become(Loaded));
        assert!(!Loaded.can_become(Deleted));
        assert!(!Deleted.can_become(Loaded));
        assert!(!Created.can_become(Exported));
    }

    #[test]
    fn test_registry_reuses_slots() {
        let mut carts = CartridgeRegistry::new();
        let a = carts.create("VTL001", FormatVersion::V2).unwrap();
        let b = carts.create("VTL002", FormatVersion::V1).unwrap();
        assert_eq!((a, b), (CartridgeId(0), CartridgeId(1)));
        assert!(carts.create("VTL001", FormatVersion::V2).is_err());

        carts.remove(a);
        let c = carts.create("VTL003", FormatVersion::V2).unwrap();
        assert_eq!(c, CartridgeId(0));
        assert_eq!(carts.len(), 2);

        let restored = TapeCartridge::new(CartridgeId(7), "VTL007", FormatVersion::V2);
        carts.insert(restored).unwrap();
        assert_eq!(carts.get(CartridgeId(7)).unwrap().label(), "VTL007");
        assert!(carts.get(CartridgeId(5)).is_none());
    }

    #[test]
    fn test_destroy_releases_storage() {
        let mut bints = BintRegistry::new();
        let (bint, _) = memory_bint(1, 32 * UNIT_SIZE);
        bints.add(bint).unwrap();
        let free_start = bints.get(1).unwrap().free();

        let mut cart = TapeCartridge::new(CartridgeId(0), "VTL001", FormatVersion::V2);
        cart.add_partition(&mut bints, 8 * UNIT_SIZE, None).unwrap();
        cart.add_partition(&mut bints, 8 * UNIT_SIZE, None).unwrap();
        cart.partitions()[1]
            .append_segment(&mut bints, SegmentKind::Data)
            .unwrap();
        assert_eq!(bints.get(1).unwrap().free(), free_start - 3 * UNIT_SIZE);

        cart.set_state(CartridgeState::Loaded).unwrap();
        assert!(cart.destroy(&mut bints, &FirstMetaSegmentExclusion).is_err());

        cart.set_state(CartridgeState::Unloaded).unwrap();
        cart.destroy(&mut bints, &FirstMetaSegmentExclusion).unwrap();
        assert_eq!(cart.state(), CartridgeState::Deleted);
        assert_eq!(bints.get(1).unwrap().free(), free_start);
    }
}
