//! Device Graph
//!
//! Drives and changers sit in a fixed-capacity table indexed by a stable
//! device id. The checker only ever needs one question answered by each
//! node: which cartridges does it keep alive.

pub mod changer;
pub mod drive;

pub use changer::{ChangerLayout, ElementType, MediaChanger};
pub use drive::TapeDrive;

use crate::error::{Result, RustVtlError};
use crate::tape::CartridgeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Capacity of the device table
pub const MAX_DEVICES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNode {
    Drive(TapeDrive),
    Changer(MediaChanger),
}

impl DeviceNode {
    pub fn name(&self) -> &str {
        match self {
            DeviceNode::Drive(drive) => drive.name(),
            DeviceNode::Changer(changer) => changer.name(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceNode::Drive(_) => "drive",
            DeviceNode::Changer(_) => "changer",
        }
    }

    /// Cartridges referenced from this node, in slot order
    pub fn cartridges(&self) -> Vec<CartridgeId> {
        match self {
            DeviceNode::Drive(drive) => drive.cartridges(),
            DeviceNode::Changer(changer) => changer.cartridges(),
        }
    }

    /// Whether the node holds the cartridge in a way that pins it: mounted in
    /// a drive, or tracked by a changer
    pub fn holds(&self, cartridge: CartridgeId) -> bool {
        match self {
            DeviceNode::Drive(drive) => drive.loaded() == Some(cartridge),
            DeviceNode::Changer(changer) => changer.contains(cartridge),
        }
    }
}

pub struct DeviceTable {
    slots: Vec<Option<DeviceNode>>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_DEVICES).map(|_| None).collect(),
        }
    }

    /// Insert into the first empty slot
    pub fn add(&mut self, node: DeviceNode) -> Result<DeviceId> {
        let pos = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or_else(|| RustVtlError::device("device table is full"))?;
        self.slots[pos] = Some(node);
        Ok(DeviceId(pos as u32))
    }

    pub fn insert_at(&mut self, id: DeviceId, node: DeviceNode) -> Result<()> {
        match self.slots.get_mut(id.0 as usize) {
            None => Err(RustVtlError::device(format!("device id {} out of range", id))),
            Some(Some(_)) => Err(RustVtlError::device(format!("device id {} in use", id))),
            Some(slot) => {
                *slot = Some(node);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<DeviceNode> {
        self.slots.get_mut(id.0 as usize).and_then(Option::take)
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceNode> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut DeviceNode> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn drive_mut(&mut self, id: DeviceId) -> Result<&mut TapeDrive> {
        match self.get_mut(id) {
            Some(DeviceNode::Drive(drive)) => Ok(drive),
            Some(_) => Err(RustVtlError::device(format!("{} is not a drive", id))),
            None => Err(RustVtlError::device(format!("no device {}", id))),
        }
    }

    pub fn changer_mut(&mut self, id: DeviceId) -> Result<&mut MediaChanger> {
        match self.get_mut(id) {
            Some(DeviceNode::Changer(changer)) => Ok(changer),
            Some(_) => Err(RustVtlError::device(format!("{} is not a changer", id))),
            None => Err(RustVtlError::device(format!("no device {}", id))),
        }
    }

    /// Occupied slots in id order
    pub fn for_each_device(&self) -> impl Iterator<Item = (DeviceId, &DeviceNode)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(pos, slot)| slot.as_ref().map(|node| (DeviceId(pos as u32), node)))
    }

    pub fn for_each_device_mut(&mut self) -> impl Iterator<Item = (DeviceId, &mut DeviceNode)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(pos, slot)| slot.as_mut().map(|node| (DeviceId(pos as u32), node)))
    }

    pub fn len(&self) -> usize {
        self.for_each_device().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every cartridge referenced by any device, once, in first-seen order
    pub fn reachable_cartridges(&self) -> Vec<CartridgeId> {
        let mut seen = HashSet::new();
        self.for_each_device()
            .flat_map(|(_, node)| node.cartridges())
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Device pinning a cartridge, if any
    pub fn holder_of(&self, cartridge: CartridgeId) -> Option<DeviceId> {
        self.for_each_device()
            .find(|(_, node)| node.holds(cartridge))
            .map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_slots() {
        let mut table = DeviceTable::new();
        let a = table.add(DeviceNode::Drive(TapeDrive::new("d0"))).unwrap();
        let b = table
            .add(DeviceNode::Changer(MediaChanger::new("c0", ChangerLayout::default())))
            .unwrap();
        assert_eq!((a, b), (DeviceId(0), DeviceId(1)));

        table.remove(a);
        assert_eq!(table.len(), 1);
        let ids: Vec<_> = table.for_each_device().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![DeviceId(1)]);

        assert!(table.insert_at(DeviceId(1), DeviceNode::Drive(TapeDrive::new("x"))).is_err());
        assert!(table
            .insert_at(DeviceId(MAX_DEVICES as u32), DeviceNode::Drive(TapeDrive::new("x")))
            .is_err());
        assert!(table.drive_mut(b).is_err());
        assert!(table.changer_mut(b).is_ok());
    }

    #[test]
    fn test_reachable_cartridges_deduplicated() {
        let mut table = DeviceTable::new();
        let mut drive = TapeDrive::new("d0");
        drive.load(CartridgeId(3)).unwrap();
        drive.unload().unwrap();
        drive.load(CartridgeId(1)).unwrap();
        table.add(DeviceNode::Drive(drive)).unwrap();

        let mut changer = MediaChanger::new("c0", ChangerLayout::default());
        changer.place(ElementType::Storage, 0, CartridgeId(3)).unwrap();
        changer.place(ElementType::Storage, 1, CartridgeId(9)).unwrap();
        changer.export(ElementType::Storage, 1).unwrap();
        table.add(DeviceNode::Changer(changer)).unwrap();

        assert_eq!(
            table.reachable_cartridges(),
            vec![CartridgeId(3), CartridgeId(1), CartridgeId(9)]
        );
        assert_eq!(table.holder_of(CartridgeId(1)), Some(DeviceId(0)));
        assert_eq!(table.holder_of(CartridgeId(9)), Some(DeviceId(1)));
        assert_eq!(table.holder_of(CartridgeId(4)), None);
    }
}
