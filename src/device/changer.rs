//! Media Changer
//!
//! A changer owns four disjoint element families plus an export list of
//! cartridges pulled out of the library that it still tracks.

use crate::error::{Result, RustVtlError};
use crate::tape::CartridgeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Storage,
    Import,
    Export,
    Transfer,
}

impl ElementType {
    pub const ALL: [ElementType; 4] = [
        ElementType::Storage,
        ElementType::Import,
        ElementType::Export,
        ElementType::Transfer,
    ];
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ElementType::Storage => "storage",
            ElementType::Import => "import",
            ElementType::Export => "export",
            ElementType::Transfer => "data-transfer",
        };
        write!(f, "{}", s)
    }
}

/// Element counts for a new changer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangerLayout {
    pub storage: usize,
    pub import: usize,
    pub export: usize,
    pub transfer: usize,
}

impl Default for ChangerLayout {
    fn default() -> Self {
        Self {
            storage: 16,
            import: 1,
            export: 1,
            transfer: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaChanger {
    name: String,
    storage: Vec<Option<CartridgeId>>,
    import: Vec<Option<CartridgeId>>,
    export: Vec<Option<CartridgeId>>,
    transfer: Vec<Option<CartridgeId>>,
    export_list: Vec<CartridgeId>,
}

impl MediaChanger {
    pub fn new(name: impl Into<String>, layout: ChangerLayout) -> Self {
        Self {
            name: name.into(),
            storage: vec![None; layout.storage],
            import: vec![None; layout.import],
            export: vec![None; layout.export],
            transfer: vec![None; layout.transfer],
            export_list: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> ChangerLayout {
        ChangerLayout {
            storage: self.storage.len(),
            import: self.import.len(),
            export: self.export.len(),
            transfer: self.transfer.len(),
        }
    }

    pub fn elements(&self, kind: ElementType) -> &[Option<CartridgeId>] {
        match kind {
            ElementType::Storage => &self.storage,
            ElementType::Import => &self.import,
            ElementType::Export => &self.export,
            ElementType::Transfer => &self.transfer,
        }
    }

    fn elements_mut(&mut self, kind: ElementType) -> &mut Vec<Option<CartridgeId>> {
        match kind {
            ElementType::Storage => &mut self.storage,
            ElementType::Import => &mut self.import,
            ElementType::Export => &mut self.export,
            ElementType::Transfer => &mut self.transfer,
        }
    }

    fn slot_mut(&mut self, kind: ElementType, slot: usize) -> Result<&mut Option<CartridgeId>> {
        let name = self.name.clone();
        self.elements_mut(kind).get_mut(slot).ok_or_else(|| {
            RustVtlError::device(format!("changer {} has no {} element {}", name, kind, slot))
        })
    }

    pub fn export_list(&self) -> &[CartridgeId] {
        &self.export_list
    }

    pub fn element_of(&self, cartridge: CartridgeId) -> Option<(ElementType, usize)> {
        ElementType::ALL.iter().find_map(|&kind| {
            self.elements(kind)
                .iter()
                .position(|slot| *slot == Some(cartridge))
                .map(|pos| (kind, pos))
        })
    }

    pub fn contains(&self, cartridge: CartridgeId) -> bool {
        self.element_of(cartridge).is_some() || self.export_list.contains(&cartridge)
    }

    /// Put a cartridge into an empty element
    pub fn place(&mut self, kind: ElementType, slot: usize, cartridge: CartridgeId) -> Result<()> {
        if self.contains(cartridge) {
            return Err(RustVtlError::device(format!(
                "cartridge {} already tracked by changer {}",
                cartridge, self.name
            )));
        }
        let name = self.name.clone();
        let target = self.slot_mut(kind, slot)?;
        if let Some(current) = target {
            return Err(RustVtlError::device(format!(
                "changer {} {} element {} holds {}",
                name, kind, slot, current
            )));
        }
        *target = Some(cartridge);
        debug!("Changer {} placed {} in {} {}", name, cartridge, kind, slot);
        Ok(())
    }

    /// Empty an element, returning its cartridge
    pub fn take(&mut self, kind: ElementType, slot: usize) -> Result<CartridgeId> {
        let name = self.name.clone();
        self.slot_mut(kind, slot)?.take().ok_or_else(|| {
            RustVtlError::device(format!("changer {} {} element {} is empty", name, kind, slot))
        })
    }

    pub fn move_medium(
        &mut self,
        src: (ElementType, usize),
        dst: (ElementType, usize),
    ) -> Result<CartridgeId> {
        if self.slot_mut(dst.0, dst.1)?.is_some() {
            return Err(RustVtlError::device(format!(
                "changer {} {} element {} is full",
                self.name, dst.0, dst.1
            )));
        }
        let cartridge = self.take(src.0, src.1)?;
        *self.slot_mut(dst.0, dst.1)? = Some(cartridge);
        debug!(
            "Changer {} moved {} from {} {} to {} {}",
            self.name, cartridge, src.0, src.1, dst.0, dst.1
        );
        Ok(cartridge)
    }

    /// Pull a cartridge out of an element onto the export list
    pub fn export(&mut self, kind: ElementType, slot: usize) -> Result<CartridgeId> {
        let cartridge = self.take(kind, slot)?;
        self.export_list.push(cartridge);
        debug!("Changer {} exported {}", self.name, cartridge);
        Ok(cartridge)
    }

    /// Bring an exported cartridge back through an import element
    pub fn import(&mut self, cartridge: CartridgeId, slot: usize) -> Result<()> {
        let pos = self
            .export_list
            .iter()
            .position(|&c| c == cartridge)
            .ok_or_else(|| {
                RustVtlError::device(format!(
                    "cartridge {} is not on changer {} export list",
                    cartridge, self.name
                ))
            })?;

        let name = self.name.clone();
        let target = self.slot_mut(ElementType::Import, slot)?;
        if target.is_some() {
            return Err(RustVtlError::device(format!(
                "changer {} import element {} is full",
                name, slot
            )));
        }
        *target = Some(cartridge);
        self.export_list.remove(pos);
        debug!("Changer {} imported {} into slot {}", name, cartridge, slot);
        Ok(())
    }

    /// Restore an export list entry, as when rebuilding from configuration
    pub fn track_exported(&mut self, cartridge: CartridgeId) {
        if !self.export_list.contains(&cartridge) {
            self.export_list.push(cartridge);
        }
    }

    /// Every cartridge in storage, import, export and data-transfer elements,
    /// followed by the export list
    pub fn cartridges(&self) -> Vec<CartridgeId> {
        ElementType::ALL
            .iter()
            .flat_map(|&kind| self.elements(kind).iter().flatten().copied())
            .chain(self.export_list.iter().copied())
            .collect()
    }
}
