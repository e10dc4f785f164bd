//! Library Store
//!
//! Owns every registry the rest of the crate works on: backing disks,
//! cartridges and the device table. Operations that touch more than one
//! registry (creating a cartridge, loading it into a drive, exporting it from
//! a changer) live here so that cartridge states follow device moves.

use crate::bdev::{
    BintRegistry, BlockAddress, BlockInterface, FileBlockStore, UNIT_SIZE,
};
use crate::config::{
    CartridgeConfig, ChangerConfig, DiskConfig, DriveConfig, ElementConfig, LibraryConfig,
    MediaRef, PartitionConfig,
};
use crate::device::{
    ChangerLayout, DeviceId, DeviceNode, DeviceTable, ElementType, MediaChanger, TapeDrive,
};
use crate::error::{Result, RustVtlError};
use crate::tape::{
    CartridgeId, CartridgeRegistry, CartridgeState, FirstMetaSegmentExclusion, FormatVersion,
    SegmentExclusion, SegmentKind, TapeCartridge, TapePartition,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Space accounting for one disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskUsage {
    pub bid: u32,
    pub usable: u64,
    pub free: u64,
    pub used: u64,
    pub degraded: bool,
    pub path: Option<PathBuf>,
}

pub struct Library {
    pub(crate) bints: BintRegistry,
    pub(crate) cartridges: CartridgeRegistry,
    pub(crate) devices: DeviceTable,
    exclusion: Box<dyn SegmentExclusion + Send + Sync>,
    disk_paths: BTreeMap<u32, PathBuf>,
}

impl Default for Library {
    fn default() -> Self {
        Self::new()
    }
}

impl Library {
    pub fn new() -> Self {
        Self::with_exclusion(Box::new(FirstMetaSegmentExclusion))
    }

    pub fn with_exclusion(exclusion: Box<dyn SegmentExclusion + Send + Sync>) -> Self {
        Self {
            bints: BintRegistry::new(),
            cartridges: CartridgeRegistry::new(),
            devices: DeviceTable::new(),
            exclusion,
            disk_paths: BTreeMap::new(),
        }
    }

    pub fn bints(&self) -> &BintRegistry {
        &self.bints
    }

    pub fn bints_mut(&mut self) -> &mut BintRegistry {
        &mut self.bints
    }

    pub fn cartridges(&self) -> &CartridgeRegistry {
        &self.cartridges
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn exclusion(&self) -> &(dyn SegmentExclusion + Send + Sync) {
        self.exclusion.as_ref()
    }

    pub fn add_disk(&mut self, bint: BlockInterface) -> Result<()> {
        info!("Adding bint {} ({} bytes)", bint.bid(), bint.usable_size());
        self.bints.add(bint)
    }

    /// Open a formatted disk image and register it
    pub fn attach_disk_file<P: AsRef<Path>>(&mut self, bid: u32, path: P) -> Result<()> {
        let store = FileBlockStore::open(path.as_ref())?;
        let bint = BlockInterface::open(bid, Arc::new(store))?;
        self.add_disk(bint)?;
        self.disk_paths.insert(bid, path.as_ref().to_path_buf());
        Ok(())
    }

    pub fn disk_path(&self, bid: u32) -> Option<&Path> {
        self.disk_paths.get(&bid).map(PathBuf::as_path)
    }

    pub fn disk_usage(&self) -> Vec<DiskUsage> {
        self.bints
            .iter()
            .map(|bint| DiskUsage {
                bid: bint.bid(),
                usable: bint.allocatable_units() * UNIT_SIZE,
                free: bint.free(),
                used: bint.used(),
                degraded: bint.is_degraded(),
                path: self.disk_paths.get(&bint.bid()).cloned(),
            })
            .collect()
    }

    /// Create a cartridge and lay out its partitions. A failure part way
    /// releases whatever was already allocated.
    pub fn create_cartridge(
        &mut self,
        label: &str,
        format: FormatVersion,
        partition_sizes: &[u64],
        preferred_bid: Option<u32>,
    ) -> Result<CartridgeId> {
        let id = self.cartridges.create(label, format)?;

        let mut failure = None;
        if let Some(cartridge) = self.cartridges.get_mut(id) {
            for &size in partition_sizes {
                if let Err(e) = cartridge.add_partition(&mut self.bints, size, preferred_bid) {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            warn!("Failed to create cartridge {}: {}", label, e);
            if let Some(mut cartridge) = self.cartridges.remove(id) {
                cartridge.destroy(&mut self.bints, self.exclusion.as_ref())?;
            }
            return Err(e);
        }

        info!(
            "Created cartridge {} ({}) with {} partitions",
            label,
            id,
            partition_sizes.len()
        );
        Ok(id)
    }

    /// Record a new segment of `kind` on a cartridge partition
    pub fn write_segment(
        &mut self,
        id: CartridgeId,
        partition_id: u8,
        kind: SegmentKind,
    ) -> Result<BlockAddress> {
        let cartridge = self.cartridges.require(id)?;
        let partition = cartridge.partition(partition_id).ok_or_else(|| {
            RustVtlError::parameter_validation(format!(
                "cartridge {} has no partition {}",
                cartridge.label(),
                partition_id
            ))
        })?;
        partition.append_segment(&mut self.bints, kind)
    }

    /// Delete a cartridge that no device pins, releasing its storage
    pub fn delete_cartridge(&mut self, id: CartridgeId) -> Result<()> {
        if let Some(holder) = self.devices.holder_of(id) {
            return Err(RustVtlError::device(format!(
                "cartridge {} is still referenced by {}",
                id, holder
            )));
        }

        let cartridge = self.cartridges.require_mut(id)?;
        cartridge.destroy(&mut self.bints, self.exclusion.as_ref())?;

        for (_, node) in self.devices.for_each_device_mut() {
            if let DeviceNode::Drive(drive) = node {
                drive.forget(id);
            }
        }
        self.cartridges.remove(id);
        Ok(())
    }

    pub fn add_drive(&mut self, name: &str) -> Result<DeviceId> {
        self.devices.add(DeviceNode::Drive(TapeDrive::new(name)))
    }

    pub fn add_changer(&mut self, name: &str, layout: ChangerLayout) -> Result<DeviceId> {
        self.devices
            .add(DeviceNode::Changer(MediaChanger::new(name, layout)))
    }

    fn require_transition(&self, id: CartridgeId, next: CartridgeState) -> Result<()> {
        let cartridge = self.cartridges.require(id)?;
        if !cartridge.state().can_become(next) {
            return Err(RustVtlError::device(format!(
                "cartridge {} is {} and cannot become {}",
                cartridge.label(),
                cartridge.state(),
                next
            )));
        }
        Ok(())
    }

    fn set_state(&mut self, id: CartridgeId, next: CartridgeState) -> Result<()> {
        self.cartridges.require_mut(id)?.set_state(next)
    }

    pub fn load_drive(&mut self, drive: DeviceId, id: CartridgeId) -> Result<()> {
        self.require_transition(id, CartridgeState::Loaded)?;
        self.devices.drive_mut(drive)?.load(id)?;
        self.set_state(id, CartridgeState::Loaded)
    }

    pub fn unload_drive(&mut self, drive: DeviceId) -> Result<CartridgeId> {
        let id = self.devices.drive_mut(drive)?.unload()?;
        if self.devices.holder_of(id).is_none() {
            self.set_state(id, CartridgeState::Unloaded)?;
        }
        Ok(id)
    }

    pub fn changer_place(
        &mut self,
        changer: DeviceId,
        kind: ElementType,
        slot: usize,
        id: CartridgeId,
    ) -> Result<()> {
        self.require_transition(id, CartridgeState::Loaded)?;
        self.devices.changer_mut(changer)?.place(kind, slot, id)?;
        self.set_state(id, CartridgeState::Loaded)
    }

    pub fn changer_move(
        &mut self,
        changer: DeviceId,
        src: (ElementType, usize),
        dst: (ElementType, usize),
    ) -> Result<CartridgeId> {
        self.devices.changer_mut(changer)?.move_medium(src, dst)
    }

    pub fn changer_export(
        &mut self,
        changer: DeviceId,
        kind: ElementType,
        slot: usize,
    ) -> Result<CartridgeId> {
        let id = self.devices.changer_mut(changer)?.export(kind, slot)?;
        self.set_state(id, CartridgeState::Exported)?;
        Ok(id)
    }

    pub fn changer_import(&mut self, changer: DeviceId, id: CartridgeId, slot: usize) -> Result<()> {
        self.require_transition(id, CartridgeState::Loaded)?;
        self.devices.changer_mut(changer)?.import(id, slot)?;
        self.set_state(id, CartridgeState::Loaded)
    }

    /// Rebuild a library from its configuration, opening every disk image
    pub fn from_config(config: &LibraryConfig) -> Result<Self> {
        let mut library = Self::new();

        for disk in &config.disks {
            library.attach_disk_file(disk.bid, &disk.path)?;
        }

        for cart in &config.cartridges {
            let mut cartridge = TapeCartridge::new(CartridgeId(cart.id), &cart.label, cart.format);
            for part in &cart.partitions {
                if library.bints.get(part.maps_bid).is_none() {
                    return Err(RustVtlError::config(format!(
                        "cartridge {} partition {} maps live on unknown disk {}",
                        cart.label, part.id, part.maps_bid
                    )));
                }
                cartridge.attach_partition(TapePartition::new(
                    part.id,
                    part.size,
                    cart.format,
                    BlockAddress::new(part.maps_bid, part.maps_block),
                ))?;
            }
            cartridge.restore_state(cart.state);
            library.cartridges.insert(cartridge)?;
        }

        for drive_cfg in &config.drives {
            let mut drive = TapeDrive::new(&drive_cfg.name);
            for media in &drive_cfg.media {
                drive.remember(library.known_cartridge(media.cartridge)?);
            }
            if let Some(loaded) = drive_cfg.loaded {
                drive.load(library.known_cartridge(loaded)?)?;
            }
            library
                .devices
                .insert_at(DeviceId(drive_cfg.id), DeviceNode::Drive(drive))?;
        }

        for changer_cfg in &config.changers {
            let layout = ChangerLayout {
                storage: changer_cfg.storage,
                import: changer_cfg.import,
                export: changer_cfg.export,
                transfer: changer_cfg.transfer,
            };
            let mut changer = MediaChanger::new(&changer_cfg.name, layout);
            for element in &changer_cfg.elements {
                let id = library.known_cartridge(element.cartridge)?;
                changer.place(element.kind, element.slot, id)?;
            }
            for exported in &changer_cfg.exported {
                changer.track_exported(library.known_cartridge(exported.cartridge)?);
            }
            library
                .devices
                .insert_at(DeviceId(changer_cfg.id), DeviceNode::Changer(changer))?;
        }

        info!(
            "Library loaded: {} disks, {} cartridges, {} devices",
            library.bints.len(),
            library.cartridges.len(),
            library.devices.len()
        );
        Ok(library)
    }

    fn known_cartridge(&self, raw: u32) -> Result<CartridgeId> {
        let id = CartridgeId(raw);
        if self.cartridges.get(id).is_none() {
            return Err(RustVtlError::config(format!(
                "device references unknown cartridge {}",
                id
            )));
        }
        Ok(id)
    }

    /// Describe the current library. Disks without a backing file path are
    /// left out.
    pub fn to_config(&self) -> LibraryConfig {
        let disks = self
            .disk_paths
            .iter()
            .map(|(bid, path)| DiskConfig {
                bid: *bid,
                path: path.display().to_string(),
            })
            .collect();

        let cartridges = self
            .cartridges
            .iter()
            .map(|cart| CartridgeConfig {
                id: cart.id().0,
                label: cart.label().to_string(),
                format: cart.format(),
                state: cart.state(),
                partitions: cart
                    .partitions()
                    .iter()
                    .map(|part| PartitionConfig {
                        id: part.partition_id(),
                        size: part.size(),
                        maps_bid: part.maps_addr().bid,
                        maps_block: part.maps_addr().block,
                    })
                    .collect(),
            })
            .collect();

        let mut drives = Vec::new();
        let mut changers = Vec::new();
        for (id, node) in self.devices.for_each_device() {
            match node {
                DeviceNode::Drive(drive) => drives.push(DriveConfig {
                    id: id.0,
                    name: drive.name().to_string(),
                    loaded: drive.loaded().map(|c| c.0),
                    media: drive
                        .media_list()
                        .iter()
                        .map(|c| MediaRef { cartridge: c.0 })
                        .collect(),
                }),
                DeviceNode::Changer(changer) => {
                    let layout = changer.layout();
                    let elements = ElementType::ALL
                        .iter()
                        .flat_map(|&kind| {
                            changer
                                .elements(kind)
                                .iter()
                                .enumerate()
                                .filter_map(move |(slot, held)| {
                                    held.map(|c| ElementConfig {
                                        kind,
                                        slot,
                                        cartridge: c.0,
                                    })
                                })
                        })
                        .collect();
                    changers.push(ChangerConfig {
                        id: id.0,
                        name: changer.name().to_string(),
                        storage: layout.storage,
                        import: layout.import,
                        export: layout.export,
                        transfer: layout.transfer,
                        elements,
                        exported: changer
                            .export_list()
                            .iter()
                            .map(|c| MediaRef { cartridge: c.0 })
                            .collect(),
                    });
                }
            }
        }

        LibraryConfig {
            disks,
            cartridges,
            drives,
            changers,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bdev::tests::memory_bint;
    use crate::bdev::MemoryBlockStore;
    use tempfile::TempDir;

    pub(crate) fn memory_library(disks: &[(u32, u64)]) -> (Library, Vec<Arc<MemoryBlockStore>>) {
        let mut library = Library::new();
        let mut stores = Vec::new();
        for &(bid, units) in disks {
            let (bint, store) = memory_bint(bid, units * UNIT_SIZE);
            library.add_disk(bint).unwrap();
            stores.push(store);
        }
        (library, stores)
    }

    #[test]
    fn test_cartridge_lifecycle() {
        let (mut library, _) = memory_library(&[(1, 64)]);
        let drive = library.add_drive("drive0").unwrap();
        let cart = library
            .create_cartridge("VTL001", FormatVersion::V2, &[8 * UNIT_SIZE], Some(1))
            .unwrap();
        library.write_segment(cart, 0, SegmentKind::Data).unwrap();
        assert!(library.write_segment(cart, 3, SegmentKind::Data).is_err());

        library.load_drive(drive, cart).unwrap();
        assert_eq!(
            library.cartridges().get(cart).unwrap().state(),
            CartridgeState::Loaded
        );
        assert!(library.delete_cartridge(cart).is_err());

        library.unload_drive(drive).unwrap();
        assert_eq!(
            library.cartridges().get(cart).unwrap().state(),
            CartridgeState::Unloaded
        );

        let free_before = library.bints().get(1).unwrap().free();
        library.delete_cartridge(cart).unwrap();
        assert!(library.cartridges().get(cart).is_none());
        assert_eq!(
            library.bints().get(1).unwrap().free(),
            free_before + 2 * UNIT_SIZE
        );
        assert!(library.devices().reachable_cartridges().is_empty());
    }

    #[test]
    fn test_changer_export_import() {
        let (mut library, _) = memory_library(&[(1, 64)]);
        let changer = library.add_changer("changer0", ChangerLayout::default()).unwrap();
        let cart = library
            .create_cartridge("VTL002", FormatVersion::V1, &[4 * UNIT_SIZE], None)
            .unwrap();

        library.changer_place(changer, ElementType::Storage, 0, cart).unwrap();
        library
            .changer_move(changer, (ElementType::Storage, 0), (ElementType::Transfer, 1))
            .unwrap();
        library.changer_export(changer, ElementType::Transfer, 1).unwrap();
        assert_eq!(
            library.cartridges().get(cart).unwrap().state(),
            CartridgeState::Exported
        );
        assert_eq!(library.devices().reachable_cartridges(), vec![cart]);
        assert!(library.delete_cartridge(cart).is_err());

        library.changer_import(changer, cart, 0).unwrap();
        assert_eq!(
            library.cartridges().get(cart).unwrap().state(),
            CartridgeState::Loaded
        );
    }

    #[test]
    fn test_failed_cartridge_creation_releases_storage() {
        // 7 units: 3 allocatable
        let (mut library, _) = memory_library(&[(1, 7)]);
        let free_before = library.bints().get(1).unwrap().free();
        let result = library.create_cartridge(
            "VTL003",
            FormatVersion::V2,
            &[UNIT_SIZE, UNIT_SIZE, UNIT_SIZE, UNIT_SIZE],
            None,
        );
        assert!(result.is_err());
        assert!(library.cartridges().is_empty());
        assert_eq!(library.bints().get(1).unwrap().free(), free_before);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk1.img");
        let size = 32 * UNIT_SIZE;
        let store = FileBlockStore::create(&path, size).unwrap();
        BlockInterface::format(1, size, Arc::new(store)).unwrap();

        let mut library = Library::new();
        library.attach_disk_file(1, &path).unwrap();
        let drive = library.add_drive("drive0").unwrap();
        let changer = library.add_changer("changer0", ChangerLayout::default()).unwrap();
        let a = library
            .create_cartridge("VTL001", FormatVersion::V2, &[4 * UNIT_SIZE], None)
            .unwrap();
        let b = library
            .create_cartridge("VTL002", FormatVersion::V1, &[4 * UNIT_SIZE], None)
            .unwrap();
        library.load_drive(drive, a).unwrap();
        library.changer_place(changer, ElementType::Storage, 3, b).unwrap();
        library.changer_export(changer, ElementType::Storage, 3).unwrap();

        let config = library.to_config();
        let config_path = dir.path().join("library.xml");
        config.save(&config_path).unwrap();
        drop(library);

        let restored = Library::from_config(&LibraryConfig::load(&config_path).unwrap()).unwrap();
        assert_eq!(restored.to_config(), config);
        assert_eq!(restored.devices().reachable_cartridges(), vec![a, b]);
        assert_eq!(
            restored.bints().get(1).unwrap().free(),
            (32 - 4 - 2) * UNIT_SIZE
        );
    }

    #[test]
    fn test_config_rejects_dangling_cartridge() {
        let config = LibraryConfig {
            drives: vec![DriveConfig {
                id: 0,
                name: "drive0".to_string(),
                loaded: Some(9),
                media: Vec::new(),
            }],
            ..LibraryConfig::default()
        };
        assert!(matches!(
            Library::from_config(&config),
            Err(RustVtlError::Config(_))
        ));
    }
}
