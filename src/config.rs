//! Library Configuration
//!
//! The library layout (backing disks, cartridges, drives, changers) is kept
//! in a small XML document:
//!
//! ```xml
//! <library>
//!   <disk bid="1" path="/srv/vtl/disk1.img"/>
//!   <cartridge id="0" label="VTL001" format="v2" state="loaded">
//!     <partition id="0" size="107374182400" maps_bid="1" maps_block="65536"/>
//!   </cartridge>
//!   <drive id="0" name="drive0" loaded="0">
//!     <media cartridge="0"/>
//!   </drive>
//!   <changer id="1" name="changer0" storage="16" import="1" export="1" transfer="2">
//!     <element type="storage" slot="0" cartridge="0"/>
//!     <exported cartridge="3"/>
//!   </changer>
//! </library>
//! ```

use crate::device::ElementType;
use crate::error::{Result, RustVtlError};
use crate::tape::{CartridgeState, FormatVersion};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename = "library")]
pub struct LibraryConfig {
    #[serde(rename = "disk", default)]
    pub disks: Vec<DiskConfig>,
    #[serde(rename = "cartridge", default)]
    pub cartridges: Vec<CartridgeConfig>,
    #[serde(rename = "drive", default)]
    pub drives: Vec<DriveConfig>,
    #[serde(rename = "changer", default)]
    pub changers: Vec<ChangerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    #[serde(rename = "@bid")]
    pub bid: u32,
    #[serde(rename = "@path")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartridgeConfig {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(rename = "@label")]
    pub label: String,
    #[serde(rename = "@format", default)]
    pub format: FormatVersion,
    #[serde(rename = "@state", default)]
    pub state: CartridgeState,
    #[serde(rename = "partition", default)]
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    #[serde(rename = "@id")]
    pub id: u8,
    #[serde(rename = "@size")]
    pub size: u64,
    #[serde(rename = "@maps_bid")]
    pub maps_bid: u32,
    #[serde(rename = "@maps_block")]
    pub maps_block: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    #[serde(rename = "@cartridge")]
    pub cartridge: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@loaded", default, skip_serializing_if = "Option::is_none")]
    pub loaded: Option<u32>,
    #[serde(rename = "media", default)]
    pub media: Vec<MediaRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementConfig {
    #[serde(rename = "@type")]
    pub kind: ElementType,
    #[serde(rename = "@slot")]
    pub slot: usize,
    #[serde(rename = "@cartridge")]
    pub cartridge: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangerConfig {
    #[serde(rename = "@id")]
    pub id: u32,
    #[serde(rename = "@name")]
    pub name: String,
    #[serde(rename = "@storage")]
    pub storage: usize,
    #[serde(rename = "@import")]
    pub import: usize,
    #[serde(rename = "@export")]
    pub export: usize,
    #[serde(rename = "@transfer")]
    pub transfer: usize,
    #[serde(rename = "element", default)]
    pub elements: Vec<ElementConfig>,
    #[serde(rename = "exported", default)]
    pub exported: Vec<MediaRef>,
}

impl LibraryConfig {
    /// `<config dir>/rustvtl/library.xml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rustvtl").join("library.xml"))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read library config {:?}", path))?;
        let config = Self::from_xml(&content)?;
        debug!(
            "Loaded library config {:?}: {} disks, {} cartridges",
            path,
            config.disks.len(),
            config.cartridges.len()
        );
        Ok(config)
    }

    pub fn from_xml(content: &str) -> Result<Self> {
        quick_xml::de::from_str(content).map_err(|e| {
            RustVtlError::config(format!("Failed to parse library config: {}", e))
        })
    }

    pub fn to_xml(&self) -> Result<String> {
        let xml_string = quick_xml::se::to_string(self).map_err(|e| {
            RustVtlError::config(format!("Failed to serialize library config: {}", e))
        })?;
        Ok(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{}",
            xml_string
        ))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }
        std::fs::write(path, self.to_xml()?)
            .with_context(|| format!("Failed to write library config {:?}", path))?;
        info!("Saved library config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> LibraryConfig {
        LibraryConfig {
            disks: vec![DiskConfig {
                bid: 1,
                path: "/srv/vtl/disk1.img".to_string(),
            }],
            cartridges: vec![CartridgeConfig {
                id: 0,
                label: "VTL001".to_string(),
                format: FormatVersion::V2,
                state: CartridgeState::Loaded,
                partitions: vec![PartitionConfig {
                    id: 0,
                    size: 1 << 36,
                    maps_bid: 1,
                    maps_block: 65536,
                }],
            }],
            drives: vec![DriveConfig {
                id: 0,
                name: "drive0".to_string(),
                loaded: None,
                media: vec![MediaRef { cartridge: 0 }],
            }],
            changers: vec![ChangerConfig {
                id: 1,
                name: "changer0".to_string(),
                storage: 4,
                import: 1,
                export: 1,
                transfer: 1,
                elements: vec![ElementConfig {
                    kind: ElementType::Storage,
                    slot: 2,
                    cartridge: 0,
                }],
                exported: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_parse_document() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<library>
  <disk bid="2" path="/tmp/disk2.img"/>
  <cartridge id="4" label="VTL004" format="v1" state="exported">
    <partition id="0" size="68719476736" maps_bid="2" maps_block="65536"/>
  </cartridge>
  <changer id="3" name="c0" storage="8" import="1" export="1" transfer="2">
    <exported cartridge="4"/>
  </changer>
</library>"#;

        let config = LibraryConfig::from_xml(xml).unwrap();
        assert_eq!(config.disks[0].bid, 2);
        assert_eq!(config.cartridges[0].format, FormatVersion::V1);
        assert_eq!(config.cartridges[0].state, CartridgeState::Exported);
        assert_eq!(config.cartridges[0].partitions[0].maps_block, 65536);
        assert!(config.drives.is_empty());
        assert_eq!(config.changers[0].exported[0].cartridge, 4);
        assert!(config.changers[0].elements.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("library.xml");

        let config = sample();
        config.save(&path).unwrap();
        let loaded = LibraryConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let err = LibraryConfig::load(dir.path().join("absent.xml")).unwrap_err();
        assert!(matches!(err, RustVtlError::Generic(_)));
        assert!(err.to_string().contains("absent.xml"));
    }

    #[test]
    fn test_malformed_document() {
        let result = LibraryConfig::from_xml("<library><disk bid=\"x\"/></library>");
        assert!(matches!(result, Err(RustVtlError::Config(_))));
    }
}
