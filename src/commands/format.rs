//! Format Command Handler
//!
//! Handles the `format` subcommand: creates a disk image and writes a fresh
//! header and bitmap, optionally registering it in the library configuration.

use super::{blocking, config_path};
use rust_vtl::bdev::{BlockInterface, FileBlockStore};
use rust_vtl::config::{DiskConfig, LibraryConfig};
use rust_vtl::error::{Result, RustVtlError};
use rust_vtl::utils::{format_bytes, format_units};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub async fn execute(
    path: PathBuf,
    bid: u32,
    size: u64,
    register: bool,
    config: Option<PathBuf>,
) -> Result<()> {
    info!("Formatting disk image {:?} as bint {} ({} bytes)", path, bid, size);

    // Resolve before touching the image so a bad --config fails early
    let config_file = if register {
        Some(config_path(config)?)
    } else {
        None
    };

    let image = path.clone();
    let bint = blocking(move || {
        let store = FileBlockStore::create(&image, size)?;
        BlockInterface::format(bid, size, Arc::new(store))
    })
    .await?;

    println!("💾 Disk image formatted: {}", path.display());
    println!("  Block interface id: {}", bint.bid());
    println!("  Usable size: {}", format_bytes(bint.usable_size()));
    println!(
        "  Allocatable: {} ({} units)",
        format_units(bint.allocatable_units()),
        bint.allocatable_units()
    );
    println!("  Index pages: {}", bint.nindexes());

    if let Some(config_file) = config_file {
        register_disk(config_file, bid, path).await?;
    }

    Ok(())
}

async fn register_disk(config_file: PathBuf, bid: u32, image: PathBuf) -> Result<()> {
    let saved = config_file.clone();
    blocking(move || {
        let mut config = if config_file.exists() {
            LibraryConfig::load(&config_file)?
        } else {
            LibraryConfig::default()
        };

        if config.disks.iter().any(|d| d.bid == bid) {
            return Err(RustVtlError::config(format!(
                "bid {} is already registered in {:?}",
                bid, config_file
            )));
        }

        let image = std::fs::canonicalize(&image).unwrap_or(image);
        config.disks.push(DiskConfig {
            bid,
            path: image.to_string_lossy().to_string(),
        });
        config.save(&config_file)
    })
    .await?;

    println!("  Registered in {}", saved.display());
    Ok(())
}
