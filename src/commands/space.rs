//! Space Command Handler
//!
//! Handles the `space` subcommand: per-disk capacity and allocation.

use super::{blocking, config_path, open_library};
use rust_vtl::error::Result;
use rust_vtl::utils::{format_bytes, format_units, percent};
use std::path::PathBuf;
use tracing::{info, warn};

pub async fn execute(config: Option<PathBuf>, detailed: bool) -> Result<()> {
    let path = config_path(config)?;
    info!("Getting library space information: {:?}", path);

    let (library, pages) = blocking(move || {
        let mut library = open_library(&path)?;

        // (bid, page, allocated, allocatable) for every bitmap page;
        // allocated is None when the page does not load
        let mut pages = Vec::new();
        if detailed {
            for bint in library.bints_mut().iter_mut() {
                for index_id in 0..bint.nindexes() {
                    let allocatable = bint.page_allocatable_units(index_id);
                    let allocated = match bint.page_free_units(index_id) {
                        Ok(free) => Some(allocatable - free),
                        Err(e) => {
                            warn!("bint {} page {}: {}", bint.bid(), index_id, e);
                            None
                        }
                    };
                    pages.push((bint.bid(), index_id, allocated, allocatable));
                }
            }
        }
        Ok((library, pages))
    })
    .await?;

    let usage = library.disk_usage();
    if usage.is_empty() {
        println!("No disks registered");
        return Ok(());
    }

    println!("📦 Library Space Information:");
    let (mut total, mut used) = (0u64, 0u64);
    for disk in &usage {
        total += disk.usable;
        used += disk.used;
        println!(
            "  bint {}: {} used of {} ({:.1}%), {} free{}{}",
            disk.bid,
            format_bytes(disk.used),
            format_bytes(disk.usable),
            percent(disk.used, disk.usable),
            format_bytes(disk.free),
            if disk.degraded {
                " (degraded, run check)"
            } else {
                ""
            },
            disk.path
                .as_ref()
                .map(|p| format!(" [{}]", p.display()))
                .unwrap_or_default()
        );
    }
    println!(
        "  Total: {} used of {} ({:.1}%)",
        format_bytes(used),
        format_bytes(total),
        percent(used, total)
    );
    println!(
        "  Cartridges: {}, devices: {}",
        library.cartridges().len(),
        library.devices().len()
    );

    if detailed {
        println!();
        println!("  Bitmap pages:");
        for (bid, index_id, allocated, allocatable) in pages {
            let Some(allocated) = allocated else {
                println!("    bint {} page {}: unreadable", bid, index_id);
                continue;
            };
            println!(
                "    bint {} page {}: {} of {} units allocated ({})",
                bid,
                index_id,
                allocated,
                allocatable,
                format_units(allocated)
            );
        }
    }

    Ok(())
}
