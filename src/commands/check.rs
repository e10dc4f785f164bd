//! Check Command Handler
//!
//! Handles the `check` subcommand: runs the consistency checker over one or
//! all disks and reports what was reclaimed and restored.

use super::{blocking, config_path, open_library};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rust_vtl::check::{self, CheckMode, CheckReport, DiskCheck};
use rust_vtl::error::{Result, RustVtlError};
use rust_vtl::utils::{format_bytes, format_duration, format_units};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

pub async fn execute(
    config: Option<PathBuf>,
    disk: Option<u32>,
    dry_run: bool,
    parallel: bool,
    report: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let path = config_path(config)?;
    let mode = if dry_run {
        CheckMode::DryRun
    } else {
        CheckMode::Repair
    };
    info!("Checking library {:?} ({:?})", path, mode);

    let started = Instant::now();
    let checks = blocking(move || {
        let mut library = open_library(&path)?;

        if let Some(bid) = disk {
            if library.bints().get(bid).is_none() {
                return Err(RustVtlError::parameter_validation(format!(
                    "bint {} is not registered",
                    bid
                )));
            }
            let check = DiskCheck {
                bid,
                result: check::check_one_disk(&mut library, bid, mode),
                checked_at: Utc::now(),
            };
            return Ok(vec![check]);
        }

        let progress = progress_bar(library.bints().len() as u64);
        let tick = |c: &DiskCheck| {
            progress.set_message(format!("bint {}", c.bid));
            progress.inc(1);
        };
        let checks = if parallel {
            check::check_all_disks_parallel(&mut library, mode, tick)
        } else {
            check::check_all_disks_with(&mut library, mode, tick)
        };
        progress.finish_and_clear();
        Ok(checks)
    })
    .await?;

    let report_data = CheckReport::from_checks(mode, &checks);

    if json {
        println!("{}", report_data.to_json()?);
    } else {
        print_summary(&report_data, started.elapsed().as_secs_f64());
    }

    if let Some(csv_path) = report {
        report_data.export_to_csv(&csv_path)?;
        if !json {
            println!("  Report written to {}", csv_path.display());
        }
    }

    let failures = report_data.failures();
    if failures > 0 {
        return Err(RustVtlError::structural(format!(
            "{} of {} disks failed the check",
            failures,
            report_data.disks.len()
        )));
    }

    Ok(())
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    match ProgressStyle::default_bar()
        .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} disks")
    {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => warn!("Invalid progress template: {}", e),
    }
    pb
}

fn print_summary(report: &CheckReport, elapsed: f64) {
    let title = if report.dry_run {
        "🔍 Consistency Check (dry run):"
    } else {
        "🔍 Consistency Check:"
    };
    println!("{}", title);

    for disk in &report.disks {
        match &disk.error {
            Some(e) => println!("  bint {}: {} ({})", disk.bid, disk.status.as_str(), e),
            None => println!(
                "  bint {}: {}, reclaimed {} restored {} multiple refs {} out of range {}, free {} -> {}",
                disk.bid,
                disk.status.as_str(),
                disk.reclaimed,
                disk.restored,
                disk.multiple_refs,
                disk.out_of_range,
                format_bytes(disk.free_before),
                format_bytes(disk.free_after)
            ),
        }
    }

    let (reclaimed, restored) = report.totals();
    println!(
        "  Total: {} disks, reclaimed {} ({}), restored {} ({}), {} failed in {}",
        report.disks.len(),
        reclaimed,
        format_units(reclaimed),
        restored,
        format_units(restored),
        report.failures(),
        format_duration(elapsed)
    );
}
