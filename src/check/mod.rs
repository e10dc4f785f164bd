//! Consistency Checker
//!
//! Rebuilds each disk's allocation bitmap from what live tape data actually
//! references and folds it back into the persisted bitmap:
//!
//! 1. mark: walk every cartridge reachable from the device table and set
//!    the blocks it references in transient shadow pages
//!    ([`mark::device_check_block`])
//! 2. reconcile: compare each production page with its shadow, count
//!    reclaimed and restored units, overwrite and persist the page, adjust
//!    free space ([`reconcile::bint_index_check`])
//!
//! A check holds `&mut Library` for its whole duration, so no allocation can
//! run against the disk between the two phases.

pub mod mark;
pub mod reconcile;
pub mod report;

pub use mark::{device_check_block, ReachableBlock, ReachableBlocks, ShadowSet};
pub use report::{CheckReport, DiskReport};

use crate::error::RustVtlError;
use crate::library::Library;
use crate::tape::TapePartition;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("cannot locate bint at {0}")]
    UnknownDisk(u32),

    #[error("cannot locate index at id {index_id} for bint {bid}")]
    MissingIndex { bid: u32, index_id: u32 },

    #[error("index sync failed for index_id {index_id} bid {bid}: {source}")]
    PersistFailed {
        bid: u32,
        index_id: u32,
        #[source]
        source: Box<RustVtlError>,
    },

    #[error("cannot walk cartridge {cartridge} partition {partition}: {source}")]
    MapLoad {
        cartridge: String,
        partition: u8,
        #[source]
        source: Box<RustVtlError>,
    },

    #[error("cannot allocate index page {index_id} for bint {bid}")]
    PageAllocation { bid: u32, index_id: u32 },
}

impl CheckError {
    pub(crate) fn map_load(cartridge: &str, partition: &TapePartition, source: RustVtlError) -> Self {
        Self::MapLoad {
            cartridge: cartridge.to_string(),
            partition: partition.partition_id(),
            source: Box::new(source),
        }
    }

    /// Structural failures: the persisted bitmap itself is incomplete
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::UnknownDisk(_) | Self::MissingIndex { .. })
    }
}

impl From<CheckError> for RustVtlError {
    fn from(err: CheckError) -> Self {
        let msg = err.to_string();
        match err {
            CheckError::UnknownDisk(_) | CheckError::MissingIndex { .. } => {
                RustVtlError::Structural(msg)
            }
            CheckError::PersistFailed { .. } => {
                RustVtlError::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
            }
            CheckError::MapLoad { .. } => RustVtlError::Corrupt(msg),
            CheckError::PageAllocation { .. } => RustVtlError::Allocation(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckMode {
    #[default]
    Repair,
    /// Count drift without touching the bitmap or free space
    DryRun,
}

/// Totals of one disk's check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckOutcome {
    pub reclaimed: u64,
    pub restored: u64,
    pub multiple_refs: u64,
    pub out_of_range: u64,
    pub pages_checked: u32,
    /// Pages whose bitmap differed from the reachable set
    pub pages_drifted: u32,
    /// Drifted pages rewritten and persisted; always 0 in a dry run
    pub pages_repaired: u32,
    pub free_before: u64,
    pub free_after: u64,
}

impl CheckOutcome {
    pub fn is_clean(&self) -> bool {
        self.reclaimed == 0 && self.restored == 0 && self.pages_drifted == 0
    }
}

#[derive(Debug)]
pub struct DiskCheck {
    pub bid: u32,
    pub result: Result<CheckOutcome, CheckError>,
    pub checked_at: DateTime<Utc>,
}

/// Check a single disk
pub fn check_one_disk(
    library: &mut Library,
    bid: u32,
    mode: CheckMode,
) -> Result<CheckOutcome, CheckError> {
    let shadow = mark::device_check_block(library, bid)?;
    let bint = library
        .bints
        .get_mut(bid)
        .ok_or(CheckError::UnknownDisk(bid))?;
    reconcile::bint_check(bint, shadow, mode)
}

fn log_result(check: &DiskCheck) {
    match &check.result {
        Ok(outcome) => info!(
            "bint {} check done: reclaimed {} restored {} multiple refs {}",
            check.bid, outcome.reclaimed, outcome.restored, outcome.multiple_refs
        ),
        Err(e) => error!("bint {} check failed: {}", check.bid, e),
    }
}

/// Check every registered disk in bid order. A failed disk does not stop
/// the sweep.
pub fn check_all_disks(library: &mut Library, mode: CheckMode) -> Vec<DiskCheck> {
    check_all_disks_with(library, mode, |_| {})
}

/// Like [`check_all_disks`], calling `on_disk` after each disk
pub fn check_all_disks_with<F>(library: &mut Library, mode: CheckMode, mut on_disk: F) -> Vec<DiskCheck>
where
    F: FnMut(&DiskCheck),
{
    let bids = library.bints.bids();
    info!("Checking {} disks ({:?})", bids.len(), mode);

    let mut checks = Vec::with_capacity(bids.len());
    for bid in bids {
        let check = DiskCheck {
            bid,
            result: check_one_disk(library, bid, mode),
            checked_at: Utc::now(),
        };
        log_result(&check);
        on_disk(&check);
        checks.push(check);
    }
    checks
}

/// Check every disk concurrently. Mark phases share the library read-only;
/// each reconcile phase then owns its disk exclusively.
pub fn check_all_disks_parallel<F>(library: &mut Library, mode: CheckMode, on_disk: F) -> Vec<DiskCheck>
where
    F: Fn(&DiskCheck) + Sync,
{
    let bids = library.bints.bids();
    info!("Checking {} disks in parallel ({:?})", bids.len(), mode);

    let shadows: Vec<Result<ShadowSet, CheckError>> = {
        let shared: &Library = library;
        bids.par_iter()
            .map(|&bid| mark::device_check_block(shared, bid))
            .collect()
    };

    let work: Vec<_> = library.bints.iter_mut().zip(shadows).collect();
    work.into_par_iter()
        .map(|(bint, shadow)| {
            let bid = bint.bid();
            let result = shadow.and_then(|shadow| reconcile::bint_check(bint, shadow, mode));
            let check = DiskCheck {
                bid,
                result,
                checked_at: Utc::now(),
            };
            log_result(&check);
            on_disk(&check);
            check
        })
        .collect()
}
