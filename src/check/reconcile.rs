//! Reconcile phase: fold shadow pages into the production bitmap

use super::mark::ShadowSet;
use super::{CheckError, CheckMode, CheckOutcome};
use crate::bdev::{BintIndex, BlockInterface, IoMode, BMAP_ENTRIES, UNIT_SIZE};
use crate::error::RustVtlError;
use tracing::{debug, info, warn};

/// Compare one production page against its shadow and, in repair mode,
/// overwrite, persist and adjust free space. The shadow page is consumed
/// whatever the result.
pub fn bint_index_check(
    bint: &mut BlockInterface,
    index_id: u32,
    shadow: Option<BintIndex>,
    mode: CheckMode,
    outcome: &mut CheckOutcome,
) -> Result<(), CheckError> {
    let bid = bint.bid();
    let entries = bint.page_entry_count(index_id);
    let masks: Vec<u8> = (0..entries)
        .map(|entry| bint.countable_mask(index_id, entry))
        .collect();

    let production = match bint.get_or_create_index(index_id, false) {
        Ok(Some(index)) => index,
        Ok(None) => {
            warn!("Cannot locate index at id {} for bint {}", index_id, bid);
            return Err(CheckError::MissingIndex { bid, index_id });
        }
        Err(RustVtlError::Allocation(_)) => {
            return Err(CheckError::PageAllocation { bid, index_id })
        }
        Err(_) => return Err(CheckError::MissingIndex { bid, index_id }),
    };

    let zeros = [0u8; BMAP_ENTRIES];
    let shadow_bytes = shadow.as_ref().map(|s| s.bitmap()).unwrap_or(&zeros);

    let mut reclaimed = 0u64;
    let mut restored = 0u64;
    let mut dirty = false;

    for (entry_id, mask) in masks.iter().enumerate() {
        let current = production.bitmap()[entry_id];
        let wanted = shadow_bytes[entry_id];
        if current == wanted {
            continue;
        }

        let current_count = (current & mask).count_ones() as u64;
        let wanted_count = (wanted & mask).count_ones() as u64;
        if wanted_count < current_count {
            reclaimed += current_count - wanted_count;
        } else {
            restored += wanted_count - current_count;
        }

        warn!(
            "bint {} index {} entry {}: bitmap {:#04x} reachable {:#04x}",
            bid, index_id, entry_id, current, wanted
        );

        if mode == CheckMode::Repair {
            production.bitmap_mut()[entry_id] = wanted;
        }
        dirty = true;
    }

    outcome.pages_checked += 1;
    outcome.reclaimed += reclaimed;
    outcome.restored += restored;

    if !dirty {
        return Ok(());
    }
    outcome.pages_drifted += 1;

    if mode == CheckMode::DryRun {
        debug!(
            "Dry run: bint {} index {} would reclaim {} restore {}",
            bid, index_id, reclaimed, restored
        );
        return Ok(());
    }

    if let Err(e) = bint.persist(index_id, IoMode::Sync) {
        warn!(
            "index sync failed for index_id {} bid {}: {}",
            index_id, bid, e
        );
        // drop the repaired copy so the cache matches what is on disk
        bint.evict_index(index_id);
        return Err(CheckError::PersistFailed {
            bid,
            index_id,
            source: Box::new(e),
        });
    }

    outcome.pages_repaired += 1;
    bint.credit_free(reclaimed);
    bint.debit_free(restored);
    Ok(())
}

/// Reconcile every page of `bint` against `shadow`, page by page in
/// `index_id` order. Stops at the first failing page; pages already
/// persisted stay repaired.
pub fn bint_check(
    bint: &mut BlockInterface,
    mut shadow: ShadowSet,
    mode: CheckMode,
) -> Result<CheckOutcome, CheckError> {
    let mut outcome = CheckOutcome {
        multiple_refs: shadow.multiple_refs(),
        out_of_range: shadow.out_of_range(),
        free_before: bint.free(),
        ..CheckOutcome::default()
    };

    for index_id in 0..bint.nindexes() {
        let page = shadow.take(index_id);
        bint_index_check(bint, index_id, page, mode, &mut outcome)?;
    }

    outcome.free_after = match mode {
        CheckMode::Repair => bint.free(),
        CheckMode::DryRun => (outcome.free_before + outcome.reclaimed * UNIT_SIZE)
            .saturating_sub(outcome.restored * UNIT_SIZE),
    };

    if outcome.reclaimed != 0 || outcome.restored != 0 {
        warn!(
            "bint {}: reclaimed {} restored {} units{}",
            bint.bid(),
            outcome.reclaimed,
            outcome.restored,
            if mode == CheckMode::DryRun { " (dry run)" } else { "" }
        );
    } else {
        info!("bint {}: bitmap consistent", bint.bid());
    }
    Ok(outcome)
}
