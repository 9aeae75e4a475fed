//! Credit-based MDC selection: which slot a new allocation should land in, and whether the
//! pool or an individual slot needs attention.
//!
//! A small, purely computational decision layer that the background task (`precompactor.rs`)
//! and the foreground allocator both consult, rather than folding the decision into either
//! caller.

use std::sync::Arc;

use crate::config::PmdConfig;
use crate::ids::{MDC_SLOTS, MDC_TBL_SZ, MPOOL_MDC_SET_SZ};
use crate::mda::Mda;
use crate::mdc_info::{CreditInfo, MdcInfo};

/// Recomputes every slot's [`CreditInfo`] from its log's current free space, then rebuilds the
/// interleave table so that slots with more free space appear proportionally more often,
/// with each slot's credits spread through the table rather than landing contiguously.
///
/// The last `config.pco_nbnoalloc + 2` slots are reserved headroom the allocator is about to
/// fill and never enter the table; any remaining candidate below 0.25% free is dropped outright;
/// the survivors are capped to the [`MPOOL_MDC_SET_SZ`] with the most free space.
pub fn update_credit(mda: &Mda, config: &PmdConfig) {
    let slots: Vec<_> = mda.slots().collect();
    if slots.is_empty() {
        mda.set_selector_table(Vec::new());
        return;
    }

    let exclude_n = config.pco_nbnoalloc + 2;
    let considered = slots.len().saturating_sub(exclude_n);

    for slot in slots.iter().skip(considered) {
        *slot.ref_.lock() = CreditInfo { free: 0, credit: 0 };
    }

    let mut candidates: Vec<(Arc<MdcInfo>, u64)> = Vec::new();
    for slot in slots.iter().take(considered) {
        let (used, cap) = slot_usage(slot);
        let free = cap.saturating_sub(used);
        if cap > 0 && free.saturating_mul(400) < cap {
            // Below 0.25% free: not worth routing new allocations to.
            *slot.ref_.lock() = CreditInfo { free, credit: 0 };
            continue;
        }
        candidates.push((Arc::clone(slot), free));
    }

    if candidates.is_empty() {
        mda.set_selector_table(Vec::new());
        return;
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.slot.cmp(&b.0.slot)));
    candidates.truncate(MPOOL_MDC_SET_SZ);

    let total_free: u64 = candidates.iter().map(|&(_, free)| free).sum();
    if total_free == 0 {
        for (slot, free) in &candidates {
            *slot.ref_.lock() = CreditInfo { free: *free, credit: 0 };
        }
        mda.set_selector_table(Vec::new());
        return;
    }

    let mut shares = Vec::with_capacity(candidates.len());
    for (slot, free) in &candidates {
        #[expect(clippy::cast_possible_truncation, reason = "share is bounded by MDC_TBL_SZ")]
        let share =
            (u128::from(*free) * MDC_TBL_SZ as u128 / u128::from(total_free)) as usize;
        *slot.ref_.lock() = CreditInfo { free: *free, credit: i64::try_from(share).unwrap_or(i64::MAX) };
        shares.push(share);
    }

    // Rounding down each share can leave the table short; top it up onto whichever candidate has
    // the most free space so the table always has exactly MDC_TBL_SZ entries.
    let assigned: usize = shares.iter().sum();
    if let Some(max_idx) = shares.iter().enumerate().max_by_key(|&(_, &s)| s).map(|(i, _)| i) {
        shares[max_idx] += MDC_TBL_SZ.saturating_sub(assigned);
    }

    // Round-robin interleave: walk the candidate list repeatedly, taking one credit from each
    // that still has any left, so each slot's entries are maximally spread through the table
    // instead of landing in one contiguous run.
    let mut table = Vec::with_capacity(MDC_TBL_SZ);
    let mut remaining = shares;
    while table.len() < MDC_TBL_SZ && remaining.iter().any(|&r| r > 0) {
        for (idx, (slot, _)) in candidates.iter().enumerate() {
            if remaining[idx] > 0 {
                table.push(slot.slot);
                remaining[idx] -= 1;
                if table.len() == MDC_TBL_SZ {
                    break;
                }
            }
        }
    }

    mda.set_selector_table(table);
}

fn slot_usage(info: &MdcInfo) -> (u64, u64) {
    let mut compact = info.compact.lock();
    match compact.handle.as_mut() {
        Some(handle) => handle.usage(),
        None => (0, 0),
    }
}

/// True when `info` has crossed either the fill or the garbage threshold and should be
/// compacted on the next pre-compactor pass.
#[must_use]
pub fn need_compact(info: &MdcInfo, config: &PmdConfig) -> bool {
    let (used, cap) = slot_usage(info);
    if cap > 0 {
        let pct_full = percent(used, cap);
        if pct_full >= config.pco_pct_full {
            return true;
        }
    }

    let pco = info.compact.lock().pco_cnt;
    let churn = u64::from(pco.del) + u64::from(pco.er) + u64::from(pco.up);
    let total = churn + u64::from(pco.cr);
    if total == 0 {
        return false;
    }
    percent(churn, total) >= config.pco_pct_garbage
}

/// True when the pool as a whole is full enough, and not yet at capacity, and compaction alone
/// wouldn't recover much of that fullness — i.e. growing the MDC set is the right response
/// rather than just compacting existing slots.
#[must_use]
pub fn mdc_needed(mda: &Mda, config: &PmdConfig) -> bool {
    let slots: Vec<_> = mda.slots().collect();
    if slots.is_empty() || slots.len() >= MDC_SLOTS {
        return false;
    }

    let mut total_used = 0u64;
    let mut total_cap = 0u64;
    let mut total_garbage = 0u64;
    let mut total_record = 0u64;
    for slot in &slots {
        let (used, cap) = slot_usage(slot);
        total_used += used;
        total_cap += cap;
        let pco = slot.compact.lock().pco_cnt;
        total_garbage += u64::from(pco.del) + u64::from(pco.er) + u64::from(pco.up);
        total_record += u64::from(pco.cr);
    }

    if total_cap == 0 || percent(total_used, total_cap) < config.crt_mdc_pct_full {
        return false;
    }

    let total = total_garbage + total_record;
    if total == 0 {
        return true;
    }
    percent(total_garbage, total) < config.crt_mdc_pct_garbage
}

fn percent(numerator: u64, denominator: u64) -> u8 {
    if denominator == 0 {
        return 0;
    }
    u8::try_from((u128::from(numerator) * 100 / u128::from(denominator)).min(100)).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryMdcLog;

    #[test]
    fn update_credit_favors_emptier_slots() {
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        let added = mda.grow(3);
        added[0].compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        added[0].compact.lock().handle.as_mut().unwrap().append(&[0u8; 90]).unwrap();

        let config = PmdConfig { pco_nbnoalloc: 0, ..PmdConfig::default() };
        update_credit(&mda, &config);
        let table = mda.selector_table();
        assert_eq!(table.len(), MDC_TBL_SZ);
        let mdc0_count = table.iter().filter(|&&s| s == 0).count();
        let other_count = table.iter().filter(|&&s| s == 1).count();
        assert!(mdc0_count > other_count, "emptier slot 0 should get more of the table");
        // The last pco_nbnoalloc + 2 == 2 slots are reserved headroom, excluded entirely.
        assert!(!table.contains(&2));
        assert!(!table.contains(&3));
    }

    #[test]
    fn update_credit_interleaves_rather_than_running_contiguous() {
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        let added = mda.grow(3);
        added[0].compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        added[0].compact.lock().handle.as_mut().unwrap().append(&[0u8; 40]).unwrap();

        let config = PmdConfig { pco_nbnoalloc: 0, ..PmdConfig::default() };
        update_credit(&mda, &config);
        let table = mda.selector_table();
        // Both candidates have meaningful share; a purely contiguous layout would put a long run
        // of one slot before any of the other appears. Check neither slot runs for more than half
        // the table uninterrupted.
        let longest_run = table
            .iter()
            .fold((0usize, 0usize, None), |(longest, current, last), &s| {
                let current = if Some(s) == last { current + 1 } else { 1 };
                (longest.max(current), current, Some(s))
            })
            .0;
        assert!(longest_run < table.len() / 2, "runs should be interleaved, not contiguous");
    }

    #[test]
    fn need_compact_triggers_on_fullness() {
        let info = MdcInfo::new(1);
        info.compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        info.compact.lock().handle.as_mut().unwrap().append(&[0u8; 95]).unwrap();
        let config = PmdConfig { pco_pct_full: 90, ..PmdConfig::default() };
        assert!(need_compact(&info, &config));
    }

    #[test]
    fn need_compact_triggers_on_garbage() {
        let info = MdcInfo::new(1);
        info.compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(10_000)));
        info.compact.lock().pco_cnt.cr = 2;
        info.compact.lock().pco_cnt.del = 8;
        let config = PmdConfig { pco_pct_full: 100, pco_pct_garbage: 50, ..PmdConfig::default() };
        assert!(need_compact(&info, &config));
    }

    #[test]
    fn need_compact_false_with_no_handle() {
        let info = MdcInfo::new(1);
        assert!(!need_compact(&info, &PmdConfig::default()));
    }

    #[test]
    fn mdc_needed_reflects_pool_wide_fullness() {
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        mda.mdc0().compact.lock().handle.as_mut().unwrap().append(&[0u8; 90]).unwrap();
        let config = PmdConfig { crt_mdc_pct_full: 80, ..PmdConfig::default() };
        assert!(mdc_needed(&mda, &config));
    }

    #[test]
    fn mdc_needed_false_when_garbage_ratio_is_high_enough_to_compact_instead() {
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        mda.mdc0().compact.lock().handle.as_mut().unwrap().append(&[0u8; 90]).unwrap();
        mda.mdc0().compact.lock().pco_cnt.cr = 1;
        mda.mdc0().compact.lock().pco_cnt.del = 9;
        let config =
            PmdConfig { crt_mdc_pct_full: 80, crt_mdc_pct_garbage: 40, ..PmdConfig::default() };
        assert!(!mdc_needed(&mda, &config));
    }

    #[test]
    fn mdc_needed_false_once_slot_array_is_full() {
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        mda.mdc0().compact.lock().handle.as_mut().unwrap().append(&[0u8; 90]).unwrap();
        mda.grow(MDC_SLOTS - 1);
        assert!(!mdc_needed(&mda, &PmdConfig { crt_mdc_pct_full: 80, ..PmdConfig::default() }));
    }
}
