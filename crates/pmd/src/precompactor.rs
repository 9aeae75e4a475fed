//! Background pre-compaction.
//!
//! A handle type wraps a background worker driven by signals over a `crossbeam-channel`. The
//! scan-and-compact decision itself (`run_once`) is kept free of threading so it can be
//! unit-tested directly; [`Precompactor`] is just a periodic driver around it.

use std::sync::Arc;
use std::time::Duration;

use crate::compaction::compact_slot;
use crate::config::PmdConfig;
use crate::error::Result;
use crate::mda::Mda;
use crate::selector::{need_compact, update_credit};

/// One pre-compactor pass: compacts every slot that needs it (excluding the last
/// `pco_nbnoalloc` slots, which are reserved headroom the allocator is about to fill),
/// then refreshes the selector's credit table. Returns the number of slots compacted.
pub fn run_once(mda: &Mda, config: &PmdConfig) -> Result<usize> {
    let slots: Vec<_> = mda.slots().collect();
    let considered = slots.len().saturating_sub(config.pco_nbnoalloc);

    let mut compacted = 0usize;
    for slot in slots.iter().take(considered) {
        if need_compact(slot, config) {
            compact_slot(slot)?;
            compacted += 1;
            tracing::debug!(slot = slot.slot, "pre-compactor compacted slot");
        }
    }
    update_credit(mda, config);
    tracing::debug!(compacted, considered, "pre-compactor pass complete");
    Ok(compacted)
}

/// Drives [`run_once`] on a fixed period in a background thread, until dropped or [`Self::stop`]
/// is called.
pub struct Precompactor {
    stop_tx: crossbeam_channel::Sender<()>,
    handle:  Option<std::thread::JoinHandle<()>>,
}

impl Precompactor {
    #[must_use]
    pub fn spawn(mda: Arc<Mda>, config: PmdConfig) -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let handle = std::thread::spawn(move || {
            let ticker = crossbeam_channel::tick(Duration::from_secs(u64::from(config.pco_period_secs)));
            loop {
                crossbeam_channel::select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        if let Err(err) = run_once(&mda, &config) {
                            tracing::warn!(%err, "pre-compactor pass failed");
                        }
                    }
                }
            }
        });
        Self { stop_tx, handle: Some(handle) }
    }

    /// Stops the background thread and waits for it to exit.
    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Precompactor {
    fn drop(&mut self) {
        self.stop_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryMdcLog;

    #[test]
    fn run_once_compacts_full_slots_and_skips_reserved_headroom() {
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        mda.mdc0().compact.lock().handle.as_mut().unwrap().append(&[0u8; 95]).unwrap();

        let added = mda.grow(1);
        added[0].compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(100)));
        added[0].compact.lock().handle.as_mut().unwrap().append(&[0u8; 95]).unwrap();

        // Reserve the last slot as headroom: only MDC0 should get compacted.
        let config = PmdConfig { pco_pct_full: 90, pco_nbnoalloc: 1, ..PmdConfig::default() };
        let compacted = run_once(&mda, &config).unwrap();
        assert_eq!(compacted, 1);

        let (used, _) = mda.mdc0().compact.lock().handle.as_mut().unwrap().usage();
        assert_eq!(used, 0, "compacting an mdc with no committed objects empties its log");
        let (other_used, _) = added[0].compact.lock().handle.as_mut().unwrap().usage();
        assert_eq!(other_used, 95, "reserved slot must be left untouched");
    }

    #[test]
    fn run_once_is_a_no_op_below_thresholds() {
        let mda = Mda::new();
        mda.mdc0().compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(1000)));
        let compacted = run_once(&mda, &PmdConfig::default()).unwrap();
        assert_eq!(compacted, 0);
    }

    #[test]
    fn spawn_and_stop_does_not_hang() {
        let mda = Arc::new(Mda::new());
        mda.mdc0().compact.lock().handle = Some(Box::new(InMemoryMdcLog::new(1000)));
        let precompactor =
            Precompactor::spawn(Arc::clone(&mda), PmdConfig { pco_period_secs: 3600, ..PmdConfig::default() });
        precompactor.stop();
    }
}
