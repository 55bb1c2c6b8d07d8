//! Runtime counters for the indexer.
//!
//! Every processing component holds an `Arc<IndexerMetrics>` and bumps the
//! relevant counter; [`IndexerMetrics::report`] writes a one-line summary to
//! the log.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every processing mode.
#[derive(Debug, Default)]
pub struct IndexerMetrics {
    /// Slots written with status `proposed`.
    pub slots_proposed: AtomicU64,
    /// Slots written with status `skipped`.
    pub slots_skipped: AtomicU64,
    /// Rows marked `forked` by reorg reconciliation.
    pub slots_forked: AtomicU64,
    /// Head events that failed to parse or process.
    pub head_errors: AtomicU64,
    /// Reorgs detected from the head stream or `chain_reorg` events.
    pub reorgs: AtomicU64,
    /// Known-gap rows written.
    pub known_gaps_recorded: AtomicU64,
    /// Historic ranges completed.
    pub historic_ranges_processed: AtomicU64,
    /// Known-gap ranges completed.
    pub known_gap_ranges_processed: AtomicU64,
    /// Re-failures of an already recorded single-slot gap.
    pub reprocessing_errors: AtomicU64,
    /// Event payloads that failed to decode.
    pub decode_failures: AtomicU64,
    /// Event-stream reconnects.
    pub subscriber_reconnects: AtomicU64,
    /// Latest finalized epoch seen on the event stream.
    pub finalized_epoch: AtomicU64,
}

/// Point-in-time copy of [`IndexerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub slots_proposed: u64,
    pub slots_skipped: u64,
    pub slots_forked: u64,
    pub head_errors: u64,
    pub reorgs: u64,
    pub known_gaps_recorded: u64,
    pub historic_ranges_processed: u64,
    pub known_gap_ranges_processed: u64,
    pub reprocessing_errors: u64,
    pub decode_failures: u64,
    pub subscriber_reconnects: u64,
    pub finalized_epoch: u64,
}

impl IndexerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to `counter`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Adds one to `counter`.
    pub fn inc(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    /// Raises the finalized epoch; older checkpoints are ignored.
    pub fn observe_finalized_epoch(&self, epoch: u64) {
        self.finalized_epoch.fetch_max(epoch, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            slots_proposed: load(&self.slots_proposed),
            slots_skipped: load(&self.slots_skipped),
            slots_forked: load(&self.slots_forked),
            head_errors: load(&self.head_errors),
            reorgs: load(&self.reorgs),
            known_gaps_recorded: load(&self.known_gaps_recorded),
            historic_ranges_processed: load(&self.historic_ranges_processed),
            known_gap_ranges_processed: load(&self.known_gap_ranges_processed),
            reprocessing_errors: load(&self.reprocessing_errors),
            decode_failures: load(&self.decode_failures),
            subscriber_reconnects: load(&self.subscriber_reconnects),
            finalized_epoch: load(&self.finalized_epoch),
        }
    }

    /// Reports current metrics to logs.
    pub fn report(&self) {
        let s = self.snapshot();
        crate::utils::logging::log(
            crate::utils::logging::LogLevel::Info,
            &format!(
                "Indexer Stats: proposed {} | skipped {} | forked {} | reorgs {} | gaps {} | head errors {} | finalized epoch {}",
                s.slots_proposed,
                s.slots_skipped,
                s.slots_forked,
                s.reorgs,
                s.known_gaps_recorded,
                s.head_errors,
                s.finalized_epoch
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = IndexerMetrics::new();
        IndexerMetrics::inc(&metrics.slots_proposed);
        IndexerMetrics::add(&metrics.known_gaps_recorded, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.slots_proposed, 1);
        assert_eq!(snapshot.known_gaps_recorded, 3);
        assert_eq!(snapshot.head_errors, 0);
    }

    #[test]
    fn test_finalized_epoch_only_moves_forward() {
        let metrics = IndexerMetrics::new();
        metrics.observe_finalized_epoch(10);
        metrics.observe_finalized_epoch(4);
        assert_eq!(metrics.snapshot().finalized_epoch, 10);
    }
}
