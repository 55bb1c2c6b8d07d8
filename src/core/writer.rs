//! Persistence of processed slots, reorg reconciliation and gap recording.

use crate::core::metrics::IndexerMetrics;
use crate::storage::StorageBackend;
use crate::types::{NewKnownGap, ReorgOutcome, SlotStatus, SlotWriteModel};
use crate::utils::error::{BeaconIndexerError, Result};
use crate::utils::logging::log_slot;
use std::sync::Arc;

/// Splits `[start, end]` into consecutive chunks of at most `increment` slots.
///
/// A reversed range is returned unchanged as a single chunk so the anomaly
/// stays visible in the queue.
#[must_use]
pub fn chunk_range(start_slot: u64, end_slot: u64, increment: u64) -> Vec<(u64, u64)> {
    if start_slot > end_slot || increment == 0 {
        return vec![(start_slot, end_slot)];
    }

    let mut chunks = Vec::new();
    let mut chunk_start = start_slot;
    loop {
        let chunk_end = chunk_start.saturating_add(increment - 1).min(end_slot);
        chunks.push((chunk_start, chunk_end));
        if chunk_end == end_slot {
            break;
        }
        chunk_start = chunk_end + 1;
    }
    chunks
}

/// Writes known-gap rows, chunked by the configured increment.
///
/// Failure to record a gap is the one error the indexer never swallows:
/// every caller receives `GapRecordError` and stops.
pub struct KnownGapRecorder {
    storage: Arc<dyn StorageBackend>,
    increment: u64,
    metrics: Arc<IndexerMetrics>,
}

impl KnownGapRecorder {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        increment: u64,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        Self {
            storage,
            increment,
            metrics,
        }
    }

    /// Records `[start_slot, end_slot]` as missing.
    ///
    /// # Errors
    ///
    /// Returns `BeaconIndexerError::GapRecordError` if any chunk cannot be written.
    pub async fn record(
        &self,
        start_slot: u64,
        end_slot: u64,
        entry_error: &str,
        entry_process: &str,
    ) -> Result<()> {
        for (chunk_start, chunk_end) in chunk_range(start_slot, end_slot, self.increment) {
            let gap = NewKnownGap {
                start_slot: chunk_start,
                end_slot: chunk_end,
                entry_error: entry_error.to_string(),
                entry_process: entry_process.to_string(),
            };
            self.storage.insert_known_gap(&gap).await.map_err(|e| {
                tracing::error!(
                    start_slot = chunk_start,
                    end_slot = chunk_end,
                    error = %e,
                    "Failed to record known gap"
                );
                BeaconIndexerError::GapRecordError {
                    start_slot: chunk_start,
                    end_slot: chunk_end,
                    source: Box::new(e),
                }
            })?;
            IndexerMetrics::inc(&self.metrics.known_gaps_recorded);
            tracing::warn!(
                start_slot = chunk_start,
                end_slot = chunk_end,
                entry_process,
                entry_error,
                "Recorded known gap"
            );
        }
        Ok(())
    }

    /// Single-slot variant of [`record`](Self::record).
    ///
    /// # Errors
    ///
    /// See [`record`](Self::record).
    pub async fn record_slot(&self, slot: u64, entry_error: &str, entry_process: &str) -> Result<()> {
        self.record(slot, slot, entry_error, entry_process).await
    }
}

/// Writes processed slots and reconciles reorgs.
pub struct DbWriter {
    storage: Arc<dyn StorageBackend>,
    gaps: Arc<KnownGapRecorder>,
    metrics: Arc<IndexerMetrics>,
}

impl DbWriter {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        gaps: Arc<KnownGapRecorder>,
        metrics: Arc<IndexerMetrics>,
    ) -> Self {
        Self {
            storage,
            gaps,
            metrics,
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Persists a processed slot. Re-writing the same slot is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn write_full_slot(&self, model: &SlotWriteModel) -> Result<()> {
        self.storage.write_slot(model).await?;

        let counter = match model.status {
            SlotStatus::Skipped => &self.metrics.slots_skipped,
            _ => &self.metrics.slots_proposed,
        };
        IndexerMetrics::inc(counter);
        log_slot(model.slot, &model.block_root, model.status.as_str());
        Ok(())
    }

    /// Makes `canonical_root` the only proposed row of `slot`.
    ///
    /// If reconciliation leaves the slot without exactly one proposed row,
    /// the slot is recorded as a known gap so it gets reprocessed.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; `GapRecordError` if the anomaly cannot be recorded.
    pub async fn write_reorgs(&self, slot: u64, canonical_root: &str) -> Result<ReorgOutcome> {
        let outcome = self.storage.reconcile_slot(slot, canonical_root).await?;
        IndexerMetrics::add(&self.metrics.slots_forked, outcome.forked);

        if outcome.is_anomalous() {
            let reason = format!(
                "reorg reconciliation for {canonical_root} left {} proposed rows ({} updated)",
                outcome.proposed_total, outcome.proposed
            );
            tracing::warn!(slot, canonical_root, %reason, "Reorg anomaly");
            self.gaps.record_slot(slot, &reason, "reorg").await?;
        } else if outcome.forked > 0 {
            tracing::info!(
                slot,
                canonical_root,
                forked = outcome.forked,
                "Reorg reconciled"
            );
        }
        Ok(outcome)
    }
}
