use super::JobSource;
use crate::core::metrics::IndexerMetrics;
use crate::core::writer::KnownGapRecorder;
use crate::storage::StorageBackend;
use crate::types::{GapQueue, GapRange, ProcessingError};
use crate::utils::error::{BeaconIndexerError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Operator-seeded backfill ranges.
pub struct HistoricSource {
    storage: Arc<dyn StorageBackend>,
    gaps: Arc<KnownGapRecorder>,
    metrics: Arc<IndexerMetrics>,
    worker_id: String,
    lease_ttl: Option<Duration>,
}

impl HistoricSource {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        gaps: Arc<KnownGapRecorder>,
        metrics: Arc<IndexerMetrics>,
        worker_id: impl Into<String>,
        lease_ttl: Option<Duration>,
    ) -> Self {
        Self {
            storage,
            gaps,
            metrics,
            worker_id: worker_id.into(),
            lease_ttl,
        }
    }
}

#[async_trait]
impl JobSource for HistoricSource {
    fn queue(&self) -> GapQueue {
        GapQueue::Historic
    }

    async fn lease(&self) -> Result<Option<GapRange>> {
        self.storage
            .lease_range(GapQueue::Historic, &self.worker_id, self.lease_ttl)
            .await
    }

    async fn complete(&self, range: &GapRange, _had_failures: bool) -> Result<()> {
        // failed slots already live on in known_gaps
        self.storage.delete_range(GapQueue::Historic, range.id).await?;
        IndexerMetrics::inc(&self.metrics.historic_ranges_processed);
        Ok(())
    }

    async fn release_all(&self) -> Result<u64> {
        self.storage
            .release_ranges(GapQueue::Historic, &self.worker_id)
            .await
    }

    async fn record_failure(&self, failure: &ProcessingError) -> Result<()> {
        self.gaps
            .record(
                failure.start_slot,
                failure.end_slot,
                &failure.message,
                "historic_processing",
            )
            .await
    }
}

/// Ranges the indexer itself found missing.
pub struct KnownGapsSource {
    storage: Arc<dyn StorageBackend>,
    gaps: Arc<KnownGapRecorder>,
    metrics: Arc<IndexerMetrics>,
    worker_id: String,
    lease_ttl: Option<Duration>,
}

impl KnownGapsSource {
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        gaps: Arc<KnownGapRecorder>,
        metrics: Arc<IndexerMetrics>,
        worker_id: impl Into<String>,
        lease_ttl: Option<Duration>,
    ) -> Self {
        Self {
            storage,
            gaps,
            metrics,
            worker_id: worker_id.into(),
            lease_ttl,
        }
    }
}

#[async_trait]
impl JobSource for KnownGapsSource {
    fn queue(&self) -> GapQueue {
        GapQueue::KnownGaps
    }

    async fn lease(&self) -> Result<Option<GapRange>> {
        self.storage
            .lease_range(GapQueue::KnownGaps, &self.worker_id, self.lease_ttl)
            .await
    }

    /// A single-slot gap that failed again stays checked out by this worker
    /// until shutdown releases it, so one run never retries it in a loop.
    async fn complete(&self, range: &GapRange, had_failures: bool) -> Result<()> {
        if had_failures && range.is_single_slot() {
            tracing::debug!(
                slot = range.start_slot,
                "Known gap failed again, keeping it checked out"
            );
            return Ok(());
        }
        self.storage.delete_range(GapQueue::KnownGaps, range.id).await?;
        IndexerMetrics::inc(&self.metrics.known_gap_ranges_processed);
        Ok(())
    }

    async fn release_all(&self) -> Result<u64> {
        self.storage
            .release_ranges(GapQueue::KnownGaps, &self.worker_id)
            .await
    }

    async fn record_failure(&self, failure: &ProcessingError) -> Result<()> {
        if !failure.is_single_slot() {
            return self
                .gaps
                .record(
                    failure.start_slot,
                    failure.end_slot,
                    &failure.message,
                    "known_gaps_processing",
                )
                .await;
        }

        let slot = failure.start_slot;
        let gap_error = |e: BeaconIndexerError| BeaconIndexerError::GapRecordError {
            start_slot: slot,
            end_slot: slot,
            source: Box::new(e),
        };

        let existing = self.storage.find_known_gap(slot, slot).await.map_err(gap_error)?;
        if existing.is_some() {
            self.storage
                .update_reprocessing_error(slot, slot, &failure.message)
                .await
                .map_err(gap_error)?;
            IndexerMetrics::inc(&self.metrics.reprocessing_errors);
            tracing::warn!(slot, error = %failure.message, "Known gap failed again");
            Ok(())
        } else {
            self.gaps
                .record_slot(slot, &failure.message, "known_gaps_processing")
                .await
        }
    }
}
