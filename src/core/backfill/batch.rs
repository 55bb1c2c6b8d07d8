//! Lease loop, slot worker pool and failure sink for one job queue.
//!
//! ```text
//! lease loop ──slots──▶ flume (bounded) ──▶ worker × N ──▶ sink
//!     │                                                   ▲
//!     └──────────── invalid ranges ───────────────────────┘
//! ```
//!
//! Workers report a slot failure before counting the slot as done, and the
//! worker finishing the last slot of a range sends its completion. Both go
//! through the same channel, so the sink always records a range's failures
//! before it completes (deletes) the range.

use super::JobSource;
use crate::config::BatchConfig;
use crate::core::slot::SlotProcessor;
use crate::types::{GapRange, ProcessingError};
use crate::utils::error::{BeaconIndexerError, Result};
use crate::utils::logging;
use crate::utils::retry::compute_backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Totals of one processor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub ranges_leased: u64,
    pub ranges_completed: u64,
    pub slots_processed: u64,
    pub slot_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ranges_leased: AtomicU64,
    ranges_completed: AtomicU64,
    slots_processed: AtomicU64,
    slot_failures: AtomicU64,
}

impl Counters {
    fn report(&self) -> BatchReport {
        BatchReport {
            ranges_leased: self.ranges_leased.load(Ordering::Relaxed),
            ranges_completed: self.ranges_completed.load(Ordering::Relaxed),
            slots_processed: self.slots_processed.load(Ordering::Relaxed),
            slot_failures: self.slot_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct RangeProgress {
    range: GapRange,
    remaining: AtomicU64,
    failures: AtomicU64,
    started: Instant,
}

impl RangeProgress {
    fn new(range: GapRange) -> Self {
        Self {
            remaining: AtomicU64::new(range.len()),
            range,
            failures: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct SlotJob {
    slot: u64,
    progress: Arc<RangeProgress>,
}

#[derive(Debug)]
enum SinkMessage {
    Failure(ProcessingError),
    Complete(Arc<RangeProgress>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Continuous,
    UntilEmpty,
}

/// Drives a [`JobSource`] with a fixed pool of slot workers.
pub struct BatchProcessor {
    source: Arc<dyn JobSource>,
    processor: Arc<SlotProcessor>,
    config: BatchConfig,
}

impl BatchProcessor {
    #[must_use]
    pub fn new(source: Arc<dyn JobSource>, processor: Arc<SlotProcessor>, config: BatchConfig) -> Self {
        Self {
            source,
            processor,
            config,
        }
    }

    #[must_use]
    pub fn source(&self) -> &Arc<dyn JobSource> {
        &self.source
    }

    /// Leases and processes ranges until `token` is cancelled. An empty
    /// queue is polled again after a backoff.
    ///
    /// # Errors
    ///
    /// - `GapRecordError` when a failure could not be written back
    /// - `QueueError` after too many consecutive lease failures
    pub async fn run(&self, token: CancellationToken) -> Result<BatchReport> {
        self.drive(token, Mode::Continuous).await
    }

    /// Like [`run`](Self::run), but returns once the queue has no leasable
    /// range left and every leased range has been processed.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_until_empty(&self, token: CancellationToken) -> Result<BatchReport> {
        self.drive(token, Mode::UntilEmpty).await
    }

    async fn drive(&self, token: CancellationToken, mode: Mode) -> Result<BatchReport> {
        let queue = self.source.queue().name();
        let workers = self.config.workers.max(1);
        let token = token.child_token();
        let counters = Arc::new(Counters::default());

        let (slot_tx, slot_rx) = flume::bounded::<SlotJob>(workers * 2);
        let (sink_tx, sink_rx) = mpsc::unbounded_channel::<SinkMessage>();

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(slot_worker(
                self.processor.clone(),
                slot_rx.clone(),
                sink_tx.clone(),
                counters.clone(),
                token.clone(),
            ));
        }
        drop(slot_rx);

        let sink = tokio::spawn(failure_sink(
            self.source.clone(),
            sink_rx,
            counters.clone(),
            token.clone(),
        ));

        tracing::info!(queue, workers, "Batch processor started");
        let lease_result = self.lease_loop(&slot_tx, &sink_tx, &counters, &token, mode).await;
        if lease_result.is_err() {
            token.cancel();
        }
        drop(slot_tx);
        drop(sink_tx);

        let mut worker_error = None;
        while let Some(joined) = pool.join_next().await {
            let result = joined.map_err(|e| {
                BeaconIndexerError::InternalError(format!("{queue} worker panicked: {e}"))
            });
            if let Err(e) | Ok(Err(e)) = result
                && worker_error.is_none()
            {
                worker_error = Some(e);
            }
        }
        let sink_result = sink
            .await
            .map_err(|e| BeaconIndexerError::InternalError(format!("{queue} sink panicked: {e}")))
            .and_then(|r| r);

        let report = counters.report();
        tracing::info!(
            queue,
            ranges_leased = report.ranges_leased,
            ranges_completed = report.ranges_completed,
            slots_processed = report.slots_processed,
            slot_failures = report.slot_failures,
            "Batch processor stopped"
        );

        sink_result?;
        if let Some(e) = worker_error {
            return Err(e);
        }
        lease_result?;
        Ok(report)
    }

    async fn lease_loop(
        &self,
        slots: &flume::Sender<SlotJob>,
        sink: &mpsc::UnboundedSender<SinkMessage>,
        counters: &Counters,
        token: &CancellationToken,
        mode: Mode,
    ) -> Result<()> {
        let queue = self.source.queue().name();
        let max_errors = self.config.max_consecutive_lease_errors.max(1);
        let mut lease_errors: Vec<String> = Vec::new();
        let mut idle_polls: u32 = 0;

        while !token.is_cancelled() {
            let range = match self.source.lease().await {
                Ok(Some(range)) => {
                    lease_errors.clear();
                    idle_polls = 0;
                    range
                }
                Ok(None) => {
                    lease_errors.clear();
                    if mode == Mode::UntilEmpty {
                        tracing::debug!(queue, "Queue drained");
                        return Ok(());
                    }
                    idle_polls = idle_polls.saturating_add(1);
                    let delay = compute_backoff(&self.config.lease_backoff, idle_polls);
                    tokio::select! {
                        () = token.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => {
                    tracing::warn!(queue, attempt = lease_errors.len() + 1, error = %e, "Lease failed");
                    lease_errors.push(e.to_string());
                    let attempts = u32::try_from(lease_errors.len()).unwrap_or(u32::MAX);
                    if attempts >= max_errors {
                        return Err(BeaconIndexerError::QueueError {
                            queue,
                            message: lease_errors.join("; "),
                        });
                    }
                    let delay = compute_backoff(&self.config.lease_backoff, attempts);
                    tokio::select! {
                        () = token.cancelled() => return Ok(()),
                        () = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            counters.ranges_leased.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                queue,
                id = range.id,
                start_slot = range.start_slot,
                end_slot = range.end_slot,
                "Leased range"
            );

            let progress = Arc::new(RangeProgress::new(range));
            if progress.range.is_reversed() {
                progress.failures.fetch_add(1, Ordering::Relaxed);
                let failure = ProcessingError {
                    start_slot: progress.range.start_slot,
                    end_slot: progress.range.end_slot,
                    message: "invalid range: start_slot > end_slot".to_string(),
                };
                // the sink only goes away after the token is cancelled
                let _ = sink.send(SinkMessage::Failure(failure));
                let _ = sink.send(SinkMessage::Complete(progress));
                continue;
            }

            for slot in progress.range.slots() {
                let job = SlotJob {
                    slot,
                    progress: progress.clone(),
                };
                tokio::select! {
                    () = token.cancelled() => return Ok(()),
                    sent = slots.send_async(job) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

async fn slot_worker(
    processor: Arc<SlotProcessor>,
    slots: flume::Receiver<SlotJob>,
    sink: mpsc::UnboundedSender<SinkMessage>,
    counters: Arc<Counters>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let job = tokio::select! {
            () = token.cancelled() => return Ok(()),
            job = slots.recv_async() => match job {
                Ok(job) => job,
                Err(_) => return Ok(()),
            },
        };

        match processor.process_slot(job.slot).await {
            Ok(_) => {
                counters.slots_processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_fatal() => {
                token.cancel();
                return Err(e);
            }
            Err(e) => {
                counters.slot_failures.fetch_add(1, Ordering::Relaxed);
                job.progress.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(slot = job.slot, error = %e, "Slot processing failed");
                let _ = sink.send(SinkMessage::Failure(ProcessingError::slot(
                    job.slot,
                    e.to_string(),
                )));
            }
        }

        if job.progress.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = sink.send(SinkMessage::Complete(job.progress));
        }
    }
}

async fn failure_sink(
    source: Arc<dyn JobSource>,
    mut messages: mpsc::UnboundedReceiver<SinkMessage>,
    counters: Arc<Counters>,
    token: CancellationToken,
) -> Result<()> {
    let queue = source.queue().name();
    while let Some(message) = messages.recv().await {
        match message {
            SinkMessage::Failure(failure) => {
                if let Err(e) = source.record_failure(&failure).await {
                    logging::log_error(&format!("{queue} failure sink"), &e.to_string());
                    token.cancel();
                    return Err(e);
                }
            }
            SinkMessage::Complete(progress) => {
                let failures = progress.failures.load(Ordering::Relaxed);
                if let Err(e) = source.complete(&progress.range, failures > 0).await {
                    tracing::error!(
                        queue,
                        id = progress.range.id,
                        error = %e,
                        "Failed to complete range"
                    );
                    continue;
                }
                counters.ranges_completed.fetch_add(1, Ordering::Relaxed);
                let elapsed = u64::try_from(progress.started.elapsed().as_millis()).unwrap_or(u64::MAX);
                logging::log_range(
                    queue,
                    progress.range.start_slot,
                    progress.range.end_slot,
                    failures,
                    elapsed,
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BeaconIndexerConfigBuilder, RetryConfig};
    use crate::core::backfill::HistoricSource;
    use crate::core::codec::CodecRegistry;
    use crate::core::metrics::IndexerMetrics;
    use crate::core::node::BeaconNodeClient;
    use crate::core::writer::{DbWriter, KnownGapRecorder};
    use crate::storage::{InMemoryStorage, StorageBackend};
    use crate::types::GapQueue;
    use async_trait::async_trait;

    fn quick_config() -> BatchConfig {
        BatchConfig {
            enabled: true,
            workers: 2,
            max_consecutive_lease_errors: 5,
            lease_backoff: RetryConfig {
                max_retries: u32::MAX,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                backoff_multiplier: 1.0,
                jitter: false,
            },
            lease_ttl_secs: None,
        }
    }

    fn processor(storage: Arc<dyn StorageBackend>, metrics: Arc<IndexerMetrics>) -> Arc<SlotProcessor> {
        let config = BeaconIndexerConfigBuilder::new()
            .with_node("http://127.0.0.1:9")
            .with_database("postgresql://localhost/unused")
            .build()
            .unwrap();
        let node = Arc::new(BeaconNodeClient::new(&config.node).unwrap());
        let gaps = Arc::new(KnownGapRecorder::new(storage.clone(), 100, metrics.clone()));
        let writer = Arc::new(DbWriter::new(storage, gaps, metrics));
        Arc::new(SlotProcessor::new(
            node,
            Arc::new(CodecRegistry::new(&config.codecs)),
            writer,
            32,
        ))
    }

    struct BrokenQueue;

    #[async_trait]
    impl JobSource for BrokenQueue {
        fn queue(&self) -> GapQueue {
            GapQueue::Historic
        }
        async fn lease(&self) -> Result<Option<GapRange>> {
            Err(BeaconIndexerError::InternalError("lock timeout".into()))
        }
        async fn complete(&self, _range: &GapRange, _had_failures: bool) -> Result<()> {
            Ok(())
        }
        async fn release_all(&self) -> Result<u64> {
            Ok(0)
        }
        async fn record_failure(&self, _failure: &ProcessingError) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_consecutive_lease_errors_abort() {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let metrics = Arc::new(IndexerMetrics::new());
        let batch = BatchProcessor::new(
            Arc::new(BrokenQueue),
            processor(storage, metrics),
            quick_config(),
        );

        let err = batch.run(CancellationToken::new()).await.unwrap_err();
        match err {
            BeaconIndexerError::QueueError { queue, message } => {
                assert_eq!(queue, "historic");
                assert_eq!(message.matches("lock timeout").count(), 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_reversed_historic_range_moves_to_known_gaps() {
        let memory = InMemoryStorage::new();
        let storage: Arc<dyn StorageBackend> = Arc::new(memory.clone());
        let metrics = Arc::new(IndexerMetrics::new());
        storage.insert_historic(101, 100, 10).await.unwrap();

        let gaps = Arc::new(KnownGapRecorder::new(storage.clone(), 100, metrics.clone()));
        let source = Arc::new(HistoricSource::new(
            storage.clone(),
            gaps,
            metrics.clone(),
            "w1",
            None,
        ));
        let batch = BatchProcessor::new(source, processor(storage.clone(), metrics), quick_config());

        let report = batch.run_until_empty(CancellationToken::new()).await.unwrap();
        assert_eq!(report.ranges_leased, 1);
        assert_eq!(report.ranges_completed, 1);
        assert_eq!(report.slots_processed, 0);

        assert!(storage.list_ranges(GapQueue::Historic).await.unwrap().is_empty());
        let known = storage.list_ranges(GapQueue::KnownGaps).await.unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!((known[0].start_slot, known[0].end_slot), (101, 100));
        assert!(known[0].entry_error.as_deref().unwrap().contains("invalid range"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_returns_empty_report() {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        let metrics = Arc::new(IndexerMetrics::new());
        let batch = BatchProcessor::new(
            Arc::new(BrokenQueue),
            processor(storage, metrics),
            quick_config(),
        );
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(batch.run(token).await.unwrap(), BatchReport::default());
    }
}
