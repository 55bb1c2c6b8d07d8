//! Live head tracking.
//!
//! Head events are parsed in arrival order and turned into jobs. Block and
//! state downloads run concurrently (bounded by the dispatch worker count),
//! while writes and continuity checks are applied strictly in event order so
//! that fork and gap detection always compare against the previous event.

use crate::config::HeadConfig;
use crate::core::metrics::IndexerMetrics;
use crate::core::slot::{SlotProcessor, SlotRequest};
use crate::core::writer::KnownGapRecorder;
use crate::storage::StorageBackend;
use crate::streams::Delivery;
use crate::types::events::parse_quantity;
use crate::types::{HeadEvent, SlotWriteModel};
use crate::utils::error::{BeaconIndexerError, Result};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ENTRY_PROCESS: &str = "head";

/// Position of the tracker in the head stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadCursor {
    pub previous_slot: Option<u64>,
    pub previous_block_root: Option<String>,
    pub starting_slot: Option<u64>,
    pub consecutive_error_count: u64,
}

impl HeadCursor {
    fn previous(&self) -> Option<(u64, String)> {
        self.previous_slot.zip(self.previous_block_root.clone())
    }
}

/// How a head block relates to the previous head event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuity {
    /// Next slot, parent is the previous head.
    Contiguous,
    /// Same slot and root delivered twice.
    Duplicate,
    /// Same slot, different root.
    Fork,
    /// Earlier slot than the previous head.
    Rewind,
    /// Slots between the two events were never announced.
    Gap { start_slot: u64, end_slot: u64 },
    /// Next slot, but built on a different parent: the previous head was reorged out.
    ParentMismatch,
}

/// Classifies a processed head block against the previous head event.
#[must_use]
pub fn classify(
    previous_slot: u64,
    previous_root: &str,
    slot: u64,
    block_root: &str,
    parent_root: &str,
) -> Continuity {
    if slot == previous_slot {
        if block_root == previous_root {
            Continuity::Duplicate
        } else {
            Continuity::Fork
        }
    } else if slot < previous_slot {
        Continuity::Rewind
    } else if slot > previous_slot + 1 {
        Continuity::Gap {
            start_slot: previous_slot + 1,
            end_slot: slot - 1,
        }
    } else if parent_root != previous_root {
        Continuity::ParentMismatch
    } else {
        Continuity::Contiguous
    }
}

#[derive(Debug, Clone)]
struct HeadJob {
    slot: u64,
    block_root: String,
    state_root: String,
    previous: Option<(u64, String)>,
}

/// Consumes head events and keeps the slot tables in step with the chain head.
pub struct HeadTracker {
    processor: Arc<SlotProcessor>,
    gaps: Arc<KnownGapRecorder>,
    storage: Arc<dyn StorageBackend>,
    metrics: Arc<IndexerMetrics>,
    config: HeadConfig,
    /// Slots accepted but not yet settled, in acceptance order.
    pending: Mutex<VecDeque<u64>>,
}

impl HeadTracker {
    #[must_use]
    pub fn new(
        processor: Arc<SlotProcessor>,
        gaps: Arc<KnownGapRecorder>,
        storage: Arc<dyn StorageBackend>,
        metrics: Arc<IndexerMetrics>,
        config: HeadConfig,
    ) -> Self {
        Self {
            processor,
            gaps,
            storage,
            metrics,
            config,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Runs until `token` is cancelled or the delivery channel closes.
    ///
    /// Deliveries are handled in the order they arrived on the stream, so an
    /// undecodable message counts as a bad head message between its
    /// neighbours. Slots still being downloaded when `token` fires are
    /// recorded as a known gap before returning.
    ///
    /// # Errors
    ///
    /// Returns `GapRecordError` when a gap could not be recorded; every other
    /// failure is recorded as a known gap and processing continues.
    pub async fn run(
        &self,
        mut deliveries: mpsc::Receiver<Delivery<HeadEvent>>,
        token: CancellationToken,
    ) -> Result<HeadCursor> {
        self.pending.lock().clear();
        let (job_tx, job_rx) = mpsc::channel::<HeadJob>(self.config.dispatch_queue_capacity);
        let intake_token = token.clone();

        let intake = async move {
            let mut cursor = HeadCursor::default();
            loop {
                tokio::select! {
                    biased;
                    () = intake_token.cancelled() => break,
                    delivery = deliveries.recv() => match delivery {
                        Some(Delivery::Event(event)) => self.accept(event, &mut cursor, &job_tx).await?,
                        Some(Delivery::Undecodable(failure)) => {
                            self.note_bad_message(&mut cursor, &failure.error);
                        }
                        None => break,
                    },
                }
            }
            Ok::<_, BeaconIndexerError>(cursor)
        };

        let (cursor, ()) = tokio::try_join!(intake, self.sequence(job_rx, token.clone()))?;
        self.record_unsettled().await?;
        Ok(cursor)
    }

    /// Records slots whose head jobs were dropped by cancellation.
    async fn record_unsettled(&self) -> Result<()> {
        let unsettled: Vec<u64> = self.pending.lock().drain(..).collect();
        let (Some(&low), Some(&high)) = (unsettled.iter().min(), unsettled.iter().max()) else {
            return Ok(());
        };
        tracing::warn!(
            count = unsettled.len(),
            low,
            high,
            "Head jobs dropped on shutdown"
        );
        self.gaps
            .record(low, high, "head shutdown before slot was written", ENTRY_PROCESS)
            .await
    }

    fn note_bad_message(&self, cursor: &mut HeadCursor, error: &str) {
        cursor.consecutive_error_count += 1;
        IndexerMetrics::inc(&self.metrics.head_errors);
        tracing::warn!(
            consecutive = cursor.consecutive_error_count,
            error,
            "Bad head message"
        );
    }

    async fn accept(
        &self,
        event: HeadEvent,
        cursor: &mut HeadCursor,
        jobs: &mpsc::Sender<HeadJob>,
    ) -> Result<()> {
        let slot = match parse_quantity("slot", &event.slot) {
            Ok(slot) => slot,
            Err(e) => {
                self.note_bad_message(cursor, &e.to_string());
                return Ok(());
            }
        };

        if cursor.consecutive_error_count > 0 {
            match cursor.previous_slot {
                Some(previous) if slot > previous => {
                    self.gaps
                        .record(
                            previous + 1,
                            slot,
                            &format!("bad head messages ({})", cursor.consecutive_error_count),
                            ENTRY_PROCESS,
                        )
                        .await?;
                }
                _ => tracing::warn!(
                    slot,
                    errors = cursor.consecutive_error_count,
                    "Bad head messages without an earlier slot to anchor a gap"
                ),
            }
            cursor.consecutive_error_count = 0;
        }

        // slots between two head events are recorded before dispatch
        if let Some(previous) = cursor.previous_slot
            && slot > previous + 1
        {
            self.gaps
                .record(
                    previous + 1,
                    slot - 1,
                    "no head event received for these slots",
                    ENTRY_PROCESS,
                )
                .await?;
        }

        if cursor.starting_slot.is_none() {
            cursor.starting_slot = Some(slot);
            self.record_startup_gap(slot).await?;
        }

        let job = HeadJob {
            slot,
            block_root: event.block.clone(),
            state_root: event.state,
            previous: cursor.previous(),
        };
        cursor.previous_slot = Some(slot);
        cursor.previous_block_root = Some(event.block);

        self.pending.lock().push_back(slot);
        if jobs.send(job).await.is_err() {
            // the sequencer only stops early on cancellation; the slot stays pending
            tracing::debug!(slot, "Head sequencer stopped, job not dispatched");
        }
        Ok(())
    }

    /// Records the slots between the last stored slot and the first head
    /// event of this run.
    async fn record_startup_gap(&self, first_slot: u64) -> Result<()> {
        let highest = match self.storage.highest_slot().await {
            Ok(highest) => highest,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read highest stored slot");
                return Ok(());
            }
        };
        if let Some(highest) = highest
            && first_slot > highest + 1
        {
            self.gaps
                .record(
                    highest + 1,
                    first_slot - 1,
                    "head startup",
                    ENTRY_PROCESS,
                )
                .await?;
        }
        Ok(())
    }

    /// In-flight downloads are dropped on cancellation; their slots stay in
    /// `pending` for [`record_unsettled`](Self::record_unsettled).
    async fn sequence(&self, jobs: mpsc::Receiver<HeadJob>, token: CancellationToken) -> Result<()> {
        let processor = self.processor.clone();
        let results = futures_util::stream::unfold(jobs, |mut rx| async move {
            rx.recv().await.map(|job| (job, rx))
        })
        .map(|job| {
            let processor = processor.clone();
            async move {
                let request = SlotRequest::from_head(job.slot, &job.block_root, &job.state_root);
                let result = processor.fetch(&request).await;
                (job, result)
            }
        })
        .buffered(self.config.dispatch_workers.max(1));
        let mut results = std::pin::pin!(results);

        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => break,
                next = results.next() => next,
            };
            let Some((job, result)) = next else {
                break;
            };
            self.settle(job, result).await?;
            self.pending.lock().pop_front();
        }
        Ok(())
    }

    async fn settle(&self, job: HeadJob, fetched: Result<SlotWriteModel>) -> Result<()> {
        let model = match fetched {
            Ok(model) => model,
            Err(e) => return self.record_failure(job.slot, &e).await,
        };
        if let Err(e) = self.processor.writer().write_full_slot(&model).await {
            return self.record_failure(job.slot, &e).await;
        }
        if model.is_skipped() {
            return Ok(());
        }

        let Some((previous_slot, previous_root)) = job.previous else {
            return Ok(());
        };
        match classify(
            previous_slot,
            &previous_root,
            job.slot,
            &model.block_root,
            &model.parent_block_root,
        ) {
            Continuity::Contiguous | Continuity::Duplicate => Ok(()),
            Continuity::Fork | Continuity::Rewind => {
                IndexerMetrics::inc(&self.metrics.reorgs);
                self.reconcile(job.slot, &model.block_root).await
            }
            Continuity::ParentMismatch => {
                IndexerMetrics::inc(&self.metrics.reorgs);
                self.reconcile(previous_slot, &model.parent_block_root)
                    .await
            }
            // recorded when the event was accepted
            Continuity::Gap { .. } => Ok(()),
        }
    }

    async fn reconcile(&self, slot: u64, canonical_root: &str) -> Result<()> {
        match self
            .processor
            .writer()
            .write_reorgs(slot, canonical_root)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => self.record_failure(slot, &e).await,
        }
    }

    async fn record_failure(&self, slot: u64, error: &BeaconIndexerError) -> Result<()> {
        IndexerMetrics::inc(&self.metrics.head_errors);
        tracing::error!(slot, error = %error, "Head slot processing failed");
        self.gaps
            .record_slot(slot, &error.to_string(), ENTRY_PROCESS)
            .await
    }
}
