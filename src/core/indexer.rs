//! Main indexer orchestrator that integrates all components.
//!
//! `BeaconIndexer` wires the node client, codecs, writer and slot processor
//! together and runs the enabled processing modes (head tracking, historic
//! backfill, known-gap reprocessing) side by side under one cancellation token.

use crate::{
    config::BeaconIndexerConfig,
    core::{
        backfill::{BatchProcessor, BatchReport, HistoricSource, JobSource, KnownGapsSource},
        codec::CodecRegistry,
        head::HeadTracker,
        metrics::IndexerMetrics,
        node::BeaconNodeClient,
        slot::SlotProcessor,
        writer::{DbWriter, KnownGapRecorder},
    },
    storage::{Storage, StorageBackend},
    streams::{Delivery, EventSubscriber},
    types::{
        BeaconEvent, ChainReorgEvent, FinalizedCheckpointEvent, GapQueue, HeadEvent,
        events::parse_quantity,
    },
    utils::{
        error::{BeaconIndexerError, Result},
        logging,
        retry::{compute_backoff, is_transient},
    },
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, interval, sleep};
use tokio_util::sync::CancellationToken;

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Main indexer that orchestrates the complete pipeline.
///
/// # Example
///
/// ```no_run
/// use beacon_indexer::{BeaconIndexer, BeaconIndexerConfigBuilder};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = BeaconIndexerConfigBuilder::new()
///     .with_node("http://localhost:5052")
///     .with_database("postgresql://localhost/beacon")
///     .build()?;
///
/// let indexer = BeaconIndexer::new(config).await?;
/// indexer.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct BeaconIndexer {
    config: BeaconIndexerConfig,
    storage: Arc<dyn StorageBackend>,
    node: Arc<BeaconNodeClient>,
    metrics: Arc<IndexerMetrics>,
    gaps: Arc<KnownGapRecorder>,
    processor: Arc<SlotProcessor>,
    historic: Arc<HistoricSource>,
    known_gaps: Arc<KnownGapsSource>,
    token: CancellationToken,
}

impl BeaconIndexer {
    /// Creates a new indexer backed by Postgres and creates the schema.
    ///
    /// # Errors
    ///
    /// Returns error if the database connection or schema creation fails, or
    /// if the node URL is unusable.
    pub async fn new(config: BeaconIndexerConfig) -> Result<Self> {
        let storage = Arc::new(Storage::new(&config.database_url).await?);
        storage.initialize().await?;
        Self::new_with_storage(config, storage)
    }

    /// Creates a new indexer instance with a custom storage backend.
    ///
    /// The backend is expected to be initialized already. This is useful for
    /// testing with [`InMemoryStorage`](crate::storage::InMemoryStorage).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the HTTP client cannot be built.
    pub fn new_with_storage(
        config: BeaconIndexerConfig,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let metrics = Arc::new(IndexerMetrics::new());
        let node = Arc::new(BeaconNodeClient::new(&config.node)?);
        let codecs = Arc::new(CodecRegistry::new(&config.codecs));
        let gaps = Arc::new(KnownGapRecorder::new(
            storage.clone(),
            config.known_gaps_increment,
            metrics.clone(),
        ));
        let writer = Arc::new(DbWriter::new(storage.clone(), gaps.clone(), metrics.clone()));
        let processor = Arc::new(SlotProcessor::new(
            node.clone(),
            codecs,
            writer,
            config.slots_per_epoch,
        ));
        let historic = Arc::new(HistoricSource::new(
            storage.clone(),
            gaps.clone(),
            metrics.clone(),
            config.worker_id.clone(),
            config.historic.lease_ttl(),
        ));
        let known_gaps = Arc::new(KnownGapsSource::new(
            storage.clone(),
            gaps.clone(),
            metrics.clone(),
            config.worker_id.clone(),
            config.known_gaps.lease_ttl(),
        ));

        Ok(Self {
            config,
            storage,
            node,
            metrics,
            gaps,
            processor,
            historic,
            known_gaps,
            token: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &BeaconIndexerConfig {
        &self.config
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<IndexerMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn processor(&self) -> &Arc<SlotProcessor> {
        &self.processor
    }

    /// Token cancelled by [`shutdown`](Self::shutdown). Child tokens of it
    /// are handed to every mode started by [`run`](Self::run).
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Requests a graceful stop of [`run`](Self::run).
    pub fn shutdown(&self) {
        logging::log(logging::LogLevel::Warning, "Shutdown requested");
        self.token.cancel();
    }

    /// Checks node health (retrying transient failures) and sync status.
    ///
    /// # Errors
    ///
    /// Returns the last health error once retries are exhausted, or
    /// `NodeError` if the node is syncing and head tracking would start
    /// without `allow_syncing`.
    pub async fn boot(&self) -> Result<()> {
        let retry = &self.config.node.health_retry;
        let mut attempt = 0;
        loop {
            match self.node.health().await {
                Ok(()) => break,
                Err(e) if attempt < retry.max_retries && is_transient(&e) => {
                    attempt += 1;
                    let delay = compute_backoff(retry, attempt);
                    tracing::warn!(attempt, ?delay, error = %e, "Beacon node not healthy yet");
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        let status = self.node.syncing().await?;
        tracing::info!(
            head_slot = status.head_slot,
            sync_distance = status.sync_distance,
            is_syncing = status.is_syncing,
            "Beacon node sync status"
        );
        if status.is_syncing && self.config.head.enabled && !self.config.node.allow_syncing {
            return Err(BeaconIndexerError::NodeError(format!(
                "node is syncing (distance {}), refusing to track head",
                status.sync_distance
            )));
        }
        logging::log(logging::LogLevel::Success, "Beacon node is ready");
        Ok(())
    }

    /// Subscribes to the head, chain reorg and finality topics and keeps
    /// the slot tables following the chain head until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// - `ConnectError` if a subscription cannot be opened initially
    /// - `GapRecordError` if a detected gap cannot be written
    pub async fn capture_head(&self, token: CancellationToken) -> Result<()> {
        let subscriber = self.config.subscriber;
        let (head, head_deliveries) =
            EventSubscriber::<HeadEvent>::new(&self.node, subscriber, self.metrics.clone());
        let (reorgs, reorg_deliveries) =
            EventSubscriber::<ChainReorgEvent>::new(&self.node, subscriber, self.metrics.clone());
        let (finality, finality_deliveries) = EventSubscriber::<FinalizedCheckpointEvent>::new(
            &self.node,
            subscriber,
            self.metrics.clone(),
        );

        let tracker = HeadTracker::new(
            self.processor.clone(),
            self.gaps.clone(),
            self.storage.clone(),
            self.metrics.clone(),
            self.config.head,
        );

        tokio::try_join!(
            head.run(token.clone()),
            reorgs.run(token.clone()),
            finality.run(token.clone()),
            async {
                let cursor = tracker.run(head_deliveries, token.clone()).await?;
                tracing::info!(
                    starting_slot = ?cursor.starting_slot,
                    last_slot = ?cursor.previous_slot,
                    "Head tracking stopped"
                );
                Ok::<(), BeaconIndexerError>(())
            },
            self.follow_chain_events(reorg_deliveries, finality_deliveries, token.clone()),
        )?;
        Ok(())
    }

    /// Handles chain reorg and finality deliveries as they arrive.
    async fn follow_chain_events(
        &self,
        mut reorgs: mpsc::Receiver<Delivery<ChainReorgEvent>>,
        mut finality: mpsc::Receiver<Delivery<FinalizedCheckpointEvent>>,
        token: CancellationToken,
    ) -> Result<()> {
        let (mut reorgs_open, mut finality_open) = (true, true);
        while reorgs_open || finality_open {
            let delivery = tokio::select! {
                biased;
                () = token.cancelled() => break,
                delivery = reorgs.recv(), if reorgs_open => match delivery {
                    Some(delivery) => delivery.into_event(),
                    None => {
                        reorgs_open = false;
                        continue;
                    }
                },
                delivery = finality.recv(), if finality_open => match delivery {
                    Some(delivery) => delivery.into_event(),
                    None => {
                        finality_open = false;
                        continue;
                    }
                },
            };

            match delivery {
                Delivery::Event(BeaconEvent::ChainReorg(event)) => self.on_chain_reorg(&event).await?,
                Delivery::Event(BeaconEvent::FinalizedCheckpoint(event)) => {
                    self.on_finalized_checkpoint(&event);
                }
                // consumed by the head tracker
                Delivery::Event(BeaconEvent::Head(_)) => {}
                Delivery::Undecodable(failure) => tracing::warn!(
                    topic = %failure.topic,
                    error = %failure.error,
                    "Bad event message"
                ),
            }
        }
        Ok(())
    }

    /// Reconciles the reorged slot against the new head block. Slots below
    /// it that the reorg also replaced are queued for reprocessing.
    async fn on_chain_reorg(&self, event: &ChainReorgEvent) -> Result<()> {
        IndexerMetrics::inc(&self.metrics.reorgs);
        let (slot, depth) = match (
            parse_quantity("slot", &event.slot),
            parse_quantity("depth", &event.depth),
        ) {
            (Ok(slot), Ok(depth)) => (slot, depth),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Unreadable chain_reorg event");
                return Ok(());
            }
        };
        tracing::warn!(
            slot,
            depth,
            old_head = %event.old_head_block,
            new_head = %event.new_head_block,
            "Chain reorg"
        );

        match self
            .processor
            .writer()
            .write_reorgs(slot, &event.new_head_block)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                self.gaps
                    .record_slot(slot, &e.to_string(), "chain_reorg")
                    .await?;
            }
        }

        if depth > 1 && slot >= depth {
            self.gaps
                .record(
                    slot - depth + 1,
                    slot - 1,
                    &format!("chain reorg of depth {depth} at slot {slot}"),
                    "chain_reorg",
                )
                .await?;
        }
        Ok(())
    }

    fn on_finalized_checkpoint(&self, event: &FinalizedCheckpointEvent) {
        match parse_quantity("epoch", &event.epoch) {
            Ok(epoch) => {
                self.metrics.observe_finalized_epoch(epoch);
                tracing::info!(epoch, block = %event.block, "Finalized checkpoint");
            }
            Err(e) => tracing::warn!(error = %e, "Unreadable finalized_checkpoint event"),
        }
    }

    /// Batch processor for `queue`, configured from this indexer's settings.
    #[must_use]
    pub fn batch_processor(&self, queue: GapQueue) -> BatchProcessor {
        let source: Arc<dyn JobSource> = match queue {
            GapQueue::Historic => self.historic.clone(),
            GapQueue::KnownGaps => self.known_gaps.clone(),
        };
        let config = match queue {
            GapQueue::Historic => self.config.historic.clone(),
            GapQueue::KnownGaps => self.config.known_gaps.clone(),
        };
        BatchProcessor::new(source, self.processor.clone(), config)
    }

    /// Processes the historic queue until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// See [`BatchProcessor::run`].
    pub async fn capture_historic(&self, token: CancellationToken) -> Result<BatchReport> {
        self.batch_processor(GapQueue::Historic).run(token).await
    }

    /// Processes the known-gaps queue until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// See [`BatchProcessor::run`].
    pub async fn process_known_gaps(&self, token: CancellationToken) -> Result<BatchReport> {
        self.batch_processor(GapQueue::KnownGaps).run(token).await
    }

    /// Releases every historic range checked out by this worker id.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn stop_historic(&self) -> Result<u64> {
        let released = self.historic.release_all().await?;
        tracing::info!(released, "Released historic ranges");
        Ok(released)
    }

    /// Releases every known-gap range checked out by this worker id.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn stop_known_gaps(&self) -> Result<u64> {
        let released = self.known_gaps.release_all().await?;
        tracing::info!(released, "Released known-gap ranges");
        Ok(released)
    }

    /// Enqueues `[start_slot, end_slot]` for historic backfill.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn seed_historic(&self, start_slot: u64, end_slot: u64, priority: i64) -> Result<()> {
        if start_slot > end_slot {
            tracing::warn!(start_slot, end_slot, "Seeding reversed historic range");
        }
        self.storage
            .insert_historic(start_slot, end_slot, priority)
            .await
    }

    /// Boots, then runs every enabled mode until [`shutdown`](Self::shutdown)
    /// is called or a mode fails fatally.
    ///
    /// After cancellation the modes and the lease release must finish within
    /// the configured grace period.
    ///
    /// # Errors
    ///
    /// - errors from [`boot`](Self::boot)
    /// - the first error returned by a mode
    /// - `ShutdownTimeout` if cleanup overruns the grace period
    pub async fn run(&self) -> Result<()> {
        self.boot().await?;
        logging::log(
            logging::LogLevel::Info,
            &format!("Starting modes: {}", self.config.enabled_modes().join(", ")),
        );

        let token = self.token.clone();
        let grace = self.config.shutdown_grace();
        let modes = self.run_modes(&token);
        tokio::pin!(modes);

        let (results, deadline) = tokio::select! {
            results = &mut modes => (results, Instant::now() + grace),
            () = token.cancelled() => {
                let deadline = Instant::now() + grace;
                match tokio::time::timeout_at(deadline, &mut modes).await {
                    Ok(results) => (results, deadline),
                    Err(_) => return Err(self.shutdown_timeout()),
                }
            }
        };

        if tokio::time::timeout_at(deadline, self.cleanup()).await.is_err() {
            return Err(self.shutdown_timeout());
        }
        self.metrics.report();

        let (head, historic, known_gaps) = results;
        head?;
        historic?;
        known_gaps?;
        logging::log(logging::LogLevel::Success, "Indexer stopped");
        Ok(())
    }

    async fn run_modes(&self, token: &CancellationToken) -> (Result<()>, Result<()>, Result<()>) {
        let head = supervised(token, "head", async {
            if self.config.head.enabled {
                self.capture_head(token.child_token()).await
            } else {
                Ok(())
            }
        });
        let historic = supervised(token, "historic", async {
            if self.config.historic.enabled {
                self.capture_historic(token.child_token()).await.map(|_| ())
            } else {
                Ok(())
            }
        });
        let known_gaps = supervised(token, "known_gaps", async {
            if self.config.known_gaps.enabled {
                self.process_known_gaps(token.child_token()).await.map(|_| ())
            } else {
                Ok(())
            }
        });
        let report = async {
            let mut ticker = interval(METRICS_REPORT_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => self.metrics.report(),
                }
            }
        };

        let (head, historic, known_gaps, ()) = tokio::join!(head, historic, known_gaps, report);
        (head, historic, known_gaps)
    }

    /// Releases leases on both queues; failures are logged, not returned.
    async fn cleanup(&self) {
        if let Err(e) = self.stop_historic().await {
            logging::log_error("Releasing historic ranges", &e.to_string());
        }
        if let Err(e) = self.stop_known_gaps().await {
            logging::log_error("Releasing known-gap ranges", &e.to_string());
        }
    }

    fn shutdown_timeout(&self) -> BeaconIndexerError {
        logging::log_error(
            "Shutdown",
            &format!(
                "cleanup did not finish within {}s",
                self.config.shutdown_grace_secs
            ),
        );
        BeaconIndexerError::ShutdownTimeout(self.config.shutdown_grace_secs)
    }
}

/// Cancels `token` when `mode` fails so the remaining modes stop too.
async fn supervised<F>(token: &CancellationToken, name: &str, mode: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = mode.await;
    if let Err(e) = &result {
        logging::log_error(&format!("{name} mode failed"), &e.to_string());
        token.cancel();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BeaconIndexerConfigBuilder;
    use crate::storage::InMemoryStorage;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn indexer_for(server: &MockServer, allow_syncing: bool) -> BeaconIndexer {
        let config = BeaconIndexerConfigBuilder::new()
            .with_node(server.uri())
            .with_database("postgresql://localhost/unused")
            .allow_syncing(allow_syncing)
            .build()
            .unwrap();
        BeaconIndexer::new_with_storage(config, Arc::new(InMemoryStorage::new())).unwrap()
    }

    async fn mount_syncing(server: &MockServer, is_syncing: bool) {
        Mock::given(method("GET"))
            .and(path("/eth/v1/node/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/eth/v1/node/syncing"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "head_slot": "1000",
                    "sync_distance": if is_syncing { "50" } else { "0" },
                    "is_syncing": is_syncing,
                    "is_optimistic": false,
                    "el_offline": false
                }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_boot_refuses_syncing_node() {
        let server = MockServer::start().await;
        mount_syncing(&server, true).await;

        let indexer = indexer_for(&server, false);
        assert!(matches!(
            indexer.boot().await,
            Err(BeaconIndexerError::NodeError(msg)) if msg.contains("syncing")
        ));

        let indexer = indexer_for(&server, true);
        assert!(indexer.boot().await.is_ok());
    }

    #[tokio::test]
    async fn test_seed_and_release() {
        let server = MockServer::start().await;
        let indexer = indexer_for(&server, false);
        indexer.seed_historic(100, 101, 1).await.unwrap();

        let leased = indexer
            .storage()
            .lease_range(GapQueue::Historic, &indexer.config().worker_id, None)
            .await
            .unwrap();
        assert!(leased.is_some());
        assert_eq!(indexer.stop_historic().await.unwrap(), 1);
        assert_eq!(indexer.stop_known_gaps().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_chain_events_are_handled_until_both_streams_close() {
        let server = MockServer::start().await;
        let indexer = indexer_for(&server, false);
        let (reorg_tx, reorg_rx) = mpsc::channel(4);
        let (finality_tx, finality_rx) = mpsc::channel(4);

        finality_tx
            .send(Delivery::Event(FinalizedCheckpointEvent {
                block: "0x01".into(),
                state: "0x02".into(),
                epoch: "7".into(),
                execution_optimistic: false,
            }))
            .await
            .unwrap();
        reorg_tx
            .send(Delivery::Undecodable(crate::streams::DecodeFailure {
                topic: crate::types::EventTopic::ChainReorg,
                raw: "{}".into(),
                error: "missing field `slot`".into(),
            }))
            .await
            .unwrap();
        drop(reorg_tx);
        drop(finality_tx);

        tokio::time::timeout(
            Duration::from_secs(5),
            indexer.follow_chain_events(reorg_rx, finality_rx, CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(indexer.metrics().snapshot().finalized_epoch, 7);
        assert_eq!(indexer.metrics().snapshot().reorgs, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = MockServer::start().await;
        mount_syncing(&server, false).await;

        let config = BeaconIndexerConfigBuilder::new()
            .with_node(server.uri())
            .with_database("postgresql://localhost/unused")
            .with_head(crate::config::HeadConfig {
                enabled: false,
                ..crate::config::HeadConfig::default()
            })
            .with_shutdown_grace(5)
            .build()
            .unwrap();
        let indexer = Arc::new(
            BeaconIndexer::new_with_storage(config, Arc::new(InMemoryStorage::new())).unwrap(),
        );

        let runner = {
            let indexer = indexer.clone();
            tokio::spawn(async move { indexer.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        indexer.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
