//! `BeaconIndexer` - a gap-free beacon chain slot indexer.
//!
//! The indexer follows a consensus-layer beacon node and records, for every
//! slot, whether a block was proposed, skipped or forked, together with the
//! raw SSZ block and state stored under content-addressed keys.
//!
//! # Quick Start
//!
//! ```no_run
//! use beacon_indexer::{BeaconIndexer, BeaconIndexerConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     dotenvy::dotenv().ok();
//!
//!     let config = BeaconIndexerConfigBuilder::new()
//!         .with_node(std::env::var("BEACON_NODE_URL")?)
//!         .with_database(std::env::var("DATABASE_URL")?)
//!         .build()?;
//!
//!     let indexer = BeaconIndexer::new(config).await?;
//!     indexer.seed_historic(0, 31, 1).await?;
//!     indexer.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **`EventSubscriber`** - typed subscription to one event-stream topic
//! 2. **`HeadTracker`** - follows `head` events, detects gaps and forks
//! 3. **`SlotProcessor`** - downloads and decodes block and state for a slot
//! 4. **`DbWriter`** - writes slot rows and blobs, reconciles reorgs
//! 5. **`BatchProcessor`** - leases ranges from the historic and known-gaps
//!    queues and processes them with a worker pool
//! 6. **Storage** - `PostgreSQL` via `SQLx`, or an in-memory backend for tests
//!
//! Every slot that could not be processed ends up in the `known_gaps` table,
//! which the known-gaps mode keeps working through.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Public API exports
pub use config::{BatchConfig, BeaconIndexerConfig, BeaconIndexerConfigBuilder, HeadConfig};
pub use core::codec::ConsensusFork;
pub use core::content_key::content_key;
pub use core::indexer::BeaconIndexer;
pub use core::metrics::{IndexerMetrics, MetricsSnapshot};
pub use storage::{InMemoryStorage, Storage, StorageBackend};
pub use types::{BeaconEvent, GapQueue, GapRange, SlotRecord, SlotStatus};
pub use utils::error::{BeaconIndexerError, Result};

// Module declarations
pub mod config;
pub mod core;
pub mod storage;
pub mod streams;
pub mod telemetry;
pub mod types;
pub mod utils;
