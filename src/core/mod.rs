pub mod backfill;
pub mod codec;
pub mod content_key;
pub mod head;
pub mod indexer;
pub mod metrics;
pub mod node;
pub mod slot;
pub mod writer;

pub use backfill::{BatchProcessor, BatchReport, HistoricSource, JobSource, KnownGapsSource};
pub use codec::{CodecRegistry, ConsensusFork, PayloadCodec};
pub use head::{HeadCursor, HeadTracker};
pub use indexer::BeaconIndexer;
pub use metrics::{IndexerMetrics, MetricsSnapshot};
pub use node::BeaconNodeClient;
pub use slot::{SlotProcessor, SlotRequest};
pub use writer::{DbWriter, KnownGapRecorder};
