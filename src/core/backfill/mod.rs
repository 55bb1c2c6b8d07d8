//! Batch processing of the historic and known-gaps queues.
//!
//! Both queues hold inclusive slot ranges. A [`JobSource`] abstracts how a
//! queue is leased, completed and how failures are written back; the
//! [`BatchProcessor`] drives any source with a pool of slot workers.

pub mod batch;
pub mod source;

pub use batch::{BatchProcessor, BatchReport};
pub use source::{HistoricSource, KnownGapsSource};

use crate::types::{GapQueue, GapRange, ProcessingError};
use crate::utils::error::Result;
use async_trait::async_trait;

/// A leasable queue of slot ranges.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Queue this source reads from.
    fn queue(&self) -> GapQueue;

    /// Claims the next range for this worker, `None` when nothing is available.
    async fn lease(&self) -> Result<Option<GapRange>>;

    /// Called once every slot of `range` has been attempted.
    async fn complete(&self, range: &GapRange, had_failures: bool) -> Result<()>;

    /// Releases every range this worker still holds. Returns rows released.
    async fn release_all(&self) -> Result<u64>;

    /// Writes a slot (or range) failure back to the known-gaps queue.
    ///
    /// An error here is fatal for the whole processor.
    async fn record_failure(&self, failure: &ProcessingError) -> Result<()>;
}
