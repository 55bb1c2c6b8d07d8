//! Error types for `BeaconIndexer` operations.
//!
//! This module defines a comprehensive error enumeration using `thiserror`
//! to provide clear, actionable error reporting throughout the indexer.

use thiserror::Error;

/// Custom error type for `BeaconIndexer` operations.
///
/// This error type covers all failure modes of the indexer, from configuration
/// issues to runtime failures talking to the beacon node, decoding payloads, or
/// writing to the database.
#[derive(Debug, Error)]
pub enum BeaconIndexerError {
    /// Errors encountered during database operations.
    ///
    /// This variant automatically wraps `sqlx::Error` using the `#[from]` attribute,
    /// allowing seamless error propagation with the `?` operator.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Transport-level failures talking to the beacon node.
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON payloads that could not be (de)serialized.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Errors during SSZ payload decoding.
    ///
    /// A decoding error is fatal for the slot being processed: the caller
    /// records the slot as a known gap.
    #[error("Decoding error: {0}")]
    DecodingError(String),

    /// The beacon node answered, but not the way we needed it to
    /// (unhealthy, unexpected status, malformed body).
    #[error("Beacon node error: {0}")]
    NodeError(String),

    /// Errors related to configuration.
    ///
    /// This includes missing environment variables, invalid configuration values,
    /// or failures in parsing configuration data.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Errors from environment variable operations.
    #[error("Environment variable error: {0}")]
    EnvVarError(#[from] std::env::VarError),

    /// The initial handshake of an event stream failed.
    #[error("Connection error: {0}")]
    ConnectError(String),

    /// A slot processing request carried neither a slot nor a root.
    #[error("Slot request is missing both a slot number and a block/state root")]
    MissingIdentifier,

    /// The lease loop of a job queue gave up after repeated failures.
    #[error("Queue error on {queue}: {message}")]
    QueueError {
        /// Name of the queue that failed.
        queue: &'static str,
        /// Accumulated error messages.
        message: String,
    },

    /// A known gap could not be written. Losing track of a gap is worse than
    /// stopping, so callers treat this as fatal.
    #[error("Failed to record known gap [{start_slot}, {end_slot}]: {source}")]
    GapRecordError {
        /// First slot of the gap.
        start_slot: u64,
        /// Last slot of the gap.
        end_slot: u64,
        /// Underlying failure.
        #[source]
        source: Box<BeaconIndexerError>,
    },

    /// Cleanup did not finish within the configured grace period.
    #[error("Shutdown did not complete within {0} seconds")]
    ShutdownTimeout(u64),

    /// Generic errors for operations that don't fit other categories.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl BeaconIndexerError {
    /// Returns `true` for errors that must stop the running service.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BeaconIndexerError::GapRecordError { .. }
                | BeaconIndexerError::QueueError { .. }
                | BeaconIndexerError::ShutdownTimeout(_)
        )
    }
}

/// Type alias for Results using `BeaconIndexerError`.
pub type Result<T> = std::result::Result<T, BeaconIndexerError>;
