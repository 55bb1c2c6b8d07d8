//! Backoff helpers shared by the lease loops and the boot sequence.
//!
//! This module provides:
//! - [`compute_backoff`]: exponential-backoff delay calculator with optional jitter.
//! - [`is_transient`]: classifies a [`BeaconIndexerError`] as retryable or not.

use crate::config::RetryConfig;
use crate::utils::error::BeaconIndexerError;
use std::time::Duration;

/// Computes the delay before the next retry.
///
/// `attempt` is 1-indexed: `attempt = 1` is the delay before the first retry,
/// `attempt = 2` before the second, etc.
///
/// Formula: `delay = initial_backoff_ms * backoff_multiplier^(attempt - 1)`,
/// capped at `max_backoff_ms`, then ±25 % jitter if enabled.
#[must_use]
pub fn compute_backoff(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let base = cfg.initial_backoff_ms as f64 * cfg.backoff_multiplier.powi(exponent);
    let capped = base.min(cfg.max_backoff_ms as f64);

    let ms = if cfg.jitter {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        // jitter factor in [0.75, 1.25]
        let factor = 0.75 + f64::from(nanos % 1_000_000) / 1_000_000.0 * 0.5;
        capped * factor
    } else {
        capped
    };

    Duration::from_millis(ms as u64)
}

/// Returns `true` if `err` represents a transient failure that is safe to retry.
///
/// | Error variant     | Retried | Reason                                  |
/// |-------------------|---------|-----------------------------------------|
/// | `HttpError`       | yes     | Connection reset, timeout               |
/// | `NodeError`       | yes     | Node still starting or overloaded       |
/// | `ConnectError`    | yes     | Event stream handshake failed           |
/// | `DatabaseError`   | yes     | Pool exhaustion, lock timeout           |
/// | `DecodingError`   | no      | Bad data will not self-heal             |
/// | `ConfigError`     | no      | Programmer error                        |
#[must_use]
pub fn is_transient(err: &BeaconIndexerError) -> bool {
    matches!(
        err,
        BeaconIndexerError::HttpError(_)
            | BeaconIndexerError::NodeError(_)
            | BeaconIndexerError::ConnectError(_)
            | BeaconIndexerError::DatabaseError(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_cfg() -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let cfg = no_jitter_cfg();
        assert_eq!(compute_backoff(&cfg, 1), Duration::from_millis(100));
        assert_eq!(compute_backoff(&cfg, 2), Duration::from_millis(200));
        assert_eq!(compute_backoff(&cfg, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let cfg = no_jitter_cfg();
        assert_eq!(compute_backoff(&cfg, 10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let cfg = RetryConfig {
            jitter: true,
            ..no_jitter_cfg()
        };
        let delay = compute_backoff(&cfg, 2).as_millis();
        assert!((150..=250).contains(&delay), "delay {delay} out of band");
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&BeaconIndexerError::NodeError("503".into())));
        assert!(!is_transient(&BeaconIndexerError::DecodingError(
            "bad".into()
        )));
        assert!(!is_transient(&BeaconIndexerError::ConfigError("x".into())));
    }
}
