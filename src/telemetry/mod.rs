//! Tracing subscriber setup for the binary and for tests.

/// Telemetry configuration.
pub mod config;

/// Global subscriber initialisation and graceful shutdown.
pub mod subscriber;

pub use config::TelemetryConfig;
pub use subscriber::{TelemetryGuard, init_telemetry, shutdown_telemetry};
