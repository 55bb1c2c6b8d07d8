use super::config::TelemetryConfig;
use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Guard that keeps the telemetry subsystem alive.
pub struct TelemetryGuard {
    service_name: String,
}

impl TelemetryGuard {
    /// Service name the subscriber was initialised for.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        shutdown_telemetry();
    }
}

static TELEMETRY_INIT: OnceLock<()> = OnceLock::new();

/// Initialize the global tracing subscriber (singleton, called once).
///
/// Uses `RUST_LOG` env var if set, otherwise falls back to `config.log_filter`.
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    TELEMETRY_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

        let fmt_layer = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_ansi(config.enable_console_colors);

        // try_init: a test harness may already have installed a subscriber
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    });

    TelemetryGuard {
        service_name: config.service_name,
    }
}

/// Explicit shutdown. The fmt layer writes synchronously, so there is nothing
/// buffered to flush.
pub fn shutdown_telemetry() {
    tracing::debug!("telemetry shut down");
}
