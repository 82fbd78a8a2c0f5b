//! # Relay Telemetry
//!
//! Logging and metrics for the relay client.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(TelemetryConfig::from_env())?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_SERVICE_NAME` | `relay-client` | Service name in logs |
//! | `RELAY_LOG_LEVEL` | `info` | Log level filter |
//! | `RELAY_JSON_LOGS` | `false` | JSON formatted output |
//! | `RELAY_CONSOLE_OUTPUT` | `true` | Emit logs to stdout |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, StructuredLogger};
pub use metrics::{encode_metrics, register_metrics, MetricsHandle};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that should be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Metrics first, so early log lines about the registry are visible
    let metrics = register_metrics()?;
    let logger = init_logging(&config)?;

    Ok(TelemetryGuard {
        _logger: logger,
        _metrics: metrics,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _logger: StructuredLogger,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
