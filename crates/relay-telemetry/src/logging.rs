//! Structured logging setup.
//!
//! Logs carry consistent fields so they can be shipped and parsed:
//! - `timestamp`, `level`, `target`
//! - `service`: service name from [`TelemetryConfig`]
//! - context fields such as `correlation_id`, `topic` and `class`

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Structured logger handle
pub struct StructuredLogger {
    service_name: String,
}

impl StructuredLogger {
    /// Service name this logger was configured for.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &TelemetryConfig) -> Result<StructuredLogger, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    if !config.console_output {
        tracing_subscriber::registry()
            .with(env_filter)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else if config.json_logs {
        // JSON output for containers/production
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    } else {
        // Pretty output for development
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;
    }

    tracing::info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Structured logging initialized"
    );

    Ok(StructuredLogger {
        service_name: config.service_name.clone(),
    })
}

/// Log a session-related event with standard fields.
#[macro_export]
macro_rules! log_session_event {
    ($level:ident, $msg:expr, $address:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            address = %$address,
            $($($field)*,)?
            $msg
        )
    };
}
