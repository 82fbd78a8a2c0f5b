//! Client configuration with validation.

use crate::domain::error::ConfigError;
use crate::domain::limits::{available_processing_units, ServiceLimits};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Relay client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Upper bound on establishing a relay connection (milliseconds)
    pub connect_timeout_ms: u64,
    /// Processing units used to derive default thread limits.
    /// `None` asks the host once per registration.
    pub processing_units: Option<usize>,
    /// Limits applied when `register` is called without explicit limits
    pub default_limits: ServiceLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            processing_units: None,
            default_limits: ServiceLimits::default(),
        }
    }
}

impl ClientConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "connect_timeout_ms cannot be 0".into(),
            ));
        }

        if self.processing_units == Some(0) {
            return Err(ConfigError::InvalidLimit(
                "processing_units cannot be 0".into(),
            ));
        }

        Ok(())
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Processing units for default limit derivation
    pub fn processing_units(&self) -> usize {
        self.processing_units
            .unwrap_or_else(available_processing_units)
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RELAY_CONNECT_TIMEOUT_MS`: Connect timeout (default: 5000)
    /// - `RELAY_PROCESSING_UNITS`: Override detected CPU count
    /// - `RELAY_BROADCAST_THREADS`, `RELAY_BROADCAST_MEMORY`,
    ///   `RELAY_REQUEST_THREADS`, `RELAY_REQUEST_MEMORY`: default service limits
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse_env("RELAY_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout_ms = ms;
        }
        if let Some(units) = parse_env("RELAY_PROCESSING_UNITS")? {
            config.processing_units = Some(units);
        }
        if let Some(v) = parse_env("RELAY_BROADCAST_THREADS")? {
            config.default_limits.broadcast_threads = v;
        }
        if let Some(v) = parse_env("RELAY_BROADCAST_MEMORY")? {
            config.default_limits.broadcast_memory = v;
        }
        if let Some(v) = parse_env("RELAY_REQUEST_THREADS")? {
            config.default_limits.request_threads = v;
        }
        if let Some(v) = parse_env("RELAY_REQUEST_MEMORY")? {
            config.default_limits.request_memory = v;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
