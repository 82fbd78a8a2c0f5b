//! Client entry point: dial the relay, attach sessions, register services.

use crate::domain::config::ClientConfig;
use crate::domain::error::{ConfigError, RelayError, RelayResult};
use crate::domain::limits::ServiceLimits;
use crate::ports::{RelayDialer, ServiceHandler};
use crate::session::{Connection, Service};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Creates connections and service registrations against a relay.
#[derive(Clone)]
pub struct RelayClient {
    dialer: Arc<dyn RelayDialer>,
    config: ClientConfig,
}

impl RelayClient {
    pub fn new(dialer: Arc<dyn RelayDialer>, config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if let Err(err) = relay_telemetry::register_metrics() {
            warn!(error = %err, "Relay client metrics unavailable");
        }
        Ok(Self { dialer, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Attach a client session to the relay at `address`.
    pub async fn connect(&self, address: &str) -> RelayResult<Connection> {
        let timeout = self.config.connect_timeout();
        let link = match tokio::time::timeout(timeout, self.dialer.dial(address)).await {
            Ok(link) => link?,
            Err(_) => {
                return Err(RelayError::Connection(format!(
                    "connect to {address} timed out after {timeout:?}"
                )))
            }
        };
        debug!(address = address, "Relay link established");
        Ok(Connection::establish(address, link, Handle::current()))
    }

    /// Register `handler` as a member of `topic`.
    ///
    /// `None` limits fall back to the configured defaults; zero fields
    /// resolve against the host's processing units.
    pub async fn register(
        &self,
        address: &str,
        topic: &str,
        handler: Arc<dyn ServiceHandler>,
        limits: Option<ServiceLimits>,
    ) -> RelayResult<Service> {
        let limits = limits
            .unwrap_or(self.config.default_limits)
            .resolve(self.config.processing_units());
        let connection = self.connect(address).await?;
        Service::start(connection, topic, handler, limits).await
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("config", &self.config)
            .finish()
    }
}
