//! Service registration: a handler bound to a topic through its own session.

use super::Connection;
use crate::admission::{GateSnapshot, TrafficClass};
use crate::domain::error::{RelayError, RelayResult};
use crate::domain::limits::AdmissionLimits;
use crate::ports::ServiceHandler;
use crate::protocol::Frame;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// A registered service.
///
/// Inbound requests and broadcasts for the topic are admitted through the
/// service's limits and handed to its handler until [`Service::unregister`]
/// is called or the relay drops the session.
pub struct Service {
    topic: String,
    connection: Connection,
}

impl Service {
    /// Initialize `handler` with `connection`, then join `topic`.
    ///
    /// The handler sees no traffic before its `init` returns. If `init`
    /// fails the session is closed and the handler is never dropped.
    pub(crate) async fn start(
        connection: Connection,
        topic: &str,
        handler: Arc<dyn ServiceHandler>,
        limits: AdmissionLimits,
    ) -> RelayResult<Self> {
        if let Err(err) = handler.init(connection.clone()).await {
            warn!(topic = topic, error = %err, "Service handler failed to initialize");
            connection.close().await?;
            return Err(RelayError::Init(err.to_string()));
        }

        connection.bind_service(topic, handler, limits);
        if let Err(err) = connection
            .send(Frame::Register {
                topic: topic.to_string(),
            })
            .await
        {
            connection.close().await?;
            return Err(err);
        }

        info!(
            topic = topic,
            address = connection.address(),
            request_threads = limits.request.threads,
            request_memory = limits.request.memory,
            broadcast_threads = limits.broadcast.threads,
            broadcast_memory = limits.broadcast.memory,
            "Service registered"
        );

        Ok(Self {
            topic: topic.to_string(),
            connection,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Session the service is attached to; usable for outbound calls.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Admission state for one traffic class. `None` once unregistered.
    pub fn admission_snapshot(&self, class: TrafficClass) -> Option<GateSnapshot> {
        self.connection.admission_snapshot(class)
    }

    /// Leave the topic and close the session. Safe to call more than once.
    pub async fn unregister(&self) -> RelayResult<()> {
        self.connection.close().await
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("topic", &self.topic)
            .field("connection", &self.connection)
            .finish()
    }
}
