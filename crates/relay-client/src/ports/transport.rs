//! # Outbound Port - Relay Transport
//!
//! The wire transport is an external collaborator. The core only needs to
//! send frames, close the link, and read inbound frames in arrival order.

use crate::domain::error::TransportError;
use crate::protocol::Frame;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sending half of a relay link.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Hand a frame to the relay.
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Release the link. Further sends fail with `TransportError::Closed`.
    async fn close(&self);
}

/// An established link to the relay.
pub struct RelayLink {
    /// Outbound frames
    pub sink: Arc<dyn FrameSink>,
    /// Inbound frames, delivered in order; ends when the relay side goes away
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

impl std::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLink")
            .field("inbound_closed", &self.inbound.is_closed())
            .finish_non_exhaustive()
    }
}

/// Establishes relay links by address.
#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn dial(&self, address: &str) -> Result<RelayLink, TransportError>;
}
