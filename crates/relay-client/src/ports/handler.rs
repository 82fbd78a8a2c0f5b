//! # Inbound Port - Service Handler
//!
//! The capability set a registrant implements to serve a topic. The session
//! calls these; it never implements them.
//!
//! | Method | Invoked | Concurrency |
//! |--------|---------|-------------|
//! | `init` | once, during registration | before any other method |
//! | `handle_broadcast` | per inbound broadcast | bounded by broadcast limits |
//! | `handle_request` | per inbound request | bounded by request limits |
//! | `handle_tunnel` | per inbound tunnel | own task, not admission gated |
//! | `handle_drop` | once, on teardown | after all handler bodies stopped |

use crate::domain::error::RelayError;
use crate::session::{Connection, Tunnel};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

/// Handler bound to a topic through a service registration.
///
/// A failed `handle_request` has its error text (`Display` of the outermost
/// error) forwarded verbatim to the requesting caller.
///
/// # Example
///
/// ```rust,ignore
/// struct Echo;
///
/// #[async_trait]
/// impl ServiceHandler for Echo {
///     async fn handle_request(&self, request: Bytes) -> anyhow::Result<Bytes> {
///         Ok(request)
///     }
/// }
/// ```
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// Called with the session before the service starts receiving traffic.
    ///
    /// Returning an error aborts the registration.
    async fn init(&self, connection: Connection) -> anyhow::Result<()> {
        let _ = connection;
        Ok(())
    }

    /// Handle a broadcast delivered to the topic.
    async fn handle_broadcast(&self, message: Bytes) {
        debug!(bytes = message.len(), "Broadcast ignored by handler");
    }

    /// Handle a request and produce its reply.
    async fn handle_request(&self, request: Bytes) -> anyhow::Result<Bytes>;

    /// Handle a tunnel opened towards this service.
    async fn handle_tunnel(&self, tunnel: Tunnel) {
        debug!(tunnel = %tunnel.id(), "Tunnel refused by handler");
        tunnel.close().await;
    }

    /// Called exactly once when the registration ends.
    async fn handle_drop(&self, reason: RelayError) {
        warn!(reason = %reason, "Service dropped");
    }
}
