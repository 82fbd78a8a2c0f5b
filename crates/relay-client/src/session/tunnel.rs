//! Ordered, bidirectional byte streams between two sessions.

use crate::domain::correlation::TunnelId;
use crate::domain::error::{RelayError, RelayResult};
use crate::ports::FrameSink;
use crate::protocol::Frame;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Inbound routes of a session's open tunnels.
///
/// Removing an entry ends the matching [`Tunnel`]'s receive side.
pub(crate) type TunnelRegistry = DashMap<TunnelId, mpsc::UnboundedSender<Bytes>>;

/// One end of an open tunnel.
pub struct Tunnel {
    id: TunnelId,
    sink: Arc<dyn FrameSink>,
    registry: Arc<TunnelRegistry>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: AtomicBool,
}

impl Tunnel {
    /// Create the local end of `id` and route its inbound data.
    pub(crate) fn attach(id: TunnelId, sink: Arc<dyn FrameSink>, registry: Arc<TunnelRegistry>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.insert(id, tx);
        Self {
            id,
            sink,
            registry,
            inbound: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// True once either side closed the tunnel or its session went away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || !self.registry.contains_key(&self.id)
    }

    /// Send a message to the other end.
    pub async fn send(&self, payload: Bytes) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::TunnelClosed);
        }
        self.sink
            .send(Frame::TunnelData {
                tunnel: self.id,
                payload,
            })
            .await?;
        Ok(())
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// Messages already received are still returned after the peer closed.
    pub async fn recv(&self, timeout: Duration) -> RelayResult<Bytes> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => Err(RelayError::TunnelClosed),
            Err(_) => Err(RelayError::Timeout(timeout)),
        }
    }

    /// Close the tunnel. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Peer already closed or session torn down: nothing to tell the relay
        if self.registry.remove(&self.id).is_none() {
            return;
        }
        if let Err(err) = self.sink.send(Frame::TunnelClose { tunnel: self.id }).await {
            debug!(tunnel = %self.id, error = %err, "Failed to notify relay of tunnel close");
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
