//! Shared handlers and setup for integration tests and benchmarks.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use relay_client::{
    ClientConfig, Connection, InMemoryRelay, RelayClient, RelayError, ServiceHandler, Tunnel,
};
use relay_telemetry::TelemetryConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Address the in-process relay listens on.
pub const RELAY_ADDR: &str = "memory://relay";

/// Fresh relay plus a client dialing it.
pub fn setup() -> (InMemoryRelay, RelayClient) {
    // First caller installs the subscriber; later calls find it in place
    let _ = relay_telemetry::init_logging(&TelemetryConfig::for_tests());

    let relay = InMemoryRelay::new(RELAY_ADDR);
    let config = ClientConfig {
        processing_units: Some(2),
        ..ClientConfig::default()
    };
    let client = match RelayClient::new(Arc::new(relay.clone()), config) {
        Ok(client) => client,
        Err(err) => panic!("default test config rejected: {err}"),
    };
    (relay, client)
}

/// Random bytes of length `len`.
pub fn random_payload(len: usize) -> Bytes {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen::<u8>()).collect::<Vec<_>>().into()
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    check()
}

/// Records what the session did to the handler.
#[derive(Default)]
pub struct Observed {
    pub inits: AtomicUsize,
    pub broadcasts: Mutex<Vec<Bytes>>,
    pub drops: Mutex<Vec<RelayError>>,
    pub connection: Mutex<Option<Connection>>,
}

impl Observed {
    pub fn drop_count(&self) -> usize {
        self.drops.lock().len()
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().len()
    }
}

/// Replies with the request, echoes tunnel traffic.
#[derive(Default)]
pub struct EchoHandler {
    pub observed: Observed,
}

#[async_trait]
impl ServiceHandler for EchoHandler {
    async fn init(&self, connection: Connection) -> anyhow::Result<()> {
        self.observed.inits.fetch_add(1, Ordering::SeqCst);
        *self.observed.connection.lock() = Some(connection);
        Ok(())
    }

    async fn handle_broadcast(&self, message: Bytes) {
        self.observed.broadcasts.lock().push(message);
    }

    async fn handle_request(&self, request: Bytes) -> anyhow::Result<Bytes> {
        Ok(request)
    }

    async fn handle_tunnel(&self, tunnel: Tunnel) {
        while let Ok(message) = tunnel.recv(Duration::from_secs(5)).await {
            if tunnel.send(message).await.is_err() {
                break;
            }
        }
        tunnel.close().await;
    }

    async fn handle_drop(&self, reason: RelayError) {
        self.observed.drops.lock().push(reason);
    }
}

/// Fails every request with the request text as the error message.
#[derive(Default)]
pub struct FailHandler;

#[async_trait]
impl ServiceHandler for FailHandler {
    async fn handle_request(&self, request: Bytes) -> anyhow::Result<Bytes> {
        anyhow::bail!("{}", String::from_utf8_lossy(&request))
    }

    async fn handle_drop(&self, _reason: RelayError) {}
}

/// Never answers; its handler bodies only end by abort.
#[derive(Default)]
pub struct StuckHandler {
    pub observed: Observed,
}

#[async_trait]
impl ServiceHandler for StuckHandler {
    async fn handle_request(&self, _request: Bytes) -> anyhow::Result<Bytes> {
        futures::future::pending::<()>().await;
        Ok(Bytes::new())
    }

    async fn handle_drop(&self, reason: RelayError) {
        self.observed.drops.lock().push(reason);
    }
}

/// Tracks how many handler bodies run at once.
pub struct ConcurrencyProbe {
    hold: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    async fn occupy(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceHandler for ConcurrencyProbe {
    async fn handle_broadcast(&self, _message: Bytes) {
        self.occupy().await;
    }

    async fn handle_request(&self, request: Bytes) -> anyhow::Result<Bytes> {
        self.occupy().await;
        Ok(request)
    }

    async fn handle_drop(&self, _reason: RelayError) {}
}
