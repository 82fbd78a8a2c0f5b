//! # Session Teardown
//!
//! Closing a session, unregistering a service, or losing the relay resolves
//! every outstanding call exactly once and tells the handler exactly once.

#[cfg(test)]
mod tests {
    use crate::fixtures::{eventually, setup, EchoHandler, StuckHandler, RELAY_ADDR};
    use bytes::Bytes;
    use relay_client::{
        Connection, RelayError, ServiceHandler, ServiceLimits, SessionState, TrafficClass,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const OUTSTANDING: usize = 10;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_resolves_outstanding_calls_once() {
        let (_relay, client) = setup();
        let stuck = Arc::new(StuckHandler::default());
        let service = client
            .register(RELAY_ADDR, "stuck", stuck.clone(), None)
            .await
            .unwrap();
        let conn = client.connect(RELAY_ADDR).await.unwrap();

        let calls: Vec<_> = (0..OUTSTANDING)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    conn.request("stuck", "wait", Duration::from_secs(60)).await
                })
            })
            .collect();
        assert!(eventually(Duration::from_secs(2), || conn.pending_requests() == OUTSTANDING).await);

        conn.close().await.unwrap();
        for call in calls {
            assert_eq!(call.await.unwrap(), Err(RelayError::ConnectionClosed));
        }
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(conn.state(), SessionState::Closed);

        service.unregister().await.unwrap();
        assert_eq!(stuck.observed.drop_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unregister_stops_handlers_and_drops_once() {
        let (relay, client) = setup();
        let stuck = Arc::new(StuckHandler::default());
        let limits = ServiceLimits {
            request_threads: 3,
            ..Default::default()
        };
        let service = client
            .register(RELAY_ADDR, "stuck", stuck.clone(), Some(limits))
            .await
            .unwrap();
        let conn = client.connect(RELAY_ADDR).await.unwrap();

        for _ in 0..5 {
            let conn = conn.clone();
            tokio::spawn(async move {
                let _ = conn.request("stuck", "wait", Duration::from_millis(500)).await;
            });
        }
        assert!(
            eventually(Duration::from_secs(2), || {
                service
                    .admission_snapshot(TrafficClass::Request)
                    .is_some_and(|s| s.threads_in_use == 3 && s.queued == 2)
            })
            .await
        );

        service.unregister().await.unwrap();
        service.unregister().await.unwrap();

        assert_eq!(stuck.observed.drop_count(), 1);
        assert_eq!(
            stuck.observed.drops.lock()[0],
            RelayError::ConnectionClosed
        );
        assert!(service.admission_snapshot(TrafficClass::Request).is_none());
        assert_eq!(relay.members("stuck"), 0);

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_close_is_idempotent() {
        let (_relay, client) = setup();
        let echo = Arc::new(EchoHandler::default());
        let service = client
            .register(RELAY_ADDR, "echo", echo.clone(), None)
            .await
            .unwrap();

        let closers: Vec<_> = (0..8)
            .map(|_| {
                let conn = service.connection().clone();
                tokio::spawn(async move { conn.close().await })
            })
            .collect();
        for closer in closers {
            assert_eq!(closer.await.unwrap(), Ok(()));
        }

        assert_eq!(echo.observed.drop_count(), 1);
        assert_eq!(echo.observed.inits.load(Ordering::SeqCst), 1);
        assert_eq!(
            service.connection().broadcast("echo", "late").await,
            Err(RelayError::NotConnected)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_relay_drop_notifies_sessions() {
        let (relay, client) = setup();
        let echo = Arc::new(EchoHandler::default());
        let service = client
            .register(RELAY_ADDR, "echo", echo.clone(), None)
            .await
            .unwrap();
        let conn = client.connect(RELAY_ADDR).await.unwrap();

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.request("nobody", "ping", Duration::from_secs(60)).await
            })
        };
        assert!(eventually(Duration::from_secs(2), || conn.pending_requests() == 1).await);

        relay.disconnect_all("relay shutting down");

        assert_eq!(pending.await.unwrap(), Err(RelayError::ConnectionClosed));
        assert!(
            eventually(Duration::from_secs(2), || {
                conn.state() == SessionState::Closed
                    && service.connection().state() == SessionState::Closed
            })
            .await
        );
        assert_eq!(
            echo.observed.drops.lock().clone(),
            vec![RelayError::Dropped("relay shutting down".into())]
        );

        // Local teardown after a relay drop is a no-op
        service.unregister().await.unwrap();
        conn.close().await.unwrap();
        assert_eq!(echo.observed.drop_count(), 1);
    }

    /// A handler closing its own session from `handle_drop` must not hang.
    #[tokio::test]
    async fn test_close_from_drop_handler() {
        struct ClosesOnDrop {
            connection: parking_lot::Mutex<Option<Connection>>,
            drops: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl ServiceHandler for ClosesOnDrop {
            async fn init(&self, connection: Connection) -> anyhow::Result<()> {
                *self.connection.lock() = Some(connection);
                Ok(())
            }

            async fn handle_request(&self, request: Bytes) -> anyhow::Result<Bytes> {
                Ok(request)
            }

            async fn handle_drop(&self, _reason: RelayError) {
                self.drops.fetch_add(1, Ordering::SeqCst);
                let connection = self.connection.lock().clone();
                if let Some(connection) = connection {
                    let _ = connection.close().await;
                }
            }
        }

        let (_relay, client) = setup();
        let handler = Arc::new(ClosesOnDrop {
            connection: parking_lot::Mutex::new(None),
            drops: AtomicUsize::new(0),
        });
        let service = client
            .register(RELAY_ADDR, "echo", handler.clone(), None)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), service.unregister())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handler.drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_from_request_handler() {
        struct ClosesOnRequest {
            connection: parking_lot::Mutex<Option<Connection>>,
        }

        #[async_trait::async_trait]
        impl ServiceHandler for ClosesOnRequest {
            async fn init(&self, connection: Connection) -> anyhow::Result<()> {
                *self.connection.lock() = Some(connection);
                Ok(())
            }

            async fn handle_request(&self, _request: Bytes) -> anyhow::Result<Bytes> {
                let connection = self.connection.lock().clone();
                if let Some(connection) = connection {
                    connection.close().await?;
                }
                Ok(Bytes::new())
            }
        }

        let (relay, client) = setup();
        let service = client
            .register(
                RELAY_ADDR,
                "quit",
                Arc::new(ClosesOnRequest {
                    connection: parking_lot::Mutex::new(None),
                }),
                None,
            )
            .await
            .unwrap();
        let conn = client.connect(RELAY_ADDR).await.unwrap();

        let timeout = Duration::from_millis(200);
        assert_eq!(
            conn.request("quit", "now", timeout).await,
            Err(RelayError::Timeout(timeout))
        );
        assert_eq!(service.connection().state(), SessionState::Closed);
        assert_eq!(relay.members("quit"), 0);

        conn.close().await.unwrap();
    }
}
