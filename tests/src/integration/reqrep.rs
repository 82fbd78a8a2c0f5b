//! # Request/Reply Correlation
//!
//! Many callers share one link per session; every reply must reach the
//! caller that issued the matching request, failures must arrive verbatim,
//! and a deadline must win over a reply that comes too late.

#[cfg(test)]
mod tests {
    use crate::fixtures::{setup, EchoHandler, FailHandler, RELAY_ADDR};
    use bytes::Bytes;
    use relay_client::{RelayError, ServiceHandler};
    use std::sync::Arc;
    use std::time::Duration;

    const CLIENTS: usize = 25;
    const SERVERS: usize = 25;
    const REQUESTS: usize = 25;

    struct SlowEcho {
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ServiceHandler for SlowEcho {
        async fn handle_request(&self, request: Bytes) -> anyhow::Result<Bytes> {
            tokio::time::sleep(self.delay).await;
            Ok(request)
        }

        async fn handle_drop(&self, _reason: RelayError) {}
    }

    #[tokio::test]
    async fn test_single_echo() {
        let (_relay, client) = setup();
        let service = client
            .register(RELAY_ADDR, "echo", Arc::new(EchoHandler::default()), None)
            .await
            .unwrap();
        let conn = client.connect(RELAY_ADDR).await.unwrap();

        let reply = conn
            .request("echo", "hello", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"hello"));

        conn.close().await.unwrap();
        service.unregister().await.unwrap();
    }

    /// Services double as clients: each one fires sequential requests from
    /// its own session while serving everybody else's.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_request_cross_talk() {
        let (relay, client) = setup();

        let mut services = Vec::new();
        for _ in 0..SERVERS {
            let service = client
                .register(RELAY_ADDR, "echo", Arc::new(EchoHandler::default()), None)
                .await
                .unwrap();
            services.push(service);
        }
        assert_eq!(relay.members("echo"), SERVERS);

        let mut workers = Vec::new();
        for c in 0..CLIENTS {
            let conn = if c < SERVERS {
                services[c].connection().clone()
            } else {
                client.connect(RELAY_ADDR).await.unwrap()
            };
            workers.push(tokio::spawn(async move {
                for r in 0..REQUESTS {
                    let request = format!("client #{c}, request #{r}");
                    let reply = conn
                        .request("echo", request.clone(), Duration::from_secs(5))
                        .await
                        .unwrap();
                    assert_eq!(reply, Bytes::from(request));
                }
            }));
        }
        for worker in workers {
            worker.await.unwrap();
        }

        for service in &services {
            assert_eq!(service.connection().pending_requests(), 0);
            service.unregister().await.unwrap();
        }
        assert_eq!(relay.open_routes(), 0);
        assert_eq!(relay.peer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_failure_forwarded_verbatim() {
        let (_relay, client) = setup();
        let service = client
            .register(RELAY_ADDR, "fail", Arc::new(FailHandler), None)
            .await
            .unwrap();
        let conn = client.connect(RELAY_ADDR).await.unwrap();

        for i in 0..CLIENTS * 5 {
            let request = format!("failure #{i}");
            let err = conn
                .request("fail", request.clone(), Duration::from_secs(1))
                .await
                .unwrap_err();
            assert_eq!(err, RelayError::Remote(request.clone()));
            assert_eq!(err.to_string(), request);
        }

        conn.close().await.unwrap();
        service.unregister().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_ignored() {
        let (relay, client) = setup();
        let service = client
            .register(
                RELAY_ADDR,
                "slow",
                Arc::new(SlowEcho {
                    delay: Duration::from_millis(100),
                }),
                None,
            )
            .await
            .unwrap();
        let conn = client.connect(RELAY_ADDR).await.unwrap();

        let timeout = Duration::from_millis(20);
        let err = conn.request("slow", "late", timeout).await.unwrap_err();
        assert_eq!(err, RelayError::Timeout(timeout));
        assert_eq!(conn.pending_requests(), 0);

        // Let the late reply arrive; it must not resolve anything
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(relay.open_routes(), 0);

        let reply = conn
            .request("slow", "on time", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"on time"));

        conn.close().await.unwrap();
        service.unregister().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_with_unbounded_timeout() {
        let (relay, client) = setup();
        let service = client
            .register(RELAY_ADDR, "echo", Arc::new(EchoHandler::default()), None)
            .await
            .unwrap();
        let conn = client.connect(RELAY_ADDR).await.unwrap();

        let reply = conn.request("echo", "patient", Duration::MAX).await.unwrap();
        assert_eq!(reply, Bytes::from_static(b"patient"));
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(relay.open_routes(), 0);

        conn.close().await.unwrap();
        service.unregister().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_without_members_times_out() {
        let (_relay, client) = setup();
        let conn = client.connect(RELAY_ADDR).await.unwrap();

        let timeout = Duration::from_millis(30);
        assert_eq!(
            conn.request("nobody", "ping", timeout).await,
            Err(RelayError::Timeout(timeout))
        );
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (_relay, client) = setup();
        let err = client.connect("memory://nowhere").await.unwrap_err();
        assert_eq!(
            err,
            RelayError::Connection("connection refused: memory://nowhere".into())
        );
    }

    #[tokio::test]
    async fn test_init_failure_aborts_registration() {
        struct Refuses;

        #[async_trait::async_trait]
        impl ServiceHandler for Refuses {
            async fn init(&self, _connection: relay_client::Connection) -> anyhow::Result<()> {
                anyhow::bail!("missing credentials")
            }

            async fn handle_request(&self, request: Bytes) -> anyhow::Result<Bytes> {
                Ok(request)
            }
        }

        let (relay, client) = setup();
        let err = client
            .register(RELAY_ADDR, "echo", Arc::new(Refuses), None)
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Init("missing credentials".into()));
        assert_eq!(relay.members("echo"), 0);
        assert_eq!(relay.peer_count(), 0);
    }
}
