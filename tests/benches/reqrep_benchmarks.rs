//! # Request/Reply Benchmarks
//!
//! Round-trip latency of a single caller, and throughput with 1..128
//! concurrent callers sharing one session against one echo service.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use relay_client::{Connection, Service};
use relay_tests::fixtures::{setup, EchoHandler, RELAY_ADDR};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const TIMEOUT: Duration = Duration::from_secs(5);

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn echo_session(rt: &Runtime) -> (Service, Connection) {
    rt.block_on(async {
        let (_relay, client) = setup();
        let service = client
            .register(RELAY_ADDR, "echo", Arc::new(EchoHandler::default()), None)
            .await
            .unwrap();
        let conn = client.connect(RELAY_ADDR).await.unwrap();
        (service, conn)
    })
}

fn bench_latency(c: &mut Criterion) {
    let rt = runtime();
    let (service, conn) = echo_session(&rt);
    let payload = Bytes::from_static(b"benchmark payload");

    let mut group = c.benchmark_group("reqrep-latency");
    group.bench_function("round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(conn.request("echo", payload.clone(), TIMEOUT).await.unwrap())
        })
    });
    group.finish();

    rt.block_on(async {
        conn.close().await.unwrap();
        service.unregister().await.unwrap();
    });
}

fn bench_throughput(c: &mut Criterion) {
    let rt = runtime();
    let (service, conn) = echo_session(&rt);
    let payload = Bytes::from_static(b"benchmark payload");

    let mut group = c.benchmark_group("reqrep-throughput");
    group.measurement_time(Duration::from_secs(10));

    for callers in [1usize, 2, 4, 8, 16, 32, 64, 128] {
        group.throughput(Throughput::Elements(callers as u64));
        group.bench_with_input(BenchmarkId::new("concurrent_callers", callers), &callers, |b, &n| {
            b.to_async(&rt).iter(|| async {
                let calls = (0..n).map(|_| conn.request("echo", payload.clone(), TIMEOUT));
                for reply in join_all(calls).await {
                    black_box(reply.unwrap());
                }
            })
        });
    }
    group.finish();

    rt.block_on(async {
        conn.close().await.unwrap();
        service.unregister().await.unwrap();
    });
}

criterion_group!(benches, bench_latency, bench_throughput);
criterion_main!(benches);
