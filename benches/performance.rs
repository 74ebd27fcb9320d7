use bytes::BytesMut;
use cerrojo::cluster::{LogAlertSink, Node, NodeAddress, NodeRegistry};
use cerrojo::config::Config;
use cerrojo::coordination::{Blacklist, LocalBlacklist};
use cerrojo::store::{MemoryStore, RespEncoder, RespParser, StoreClient};
use cerrojo::Coordinator;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn memory_coordinator(rt: &Runtime) -> Coordinator {
    rt.block_on(async {
        let client: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let registry = Arc::new(NodeRegistry::new(vec![Node::new("node1", "127.0.0.1", 6379, client)]));
        Coordinator::from_registry(Config::default(), registry, Arc::new(LogAlertSink)).await
    })
}

/// Coordination calls through the retrying executor
fn bench_coordination(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let coordinator = memory_coordinator(&rt);
    rt.block_on(async {
        coordinator.quota().init("bench", i64::MAX / 2, 1).await.unwrap();
        coordinator.quota().enable("bench", true).await.unwrap();
    });

    let mut group = c.benchmark_group("coordination");

    group.bench_function("quota_acquire", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(coordinator.quota().acquire("bench", 1).await.unwrap());
        });
    });

    group.bench_function("lock_unlock", |b| {
        b.to_async(&rt).iter(|| async {
            let lock = coordinator.lock();
            lock.try_lock("bench-lock", "token", Duration::from_secs(30)).await.unwrap();
            black_box(lock.unlock("bench-lock", "token").await.unwrap());
        });
    });

    group.finish();
}

/// In-process blacklist with its full-scan eviction
fn bench_local_blacklist(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("local_blacklist");

    for size in [100, 1000, 10000].iter() {
        let blacklist = LocalBlacklist::new();
        for i in 0..*size {
            blacklist.put(&format!("jti_{}", i), "1", Duration::from_secs(3600));
        }
        let key = format!("jti_{}", size / 2);

        group.bench_with_input(BenchmarkId::new("is_blacklisted", size), size, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(blacklist.is_blacklisted(&key).await.unwrap());
            });
        });
    }

    group.finish();
}

/// RESP codec and node entry parsing
fn bench_protocol(c: &mut Criterion) {
    let mut group = c.benchmark_group("protocol");

    let command = RespEncoder::create_command("EVAL", &["return 1", "1", "flash_sale:bench", "3"]);
    group.bench_function("resp_encode", |b| {
        b.iter(|| black_box(RespEncoder::encode(&command)));
    });

    let encoded = RespEncoder::encode(&command);
    group.bench_function("resp_parse", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&encoded[..]);
            black_box(RespParser::parse(&mut buf).unwrap());
        });
    });

    group.bench_function("node_address_parse", |b| {
        b.iter(|| black_box(NodeAddress::parse("s3cret@10.0.1.20:6379").unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_coordination, bench_local_blacklist, bench_protocol);

criterion_main!(benches);
