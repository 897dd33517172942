use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use quotepool::{Key, KeyedResourcePool, Listener, PoolConfig, PushSink, ResourceError, ResourceOpener};

const PUSHES_PER_ITER: u64 = 1024;

/// Opener that hands its sink back to the benchmark.
#[derive(Default)]
struct SinkOpener {
    sink: Mutex<Option<PushSink>>,
}

impl ResourceOpener for SinkOpener {
    fn open(&self, _key: &Key, sink: PushSink) -> Result<(), ResourceError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn close(&self, _key: &Key) {}
}

fn wait_for(counter: &AtomicU64, target: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while counter.load(Ordering::Acquire) < target {
        assert!(Instant::now() < deadline, "fanout stalled");
        std::hint::spin_loop();
    }
}

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/fanout");

    for listeners in [1_u64, 8, 64] {
        group.throughput(Throughput::Elements(PUSHES_PER_ITER * listeners));
        group.bench_with_input(BenchmarkId::from_parameter(listeners), &listeners, |b, &listeners| {
            let opener = Arc::new(SinkOpener::default());
            let pool = KeyedResourcePool::new(
                PoolConfig {
                    push_queue_capacity: 65_536,
                    maintenance_interval: Duration::from_millis(5),
                    ..PoolConfig::default()
                },
                Arc::clone(&opener) as Arc<dyn ResourceOpener>,
            )
            .unwrap();
            let key = Key::parse("BENCH").unwrap();

            let delivered = Arc::new(AtomicU64::new(0));
            let subscribed: Vec<Listener> = (0..listeners)
                .map(|_| {
                    let delivered = Arc::clone(&delivered);
                    let listener = Listener::new(move |_, _, _| {
                        delivered.fetch_add(1, Ordering::Release);
                    });
                    pool.subscribe(&key, &listener);
                    listener
                })
                .collect();

            let sink = loop {
                if let Some(sink) = opener.sink.lock().unwrap().clone() {
                    break sink;
                }
                std::thread::sleep(Duration::from_millis(1));
            };

            b.iter_custom(|iters| {
                let start = Instant::now();
                for _ in 0..iters {
                    let target = delivered.load(Ordering::Acquire) + PUSHES_PER_ITER * listeners;
                    for i in 0..PUSHES_PER_ITER {
                        sink.push_now(i.to_string()).unwrap();
                    }
                    wait_for(&delivered, target);
                }
                start.elapsed()
            });

            drop(subscribed);
            pool.shutdown();
        });
    }

    group.finish();
}

fn bench_subscribe_churn(c: &mut Criterion) {
    c.bench_function("pool/subscribe_unsubscribe", |b| {
        let opener = Arc::new(SinkOpener::default());
        let pool = KeyedResourcePool::new(PoolConfig::default(), opener).unwrap();
        let key = Key::parse("CHURN").unwrap();
        let listener = Listener::new(|_, _, _| {});

        b.iter(|| {
            pool.subscribe(&key, &listener);
            pool.unsubscribe(&key, &listener);
        });

        let _ = pool.stats();
    });
}

criterion_group!(benches, bench_fanout, bench_subscribe_churn);
criterion_main!(benches);
