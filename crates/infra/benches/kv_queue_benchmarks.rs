use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use jobservice_core::{JobId, JobStatus, Parameters, SystemClock};
use jobservice_infra::kv::{InMemoryStore, KvStore, Keys};
use jobservice_infra::lcm::LifecycleController;
use jobservice_infra::worker::{Dispatcher, NewJob};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn setup() -> (Arc<InMemoryStore>, Keys, Dispatcher) {
    let kv = Arc::new(InMemoryStore::new());
    let keys = Keys::new("bench");
    let clock = Arc::new(SystemClock);
    let lcm = Arc::new(LifecycleController::new(kv.clone(), keys.clone(), clock.clone(), None));
    let dispatcher = Dispatcher::new(kv.clone(), keys.clone(), clock, lcm);
    (kv, keys, dispatcher)
}

/// Launch then pop: the path every generic job takes before a worker runs it.
fn bench_enqueue_dequeue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue_dequeue");

    for batch_size in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("launch_then_blpop", batch_size),
            batch_size,
            |b, &size| {
                let (kv, keys, dispatcher) = setup();
                let queues = [keys.queue_priority(), keys.queue_default()];
                b.iter(|| {
                    rt.block_on(async {
                        for _ in 0..size {
                            dispatcher
                                .launch(NewJob::new("SAMPLE", Parameters::new()))
                                .await
                                .unwrap();
                        }
                        for _ in 0..size {
                            black_box(kv.blpop(&queues, Duration::from_millis(10)).await.unwrap());
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

/// Full status walk of one job through the revision CAS.
fn bench_status_transitions(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("status_transitions");
    group.sample_size(500);

    group.bench_function("pending_running_success", |b| {
        let (_kv, _keys, dispatcher) = setup();
        b.iter(|| {
            rt.block_on(async {
                let stats = dispatcher
                    .launch(NewJob::new("SAMPLE", Parameters::new()))
                    .await
                    .unwrap();
                let mut tracker = dispatcher.lcm().track(&stats.id).await.unwrap();
                tracker.run().await.unwrap();
                tracker.check_in("halfway").await.unwrap();
                tracker.succeed().await.unwrap();
                assert_eq!(tracker.status(), JobStatus::Success);
            })
        });
    });

    group.bench_function("unique_lock_conflict", |b| {
        let (_kv, _keys, dispatcher) = setup();
        rt.block_on(async {
            dispatcher
                .launch(NewJob::new("SAMPLE", Parameters::new()).unique(true))
                .await
                .unwrap();
        });
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    dispatcher
                        .launch(NewJob::new("SAMPLE", Parameters::new()).unique(true))
                        .await
                        .is_err(),
                )
            })
        });
    });

    group.finish();
}

fn bench_delayed_promotion_scan(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("delayed_set");

    for size in [100usize, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("range_due", size), size, |b, &size| {
            let (kv, keys, _) = setup();
            rt.block_on(async {
                for i in 0..size {
                    let id = JobId::generate();
                    kv.zadd(
                        &keys.scheduled(),
                        id.as_str(),
                        i as f64,
                        jobservice_infra::kv::ZAddMode::Always,
                    )
                    .await
                    .unwrap();
                }
            });
            b.iter(|| {
                rt.block_on(async {
                    black_box(
                        kv.zrange_by_score(&keys.scheduled(), f64::NEG_INFINITY, size as f64 / 2.0, 0, Some(100))
                            .await
                            .unwrap(),
                    )
                })
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_dequeue,
    bench_status_transitions,
    bench_delayed_promotion_scan
);
criterion_main!(benches);
