//! Scheduling-core benchmarks.
//!
//! Measures the hot paths of the sequencing core:
//!
//! - Immediate posting from the owning thread (lock + atomic order
//!   allocation + staging push)
//! - Post-and-drain batches (staging -> work queue -> selection -> run)
//! - Delayed posting onto the incoming heap
//! - Virtual-time advancement over many armed deadlines
//! - Cross-queue selection pressure with several priority bands populated
//!
//! Run with `cargo bench --bench scheduling`.

#![allow(missing_docs)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sequent::{
    Location, QueuePriority, RecordingController, SequenceManager, TaskQueueSpec, TaskType,
    TestTickClock,
};
use std::sync::Arc;
use std::time::Duration;

fn bench_manager() -> (SequenceManager, Arc<TestTickClock>) {
    let clock = Arc::new(TestTickClock::new());
    let manager = SequenceManager::builder()
        .clock(clock.clone())
        .controller(Arc::new(RecordingController::new()))
        .build();
    (manager, clock)
}

fn bench_post_immediate(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduling/post_immediate");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        let (manager, _clock) = bench_manager();
        let queue = manager.create_task_queue(TaskQueueSpec::new("bench"));
        let runner = queue.create_task_runner(TaskType::DEFAULT);
        b.iter(|| {
            std::hint::black_box(runner.post_task(Location::caller(), || {}));
        });
        manager.run_until_idle();
    });

    group.finish();
}

fn bench_post_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduling/post_and_drain");

    for batch in [100_u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let (manager, _clock) = bench_manager();
            let queue = manager.create_task_queue(TaskQueueSpec::new("bench"));
            let runner = queue.create_task_runner(TaskType::DEFAULT);
            b.iter(|| {
                for _ in 0..batch {
                    runner.post_task(Location::caller(), || {});
                }
                manager.run_until_idle();
            });
        });
    }

    group.finish();
}

fn bench_post_delayed(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduling/post_delayed");
    group.throughput(Throughput::Elements(1));

    group.bench_function("onto_heap", |b| {
        let (manager, clock) = bench_manager();
        let queue = manager.create_task_queue(TaskQueueSpec::new("bench"));
        let runner = queue.create_task_runner(TaskType::DEFAULT);
        let mut delay_ms = 0_u64;
        b.iter(|| {
            delay_ms = delay_ms % 1_000 + 1;
            std::hint::black_box(runner.post_delayed_task(
                Location::caller(),
                || {},
                Duration::from_millis(delay_ms),
            ));
        });
        clock.advance(Duration::from_secs(2));
        manager.run_until_idle();
    });

    group.finish();
}

fn bench_advance_over_deadlines(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduling/advance");

    for armed in [100_u64, 1_000] {
        group.throughput(Throughput::Elements(armed));
        group.bench_with_input(BenchmarkId::from_parameter(armed), &armed, |b, &armed| {
            b.iter_batched(
                || {
                    let (manager, clock) = bench_manager();
                    let queue = manager.create_task_queue(TaskQueueSpec::new("bench"));
                    let runner = queue.create_task_runner(TaskType::DEFAULT);
                    for i in 0..armed {
                        runner.post_delayed_task(
                            Location::caller(),
                            || {},
                            Duration::from_millis(i + 1),
                        );
                    }
                    (manager, clock)
                },
                |(manager, clock)| {
                    clock.advance(Duration::from_secs(10));
                    manager.run_until_idle();
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_multi_queue_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduling/selection");

    group.bench_function("seven_bands", |b| {
        let (manager, _clock) = bench_manager();
        let runners: Vec<_> = QueuePriority::ALL
            .iter()
            .map(|&priority| {
                let queue = manager.create_task_queue(TaskQueueSpec::new(priority.as_str()));
                queue.set_queue_priority(priority);
                queue.create_task_runner(TaskType::DEFAULT)
            })
            .collect();
        b.iter(|| {
            for runner in &runners {
                for _ in 0..20 {
                    runner.post_task(Location::caller(), || {});
                }
            }
            manager.run_until_idle();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_post_immediate,
    bench_post_and_drain,
    bench_post_delayed,
    bench_advance_over_deadlines,
    bench_multi_queue_selection,
);
criterion_main!(benches);
