//! Benchmarks for batch execution and diff computation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meridian::actions::{create_index_task, AllocationService, CreateIndexRequest};
use meridian::master::{ClusterStateTaskExecutor, Task, TaskContext};
use meridian::state::{ClusterState, ClusterStateDiff, DiscoveryNode};
use meridian::types::ManualClock;
use std::sync::Arc;

fn base_state(nodes: usize) -> ClusterState {
    let mut state = ClusterState::bootstrap("bench", DiscoveryNode::new("node-0", "127.0.0.1:9300"));
    for i in 1..nodes {
        let id = format!("node-{}", i);
        state
            .nodes
            .insert(id.clone(), DiscoveryNode::new(id, format!("127.0.0.1:{}", 9300 + i)));
    }
    state
}

fn create_tasks(count: usize) -> Vec<Task> {
    (0..count)
        .map(|i| create_index_task(CreateIndexRequest::new(format!("index-{}", i), 2, 1)))
        .collect()
}

fn executor() -> ClusterStateTaskExecutor {
    ClusterStateTaskExecutor::new(
        TaskContext::new("node-0", Arc::new(ManualClock::new(0))),
        Arc::new(AllocationService),
    )
}

fn bench_execute_batch(c: &mut Criterion) {
    let executor = executor();
    let base = base_state(5);
    let mut group = c.benchmark_group("execute_batch");

    for size in [1, 16, 128].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_batched(
                || create_tasks(size),
                |tasks| executor.execute_batch(black_box(&base), black_box(&tasks)),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_diff(c: &mut Criterion) {
    let executor = executor();
    let mut group = c.benchmark_group("state_diff");

    for indices in [16, 256].iter() {
        let base = executor.execute_batch(&base_state(5), &create_tasks(*indices)).state;
        let extra = vec![create_index_task(CreateIndexRequest::new("extra", 1, 1))];
        let next = executor.execute_batch(&base, &extra).state;

        group.bench_with_input(BenchmarkId::from_parameter(indices), indices, |b, _| {
            b.iter(|| ClusterStateDiff::between(black_box(&base), black_box(&next)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_execute_batch, bench_diff);
criterion_main!(benches);
