use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use forgeflow_core::{Job, JobKind, JobSet};
use forgeflow_events::InMemoryEventBus;
use forgeflow_executor::commands::AcquireJobsCmd;
use forgeflow_executor::{
    CommandContext, CommandExecutor, InMemoryJobStore, JobHandlerRegistry, JobManager, JobStore,
    NoRepeat,
};

fn command_executor(store: Arc<InMemoryJobStore>) -> CommandExecutor {
    let manager = Arc::new(JobManager::new(
        Arc::new(JobHandlerRegistry::new()),
        Arc::new(NoRepeat),
    ));
    let ctx = Arc::new(CommandContext::new(
        store,
        Arc::new(InMemoryEventBus::new()),
        manager,
    ));
    CommandExecutor::new(ctx)
}

fn store_with_due_jobs(count: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    for _ in 0..count {
        store
            .insert(
                JobSet::Executable,
                Job::new(JobKind::Async, "bench", serde_json::json!({})),
            )
            .unwrap();
    }
    store
}

fn bench_acquisition_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_jobs");
    for &size in &[64usize, 512] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let store = store_with_due_jobs(size);
                    command_executor(store)
                },
                |executor| {
                    let acquired = executor
                        .execute(AcquireJobsCmd {
                            max_jobs: size,
                            lock_owner: "bench-node".to_string(),
                            lock_duration: Duration::from_secs(3600),
                        })
                        .unwrap();
                    black_box(acquired)
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_due_query(c: &mut Criterion) {
    let store = store_with_due_jobs(4096);
    c.bench_function("find_due_executable_jobs_page", |b| {
        b.iter(|| {
            let page = store.find_due_executable_jobs(Utc::now(), 512).unwrap();
            black_box(page)
        })
    });
}

criterion_group!(benches, bench_acquisition_throughput, bench_due_query);
criterion_main!(benches);
