use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;

use stepwise_cache::data::{FilesystemLoader, MemoryPageStore};
use stepwise_cache::{ComputationCache, Config};
use stepwise_test::ToyEngine;

use crate::workloads::{ParsedPayload, WorkloadsConfig, prepare_payload, process_payload};

fn start_cache(config: &Config, data: Option<PathBuf>) -> Result<ComputationCache<ToyEngine>> {
    let engine = ToyEngine::new();
    let cache = match data {
        Some(root) => ComputationCache::with_data(
            engine,
            config,
            Arc::new(MemoryPageStore::new(config.page_store_capacity)),
            Arc::new(FilesystemLoader::new(root)),
        ),
        None => ComputationCache::new(engine, config),
    };
    cache.context("failed to start computation cache")
}

/// Runs one operation, recording its duration. Returns whether it succeeded.
fn run_once(cache: &ComputationCache<ToyEngine>, workload: &ParsedPayload, durations: &Mutex<DDSketch>) -> bool {
    let task_start = Instant::now();

    let hub = Arc::new(sentry::Hub::new_from_top(sentry::Hub::current()));
    let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
    let transaction = hub.start_transaction(ctx);

    let result = sentry::Hub::run(hub, || process_payload(cache, workload));
    transaction.finish();

    let elapsed = task_start.elapsed().as_secs_f64();
    durations
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
        .add(elapsed);

    match result {
        Ok(_) => true,
        Err(err) => {
            tracing::error!(error = %err, key = ?workload.key, "operation failed");
            false
        }
    }
}

pub fn perform_stresstest(
    config: Config,
    data: Option<PathBuf>,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = start_cache(&config, data)?;

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .iter()
        .map(|workload| (workload.concurrency.max(1), prepare_payload(workload)))
        .collect();

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();
        let durations = Mutex::new(DDSketch::default());

        thread::scope(|s| {
            for (_, workload) in &workloads {
                let (cache, durations) = (&cache, &durations);
                s.spawn(move || run_once(cache, workload, durations));
            }
        });

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let deadline = Instant::now() + duration;
    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = workloads
            .iter()
            .map(|(concurrency, workload)| {
                let task_durations = Arc::new(Mutex::new(DDSketch::default()));
                let failures = Arc::new(AtomicUsize::new(0));

                for _ in 0..*concurrency {
                    let cache = &cache;
                    let task_durations = Arc::clone(&task_durations);
                    let failures = Arc::clone(&failures);
                    s.spawn(move || {
                        while Instant::now() < deadline {
                            if !run_once(cache, workload, &task_durations) {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    });
                }

                (*concurrency, task_durations, failures)
            })
            .collect();
        handles
    });

    for (i, (concurrency, task_durations, failures)) in results.into_iter().enumerate() {
        let task_durations = task_durations
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        let failures = failures.load(Ordering::Relaxed);
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed"
        );

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let stats = cache.stats();
    println!();
    println!(
        "Cache: {} computations, {} steps, {} splits, {} cycles broken, {} data loads",
        stats.computations, stats.steps, stats.splits, stats.cycles_broken, stats.data_loads
    );

    cache.teardown();
    Ok(())
}
