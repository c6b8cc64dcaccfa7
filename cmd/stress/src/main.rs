//! procpool stress test
//!
//! Usage: stress [num_tasks] [max_procs]
//!
//! Phase 1 pushes a large `map` batch through the pool and reports
//! throughput. Phase 2 issues twice as many 100ms sleeps as there are
//! workers; with serial workers the wall clock should land near 200ms,
//! which makes saturation (or the lack of it) visible at a glance.

use std::time::Instant;

use procpool::pool::default_max_procs;
use procpool::{run_if_worker, tasks, Bincode, TaskPool};

fn main() -> procpool::Result<()> {
    let registry = tasks::registry();
    run_if_worker(&registry, &Bincode);

    tracing_subscriber::fmt().init();

    let num_tasks: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(1_000);
    let max_procs: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(default_max_procs);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    rt.block_on(run(num_tasks, max_procs))
}

async fn run(num_tasks: usize, max_procs: usize) -> procpool::Result<()> {
    println!("=== procpool stress test ===");
    println!("tasks: {num_tasks}, max_procs: {max_procs}\n");

    let pool = TaskPool::builder().max_procs(max_procs).max_reqs(10_000).build()?;

    // Phase 1: throughput over a map batch.
    let start = Instant::now();
    let results: Vec<i64> = pool.map("double", 0..num_tasks as i64).await?;
    let elapsed = start.elapsed();

    assert_eq!(results.len(), num_tasks);
    assert_eq!(results.last().copied(), Some((num_tasks as i64 - 1) * 2));

    println!("map: {num_tasks} tasks in {elapsed:?}");
    println!("     {:.0} tasks/sec", num_tasks as f64 / elapsed.as_secs_f64());
    println!("     workers live: {}", pool.num_procs());

    // Phase 2: saturation with blocking sleeps.
    let rounds = 2;
    let start = Instant::now();
    let mut handles: Vec<procpool::Deferred<u64>> = Vec::with_capacity(max_procs * rounds);
    for _ in 0..max_procs * rounds {
        handles.push(pool.defer("sleep-ms", &100u64).await?);
    }
    for handle in handles {
        handle.await?;
    }
    let elapsed = start.elapsed();

    println!("\nsleep: {} x 100ms over {} workers in {elapsed:?}", max_procs * rounds, pool.num_procs());
    println!("       ideal: {}ms", rounds * 100);

    pool.shutdown().await;
    println!("\npool shut down");
    Ok(())
}
