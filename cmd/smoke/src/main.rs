//! procpool smoke test
//!
//! Drives every submission surface once. The binary doubles as its own
//! worker: spawned with the worker marker it serves the reference tasks
//! instead of running the demo.

use procpool::{run_if_worker, tasks, Bincode, TaskPool};

fn main() -> procpool::Result<()> {
    // Worker mode first, before any runtime exists.
    let registry = tasks::registry();
    run_if_worker(&registry, &Bincode);

    tracing_subscriber::fmt().init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    rt.block_on(run())
}

async fn run() -> procpool::Result<()> {
    println!("=== procpool smoke test ===\n");

    let pool = TaskPool::builder().max_procs(2).max_reqs(100).build()?;

    let doubled: i64 = pool.process("double", &21i64, None).await?;
    println!("process double(21)   -> {doubled}");

    let sum: i64 = pool.process("adder", &(40i64, 2i64), None).await?;
    println!("process adder(40, 2) -> {sum}");

    let batch: Vec<i64> = pool.map("double", 1i64..=10).await?;
    println!("map double(1..=10)   -> {batch:?}");

    let deferred: procpool::Deferred<i64> = pool.defer("double", &8i64).await?;
    println!("defer double(8)      -> {}", deferred.await?);

    let (tx, rx) = tokio::sync::oneshot::channel();
    pool.queue(
        "double",
        &16i64,
        Some(Box::new(move |value: i64| {
            let _ = tx.send(value);
        })),
        None,
    )
    .await?;
    println!("queue double(16)     -> {}", rx.await.expect("queue callback"));

    println!("\nworkers live: {}, idle: {}", pool.num_procs(), pool.capacity());

    pool.shutdown().await;
    println!("pool shut down");
    Ok(())
}
