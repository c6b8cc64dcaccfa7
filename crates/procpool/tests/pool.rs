//! End-to-end tests driving real worker processes through the pool.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use futures::future;
use procpool::{Deferred, Error, TaskPool, TaskPoolBuilder, TaskTarget, WorkerCommand};

fn builder() -> TaskPoolBuilder {
    TaskPool::builder().worker_command(WorkerCommand::new(env!("CARGO_BIN_EXE_procpool-worker")))
}

#[tokio::test]
async fn test_process_round_trip() {
    let pool = builder().max_procs(2).build().unwrap();

    let doubled: i64 = pool.process("double", &21i64, None).await.unwrap();
    assert_eq!(doubled, 42);

    // One submission spawns exactly one worker, lazily.
    assert_eq!(pool.num_procs(), 1);
    assert!(pool.capacity() <= 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_process_echo_identity() {
    let pool = builder().max_procs(1).build().unwrap();

    let out: String = pool.process("echo", "round and round", None).await.unwrap();
    assert_eq!(out, "round and round");

    pool.shutdown().await;
}

#[tokio::test]
async fn test_task_error_propagates() {
    let pool = builder().max_procs(1).build().unwrap();

    let res: Result<(), Error> = pool.process("fail", "boom", None).await;
    match res.unwrap_err() {
        Error::Task(task) => {
            assert_eq!(task.message, "boom");
            assert!(task.trace.is_some());
        }
        other => panic!("expected task error, got {other:?}"),
    }

    // The worker survives a failed task.
    let doubled: i64 = pool.process("double", &4i64, None).await.unwrap();
    assert_eq!(doubled, 8);
    assert_eq!(pool.num_procs(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_unknown_task() {
    let pool = builder().max_procs(1).build().unwrap();

    let res: Result<(), Error> = pool.process("no-such-task", &(), None).await;
    match res.unwrap_err() {
        Error::Task(task) => assert!(task.message.contains("unknown task")),
        other => panic!("expected task error, got {other:?}"),
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_empty_target_is_rejected_without_side_effects() {
    let pool = builder().max_procs(1).build().unwrap();

    let res: Result<(), Error> = pool.process("", &(), None).await;
    assert!(matches!(res.unwrap_err(), Error::InvalidArg(_)));
    assert_eq!(pool.num_procs(), 0);
}

#[tokio::test]
async fn test_callable_target_rejected_by_default_worker() {
    let pool = builder().max_procs(1).build().unwrap();

    let res: Result<(), Error> = pool
        .process(TaskTarget::Callable(vec![1, 2, 3]), &(), None)
        .await;
    match res.unwrap_err() {
        Error::Task(task) => assert!(task.message.contains("callable targets")),
        other => panic!("expected task error, got {other:?}"),
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_map_preserves_input_order() {
    let pool = builder().max_procs(4).build().unwrap();

    let doubled: Vec<i64> = pool.map("double", 1i64..=100).await.unwrap();
    let expected: Vec<i64> = (1i64..=100).map(|n| n * 2).collect();
    assert_eq!(doubled, expected);
    assert!(pool.num_procs() <= 4);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_map_empty_input() {
    let pool = builder().max_procs(2).build().unwrap();

    let out: Vec<i64> = pool.map("double", Vec::<i64>::new()).await.unwrap();
    assert!(out.is_empty());
    assert_eq!(pool.num_procs(), 0);
}

#[tokio::test]
async fn test_remote_task_constructor_and_run() {
    let pool = builder().max_procs(1).build().unwrap();

    let sum: i64 = pool.process("adder", &(40i64, 2i64), None).await.unwrap();
    assert_eq!(sum, 42);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_env_reaches_workers() {
    let pool = builder()
        .max_procs(1)
        .env("PROCPOOL_TEST_MARKER", "present")
        .build()
        .unwrap();

    let value: Option<String> = pool
        .process("env", "PROCPOOL_TEST_MARKER", None)
        .await
        .unwrap();
    assert_eq!(value.as_deref(), Some("present"));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_recycling_after_max_reqs() {
    let pool = builder().max_procs(1).max_reqs(3).build().unwrap();

    let mut pids = HashSet::new();
    for _ in 0..10 {
        let pid: u32 = pool.process("pid", &(), None).await.unwrap();
        pids.insert(pid);
        assert!(pool.num_procs() <= 1);
    }

    // 10 requests at 3 per worker: ceil(10 / 3) = 4 distinct processes.
    assert_eq!(pids.len(), 4);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_checkout_timeout_expires_without_losing_capacity() {
    let pool = builder().max_procs(1).build().unwrap();

    let held = pool.pool().checkout(None).await.unwrap();
    assert_eq!(pool.num_procs(), 1);

    let start = Instant::now();
    let err = pool.pool().checkout(Some(Duration::from_millis(200))).await.unwrap_err();
    assert!(matches!(err, Error::CheckoutTimeout(_)), "got {err:?}");
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(pool.num_procs(), 1);

    // The held worker is unaffected and still serves requests.
    pool.pool().checkin(held).await;
    let doubled: i64 = pool.process("double", &3i64, None).await.unwrap();
    assert_eq!(doubled, 6);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_checkout_wins_when_worker_arrives_in_time() {
    let pool = builder().max_procs(1).build().unwrap();

    let held = pool.pool().checkout(None).await.unwrap();

    let returner = pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        returner.pool().checkin(held).await;
    });

    let worker = pool.pool().checkout(Some(Duration::from_millis(500))).await.unwrap();
    assert_eq!(pool.num_procs(), 1);

    pool.pool().checkin(worker).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_deferred_tasks_fill_the_pool() {
    let pool = builder().max_procs(2).build().unwrap();

    let start = Instant::now();
    let handles: Vec<Deferred<u64>> =
        future::try_join_all((0..4).map(|_| pool.defer("sleep-ms", &250u64)))
            .await
            .unwrap();

    for handle in handles {
        assert_eq!(handle.await.unwrap(), 250);
    }

    // Four 250ms sleeps over two serial workers: two rounds.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(480), "finished too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2000), "took too long: {elapsed:?}");
    assert_eq!(pool.num_procs(), 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_queue_invokes_success_callback() {
    let pool = builder().max_procs(1).build().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<i64>();
    pool.queue(
        "double",
        &5i64,
        Some(Box::new(move |value: i64| {
            let _ = tx.send(value);
        })),
        None,
    )
    .await
    .unwrap();

    let value = tokio::time::timeout(Duration::from_secs(10), rx).await.unwrap().unwrap();
    assert_eq!(value, 10);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_queue_invokes_error_callback_only() {
    let pool = builder().max_procs(1).build().unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<Error>();
    pool.queue(
        "fail",
        "remote failure",
        Some(Box::new(|_: ()| panic!("success callback must not fire"))),
        Some(Box::new(move |err| {
            let _ = tx.send(err);
        })),
    )
    .await
    .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(10), rx).await.unwrap().unwrap();
    match err {
        Error::Task(task) => assert_eq!(task.message, "remote failure"),
        other => panic!("expected task error, got {other:?}"),
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn test_defer_then_shutdown_does_not_hang() {
    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        let pool = builder().max_procs(1).build().unwrap();
        let deferred: Deferred<i64> = pool.defer("double", &3i64).await.unwrap();
        pool.shutdown().await;
        deferred.await
    })
    .await
    .expect("shutdown must not hang");

    match outcome {
        Ok(value) => assert_eq!(value, 6),
        Err(Error::WorkerDead(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_resets_and_pool_is_reusable() {
    let pool = builder().max_procs(2).build().unwrap();

    let doubled: i64 = pool.process("double", &1i64, None).await.unwrap();
    assert_eq!(doubled, 2);

    pool.shutdown().await;
    assert_eq!(pool.num_procs(), 0);
    assert_eq!(pool.capacity(), 0);

    // First submission after shutdown behaves like a fresh pool.
    let doubled: i64 = pool.process("double", &2i64, None).await.unwrap();
    assert_eq!(doubled, 4);
    assert_eq!(pool.num_procs(), 1);

    pool.shutdown().await;
    assert_eq!(pool.num_procs(), 0);
}

#[tokio::test]
async fn test_checkout_during_shutdown_fails_fast() {
    let pool = builder().max_procs(1).build().unwrap();

    let held = pool.pool().checkout(None).await.unwrap();

    let stopper = pool.clone();
    let shutdown = tokio::spawn(async move { stopper.shutdown().await });

    // Let the shutdown task reach its drain loop.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = pool.pool().checkout(None).await.unwrap_err();
    assert!(matches!(err, Error::PoolStopped), "got {err:?}");

    pool.pool().checkin(held).await;
    shutdown.await.unwrap();
    assert_eq!(pool.num_procs(), 0);
}

#[tokio::test]
async fn test_worker_crash_surfaces_and_pool_recovers() {
    let pool = builder().max_procs(1).build().unwrap();

    let res: Result<(), Error> = pool.process("exit", &0i32, None).await;
    let err = res.unwrap_err();
    assert!(matches!(err, Error::WorkerDead(_)), "got {err:?}");

    // The crashed worker is retired; the next submission gets a fresh one.
    let doubled: i64 = pool.process("double", &7i64, None).await.unwrap();
    assert_eq!(doubled, 14);
    assert_eq!(pool.num_procs(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_collect_twice_reports_unknown_msgid() {
    let pool = builder().max_procs(1).build().unwrap();

    let id = pool
        .start_task("double".into(), procpool::codec::to_payload(&1i64).unwrap(), None)
        .await
        .unwrap();
    let bytes = pool.collect_task(id).await.unwrap();
    assert_eq!(procpool::codec::from_payload::<i64>(&bytes).unwrap(), 2);

    let err = pool.collect_task(id).await.unwrap_err();
    assert!(matches!(err, Error::UnknownMsgId(_)), "got {err:?}");

    pool.shutdown().await;
}

#[tokio::test]
async fn test_counters_consistent_under_load() {
    let pool = builder().max_procs(3).build().unwrap();

    let doubled: Vec<i64> = pool.map("double", 1i64..=50).await.unwrap();
    assert_eq!(doubled.len(), 50);
    assert!(pool.num_procs() <= 3);
    assert!(pool.capacity() <= pool.num_procs());

    pool.shutdown().await;
    assert_eq!(pool.num_procs(), 0);
    assert_eq!(pool.capacity(), 0);
}
