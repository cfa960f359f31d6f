//! End-to-end tests for pool dispatch, recycling, and shutdown.
//!
//! Plain binary (`harness = false`) for the same reason as `e2e_process`:
//! spawn-mode pool workers re-execute this executable and divert through
//! [`subpool::init`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use subpool::{
    register_initializer, register_task, ExecutionContext, Pool, PoolConfig, StartMethod,
    SubpoolError, TaskCall, TaskError,
};
use tokio::runtime::Runtime;

static INIT_VALUE: Mutex<Option<Value>> = Mutex::new(None);

macro_rules! check {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err(format!($($arg)+));
        }
    };
}

fn register() {
    register_task("add", |args| async move {
        let a = args.arg(0).and_then(Value::as_i64).unwrap_or(0);
        let b = args.arg(1).and_then(Value::as_i64).unwrap_or(0);
        Ok(json!(a + b))
    });
    register_task("echo", |args| async move {
        Ok(args.arg(0).cloned().unwrap_or(Value::Null))
    });
    register_task("pid_of", |_args| async move { Ok(json!(std::process::id())) });
    register_task("scramble_delay", |args| async move {
        let n = args.arg(0).and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis((n % 3) * 50)).await;
        Ok(json!(n * 10))
    });
    register_task("fail_value", |_args| async move {
        Err(TaskError::new("ValueError", "unusable input"))
    });
    register_task("die_hard", |_args| async move { std::process::exit(3) });
    register_task("fetch_value", |_args| async move {
        let stored = INIT_VALUE.lock().expect("init value lock").clone();
        stored.ok_or_else(|| TaskError::msg("initializer never ran"))
    });
    register_initializer("store_value", |args| {
        let value = args.arg(0).cloned().unwrap_or(Value::Null);
        *INIT_VALUE.lock().expect("init value lock") = Some(value);
        Ok(())
    });
}

fn main() {
    register();
    subpool::logging::init(subpool::logging::LogConfig::from_env());
    subpool::init();
    // Visible to fork-mode workers only; spawn-mode children re-register
    // everything above and stop there.
    register_task("late_task", |_args| async move { Ok(json!("late")) });

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let mut failed = 0u32;
    run(
        &rt,
        "pool_apply_returns_value",
        &mut failed,
        pool_apply_returns_value(),
    );
    run(
        &rt,
        "pool_map_preserves_input_order",
        &mut failed,
        pool_map_preserves_input_order(),
    );
    run(
        &rt,
        "pool_starmap_unpacks_args",
        &mut failed,
        pool_starmap_unpacks_args(),
    );
    run(
        &rt,
        "pool_concurrent_applies_correlate",
        &mut failed,
        pool_concurrent_applies_correlate(),
    );
    run(
        &rt,
        "pool_roundtrips_structured_values",
        &mut failed,
        pool_roundtrips_structured_values(),
    );
    run(
        &rt,
        "pool_task_failure_is_error_not_fatal",
        &mut failed,
        pool_task_failure_is_error_not_fatal(),
    );
    run(
        &rt,
        "pool_initializer_runs_in_every_worker",
        &mut failed,
        pool_initializer_runs_in_every_worker(),
    );
    run(
        &rt,
        "pool_quota_one_recycles_every_task",
        &mut failed,
        pool_quota_one_recycles_every_task(),
    );
    run(
        &rt,
        "pool_quota_two_pairs_tasks",
        &mut failed,
        pool_quota_two_pairs_tasks(),
    );
    run(
        &rt,
        "pool_crash_fails_only_inflight_task",
        &mut failed,
        pool_crash_fails_only_inflight_task(),
    );
    run(
        &rt,
        "pool_close_idempotent_and_final",
        &mut failed,
        pool_close_idempotent_and_final(),
    );
    run(
        &rt,
        "pool_rejects_unregistered_task",
        &mut failed,
        pool_rejects_unregistered_task(),
    );
    run(
        &rt,
        "pool_worker_pids_reports_slots",
        &mut failed,
        pool_worker_pids_reports_slots(),
    );
    run(&rt, "pool_fork_workers", &mut failed, pool_fork_workers());
    run(
        &rt,
        "pool_default_worker_count",
        &mut failed,
        pool_default_worker_count(),
    );
    run(
        &rt,
        "pool_drop_kills_workers",
        &mut failed,
        pool_drop_kills_workers(),
    );

    if failed > 0 {
        eprintln!("{failed} test(s) failed");
        std::process::exit(1);
    }
    println!("e2e_pool: all tests passed");
}

fn run<F>(rt: &Runtime, name: &str, failed: &mut u32, case: F)
where
    F: Future<Output = Result<(), String>>,
{
    // The timeout is built inside block_on; timer handles need a running
    // runtime at construction.
    match rt.block_on(async { tokio::time::timeout(Duration::from_secs(60), case).await }) {
        Ok(Ok(())) => println!("test {name} ... ok"),
        Ok(Err(msg)) => {
            println!("test {name} ... FAILED: {msg}");
            *failed += 1;
        }
        Err(_) => {
            println!("test {name} ... FAILED: timed out");
            *failed += 1;
        }
    }
}

async fn pool_apply_returns_value() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(2)).map_err(|e| format!("new: {e}"))?;
    let value = pool
        .apply(TaskCall::new("add").arg(json!(2)).arg(json!(3)))
        .await
        .map_err(|e| format!("apply: {e}"))?;
    check!(value == json!(5), "value {value}");
    let stats = pool.stats();
    check!(stats.process_count == 2, "process_count {}", stats.process_count);
    check!(stats.tasks_completed == 1, "tasks_completed {}", stats.tasks_completed);
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_map_preserves_input_order() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(3)).map_err(|e| format!("new: {e}"))?;
    let results = pool
        .map("scramble_delay", (0..12).map(|n| json!(n)))
        .await
        .map_err(|e| format!("map: {e}"))?;
    let expected: Vec<Value> = (0..12).map(|n| json!(n * 10)).collect();
    check!(results == expected, "results {results:?}");
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_starmap_unpacks_args() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(2)).map_err(|e| format!("new: {e}"))?;
    let inputs = vec![
        vec![json!(1), json!(2)],
        vec![json!(3), json!(4)],
        vec![json!(10), json!(32)],
    ];
    let results = pool
        .starmap("add", inputs)
        .await
        .map_err(|e| format!("starmap: {e}"))?;
    check!(
        results == vec![json!(3), json!(7), json!(42)],
        "results {results:?}"
    );
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_concurrent_applies_correlate() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(2)).map_err(|e| format!("new: {e}"))?;
    let applies = (0..8).map(|n| pool.apply(TaskCall::new("echo").arg(json!(n))));
    let settled = futures::future::join_all(applies).await;
    for (n, result) in settled.into_iter().enumerate() {
        let value = result.map_err(|e| format!("apply {n}: {e}"))?;
        check!(value == json!(n), "apply {n} returned {value}");
    }
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_roundtrips_structured_values() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(1)).map_err(|e| format!("new: {e}"))?;
    let payload = json!({
        "nested": {"list": [1, null, "msg", "юникод"], "flag": true},
        "empty": {},
    });
    let value = pool
        .apply(TaskCall::new("echo").arg(payload.clone()))
        .await
        .map_err(|e| format!("apply: {e}"))?;
    check!(value == payload, "value {value}");
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_task_failure_is_error_not_fatal() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(1)).map_err(|e| format!("new: {e}"))?;
    match pool.apply(TaskCall::new("fail_value")).await {
        Err(SubpoolError::Task(proxy)) => {
            check!(proxy.kind == "ValueError", "kind {}", proxy.kind);
            check!(
                proxy.message.contains("unusable input"),
                "message {}",
                proxy.message
            );
        }
        other => return Err(format!("expected task error, got {other:?}")),
    }
    // The worker survives a failed task; no replacement happens.
    let value = pool
        .apply(TaskCall::new("add").arg(json!(2)).arg(json!(2)))
        .await
        .map_err(|e| format!("follow-up apply: {e}"))?;
    check!(value == json!(4), "value {value}");
    let stats = pool.stats();
    check!(stats.workers_replaced == 0, "workers_replaced {}", stats.workers_replaced);
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_initializer_runs_in_every_worker() -> Result<(), String> {
    let pool = Pool::new(
        PoolConfig::new()
            .with_workers(2)
            .with_initializer(TaskCall::new("store_value").arg(json!(7))),
    )
    .map_err(|e| format!("new: {e}"))?;
    let results = pool
        .map("fetch_value", (0..4).map(|n| json!(n)))
        .await
        .map_err(|e| format!("map: {e}"))?;
    check!(
        results.iter().all(|v| *v == json!(7)),
        "results {results:?}"
    );
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_quota_one_recycles_every_task() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(2).with_quota(1))
        .map_err(|e| format!("new: {e}"))?;
    let results = pool
        .map("pid_of", (0..6).map(|n| json!(n)))
        .await
        .map_err(|e| format!("map: {e}"))?;
    let pids: HashSet<u64> = results.iter().filter_map(Value::as_u64).collect();
    check!(pids.len() == 6, "expected 6 distinct pids, got {results:?}");
    let stats = pool.stats();
    check!(stats.tasks_completed == 6, "tasks_completed {}", stats.tasks_completed);
    check!(
        stats.workers_replaced >= 4,
        "workers_replaced {}",
        stats.workers_replaced
    );
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_quota_two_pairs_tasks() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(1).with_quota(2))
        .map_err(|e| format!("new: {e}"))?;
    let results = pool
        .map("pid_of", (0..4).map(|n| json!(n)))
        .await
        .map_err(|e| format!("map: {e}"))?;
    check!(results[0] == results[1], "first pair split: {results:?}");
    check!(results[2] == results[3], "second pair split: {results:?}");
    check!(results[0] != results[2], "no recycle between pairs: {results:?}");
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_crash_fails_only_inflight_task() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(1)).map_err(|e| format!("new: {e}"))?;
    match pool.apply(TaskCall::new("die_hard")).await {
        Err(SubpoolError::WorkerLost(msg)) => {
            check!(msg.contains("exited with code 3"), "message {msg}");
        }
        other => return Err(format!("expected worker-lost, got {other:?}")),
    }
    // The slot was replaced; the pool keeps serving.
    let value = pool
        .apply(TaskCall::new("add").arg(json!(1)).arg(json!(1)))
        .await
        .map_err(|e| format!("follow-up apply: {e}"))?;
    check!(value == json!(2), "value {value}");
    let stats = pool.stats();
    check!(
        stats.workers_replaced >= 1,
        "workers_replaced {}",
        stats.workers_replaced
    );
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_close_idempotent_and_final() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(1)).map_err(|e| format!("new: {e}"))?;
    let value = pool
        .apply(TaskCall::new("add").arg(json!(1)).arg(json!(2)))
        .await
        .map_err(|e| format!("apply: {e}"))?;
    check!(value == json!(3), "value {value}");
    pool.close().await.map_err(|e| format!("close: {e}"))?;
    pool.close().await.map_err(|e| format!("second close: {e}"))?;
    match pool.apply(TaskCall::new("add").arg(json!(1)).arg(json!(1))).await {
        Err(SubpoolError::PoolClosed) => {}
        other => return Err(format!("expected pool-closed, got {other:?}")),
    }
    match pool.map("add", vec![json!(1)]).await {
        Err(SubpoolError::PoolClosed) => Ok(()),
        other => Err(format!("expected pool-closed map, got {other:?}")),
    }
}

async fn pool_rejects_unregistered_task() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(1)).map_err(|e| format!("new: {e}"))?;
    match pool.apply(TaskCall::new("missing")).await {
        Err(SubpoolError::InvalidArgument(msg)) => {
            check!(msg.contains("not a registered task"), "message {msg}");
        }
        other => return Err(format!("expected invalid-argument, got {other:?}")),
    }
    let value = pool
        .apply(TaskCall::new("add").arg(json!(3)).arg(json!(4)))
        .await
        .map_err(|e| format!("follow-up apply: {e}"))?;
    check!(value == json!(7), "value {value}");
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_worker_pids_reports_slots() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(3)).map_err(|e| format!("new: {e}"))?;
    check!(pool.process_count() == 3, "process_count {}", pool.process_count());
    let pids = pool.worker_pids().await;
    check!(pids.len() == 3, "pids {pids:?}");
    let distinct: HashSet<u32> = pids.iter().copied().collect();
    check!(distinct.len() == 3, "duplicate pids {pids:?}");
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_fork_workers() -> Result<(), String> {
    let pool = Pool::new(
        PoolConfig::new()
            .with_workers(2)
            .with_context(ExecutionContext::new(StartMethod::Fork)),
    )
    .map_err(|e| format!("new: {e}"))?;
    // Forked workers inherit registrations made after init.
    let value = pool
        .apply(TaskCall::new("late_task"))
        .await
        .map_err(|e| format!("apply late_task: {e}"))?;
    check!(value == json!("late"), "value {value}");
    let value = pool
        .apply(TaskCall::new("add").arg(json!(2)).arg(json!(3)))
        .await
        .map_err(|e| format!("apply add: {e}"))?;
    check!(value == json!(5), "value {value}");
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_default_worker_count() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new()).map_err(|e| format!("new: {e}"))?;
    check!(pool.process_count() >= 1, "process_count {}", pool.process_count());
    check!(
        pool.process_count() == num_cpus::get().max(1),
        "process_count {} vs cpus {}",
        pool.process_count(),
        num_cpus::get()
    );
    pool.close().await.map_err(|e| format!("close: {e}"))
}

async fn pool_drop_kills_workers() -> Result<(), String> {
    let pool = Pool::new(PoolConfig::new().with_workers(2)).map_err(|e| format!("new: {e}"))?;
    let pids = pool.worker_pids().await;
    check!(pids.len() == 2, "pids {pids:?}");
    drop(pool);
    let targets: Vec<nix::unistd::Pid> = pids
        .iter()
        .map(|pid| nix::unistd::Pid::from_raw(*pid as i32))
        .collect();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if targets
            .iter()
            .all(|pid| nix::sys::signal::kill(*pid, None).is_err())
        {
            return Ok(());
        }
    }
    Err("pool workers still running 5s after drop".to_string())
}
