//! Worker pool orchestration.
//!
//! Architecture:
//!
//! ```text
//!   caller                Pool (driver process)            worker processes
//!   ------                ----------------------           ----------------
//!   apply/map ──┐
//!               ├─ submit ── dispatch lock ── slot 0 ── submit pipe ──▶ loop
//!               │              (round-robin,  slot 1 ── submit pipe ──▶ loop
//!   oneshot ◀───┘               quota-gated)  ...
//!      ▲                                       ▲
//!      │        pending table (id → waiter)    │ replacement on exit
//!      └──────── drain task per worker ◀── result pipe ◀── envelopes
//! ```
//!
//! Each slot of the fixed-size arena holds the submit end for one worker
//! incarnation. Dispatch picks a slot round-robin, skipping incarnations
//! that already received their full task quota, records the waiter, then
//! writes the task frame; a single lock orders the writes so every worker
//! sees its tasks in submission order. One drain task per incarnation reads
//! the result pipe until EOF, resolves waiters by id, reaps the child, and
//! installs a replacement in the same slot while the pool is open.

use crate::context::ExecutionContext;
use crate::error::{Result, SubpoolError};
use crate::ipc::{FrameReader, FrameWriter};
use crate::proc::{describe_exit, ChildProc};
use crate::protocol::{
    TaskCall, TaskId, TaskOutcome, WorkerBoot, WorkerEntry, WorkerRequest, WorkerResponse,
};
use crate::registry;
use crate::spawn;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pool construction parameters.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    workers: Option<usize>,
    initializer: Option<TaskCall>,
    quota: Option<u64>,
    context: Option<ExecutionContext>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker processes (default: one per host CPU).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Registered plain initializer every worker runs once before its first
    /// task.
    pub fn with_initializer(mut self, call: TaskCall) -> Self {
        self.initializer = Some(call);
        self
    }

    /// Tasks a worker completes before it is recycled (default: unbounded).
    pub fn with_quota(mut self, quota: u64) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Override the captured execution context.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Fixed worker-process count.
    pub process_count: usize,
    /// Task envelopes resolved over the pool's lifetime.
    pub tasks_completed: u64,
    /// Workers replaced after quota exits or crashes.
    pub workers_replaced: u64,
}

/// What a waiter receives for its task.
enum Delivery {
    Outcome(TaskOutcome),
    Lost(String),
    Closed,
}

struct PendingTask {
    tx: oneshot::Sender<Delivery>,
    slot: usize,
    incarnation: u64,
}

struct Slot {
    pid: u32,
    incarnation: u64,
    writer: FrameWriter,
    // Tasks dispatched to the current incarnation.
    dispatched: u64,
    // Current incarnation accepts tasks.
    alive: bool,
    // Permanently dead: replacement failed. Never picked again.
    retired: bool,
}

struct DispatchState {
    slots: Vec<Slot>,
    cursor: usize,
    closing: bool,
}

struct Shared {
    // Held across the pipe write so each worker sees submission order.
    dispatch: Mutex<DispatchState>,
    pending: StdMutex<HashMap<TaskId, PendingTask>>,
    drains: StdMutex<Vec<JoinHandle<()>>>,
    // Signaled when a replacement slot is installed (or retired) so gated
    // submitters re-check.
    slot_ready: Notify,
    next_id: AtomicU64,
    tasks_completed: AtomicU64,
    workers_replaced: AtomicU64,
    process_count: usize,
    initializer: Option<TaskCall>,
    quota: Option<u64>,
    context: ExecutionContext,
}

/// A fixed-size set of pool workers with task dispatch, result collection,
/// and worker replacement.
///
/// All operations take `&self`; wrap the pool in an `Arc` to share it.
/// [`Pool::close`] is the graceful shutdown path; dropping an open pool
/// kills its workers.
pub struct Pool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    /// Create a pool and start all of its workers.
    ///
    /// Fails without leaving children behind if any worker cannot be
    /// spawned. Requires a tokio runtime context.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.workers == Some(0) {
            return Err(SubpoolError::InvalidArgument(
                "pool requires at least one worker".to_string(),
            ));
        }
        if config.quota == Some(0) {
            return Err(SubpoolError::InvalidArgument(
                "task quota must be positive".to_string(),
            ));
        }
        if let Some(init) = &config.initializer {
            registry::validate_initializer(&init.name)?;
        }
        let process_count = config.workers.unwrap_or_else(num_cpus::get).max(1);
        let context = config.context.unwrap_or_else(ExecutionContext::current);

        // Spawn every worker before wiring anything up: on a partial
        // failure the collected children are daemons and die on drop.
        let mut workers = Vec::with_capacity(process_count);
        for index in 0..process_count {
            let boot = WorkerBoot {
                entry: WorkerEntry::Pool,
                initializer: config.initializer.clone(),
                quota: config.quota,
            };
            let label = format!("pool-{index}");
            workers.push(spawn::spawn_worker(
                boot,
                context.start_method,
                true,
                &label,
            )?);
        }

        let mut slots = Vec::with_capacity(process_count);
        let mut drain_input = Vec::with_capacity(process_count);
        for (index, worker) in workers.into_iter().enumerate() {
            slots.push(Slot {
                pid: worker.proc.pid(),
                incarnation: 1,
                writer: worker.writer,
                dispatched: 0,
                alive: true,
                retired: false,
            });
            drain_input.push((index, worker.proc, worker.reader));
        }

        let shared = Arc::new(Shared {
            dispatch: Mutex::new(DispatchState {
                slots,
                cursor: 0,
                closing: false,
            }),
            pending: StdMutex::new(HashMap::new()),
            drains: StdMutex::new(Vec::new()),
            slot_ready: Notify::new(),
            next_id: AtomicU64::new(1),
            tasks_completed: AtomicU64::new(0),
            workers_replaced: AtomicU64::new(0),
            process_count,
            initializer: config.initializer,
            quota: config.quota,
            context,
        });

        for (index, proc, reader) in drain_input {
            let handle = spawn_drain(shared.clone(), index, 1, proc, reader);
            shared
                .drains
                .lock()
                .expect("drain set lock poisoned")
                .push(handle);
        }

        info!(
            workers = process_count,
            method = %context.start_method,
            "pool started"
        );
        Ok(Self { shared })
    }

    /// Fixed worker-process count, constant for the pool's lifetime.
    pub fn process_count(&self) -> usize {
        self.shared.process_count
    }

    /// Current worker pids, in slot order.
    pub async fn worker_pids(&self) -> Vec<u32> {
        let dispatch = self.shared.dispatch.lock().await;
        dispatch.slots.iter().map(|slot| slot.pid).collect()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            process_count: self.shared.process_count,
            tasks_completed: self.shared.tasks_completed.load(Ordering::Relaxed),
            workers_replaced: self.shared.workers_replaced.load(Ordering::Relaxed),
        }
    }

    /// Submit one call and wait for its result.
    ///
    /// A failed task surfaces as [`SubpoolError::Task`] carrying the
    /// reconstructed [`crate::ProxyError`].
    pub async fn apply(&self, call: TaskCall) -> Result<Value> {
        let rx = self.submit(call).await?;
        settle(rx.await)
    }

    /// Run `task` once per input element (one positional argument each) and
    /// return the results in input order, regardless of completion order.
    ///
    /// The first failure in input order fails the whole call; there is no
    /// partial-result surface.
    pub async fn map<I>(&self, task: &str, inputs: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut receivers = Vec::new();
        for input in inputs {
            receivers.push(self.submit(TaskCall::new(task).arg(input)).await?);
        }
        collect_ordered(receivers).await
    }

    /// Like [`Pool::map`] but each input element is a vector unpacked as the
    /// task's positional arguments.
    pub async fn starmap<I>(&self, task: &str, inputs: I) -> Result<Vec<Value>>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let mut receivers = Vec::new();
        for input in inputs {
            receivers.push(self.submit(TaskCall::new(task).with_args(input)).await?);
        }
        collect_ordered(receivers).await
    }

    /// Graceful shutdown: broadcast the stop sentinel, join every worker,
    /// then fail anything still pending with pool-closed. Idempotent;
    /// submissions racing with close fail with pool-closed.
    pub async fn close(&self) -> Result<()> {
        {
            let mut dispatch = self.shared.dispatch.lock().await;
            if !dispatch.closing {
                dispatch.closing = true;
                let sentinel = WorkerRequest::Stop.to_line();
                for slot in dispatch.slots.iter_mut().filter(|s| s.alive) {
                    // A worker that already exited has closed its pipe;
                    // its drain task is finishing on its own.
                    if let Err(err) = slot.writer.write_line(&sentinel).await {
                        debug!(error = %err, "sentinel write skipped, worker already gone");
                    }
                }
            }
        }
        self.shared.slot_ready.notify_waiters();

        loop {
            let handle = self
                .shared
                .drains
                .lock()
                .expect("drain set lock poisoned")
                .pop();
            match handle {
                Some(handle) => {
                    if let Err(err) = handle.await {
                        warn!(error = %err, "drain task failed");
                    }
                }
                None => break,
            }
        }

        let leftover: Vec<PendingTask> = {
            let mut pending = self.shared.pending.lock().expect("pending table poisoned");
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in leftover {
            let _ = entry.tx.send(Delivery::Closed);
        }

        info!("pool closed");
        Ok(())
    }

    /// Pick a slot, record the waiter, write the task frame.
    async fn submit(&self, call: TaskCall) -> Result<oneshot::Receiver<Delivery>> {
        registry::validate_target(&call.name)?;
        let shared = &self.shared;
        loop {
            let mut dispatch = shared.dispatch.lock().await;
            if dispatch.closing {
                return Err(SubpoolError::PoolClosed);
            }
            if let Some(index) = pick_slot(&mut dispatch, shared.quota) {
                let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                let incarnation = dispatch.slots[index].incarnation;
                let (tx, rx) = oneshot::channel();
                shared
                    .pending
                    .lock()
                    .expect("pending table poisoned")
                    .insert(
                        id,
                        PendingTask {
                            tx,
                            slot: index,
                            incarnation,
                        },
                    );

                let request = WorkerRequest::Task {
                    id,
                    call: call.clone(),
                };
                let slot = &mut dispatch.slots[index];
                slot.dispatched += 1;
                match slot.writer.write_line(&request.to_line()).await {
                    Ok(()) => {
                        debug!(task = id, slot = index, "task dispatched");
                        return Ok(rx);
                    }
                    Err(err) => {
                        // The worker died under us; its drain task will
                        // replace the slot. Retry elsewhere.
                        warn!(slot = index, error = %err, "dispatch failed, retrying on another worker");
                        slot.alive = false;
                        shared
                            .pending
                            .lock()
                            .expect("pending table poisoned")
                            .remove(&id);
                        continue;
                    }
                }
            }
            if dispatch.slots.iter().all(|slot| slot.retired) {
                return Err(SubpoolError::WorkerLost(
                    "all pool workers were lost and could not be replaced".to_string(),
                ));
            }
            // Every usable slot is quota-gated or mid-replacement; wait for
            // the next slot change. Register while still holding the lock
            // so no notification can slip between unlock and await.
            let notified = shared.slot_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(dispatch);
            notified.await;
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Not the graceful path: stop replacements and cut the drain tasks
        // loose; each aborted drain drops its daemon child, which kills the
        // worker process.
        if let Ok(mut dispatch) = self.shared.dispatch.try_lock() {
            dispatch.closing = true;
        }
        let handles = self.shared.drains.lock().expect("drain set lock poisoned");
        for handle in handles.iter() {
            handle.abort();
        }
    }
}

/// Round-robin over usable slots, skipping quota-exhausted incarnations.
fn pick_slot(dispatch: &mut DispatchState, quota: Option<u64>) -> Option<usize> {
    let n = dispatch.slots.len();
    for step in 0..n {
        let index = (dispatch.cursor + step) % n;
        let slot = &dispatch.slots[index];
        if !slot.alive {
            continue;
        }
        if let Some(quota) = quota {
            if slot.dispatched >= quota {
                continue;
            }
        }
        dispatch.cursor = (index + 1) % n;
        return Some(index);
    }
    None
}

fn settle(received: std::result::Result<Delivery, oneshot::error::RecvError>) -> Result<Value> {
    match received {
        Ok(Delivery::Outcome(TaskOutcome::Value(value))) => Ok(value),
        Ok(Delivery::Outcome(TaskOutcome::Failed(envelope))) => {
            Err(SubpoolError::Task(envelope.into()))
        }
        Ok(Delivery::Lost(reason)) => Err(SubpoolError::WorkerLost(reason)),
        Ok(Delivery::Closed) => Err(SubpoolError::PoolClosed),
        // Sender dropped without a delivery: teardown won the race.
        Err(_) => Err(SubpoolError::PoolClosed),
    }
}

async fn collect_ordered(receivers: Vec<oneshot::Receiver<Delivery>>) -> Result<Vec<Value>> {
    let settled = join_all(receivers).await;
    let mut results = Vec::with_capacity(settled.len());
    for received in settled {
        results.push(settle(received)?);
    }
    Ok(results)
}

/// Spawn a drain task. Plain fn so the drain can spawn its successor
/// without its future type referencing itself.
fn spawn_drain(
    shared: Arc<Shared>,
    index: usize,
    incarnation: u64,
    proc: ChildProc,
    reader: FrameReader,
) -> JoinHandle<()> {
    tokio::spawn(drain_loop(shared, index, incarnation, proc, reader))
}

/// Read one worker's result pipe until EOF, then reap, fail stranded
/// waiters, and replace the slot if the pool is still open.
async fn drain_loop(
    shared: Arc<Shared>,
    index: usize,
    incarnation: u64,
    mut proc: ChildProc,
    mut reader: FrameReader,
) {
    loop {
        match reader.read_line().await {
            Ok(Some(line)) => match WorkerResponse::from_line(&line) {
                Ok(response) => {
                    let id = response.id();
                    let entry = shared
                        .pending
                        .lock()
                        .expect("pending table poisoned")
                        .remove(&id);
                    match entry {
                        Some(waiter) => {
                            shared.tasks_completed.fetch_add(1, Ordering::Relaxed);
                            let _ = waiter.tx.send(Delivery::Outcome(response.into_outcome()));
                        }
                        None => warn!(slot = index, task = id, "response for unknown task id"),
                    }
                }
                Err(err) => warn!(slot = index, error = %err, "malformed worker response"),
            },
            Ok(None) => break,
            Err(err) => {
                warn!(slot = index, error = %err, "result channel read failed");
                break;
            }
        }
    }

    // EOF is the only "worker gone" signal. A quota or sentinel exit has
    // flushed every response before it, so anything still pending for this
    // incarnation was lost to a crash.
    let pid = proc.pid();
    let how = match proc.wait().await {
        Ok(code) => describe_exit(code),
        Err(err) => {
            warn!(slot = index, pid, error = %err, "failed to reap worker");
            "could not be reaped".to_string()
        }
    };
    debug!(slot = index, pid, "worker {how}");
    drop(proc);

    let stranded = fail_pending(&shared, index, incarnation, &how);
    if stranded > 0 {
        warn!(slot = index, pid, stranded, "worker died with tasks in flight");
    }

    let mut dispatch = shared.dispatch.lock().await;
    dispatch.slots[index].alive = false;
    if dispatch.closing {
        return;
    }

    let next_incarnation = incarnation + 1;
    let boot = WorkerBoot {
        entry: WorkerEntry::Pool,
        initializer: shared.initializer.clone(),
        quota: shared.quota,
    };
    let label = format!("pool-{index}");
    match spawn::spawn_worker(boot, shared.context.start_method, true, &label) {
        Ok(worker) => {
            let slot = &mut dispatch.slots[index];
            slot.pid = worker.proc.pid();
            slot.incarnation = next_incarnation;
            slot.writer = worker.writer;
            slot.dispatched = 0;
            slot.alive = true;
            shared.workers_replaced.fetch_add(1, Ordering::Relaxed);
            info!(slot = index, pid = slot.pid, "worker replaced");

            let handle = spawn_drain(
                shared.clone(),
                index,
                next_incarnation,
                worker.proc,
                worker.reader,
            );
            let mut drains = shared.drains.lock().expect("drain set lock poisoned");
            prune_finished(&mut drains);
            drains.push(handle);
            drop(drains);
            drop(dispatch);
            shared.slot_ready.notify_waiters();
        }
        Err(err) => {
            error!(slot = index, error = %err, "failed to replace worker");
            dispatch.slots[index].retired = true;
            drop(dispatch);
            // Wake gated submitters so they can observe the retirement.
            shared.slot_ready.notify_waiters();
        }
    }
}

/// Drop handles of drain tasks that already ran to completion. Called at
/// each replacement so the set tracks live drains instead of gaining one
/// finished handle per recycled worker.
fn prune_finished(drains: &mut Vec<JoinHandle<()>>) {
    drains.retain(|drain| !drain.is_finished());
}

/// Fail every pending waiter still tagged with this slot incarnation.
fn fail_pending(shared: &Shared, index: usize, incarnation: u64, how: &str) -> usize {
    let mut pending = shared.pending.lock().expect("pending table poisoned");
    let stranded: Vec<TaskId> = pending
        .iter()
        .filter(|(_, entry)| entry.slot == index && entry.incarnation == incarnation)
        .map(|(id, _)| *id)
        .collect();
    let count = stranded.len();
    for id in stranded {
        if let Some(entry) = pending.remove(&id) {
            let _ = entry
                .tx
                .send(Delivery::Lost(format!("worker {how} before responding")));
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::unix::pipe;

    // Pools that spawn real workers are exercised by the e2e binaries; the
    // unit tests cover construction validation and the dispatch policy.

    #[test]
    fn test_config_builders() {
        let config = PoolConfig::new()
            .with_workers(4)
            .with_initializer(TaskCall::new("setup"))
            .with_quota(10);
        assert_eq!(config.workers, Some(4));
        assert_eq!(config.quota, Some(10));
        assert_eq!(config.initializer.as_ref().unwrap().name, "setup");
        assert!(config.context.is_none());

        let default = PoolConfig::default();
        assert!(default.workers.is_none());
        assert!(default.quota.is_none());
    }

    #[tokio::test]
    async fn test_new_rejects_bad_parameters() {
        let err = Pool::new(PoolConfig::new().with_workers(0)).unwrap_err();
        assert!(matches!(err, SubpoolError::InvalidArgument(_)));
        assert!(err.to_string().contains("at least one worker"));

        let err = Pool::new(PoolConfig::new().with_workers(1).with_quota(0)).unwrap_err();
        assert!(err.to_string().contains("quota must be positive"));

        let err = Pool::new(
            PoolConfig::new()
                .with_workers(1)
                .with_initializer(TaskCall::new("pool_test_no_such_init")),
        )
        .unwrap_err();
        assert!(matches!(err, SubpoolError::InvalidArgument(_)));
    }

    fn test_slot(writer: FrameWriter) -> Slot {
        Slot {
            pid: 0,
            incarnation: 1,
            writer,
            dispatched: 0,
            alive: true,
            retired: false,
        }
    }

    fn pipe_writer() -> FrameWriter {
        let (_read_fd, write_fd) = nix::unistd::pipe().unwrap();
        // The read end leaks for the test's duration; nothing reads these
        // pipes.
        std::mem::forget(_read_fd);
        FrameWriter::pipe(pipe::Sender::from_owned_fd(write_fd).unwrap())
    }

    #[tokio::test]
    async fn test_pick_slot_round_robin() {
        let mut dispatch = DispatchState {
            slots: vec![
                test_slot(pipe_writer()),
                test_slot(pipe_writer()),
                test_slot(pipe_writer()),
            ],
            cursor: 0,
            closing: false,
        };

        assert_eq!(pick_slot(&mut dispatch, None), Some(0));
        assert_eq!(pick_slot(&mut dispatch, None), Some(1));
        assert_eq!(pick_slot(&mut dispatch, None), Some(2));
        assert_eq!(pick_slot(&mut dispatch, None), Some(0));
    }

    #[tokio::test]
    async fn test_pick_slot_skips_gated_and_dead() {
        let mut dispatch = DispatchState {
            slots: vec![
                test_slot(pipe_writer()),
                test_slot(pipe_writer()),
                test_slot(pipe_writer()),
            ],
            cursor: 0,
            closing: false,
        };
        dispatch.slots[0].dispatched = 2;
        dispatch.slots[1].alive = false;

        // Quota 2: slot 0 is exhausted, slot 1 is mid-replacement.
        assert_eq!(pick_slot(&mut dispatch, Some(2)), Some(2));
        dispatch.slots[2].dispatched = 2;
        assert_eq!(pick_slot(&mut dispatch, Some(2)), None);

        // Replacement installed in slot 1: picks resume there.
        dispatch.slots[1].alive = true;
        dispatch.slots[1].dispatched = 0;
        assert_eq!(pick_slot(&mut dispatch, Some(2)), Some(1));
    }

    #[tokio::test]
    async fn test_pick_slot_unbounded_ignores_dispatch_counts() {
        let mut dispatch = DispatchState {
            slots: vec![test_slot(pipe_writer())],
            cursor: 0,
            closing: false,
        };
        dispatch.slots[0].dispatched = 1_000;
        assert_eq!(pick_slot(&mut dispatch, None), Some(0));
    }

    #[tokio::test]
    async fn test_prune_finished_keeps_live_drains() {
        let finished = tokio::spawn(async {});
        let (tx, rx) = oneshot::channel::<()>();
        let live = tokio::spawn(async {
            let _ = rx.await;
        });
        while !finished.is_finished() {
            tokio::task::yield_now().await;
        }

        let mut drains = vec![finished, live];
        prune_finished(&mut drains);
        assert_eq!(drains.len(), 1);
        assert!(!drains[0].is_finished());

        drop(tx);
        drains.pop().unwrap().await.unwrap();
    }

    #[test]
    fn test_settle_variants() {
        let value = settle(Ok(Delivery::Outcome(TaskOutcome::Value(
            serde_json::json!(5),
        ))))
        .unwrap();
        assert_eq!(value, serde_json::json!(5));

        let envelope = crate::protocol::ErrorEnvelope::not_registered("ghost");
        let err = settle(Ok(Delivery::Outcome(TaskOutcome::Failed(envelope)))).unwrap_err();
        match err {
            SubpoolError::Task(proxy) => {
                assert_eq!(proxy.kind, crate::protocol::ErrorEnvelope::NOT_REGISTERED)
            }
            other => panic!("Expected Task error, got {other}"),
        }

        assert!(matches!(
            settle(Ok(Delivery::Lost("gone".to_string()))).unwrap_err(),
            SubpoolError::WorkerLost(_)
        ));
        assert!(matches!(
            settle(Ok(Delivery::Closed)).unwrap_err(),
            SubpoolError::PoolClosed
        ));
    }
}
