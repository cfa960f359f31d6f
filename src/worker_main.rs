//! Worker process entry points.
//!
//! Everything here runs inside a worker child. The loop blocks: one task
//! is pulled, driven to completion on a private current-thread runtime,
//! answered, and only then is the next task read.
//! Fatal conditions are reported on stderr (inherited from the driver) and
//! end the process; task failures are captured into envelopes instead.

use crate::ipc::{self, LineReader, LineWriter};
use crate::protocol::{
    ErrorEnvelope, TaskCall, TaskId, WorkerBoot, WorkerEntry, WorkerRequest, WorkerResponse,
};
use crate::registry::{self, InitHandler, RegistrySnapshot, TaskArgs, TaskHandler};
use crate::spawn::{BOOT_ENV, WORKER_ENV};
use std::os::fd::OwnedFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::runtime::Runtime;

/// Divert into the worker entry if this process was started as a spawn-mode
/// worker.
///
/// Host binaries call this once in `main()`, after registering their tasks
/// and initializers. In a worker child it never returns; anywhere else it
/// is a cheap no-op.
pub fn init() {
    if std::env::var_os(WORKER_ENV).is_none() {
        return;
    }
    let raw = match std::env::var(BOOT_ENV) {
        Ok(raw) => raw,
        Err(_) => {
            eprintln!("subpool worker: missing boot record");
            std::process::exit(1);
        }
    };
    let boot = match WorkerBoot::decode(&raw) {
        Ok(boot) => boot,
        Err(err) => {
            eprintln!("subpool worker: invalid boot record: {err}");
            std::process::exit(1);
        }
    };
    // Stderr and the environment are inherited, so the driver's log
    // settings apply here too.
    crate::logging::init(crate::logging::LogConfig::from_env());
    let reader = ipc::stdin_reader();
    let writer = ipc::stdout_writer();
    std::process::exit(run_worker(boot, Lookup::Global, reader, writer));
}

/// Entry for a fork-mode worker child. Never returns.
pub(crate) fn run_forked(
    boot: WorkerBoot,
    snapshot: RegistrySnapshot,
    submit: OwnedFd,
    result: OwnedFd,
) -> ! {
    let reader = LineReader::from_fd(submit);
    let writer = LineWriter::from_fd(result);
    let code = run_worker(boot, Lookup::Snapshot(snapshot), reader, writer);
    // _exit: skip atexit hooks so the child cannot re-flush stdio buffers
    // inherited from the parent image.
    unsafe { nix::libc::_exit(code) }
}

/// Where a worker resolves task names: the process-global registry (spawn
/// mode, rebuilt by the re-executed main) or a fork-time snapshot.
enum Lookup {
    Global,
    Snapshot(RegistrySnapshot),
}

impl Lookup {
    fn task(&self, name: &str) -> Option<TaskHandler> {
        match self {
            Lookup::Global => registry::task_handler(name),
            Lookup::Snapshot(snap) => snap.task(name),
        }
    }

    fn initializer(&self, name: &str) -> Option<InitHandler> {
        match self {
            Lookup::Global => registry::initializer_handler(name),
            Lookup::Snapshot(snap) => snap.initializer(name),
        }
    }
}

fn run_worker(boot: WorkerBoot, lookup: Lookup, mut reader: LineReader, mut writer: LineWriter) -> i32 {
    // Initializer failures are fatal: the worker must not accept tasks in a
    // half-initialized process.
    if let Some(call) = &boot.initializer {
        let Some(handler) = lookup.initializer(&call.name) else {
            eprintln!(
                "subpool worker: initializer '{}' is not registered in this process",
                call.name
            );
            return 1;
        };
        let args = TaskArgs::new(call.args.clone(), call.kwargs.clone());
        if let Err(err) = handler(args) {
            eprintln!("subpool worker: initializer '{}' failed: {err}", call.name);
            return 1;
        }
    }

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("subpool worker: failed to build runtime: {err}");
            return 1;
        }
    };

    match boot.entry {
        WorkerEntry::Single { call, capture } => run_single(&rt, &lookup, call, capture, &mut writer),
        WorkerEntry::Pool => run_pool_loop(&rt, &lookup, boot.quota, &mut reader, &mut writer),
    }
}

/// Run exactly one call. In capture mode (Worker handles) the outcome goes
/// to the result pipe and the process exits 0 even if the task failed; in
/// bare mode (Process handles) a failure exits 1.
fn run_single(
    rt: &Runtime,
    lookup: &Lookup,
    call: TaskCall,
    capture: bool,
    writer: &mut LineWriter,
) -> i32 {
    let response = execute_task(rt, lookup, 0, &call);
    if capture {
        if let Err(err) = writer.write_line(&response.to_line()) {
            eprintln!("subpool worker: failed to write result: {err}");
            return 1;
        }
        return 0;
    }
    match response {
        WorkerResponse::Result { .. } => 0,
        WorkerResponse::Error { error, .. } => {
            eprintln!("subpool worker: {}", error.trace);
            1
        }
    }
}

/// The pool worker loop: initializer already ran; pull tasks until the stop
/// sentinel, channel EOF, or the task quota, then exit.
fn run_pool_loop(
    rt: &Runtime,
    lookup: &Lookup,
    quota: Option<u64>,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> i32 {
    let mut completed: u64 = 0;
    loop {
        let line = match reader.read_line() {
            Ok(Some(line)) => line,
            // Driver hung up; treat like a stop sentinel.
            Ok(None) => return 0,
            Err(err) => {
                eprintln!("subpool worker: submit channel read failed: {err}");
                return 1;
            }
        };
        let request = match WorkerRequest::from_line(&line) {
            Ok(request) => request,
            Err(err) => {
                eprintln!("subpool worker: malformed request: {err}");
                continue;
            }
        };
        match request {
            WorkerRequest::Stop => return 0,
            WorkerRequest::Task { id, call } => {
                let response = execute_task(rt, lookup, id, &call);
                if let Err(err) = writer.write_line(&response.to_line()) {
                    eprintln!("subpool worker: failed to write result: {err}");
                    return 1;
                }
                completed += 1;
                if let Some(quota) = quota {
                    // Recycle after finishing the current task, never
                    // mid-task.
                    if completed >= quota {
                        return 0;
                    }
                }
            }
        }
    }
}

/// Drive one call to completion, capturing handler errors and panics into
/// an envelope before they can cross the process boundary.
fn execute_task(rt: &Runtime, lookup: &Lookup, id: TaskId, call: &TaskCall) -> WorkerResponse {
    let Some(handler) = lookup.task(&call.name) else {
        return WorkerResponse::Error {
            id,
            error: ErrorEnvelope::not_registered(&call.name),
        };
    };
    let args = TaskArgs::new(call.args.clone(), call.kwargs.clone());
    match catch_unwind(AssertUnwindSafe(|| rt.block_on(handler(args)))) {
        Ok(Ok(value)) => WorkerResponse::Result { id, value },
        Ok(Err(err)) => WorkerResponse::Error {
            id,
            error: ErrorEnvelope::from_task_error(&call.name, &err),
        },
        Err(payload) => WorkerResponse::Error {
            id,
            error: ErrorEnvelope::from_panic(&call.name, &panic_text(payload)),
        },
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
