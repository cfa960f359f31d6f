//! Worker process creation for both start methods.
//!
//! Spawn mode re-executes the current binary with a marker environment
//! variable; [`crate::init`] in the child's `main()` diverts into the worker
//! entry before any application logic runs. The boot record travels in the
//! environment so no pipe traffic is needed before the worker loop starts.
//! Fork mode clones the calling process and hands the child a pre-fork
//! registry snapshot together with its pipe fds.

use crate::context::StartMethod;
use crate::error::Result;
use crate::ipc::{FrameReader, FrameWriter};
use crate::proc::ChildProc;
use crate::protocol::WorkerBoot;
use crate::registry;
use crate::worker_main;
use nix::fcntl::OFlag;
use std::process::Stdio;
use tokio::net::unix::pipe;
use tracing::debug;

/// Environment marker diverting a re-executed binary into the worker entry.
pub(crate) const WORKER_ENV: &str = "SUBPOOL_WORKER";

/// Environment variable carrying the serialized boot record (spawn mode).
pub(crate) const BOOT_ENV: &str = "SUBPOOL_BOOT";

/// A started worker: the child plus the driver ends of its channel pair.
pub(crate) struct SpawnedWorker {
    pub(crate) proc: ChildProc,
    pub(crate) writer: FrameWriter,
    pub(crate) reader: FrameReader,
}

/// Create one worker child with a fresh channel pair.
///
/// Requires a tokio runtime context: the driver ends of the pipes register
/// with the reactor.
pub(crate) fn spawn_worker(
    boot: WorkerBoot,
    method: StartMethod,
    daemon: bool,
    label: &str,
) -> Result<SpawnedWorker> {
    match method {
        StartMethod::Spawn => exec_worker(boot, daemon, label),
        StartMethod::Fork => fork_worker(boot, daemon, label),
    }
}

fn exec_worker(boot: WorkerBoot, daemon: bool, label: &str) -> Result<SpawnedWorker> {
    let exe = std::env::current_exe()?;
    let mut child = tokio::process::Command::new(&exe)
        .env(WORKER_ENV, "1")
        .env(BOOT_ENV, boot.encode())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(false)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("worker stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("worker stdout not captured"))?;

    let proc = ChildProc::spawned(child, daemon);
    debug!(worker = label, pid = proc.pid(), method = "spawn", "started worker process");
    Ok(SpawnedWorker {
        proc,
        writer: FrameWriter::stdio(stdin),
        reader: FrameReader::stdio(stdout),
    })
}

fn fork_worker(boot: WorkerBoot, daemon: bool, label: &str) -> Result<SpawnedWorker> {
    // CLOEXEC so a spawn-mode sibling exec'd later cannot inherit these
    // ends and hold a dead worker's pipe open past its exit.
    let (submit_read, submit_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let (result_read, result_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let snapshot = registry::snapshot();

    // Fork from a fresh thread. The calling thread usually sits inside
    // block_on, and a child born there would inherit its thread-local
    // runtime guard and could never block_on a runtime of its own. The
    // child keeps only the forking thread.
    let helper = std::thread::Builder::new()
        .name("subpool-fork".to_string())
        .spawn(move || {
            // Safety: the child immediately enters the worker entry,
            // touches only its owned snapshot and its two pipe fds, and
            // leaves through process exit. It never takes a lock shared
            // with the parent.
            match unsafe { nix::unistd::fork() } {
                Ok(nix::unistd::ForkResult::Child) => {
                    drop(submit_write);
                    drop(result_read);
                    worker_main::run_forked(boot, snapshot, submit_read, result_write)
                }
                Ok(nix::unistd::ForkResult::Parent { child }) => {
                    drop(submit_read);
                    drop(result_write);
                    Ok((child, submit_write, result_read))
                }
                Err(err) => Err(err),
            }
        })?;
    let (child, submit_write, result_read) = helper
        .join()
        .map_err(|_| std::io::Error::other("fork thread panicked"))??;

    let writer = FrameWriter::pipe(pipe::Sender::from_owned_fd(submit_write)?);
    let reader = FrameReader::pipe(pipe::Receiver::from_owned_fd(result_read)?);
    debug!(worker = label, pid = child.as_raw(), method = "fork", "started worker process");
    Ok(SpawnedWorker {
        proc: ChildProc::forked(child, daemon),
        writer,
        reader,
    })
}
