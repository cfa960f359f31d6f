//! Process and Worker handles.
//!
//! A [`Process`] owns one OS child driving a single registered async task
//! to completion; nothing else may start or signal that child. A
//! [`Worker`] is the same handle in capture mode: the task's settled
//! outcome crosses back over the result pipe and is handed to the caller
//! as a value, even when the task failed.

use crate::context::ExecutionContext;
use crate::error::{Result, SubpoolError};
use crate::ipc::FrameReader;
use crate::proc::{describe_exit, ChildProc};
use crate::protocol::{TaskCall, TaskOutcome, WorkerBoot, WorkerEntry, WorkerResponse};
use crate::registry;
use crate::spawn;
use futures::future::BoxFuture;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

static NAME_SEQ: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcState {
    NotStarted,
    Running,
    Exited(i32),
    Closed,
}

/// Handle to one OS process running one registered async task.
///
/// Lifecycle: `NotStarted -> Running -> Exited -> Closed`. The handle must
/// be started explicitly; `join` observes the exit; `close` releases the
/// child after the exit was observed.
pub struct Process {
    name: String,
    target: TaskCall,
    initializer: Option<TaskCall>,
    daemon: bool,
    context: ExecutionContext,
    capture: bool,
    state: ProcState,
    child: Option<ChildProc>,
    reader: Option<FrameReader>,
}

impl Process {
    /// Create a handle for `target`. The start method is captured from the
    /// process-wide default now; override it with [`Process::with_context`].
    pub fn new(target: TaskCall) -> Self {
        let seq = NAME_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            name: format!("process-{seq}"),
            target,
            initializer: None,
            daemon: false,
            context: ExecutionContext::current(),
            capture: false,
            state: ProcState::NotStarted,
            child: None,
            reader: None,
        }
    }

    /// Set the handle name used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Run a registered plain initializer in the child before the target.
    pub fn with_initializer(mut self, call: TaskCall) -> Self {
        self.initializer = Some(call);
        self
    }

    /// Override the captured execution context.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub(crate) fn capture_result(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Handle name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Child pid; `None` before start.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(ChildProc::pid)
    }

    /// Whether the child is torn down when the handle is dropped.
    pub fn daemon(&self) -> bool {
        self.daemon
    }

    /// Set the daemon flag. Only allowed before [`Process::start`].
    pub fn set_daemon(&mut self, daemon: bool) -> Result<()> {
        if self.state != ProcState::NotStarted {
            return Err(SubpoolError::InvalidState(
                "daemon flag can only be changed before start".to_string(),
            ));
        }
        self.daemon = daemon;
        Ok(())
    }

    /// Start the child process.
    ///
    /// Validates the target and initializer shapes against the registry,
    /// then spawns via the captured start method. Requires a tokio runtime
    /// context.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ProcState::NotStarted {
            return Err(SubpoolError::InvalidState(
                "process already started".to_string(),
            ));
        }
        registry::validate_target(&self.target.name)?;
        if let Some(init) = &self.initializer {
            registry::validate_initializer(&init.name)?;
        }

        let boot = WorkerBoot {
            entry: WorkerEntry::Single {
                call: self.target.clone(),
                capture: self.capture,
            },
            initializer: self.initializer.clone(),
            quota: None,
        };
        let worker = spawn::spawn_worker(boot, self.context.start_method, self.daemon, &self.name)?;
        // The submit writer is dropped here: single-task children read
        // nothing from their submit pipe.
        self.child = Some(worker.proc);
        self.reader = Some(worker.reader);
        self.state = ProcState::Running;
        Ok(())
    }

    fn child_ref(&self) -> Result<&ChildProc> {
        self.child
            .as_ref()
            .ok_or_else(|| SubpoolError::InvalidState("process has no child".to_string()))
    }

    fn child_mut(&mut self) -> Result<&mut ChildProc> {
        self.child
            .as_mut()
            .ok_or_else(|| SubpoolError::InvalidState("process has no child".to_string()))
    }

    /// Wait until the process exits; the exit code becomes observable
    /// through [`Process::exit_code`].
    pub async fn join(&mut self) -> Result<()> {
        match self.state {
            ProcState::NotStarted => Err(SubpoolError::InvalidState(
                "must start process before joining".to_string(),
            )),
            ProcState::Closed => Err(SubpoolError::InvalidState("process is closed".to_string())),
            ProcState::Exited(_) => Ok(()),
            ProcState::Running => {
                let name = self.name.clone();
                let code = self.child_mut()?.wait().await?;
                self.state = ProcState::Exited(code);
                debug!(process = %name, "{}", describe_exit(code));
                Ok(())
            }
        }
    }

    /// Like [`Process::join`] but gives up after `timeout`, leaving the
    /// process running.
    pub async fn join_timeout(&mut self, timeout: Duration) -> Result<()> {
        match self.state {
            ProcState::NotStarted => Err(SubpoolError::InvalidState(
                "must start process before joining".to_string(),
            )),
            ProcState::Closed => Err(SubpoolError::InvalidState("process is closed".to_string())),
            ProcState::Exited(_) => Ok(()),
            ProcState::Running => {
                let child = self.child_mut()?;
                match tokio::time::timeout(timeout, child.wait()).await {
                    Ok(waited) => {
                        let code = waited?;
                        self.state = ProcState::Exited(code);
                        Ok(())
                    }
                    Err(_) => Err(SubpoolError::JoinTimeout(timeout)),
                }
            }
        }
    }

    /// True while the child runs and its exit has not been observed yet.
    /// Observes an exit opportunistically, without blocking.
    pub fn is_alive(&mut self) -> bool {
        if self.state != ProcState::Running {
            return false;
        }
        match self.child.as_mut().and_then(|c| c.try_wait().ok().flatten()) {
            Some(code) => {
                self.state = ProcState::Exited(code);
                false
            }
            None => true,
        }
    }

    /// Exit code once observed via `join`/`is_alive`, negative for signal
    /// deaths. `None` before start or while running.
    pub fn exit_code(&self) -> Result<Option<i32>> {
        match self.state {
            ProcState::Closed => Err(SubpoolError::InvalidState("process is closed".to_string())),
            ProcState::Exited(code) => Ok(Some(code)),
            _ => Ok(None),
        }
    }

    /// Request termination (SIGTERM). Non-blocking; `join` still observes
    /// the exit code.
    pub fn terminate(&self) -> Result<()> {
        match self.state {
            ProcState::NotStarted => Err(SubpoolError::InvalidState(
                "cannot terminate a process that was never started".to_string(),
            )),
            ProcState::Closed => Err(SubpoolError::InvalidState("process is closed".to_string())),
            ProcState::Exited(_) => Ok(()),
            ProcState::Running => self.child_ref()?.terminate(),
        }
    }

    /// Force termination (SIGKILL). Non-blocking.
    pub fn kill(&self) -> Result<()> {
        match self.state {
            ProcState::NotStarted => Err(SubpoolError::InvalidState(
                "cannot kill a process that was never started".to_string(),
            )),
            ProcState::Closed => Err(SubpoolError::InvalidState("process is closed".to_string())),
            ProcState::Exited(_) => Ok(()),
            ProcState::Running => self.child_ref()?.kill(),
        }
    }

    /// Release the child handle. Fails while the process is still running;
    /// idempotent afterwards.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            ProcState::Closed => Ok(()),
            ProcState::NotStarted | ProcState::Exited(_) => {
                self.child = None;
                self.reader = None;
                self.state = ProcState::Closed;
                Ok(())
            }
            ProcState::Running => {
                // An exit nobody observed yet still counts.
                if self.child_mut()?.try_wait()?.is_some() {
                    self.child = None;
                    self.reader = None;
                    self.state = ProcState::Closed;
                    Ok(())
                } else {
                    Err(SubpoolError::InvalidState(
                        "cannot close a running process".to_string(),
                    ))
                }
            }
        }
    }
}

/// A [`Process`] whose task outcome is captured and returned to the caller.
///
/// Unlike pool operations, a failed task is this handle's *result value*
/// (a [`TaskOutcome::Failed`]), never a raised error. Awaiting a `Worker`
/// directly auto-starts it and resolves to its outcome.
pub struct Worker {
    process: Process,
    outcome: Option<TaskOutcome>,
}

impl Worker {
    /// Create a capture-mode handle for `target`.
    pub fn new(target: TaskCall) -> Self {
        Self {
            process: Process::new(target).capture_result(),
            outcome: None,
        }
    }

    /// Set the handle name used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.process = self.process.with_name(name);
        self
    }

    /// Run a registered plain initializer in the child before the target.
    pub fn with_initializer(mut self, call: TaskCall) -> Self {
        self.process = self.process.with_initializer(call);
        self
    }

    /// Override the captured execution context.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.process = self.process.with_context(context);
        self
    }

    /// Handle name.
    pub fn name(&self) -> &str {
        self.process.name()
    }

    /// Child pid; `None` before start.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Whether the child is torn down when the handle is dropped.
    pub fn daemon(&self) -> bool {
        self.process.daemon()
    }

    /// Set the daemon flag. Only allowed before [`Worker::start`].
    pub fn set_daemon(&mut self, daemon: bool) -> Result<()> {
        self.process.set_daemon(daemon)
    }

    /// Start the child process.
    pub fn start(&mut self) -> Result<()> {
        self.process.start()
    }

    /// True while the child runs and its exit has not been observed yet.
    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    /// Request termination (SIGTERM).
    pub fn terminate(&self) -> Result<()> {
        self.process.terminate()
    }

    /// Force termination (SIGKILL).
    pub fn kill(&self) -> Result<()> {
        self.process.kill()
    }

    /// Exit code once observed, negative for signal deaths.
    pub fn exit_code(&self) -> Result<Option<i32>> {
        self.process.exit_code()
    }

    /// Release the child handle after exit.
    pub fn close(&mut self) -> Result<()> {
        self.process.close()
    }

    /// Wait for the child and return the captured outcome.
    ///
    /// A child that exited without writing its outcome (killed, crashed)
    /// is a worker-lost error; task failures are not errors here.
    pub async fn join(&mut self) -> Result<TaskOutcome> {
        self.process.join().await?;
        self.read_outcome().await
    }

    /// Like [`Worker::join`] with a deadline on the process exit.
    pub async fn join_timeout(&mut self, timeout: Duration) -> Result<TaskOutcome> {
        self.process.join_timeout(timeout).await?;
        self.read_outcome().await
    }

    /// The captured outcome. Usage error ("not completed") until a join has
    /// observed it.
    pub fn result(&self) -> Result<&TaskOutcome> {
        self.outcome
            .as_ref()
            .ok_or_else(|| SubpoolError::InvalidState("task not completed".to_string()))
    }

    async fn read_outcome(&mut self) -> Result<TaskOutcome> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        let reader = self
            .process
            .reader
            .as_mut()
            .ok_or_else(|| SubpoolError::InvalidState("result channel is gone".to_string()))?;
        // The child exited already, so the envelope (or EOF) is sitting in
        // the pipe.
        match reader.read_line().await? {
            Some(line) => {
                let outcome = WorkerResponse::from_line(&line)?.into_outcome();
                self.outcome = Some(outcome.clone());
                Ok(outcome)
            }
            None => {
                let how = match self.process.state {
                    ProcState::Exited(code) => describe_exit(code),
                    _ => "exited".to_string(),
                };
                Err(SubpoolError::WorkerLost(format!(
                    "worker {how} before writing its result"
                )))
            }
        }
    }
}

impl IntoFuture for Worker {
    type Output = Result<TaskOutcome>;
    type IntoFuture = BoxFuture<'static, Result<TaskOutcome>>;

    /// `start()` + `join()` + outcome as one awaitable.
    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move {
            if self.process.state == ProcState::NotStarted {
                self.start()?;
            }
            self.join().await
        })
    }
}
