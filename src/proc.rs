//! Owned child process handles.
//!
//! One `ChildProc` per worker, covering both start methods: a spawned
//! (re-executed) child held as a tokio `Child`, or a forked pid reaped via
//! `waitpid`. Exit codes are signed: a normal exit keeps its code, a signal
//! death maps to the negative signal number.

use crate::error::Result;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::process::Child;

/// Map a std exit status to the signed exit-code convention.
pub(crate) fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(1),
    }
}

/// Map a waitpid status; `None` while the child is still running.
fn exit_code_from_wait_status(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, sig, _) => Some(-(sig as i32)),
        _ => None,
    }
}

/// Human description of a signed exit code for logs.
pub(crate) fn describe_exit(code: i32) -> String {
    if code >= 0 {
        format!("exited with code {code}")
    } else {
        match Signal::try_from(-code) {
            Ok(sig) => format!("killed by signal {} ({})", -code, sig),
            Err(_) => format!("killed by signal {}", -code),
        }
    }
}

enum ChildKind {
    Spawned(Child),
    Forked(Pid),
}

/// One worker child process, exclusively owned by its handle or pool slot.
pub(crate) struct ChildProc {
    pid: u32,
    kind: ChildKind,
    // Mapped exit code once observed; doubles as the reaped flag.
    exit_code: Option<i32>,
    daemon: bool,
}

impl ChildProc {
    pub(crate) fn spawned(child: Child, daemon: bool) -> Self {
        let pid = child.id().unwrap_or_default();
        Self {
            pid,
            kind: ChildKind::Spawned(child),
            exit_code: None,
            daemon,
        }
    }

    pub(crate) fn forked(pid: Pid, daemon: bool) -> Self {
        Self {
            pid: pid.as_raw() as u32,
            kind: ChildKind::Forked(pid),
            exit_code: None,
            daemon,
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Non-blocking reap attempt.
    pub(crate) fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        let code = match &mut self.kind {
            ChildKind::Spawned(child) => child.try_wait()?.map(exit_code_from_status),
            ChildKind::Forked(pid) => {
                exit_code_from_wait_status(waitpid(*pid, Some(WaitPidFlag::WNOHANG))?)
            }
        };
        self.exit_code = code;
        Ok(code)
    }

    /// Wait for exit and return the mapped exit code.
    pub(crate) async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = match &mut self.kind {
            ChildKind::Spawned(child) => exit_code_from_status(child.wait().await?),
            ChildKind::Forked(pid) => {
                // There is no async waitpid; poll with a short sleep. Worker
                // exits are rare events (quota, sentinel, crash), so the
                // polling cost does not matter.
                let pid = *pid;
                loop {
                    match exit_code_from_wait_status(waitpid(pid, Some(WaitPidFlag::WNOHANG))?) {
                        Some(code) => break code,
                        None => tokio::time::sleep(Duration::from_millis(5)).await,
                    }
                }
            }
        };
        self.exit_code = Some(code);
        Ok(code)
    }

    /// Request termination (SIGTERM). Non-blocking; the exit code is still
    /// observed through `wait`.
    pub(crate) fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Force termination (SIGKILL). Non-blocking.
    pub(crate) fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        match kill(Pid::from_raw(self.pid as i32), sig) {
            // Already gone; the pending reap will pick up the real status.
            Err(Errno::ESRCH) => Ok(()),
            other => Ok(other?),
        }
    }
}

impl Drop for ChildProc {
    fn drop(&mut self) {
        if !self.daemon || self.exit_code.is_some() {
            return;
        }
        match &mut self.kind {
            ChildKind::Spawned(child) => {
                // tokio reaps the orphan after the kill.
                let _ = child.start_kill();
            }
            ChildKind::Forked(pid) => {
                let _ = kill(*pid, Signal::SIGKILL);
                let _ = waitpid(*pid, None);
            }
        }
    }
}
