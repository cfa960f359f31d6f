//! IPC protocol for worker subprocess communication.
//!
//! Messages are JSON-serialized and newline-delimited. Each pool worker has
//! a private pipe pair: requests flow parent to worker, responses flow back.
//! The boot record travels out-of-band (environment for spawn, memory for
//! fork), never over the pipes.

use crate::error::ProxyError;
use crate::registry::TaskError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task identity, unique per pool lifetime, assigned at submission.
pub type TaskId = u64;

/// A callable reference plus its arguments, in transmissible form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskCall {
    /// Registered task (or initializer) name.
    pub name: String,
    /// Positional arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl TaskCall {
    /// Create a call with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// Append one positional argument.
    pub fn arg(mut self, value: Value) -> Self {
        self.args.push(value);
        self
    }

    /// Set all positional arguments at once.
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    /// Add one keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }
}

/// Request from parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    /// Run one task.
    #[serde(rename = "task")]
    Task {
        /// Task identity for result correlation.
        id: TaskId,
        /// What to run.
        call: TaskCall,
    },

    /// Stop sentinel: exit the worker loop, no more tasks will come.
    #[serde(rename = "stop")]
    Stop,
}

impl WorkerRequest {
    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkerRequest serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Response from worker to parent: exactly one per task, value or error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerResponse {
    /// Task completed with a value.
    #[serde(rename = "result")]
    Result {
        /// Task identity this resolves.
        id: TaskId,
        /// The task's return value.
        value: Value,
    },

    /// Task failed; the failure was captured in the worker.
    #[serde(rename = "error")]
    Error {
        /// Task identity this resolves.
        id: TaskId,
        /// Captured failure description.
        error: ErrorEnvelope,
    },
}

impl WorkerResponse {
    /// Task identity this response resolves.
    pub fn id(&self) -> TaskId {
        match self {
            WorkerResponse::Result { id, .. } => *id,
            WorkerResponse::Error { id, .. } => *id,
        }
    }

    /// The outcome carried by this response.
    pub fn into_outcome(self) -> TaskOutcome {
        match self {
            WorkerResponse::Result { value, .. } => TaskOutcome::Value(value),
            WorkerResponse::Error { error, .. } => TaskOutcome::Failed(error),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkerResponse serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Serializable failure description, built exactly once in the failing
/// worker process before crossing the pipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    /// Failure kind name.
    pub kind: String,
    /// Failure message.
    pub message: String,
    /// Formatted trace text captured at the point of failure.
    pub trace: String,
}

impl ErrorEnvelope {
    /// Kind reported for a caught panic.
    pub const PANIC: &'static str = "Panic";
    /// Kind reported when a worker cannot resolve a task name.
    pub const NOT_REGISTERED: &'static str = "TaskNotRegistered";

    /// Capture a handler failure.
    pub fn from_task_error(task: &str, err: &TaskError) -> Self {
        Self {
            kind: err.kind.clone(),
            message: err.message.clone(),
            trace: format!("task '{task}' failed with {}: {}", err.kind, err.message),
        }
    }

    /// Capture a panic payload.
    pub fn from_panic(task: &str, payload: &str) -> Self {
        Self {
            kind: Self::PANIC.to_string(),
            message: payload.to_string(),
            trace: format!("task '{task}' panicked: {payload}"),
        }
    }

    /// Failure for a task name the worker does not know.
    pub fn not_registered(task: &str) -> Self {
        Self {
            kind: Self::NOT_REGISTERED.to_string(),
            message: format!("no task registered under '{task}'"),
            trace: format!("task '{task}' is not registered in the worker process"),
        }
    }
}

impl From<ErrorEnvelope> for ProxyError {
    fn from(env: ErrorEnvelope) -> Self {
        ProxyError {
            kind: env.kind,
            message: env.message,
            trace: env.trace,
        }
    }
}

/// Settled outcome of one task: a value or a captured failure.
///
/// Pool operations unwrap this and raise [`ProxyError`] on failure; a
/// [`crate::Worker`] hands it back as-is, so a task failure is data there,
/// not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The task's return value.
    Value(Value),
    /// The task failed; description captured in the worker.
    Failed(ErrorEnvelope),
}

impl TaskOutcome {
    /// True if this outcome is a captured failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed(_))
    }

    /// The value, if the task succeeded.
    pub fn value(&self) -> Option<&Value> {
        match self {
            TaskOutcome::Value(v) => Some(v),
            TaskOutcome::Failed(_) => None,
        }
    }

    /// The failure, if the task failed.
    pub fn error(&self) -> Option<&ErrorEnvelope> {
        match self {
            TaskOutcome::Value(_) => None,
            TaskOutcome::Failed(env) => Some(env),
        }
    }
}

/// What a freshly started worker process should do, decoded before the
/// first pipe read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerBoot {
    /// Single-task or pool-loop mode.
    pub entry: WorkerEntry,
    /// Initializer to run once before any task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<TaskCall>,
    /// Pool mode only: task quota before voluntary exit (unset = unbounded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
}

/// Worker entry mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum WorkerEntry {
    /// Pull tasks from the submit pipe until quota or sentinel.
    #[serde(rename = "pool")]
    Pool,

    /// Run exactly one call and exit.
    #[serde(rename = "single")]
    Single {
        /// The call to drive to completion.
        call: TaskCall,
        /// Write the outcome to the result pipe and exit 0 even on task
        /// failure (Worker mode) instead of exiting 1 without a response
        /// (bare Process mode).
        capture: bool,
    },
}

impl WorkerBoot {
    /// Serialize for the boot environment variable.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("WorkerBoot serialization failed")
    }

    /// Deserialize from the boot environment variable.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_request_serialization() {
        let call = TaskCall::new("mapper").arg(json!(5)).kwarg("scale", json!(2));
        let req = WorkerRequest::Task { id: 7, call };
        let line = req.to_line();
        assert!(line.ends_with('\n'));
        assert!(line.contains("task"));
        assert!(line.contains("mapper"));

        let parsed = WorkerRequest::from_line(&line).unwrap();
        match parsed {
            WorkerRequest::Task { id, call } => {
                assert_eq!(id, 7);
                assert_eq!(call.name, "mapper");
                assert_eq!(call.args, vec![json!(5)]);
                assert_eq!(call.kwargs.get("scale"), Some(&json!(2)));
            }
            WorkerRequest::Stop => panic!("Expected Task variant"),
        }
    }

    #[test]
    fn test_stop_sentinel_serialization() {
        let req = WorkerRequest::Stop;
        let line = req.to_line();
        let parsed = WorkerRequest::from_line(&line).unwrap();
        assert!(matches!(parsed, WorkerRequest::Stop));
    }

    #[test]
    fn test_response_carries_exactly_one_of_value_or_error() {
        let ok = WorkerResponse::Result {
            id: 1,
            value: json!([1, 2, 3]),
        };
        assert_eq!(ok.id(), 1);
        let outcome = ok.into_outcome();
        assert!(!outcome.is_failure());
        assert_eq!(outcome.value(), Some(&json!([1, 2, 3])));
        assert!(outcome.error().is_none());

        let failed = WorkerResponse::Error {
            id: 2,
            error: ErrorEnvelope::not_registered("ghost"),
        };
        assert_eq!(failed.id(), 2);
        let outcome = failed.into_outcome();
        assert!(outcome.is_failure());
        assert!(outcome.value().is_none());
        assert_eq!(outcome.error().unwrap().kind, ErrorEnvelope::NOT_REGISTERED);
    }

    #[test]
    fn test_response_roundtrip() {
        let resp = WorkerResponse::Error {
            id: 9,
            error: ErrorEnvelope::from_panic("boom_task", "index out of bounds"),
        };
        let line = resp.to_line();
        assert!(line.ends_with('\n'));

        let parsed = WorkerResponse::from_line(&line).unwrap();
        match parsed {
            WorkerResponse::Error { id, error } => {
                assert_eq!(id, 9);
                assert_eq!(error.kind, ErrorEnvelope::PANIC);
                assert!(error.trace.contains("boom_task"));
            }
            WorkerResponse::Result { .. } => panic!("Expected Error variant"),
        }
    }

    #[test]
    fn test_envelope_from_task_error() {
        let err = TaskError::new("ValueError", "expected a number");
        let env = ErrorEnvelope::from_task_error("mapper", &err);
        assert_eq!(env.kind, "ValueError");
        assert_eq!(env.message, "expected a number");
        assert!(env.trace.contains("mapper"));

        let proxy = ProxyError::from(env);
        assert_eq!(proxy.kind, "ValueError");
        assert!(proxy.trace.contains("mapper"));
    }

    #[test]
    fn test_boot_encode_decode() {
        let boot = WorkerBoot {
            entry: WorkerEntry::Pool,
            initializer: Some(TaskCall::new("setup").arg(json!(42))),
            quota: Some(3),
        };
        let raw = boot.encode();
        let parsed = WorkerBoot::decode(&raw).unwrap();
        assert!(matches!(parsed.entry, WorkerEntry::Pool));
        assert_eq!(parsed.initializer.unwrap().name, "setup");
        assert_eq!(parsed.quota, Some(3));
    }

    #[test]
    fn test_single_entry_boot() {
        let boot = WorkerBoot {
            entry: WorkerEntry::Single {
                call: TaskCall::new("sleepy"),
                capture: true,
            },
            initializer: None,
            quota: None,
        };
        let parsed = WorkerBoot::decode(&boot.encode()).unwrap();
        match parsed.entry {
            WorkerEntry::Single { call, capture } => {
                assert_eq!(call.name, "sleepy");
                assert!(capture);
            }
            WorkerEntry::Pool => panic!("Expected Single variant"),
        }
    }
}
