//! Error types for subpool.

use std::time::Duration;
use thiserror::Error;

/// A task failure reconstructed at the call site from the envelope the
/// worker process wrote before exiting or moving on.
///
/// Pool operations raise this single error kind for every remote failure;
/// the original failure is carried as data (`kind`, `message`, `trace`) and
/// cannot be downcast to its source type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProxyError {
    /// Kind name of the original failure (e.g. "Panic", "TaskNotRegistered",
    /// or whatever kind the task handler reported).
    pub kind: String,
    /// Original failure message.
    pub message: String,
    /// Formatted trace text captured in the worker process.
    pub trace: String,
}

impl ProxyError {
    /// Create a proxy error from its captured parts.
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }
}

/// Main error type for subpool.
#[derive(Error, Debug)]
pub enum SubpoolError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Join timed out after {0:?}")]
    JoinTimeout(Duration),

    #[error("Task failed: {0}")]
    Task(#[from] ProxyError),

    #[error("Worker lost: {0}")]
    WorkerLost(String),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("System error: {0}")]
    Sys(#[from] nix::Error),
}

/// Result type alias for subpool operations.
pub type Result<T> = std::result::Result<T, SubpoolError>;
