//! Task registry: named async tasks and sync initializers.
//!
//! Worker processes cannot receive arbitrary closures, so callables cross
//! the process boundary by name. Host binaries register their handlers in
//! `main()` before calling [`crate::init`]. Spawn-mode children re-run those
//! registrations when the binary is re-executed; fork-mode children receive
//! a snapshot taken at fork time, so they also see names registered after
//! `init()`.

use crate::error::{Result, SubpoolError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;

/// Arguments delivered to a task or initializer handler.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    /// Positional arguments, in call order.
    pub positional: Vec<Value>,
    /// Keyword arguments.
    pub keyword: Map<String, Value>,
}

impl TaskArgs {
    /// Create from positional and keyword arguments.
    pub fn new(positional: Vec<Value>, keyword: Map<String, Value>) -> Self {
        Self {
            positional,
            keyword,
        }
    }

    /// Positional argument by index.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }
}

/// Failure reported by a task or initializer handler.
///
/// The `kind` string survives the process boundary verbatim and is what
/// callers match on (via [`crate::ProxyError::kind`] or a failed
/// [`crate::TaskOutcome`]).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TaskError {
    /// Failure kind name chosen by the handler.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl TaskError {
    /// Create a task error with an explicit kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a task error with the generic "TaskError" kind.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("TaskError", message)
    }
}

/// Boxed future returned by task handlers.
///
/// Not `Send`: each worker drives one task at a time on a current-thread
/// runtime, so the future never migrates.
pub type TaskFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, TaskError>>>>;

pub(crate) type TaskHandler = Arc<dyn Fn(TaskArgs) -> TaskFuture + Send + Sync>;
pub(crate) type InitHandler =
    Arc<dyn Fn(TaskArgs) -> std::result::Result<(), TaskError> + Send + Sync>;

fn tasks() -> &'static RwLock<HashMap<String, TaskHandler>> {
    static TASKS: OnceLock<RwLock<HashMap<String, TaskHandler>>> = OnceLock::new();
    TASKS.get_or_init(|| RwLock::new(HashMap::new()))
}

fn initializers() -> &'static RwLock<HashMap<String, InitHandler>> {
    static INITIALIZERS: OnceLock<RwLock<HashMap<String, InitHandler>>> = OnceLock::new();
    INITIALIZERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register an async task handler under `name`.
///
/// Re-registering a name replaces the previous handler. Registrations made
/// after [`crate::init`] are visible to fork-mode workers created later but
/// never to spawn-mode workers.
pub fn register_task<F, Fut>(name: impl Into<String>, handler: F)
where
    F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, TaskError>> + 'static,
{
    let handler: TaskHandler = Arc::new(move |args| Box::pin(handler(args)) as TaskFuture);
    tasks()
        .write()
        .expect("task registry lock poisoned")
        .insert(name.into(), handler);
}

/// Register a sync initializer handler under `name`.
///
/// Initializers run once per worker process, before any task, and must not
/// suspend.
pub fn register_initializer<F>(name: impl Into<String>, handler: F)
where
    F: Fn(TaskArgs) -> std::result::Result<(), TaskError> + Send + Sync + 'static,
{
    let handler: InitHandler = Arc::new(handler);
    initializers()
        .write()
        .expect("initializer registry lock poisoned")
        .insert(name.into(), handler);
}

pub(crate) fn task_handler(name: &str) -> Option<TaskHandler> {
    tasks()
        .read()
        .expect("task registry lock poisoned")
        .get(name)
        .cloned()
}

pub(crate) fn initializer_handler(name: &str) -> Option<InitHandler> {
    initializers()
        .read()
        .expect("initializer registry lock poisoned")
        .get(name)
        .cloned()
}

pub(crate) fn is_task_registered(name: &str) -> bool {
    tasks()
        .read()
        .expect("task registry lock poisoned")
        .contains_key(name)
}

pub(crate) fn is_initializer_registered(name: &str) -> bool {
    initializers()
        .read()
        .expect("initializer registry lock poisoned")
        .contains_key(name)
}

/// Check that `name` can serve as a process or pool target: it must be a
/// registered async task.
pub(crate) fn validate_target(name: &str) -> Result<()> {
    if is_task_registered(name) {
        return Ok(());
    }
    if is_initializer_registered(name) {
        return Err(SubpoolError::InvalidArgument(format!(
            "target '{name}' is registered as a plain initializer, not an async task"
        )));
    }
    Err(SubpoolError::InvalidArgument(format!(
        "target '{name}' is not a registered task"
    )))
}

/// Check that `name` can serve as an initializer: it must be a registered
/// plain (non-suspending) function.
pub(crate) fn validate_initializer(name: &str) -> Result<()> {
    if is_initializer_registered(name) {
        return Ok(());
    }
    if is_task_registered(name) {
        return Err(SubpoolError::InvalidArgument(format!(
            "initializer '{name}' must be a plain function, not an async task"
        )));
    }
    Err(SubpoolError::InvalidArgument(format!(
        "initializer '{name}' is not registered"
    )))
}

/// Owned copy of both registries, taken just before forking a worker.
///
/// The fork child resolves handlers through its snapshot only and never
/// touches the global locks, which may be held by other parent threads at
/// fork time.
pub(crate) struct RegistrySnapshot {
    tasks: HashMap<String, TaskHandler>,
    initializers: HashMap<String, InitHandler>,
}

impl RegistrySnapshot {
    pub(crate) fn task(&self, name: &str) -> Option<TaskHandler> {
        self.tasks.get(name).cloned()
    }

    pub(crate) fn initializer(&self, name: &str) -> Option<InitHandler> {
        self.initializers.get(name).cloned()
    }
}

pub(crate) fn snapshot() -> RegistrySnapshot {
    RegistrySnapshot {
        tasks: tasks()
            .read()
            .expect("task registry lock poisoned")
            .clone(),
        initializers: initializers()
            .read()
            .expect("initializer registry lock poisoned")
            .clone(),
    }
}
