//! Start-method policy: how worker processes are created.
//!
//! A process-wide default (configure once, before building any pool or
//! process) plus an explicit [`ExecutionContext`] value captured at
//! construction time, so changing the default never affects handles that
//! already exist.

use crate::error::{Result, SubpoolError};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Strategy used to create worker processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMethod {
    /// Re-execute the current binary with a worker marker. The child starts
    /// from a fresh state and sees only registrations made before
    /// [`crate::init`].
    #[default]
    Spawn,
    /// `fork(2)` the calling process (Unix only). The child inherits a
    /// snapshot of the registry taken at fork time.
    Fork,
}

impl StartMethod {
    /// Canonical name, as accepted by [`set_start_method`].
    pub fn name(&self) -> &'static str {
        match self {
            StartMethod::Spawn => "spawn",
            StartMethod::Fork => "fork",
        }
    }

    /// Whether the current platform supports this method.
    pub fn is_supported(&self) -> bool {
        match self {
            StartMethod::Spawn => true,
            StartMethod::Fork => cfg!(unix),
        }
    }
}

impl fmt::Display for StartMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StartMethod {
    type Err = SubpoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spawn" => Ok(StartMethod::Spawn),
            "fork" => Ok(StartMethod::Fork),
            other => Err(SubpoolError::InvalidArgument(format!(
                "unknown start method '{other}' (expected 'spawn' or 'fork')"
            ))),
        }
    }
}

// Process-wide default. 0 = spawn, 1 = fork.
static START_METHOD: AtomicU8 = AtomicU8::new(0);

/// The process-wide default start method.
pub fn get_start_method() -> StartMethod {
    match START_METHOD.load(Ordering::SeqCst) {
        1 => StartMethod::Fork,
        _ => StartMethod::Spawn,
    }
}

/// Set the process-wide default start method.
///
/// `None` resets to the platform default (spawn). An unknown name is an
/// invalid-argument error, a known name the platform cannot use is an
/// unsupported error; in both cases the previous setting stays in effect.
/// Configure before constructing any [`crate::Process`] or [`crate::Pool`];
/// handles capture the method at construction.
pub fn set_start_method(name: Option<&str>) -> Result<()> {
    let method = match name {
        None => StartMethod::default(),
        Some(raw) => raw.parse::<StartMethod>()?,
    };
    if !method.is_supported() {
        return Err(SubpoolError::Unsupported(format!(
            "start method '{method}'"
        )));
    }
    START_METHOD.store(method as u8, Ordering::SeqCst);
    Ok(())
}

/// Thin alias over [`set_start_method`]; failures propagate unmodified.
pub fn set_context(name: Option<&str>) -> Result<()> {
    set_start_method(name)
}

/// Explicit process-creation policy for one handle or pool.
///
/// Captured from the process-wide default at construction unless supplied
/// via `with_context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionContext {
    /// How worker processes are created.
    pub start_method: StartMethod,
}

impl ExecutionContext {
    /// Context using the given start method.
    pub fn new(start_method: StartMethod) -> Self {
        Self { start_method }
    }

    /// Context capturing the current process-wide default.
    pub fn current() -> Self {
        Self {
            start_method: get_start_method(),
        }
    }
}
