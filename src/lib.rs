//! subpool - process-parallel worker pools for async tasks
//!
//! Tasks run in child worker processes, each driving its own async runtime,
//! so CPU-bound async work scales past one core without stalling the
//! driver. Tasks and initializers are plain functions registered under
//! string names; arguments and results cross the process boundary as JSON
//! lines over pipes, and failures come back as structured envelopes rather
//! than torn-down pools.
//!
//! Two start methods are supported: `spawn` re-executes the current binary
//! (which is why host programs call [`init`] early in `main`), `fork`
//! clones the driver process directly.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use subpool::{register_task, Pool, PoolConfig, TaskError};
//!
//! fn main() -> subpool::Result<()> {
//!     register_task("double", |args| async move {
//!         let n = args
//!             .arg(0)
//!             .and_then(|v| v.as_i64())
//!             .ok_or_else(|| TaskError::msg("expected a number"))?;
//!         Ok(json!(n * 2))
//!     });
//!     // Divert into the worker loop if this process is a spawned worker.
//!     subpool::init();
//!
//!     let rt = tokio::runtime::Builder::new_multi_thread()
//!         .enable_all()
//!         .build()?;
//!     rt.block_on(async {
//!         let pool = Pool::new(PoolConfig::new().with_workers(2))?;
//!         let doubled = pool.map("double", (0..10).map(|n| json!(n))).await?;
//!         assert_eq!(doubled.len(), 10);
//!         pool.close().await
//!     })
//! }
//! ```

mod context;
mod error;
mod ipc;
pub mod logging;
mod pool;
mod proc;
mod process;
mod protocol;
mod registry;
mod spawn;
mod worker_main;

pub use context::{get_start_method, set_context, set_start_method, ExecutionContext, StartMethod};
pub use error::{ProxyError, Result, SubpoolError};
pub use pool::{Pool, PoolConfig, PoolStats};
pub use process::{Process, Worker};
pub use protocol::{ErrorEnvelope, TaskCall, TaskOutcome};
pub use registry::{register_initializer, register_task, TaskArgs, TaskError};
pub use worker_main::init;
