//! Agent execution.
//!
//! - `models` holds the request and result types.
//! - `process` holds the shared handle to one child process.
//! - `registry` tracks the running execution of each user.
//! - `progress` sends periodic status updates while a child runs.
//! - `service` drives a request from prompt to classified result.

mod error;
mod models;
mod process;
mod progress;
mod registry;
mod service;

pub use error::RegistryError;
pub use models::{DEFAULT_TIMEOUT, ExecutionRequest, ExecutionResult, ExecutionStatus};
pub use process::{ProcessExit, ProcessHandle};
pub use progress::{ProgressConfig, ProgressNotifier, ProgressSink, default_statuses};
pub use registry::{DEFAULT_GRACE_PERIOD, ProcessRegistry, UserId};
pub use service::{ExecutionService, ExecutorConfig};
