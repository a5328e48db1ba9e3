//! Codebot core: runs a coding agent on behalf of chat users.
//!
//! One request per user at a time. Each request becomes a child process that
//! receives its prompt on stdin, is watched by a timeout and a cancellation
//! path, and reports back through an [`executor::ExecutionResult`]. Results
//! are rendered into transport-sized HTML chunks by [`render`].

pub mod config;
pub mod executor;
pub mod history;
pub mod prompt;
pub mod render;

pub use executor::{
    ExecutionRequest, ExecutionResult, ExecutionService, ExecutionStatus, ExecutorConfig,
    ProcessRegistry, RegistryError, UserId,
};
pub use history::{ConversationHistory, HistoryEntry};
