//! Executor error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use super::registry::UserId;

/// Errors from registry bookkeeping.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The user already has a running execution.
    #[error("user {user} already has an active execution")]
    AlreadyActive { user: UserId },
}

/// Faults while driving a child process. These never escape `execute`;
/// they are reported as an error result.
#[derive(Debug, Error)]
pub(crate) enum ExecError {
    /// The agent binary could not be started.
    #[error("failed to spawn agent {}: {source}", binary.display())]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading, writing or waiting on the child failed.
    #[error("agent I/O failed: {0}")]
    Io(#[from] io::Error),
}
