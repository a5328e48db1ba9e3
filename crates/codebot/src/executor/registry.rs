//! Per-user registry of running executions.
//!
//! The registry is the only shared mutable state in the executor. Entries
//! for different users live in different shards, so one user's bookkeeping
//! never waits on another's. No map reference is held across an await:
//! handles are cloned out before anything is awaited.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use log::{debug, info, warn};

use super::error::RegistryError;
use super::process::ProcessHandle;

/// Chat user identifier.
pub type UserId = i64;

/// Default wait between a termination request and a forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Map from user to the handle of that user's running execution.
#[derive(Debug)]
pub struct ProcessRegistry {
    entries: DashMap<UserId, Arc<ProcessHandle>>,
    grace_period: Duration,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ProcessRegistry {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            grace_period,
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Record `handle` as the user's active execution.
    ///
    /// Fails if the user already has a live entry. An entry whose process has
    /// already exited is replaced.
    pub fn register(&self, user: UserId, handle: Arc<ProcessHandle>) -> Result<(), RegistryError> {
        match self.entries.entry(user) {
            Entry::Occupied(mut entry) if !entry.get().is_running() => {
                debug!("replacing finished entry for user {user}");
                entry.insert(handle);
                Ok(())
            }
            Entry::Occupied(_) => Err(RegistryError::AlreadyActive { user }),
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    /// Remove the user's entry, whatever it is.
    pub fn unregister(&self, user: UserId) -> Option<Arc<ProcessHandle>> {
        self.entries.remove(&user).map(|(_, handle)| handle)
    }

    /// Remove the user's entry only if it is still `handle`, so a late
    /// cleanup cannot evict a newer execution.
    pub(crate) fn release(&self, user: UserId, handle: &Arc<ProcessHandle>) -> bool {
        self.entries
            .remove_if(&user, |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    pub fn is_active(&self, user: UserId) -> bool {
        self.entries
            .get(&user)
            .is_some_and(|handle| handle.is_running())
    }

    pub fn get(&self, user: UserId) -> Option<Arc<ProcessHandle>> {
        self.entries.get(&user).map(|handle| Arc::clone(handle.value()))
    }

    pub fn active_users(&self) -> Vec<UserId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stop the user's execution: request termination, wait out the grace
    /// period, force it, then drop the entry.
    ///
    /// Returns whether a running execution was found.
    pub async fn cancel(&self, user: UserId) -> bool {
        let Some(handle) = self.get(user) else {
            return false;
        };

        if !handle.is_running() {
            self.release(user, &handle);
            return false;
        }

        info!("cancelling execution for user {user}");
        handle.request_termination();

        if handle.wait_timeout(self.grace_period).await.is_none() {
            warn!(
                "execution for user {user} ignored termination for {:?}, forcing",
                self.grace_period
            );
            handle.force_termination();
            if handle.wait_timeout(self.grace_period).await.is_none() {
                warn!("execution for user {user} still running after forced termination");
            }
        }

        self.release(user, &handle);
        true
    }

    /// Cancel every entry concurrently and wait for all of them.
    ///
    /// Returns how many running executions were stopped.
    pub async fn cancel_all(&self) -> usize {
        let users = self.active_users();
        if users.is_empty() {
            return 0;
        }

        info!("cancelling {} active execution(s)", users.len());
        let results = join_all(users.into_iter().map(|user| self.cancel(user))).await;
        results.into_iter().filter(|cancelled| *cancelled).count()
    }
}
