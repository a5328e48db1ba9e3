//! Shared handle to one agent child process.
//!
//! The child itself is owned by the execution that spawned it. Everyone else
//! (registry, progress notifier, cancel callers) holds an `Arc<ProcessHandle>`
//! and talks to the child through it: exit state is published over a watch
//! channel, graceful termination is a signal, forced termination is a
//! request the owning execution acts on.

use std::process::ExitStatus;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use tokio::sync::{Notify, watch};

/// How a child process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number (unix only).
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Whether this exit is the result of a termination request.
    ///
    /// On unix that is death by SIGTERM or SIGINT, the shell forms of those
    /// (exit 143 and 130), or SIGKILL after termination was requested through
    /// the handle. Elsewhere there are no signals, so any failing exit after
    /// a request counts.
    pub fn is_termination(&self, requested: bool) -> bool {
        #[cfg(unix)]
        {
            matches!(self.signal, Some(libc::SIGTERM) | Some(libc::SIGINT))
                || matches!(self.code, Some(143) | Some(130))
                || (requested && self.signal == Some(libc::SIGKILL))
        }
        #[cfg(not(unix))]
        {
            requested && !self.success()
        }
    }

    /// Human-readable form, e.g. `exited with code 2`.
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(sig)) => match signal_name(sig) {
                Some(name) => format!("killed by {name} (signal {sig})"),
                None => format!("killed by signal {sig}"),
            },
            (None, None) => "exited (unknown status)".to_string(),
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

fn signal_name(sig: i32) -> Option<&'static str> {
    match sig {
        1 => Some("SIGHUP"),
        2 => Some("SIGINT"),
        6 => Some("SIGABRT"),
        9 => Some("SIGKILL"),
        11 => Some("SIGSEGV"),
        15 => Some("SIGTERM"),
        _ => None,
    }
}

/// Handle to a child process that may not have been spawned yet.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: OnceLock<u32>,
    exit: watch::Sender<Option<ProcessExit>>,
    termination_requested: AtomicBool,
    force: Notify,
}

impl Default for ProcessHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHandle {
    pub fn new() -> Self {
        Self {
            pid: OnceLock::new(),
            exit: watch::Sender::new(None),
            termination_requested: AtomicBool::new(false),
            force: Notify::new(),
        }
    }

    /// OS process id, once the child is spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// True until the exit has been recorded. A handle whose child is still
    /// being spawned counts as running.
    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    pub fn termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::SeqCst)
    }

    /// Ask the child to stop (SIGTERM). If the child has not been spawned
    /// yet, the signal is sent as soon as its pid is attached.
    pub fn request_termination(&self) {
        if !self.is_running() {
            return;
        }
        self.termination_requested.store(true, Ordering::SeqCst);

        #[cfg(unix)]
        if let Some(pid) = self.pid() {
            send_sigterm(pid);
        }

        #[cfg(not(unix))]
        self.force.notify_one();
    }

    /// Ask the owning execution to kill the child outright.
    pub fn force_termination(&self) {
        if !self.is_running() {
            return;
        }
        self.termination_requested.store(true, Ordering::SeqCst);
        self.force.notify_one();
    }

    /// Wait for the exit to be recorded.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_default(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => ProcessExit::default(),
        }
    }

    /// Like [`wait`](Self::wait), giving up after `limit`.
    pub async fn wait_timeout(&self, limit: Duration) -> Option<ProcessExit> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    pub(crate) fn attach(&self, pid: u32) {
        if self.pid.set(pid).is_err() {
            warn!("process handle already attached, ignoring pid {pid}");
            return;
        }

        #[cfg(unix)]
        if self.termination_requested() {
            debug!("delivering deferred termination to pid {pid}");
            send_sigterm(pid);
        }
    }

    pub(crate) fn mark_exited(&self, exit: ProcessExit) {
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(exit);
            true
        });
    }

    /// Resolves when [`force_termination`](Self::force_termination) is called.
    pub(crate) async fn force_requested(&self) {
        self.force.notified().await;
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(
            "SIGTERM to pid {pid} failed: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn describe_exit() {
        assert_eq!(ProcessExit::from_code(2).describe(), "exited with code 2");
        assert_eq!(
            ProcessExit::from_signal(9).describe(),
            "killed by SIGKILL (signal 9)"
        );
        assert_eq!(ProcessExit::from_signal(31).describe(), "killed by signal 31");
        assert_eq!(ProcessExit::default().describe(), "exited (unknown status)");
    }

    #[cfg(unix)]
    #[test]
    fn termination_mapping() {
        assert!(ProcessExit::from_signal(libc::SIGTERM).is_termination(false));
        assert!(ProcessExit::from_signal(libc::SIGINT).is_termination(false));
        assert!(ProcessExit::from_code(143).is_termination(false));
        assert!(ProcessExit::from_code(130).is_termination(false));
        assert!(!ProcessExit::from_signal(libc::SIGKILL).is_termination(false));
        assert!(ProcessExit::from_signal(libc::SIGKILL).is_termination(true));
        assert!(!ProcessExit::from_code(1).is_termination(true));
        assert!(!ProcessExit::from_code(0).is_termination(false));
    }

    #[tokio::test]
    async fn wait_sees_recorded_exit() {
        let handle = Arc::new(ProcessHandle::new());
        assert!(handle.is_running());
        assert_eq!(handle.wait_timeout(Duration::from_millis(20)).await, None);

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.wait().await })
        };
        handle.mark_exited(ProcessExit::from_code(3));
        handle.mark_exited(ProcessExit::from_code(4));

        assert_eq!(waiter.await.unwrap(), ProcessExit::from_code(3));
        assert!(!handle.is_running());
        assert_eq!(handle.exit(), Some(ProcessExit::from_code(3)));
    }

    #[tokio::test]
    async fn requests_after_exit_are_ignored() {
        let handle = ProcessHandle::new();
        handle.mark_exited(ProcessExit::from_code(0));
        handle.request_termination();
        handle.force_termination();
        assert!(!handle.termination_requested());
    }

    #[tokio::test]
    async fn force_request_is_remembered() {
        let handle = ProcessHandle::new();
        handle.force_termination();
        assert!(handle.termination_requested());
        tokio::time::timeout(Duration::from_secs(1), handle.force_requested())
            .await
            .expect("stored permit resolves immediately");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deferred_termination_reaches_child() {
        let handle = ProcessHandle::new();
        handle.request_termination();

        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        handle.attach(child.id().unwrap());

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        let exit = ProcessExit::from(status);
        assert_eq!(exit.signal, Some(libc::SIGTERM));
        assert!(exit.is_termination(handle.termination_requested()));
    }
}
