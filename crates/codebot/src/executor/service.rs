//! Execution service: one agent process per request.
//!
//! `execute` builds the prompt, claims the user's registry slot, spawns the
//! agent with the prompt on stdin, and waits for whichever comes first: the
//! agent finishing, the request deadline, cancellation of the caller, or a
//! forced termination from the registry. The slot is released and the
//! progress notifier stopped on every path out, including the future being
//! dropped midway.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::error::{ExecError, RegistryError};
use super::models::{ExecutionRequest, ExecutionResult};
use super::process::{ProcessExit, ProcessHandle};
use super::progress::{ProgressConfig, ProgressNotifier, ProgressSink};
use super::registry::{DEFAULT_GRACE_PERIOD, ProcessRegistry, UserId};
use crate::prompt::{PromptConfig, build_prompt, detect_execution_intent};

/// Settings shared by every execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Agent executable, started without arguments.
    pub agent_binary: PathBuf,
    /// Wait between a termination request and a forced kill on timeout.
    pub grace_period: Duration,
    pub progress: ProgressConfig,
    pub prompt: PromptConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            agent_binary: PathBuf::from("claude"),
            grace_period: DEFAULT_GRACE_PERIOD,
            progress: ProgressConfig::default(),
            prompt: PromptConfig::default(),
        }
    }
}

/// Runs agent executions against a shared [`ProcessRegistry`].
#[derive(Debug)]
pub struct ExecutionService {
    config: ExecutorConfig,
    registry: Arc<ProcessRegistry>,
    shutdown: CancellationToken,
}

/// How waiting on the child ended.
enum Waited {
    Finished(io::Result<(ExitStatus, Vec<u8>, Vec<u8>)>),
    TimedOut,
    Aborted,
    Forced,
}

impl ExecutionService {
    pub fn new(config: ExecutorConfig, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            config,
            registry,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn is_active(&self, user: UserId) -> bool {
        self.registry.is_active(user)
    }

    /// Cancel the user's running execution, if any.
    pub async fn cancel(&self, user: UserId) -> bool {
        self.registry.cancel(user).await
    }

    /// Run one request. Cancelled by [`shutdown`](Self::shutdown).
    ///
    /// The only error is a second request for a user whose previous one is
    /// still running; every other failure is an [`ExecutionResult`].
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<ExecutionResult, RegistryError> {
        let cancel = self.shutdown.child_token();
        self.execute_with_cancel(request, progress, &cancel).await
    }

    /// Like [`execute`](Self::execute), also stopping when `cancel` fires.
    /// The child is killed without waiting in that case.
    pub async fn execute_with_cancel(
        &self,
        request: &ExecutionRequest,
        progress: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, RegistryError> {
        let user = request.user;
        let needs_execution = detect_execution_intent(&request.message);
        let prompt = build_prompt(
            &self.config.prompt,
            &request.message,
            &request.history,
            needs_execution,
        );
        info!(
            "executing agent for user {user}, prompt length {}, execution allowed: {needs_execution}",
            prompt.chars().count()
        );

        let handle = Arc::new(ProcessHandle::new());
        self.registry.register(user, Arc::clone(&handle))?;
        let _slot = RegistrySlot {
            registry: &self.registry,
            user,
            handle: Arc::clone(&handle),
        };

        let started = Instant::now();
        let mut child = match self.spawn(&request.working_directory) {
            Ok(child) => child,
            Err(err) => {
                error!("{err}");
                handle.mark_exited(ProcessExit::default());
                return Ok(ExecutionResult::error(err.to_string(), started.elapsed()));
            }
        };
        if let Some(pid) = child.id() {
            debug!("agent for user {user} started with pid {pid}");
            handle.attach(pid);
        }

        let notifier = progress.map(|sink| {
            ProgressNotifier::spawn(Arc::clone(&handle), sink, self.config.progress.clone())
        });

        let waited = tokio::select! {
            result = communicate(&mut child, prompt) => Waited::Finished(result),
            _ = tokio::time::sleep(request.timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Aborted,
            _ = handle.force_requested() => Waited::Forced,
        };

        let result = match waited {
            Waited::Finished(Ok((status, stdout, stderr))) => {
                let exit = ProcessExit::from(status);
                handle.mark_exited(exit);
                classify(user, exit, &handle, &stdout, &stderr, started.elapsed())
            }
            Waited::Finished(Err(err)) => {
                let err = ExecError::Io(err);
                error!("agent for user {user}: {err}");
                let exit = self.kill(&mut child).await;
                handle.mark_exited(exit);
                ExecutionResult::error(err.to_string(), started.elapsed())
            }
            Waited::TimedOut => {
                warn!(
                    "agent for user {user} timed out after {:?}, terminating",
                    request.timeout
                );
                let exit = self.terminate(&mut child, &handle).await;
                handle.mark_exited(exit);
                ExecutionResult::timeout(request.timeout, started.elapsed())
            }
            Waited::Forced => {
                info!("agent for user {user} force-terminated");
                let exit = self.kill(&mut child).await;
                handle.mark_exited(exit);
                ExecutionResult::cancelled(started.elapsed())
            }
            Waited::Aborted => {
                info!("execution for user {user} aborted by caller");
                if let Err(err) = child.start_kill() {
                    debug!("kill after abort failed: {err}");
                }
                let exit = child
                    .try_wait()
                    .ok()
                    .flatten()
                    .map(ProcessExit::from)
                    .unwrap_or_default();
                handle.mark_exited(exit);
                ExecutionResult::cancelled(started.elapsed())
            }
        };

        if let Some(notifier) = notifier {
            notifier.stop().await;
        }

        Ok(result)
    }

    /// Cancel every running execution and wait until they are gone.
    pub async fn shutdown(&self) -> usize {
        info!("shutting down execution service");
        self.shutdown.cancel();
        self.registry.cancel_all().await
    }

    fn spawn(&self, working_directory: &Path) -> Result<Child, ExecError> {
        Command::new(&self.config.agent_binary)
            .current_dir(working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                binary: self.config.agent_binary.clone(),
                source,
            })
    }

    /// Graceful stop: SIGTERM, wait out the grace period, then kill.
    async fn terminate(&self, child: &mut Child, handle: &ProcessHandle) -> ProcessExit {
        handle.request_termination();
        match tokio::time::timeout(self.config.grace_period, child.wait()).await {
            Ok(Ok(status)) => ProcessExit::from(status),
            Ok(Err(err)) => {
                warn!("waiting for terminated agent failed: {err}");
                ProcessExit::default()
            }
            Err(_) => {
                warn!(
                    "agent ignored termination for {:?}, killing",
                    self.config.grace_period
                );
                self.kill(child).await
            }
        }
    }

    /// Kill and reap, bounded by the grace period.
    async fn kill(&self, child: &mut Child) -> ProcessExit {
        if let Err(err) = child.start_kill() {
            debug!("kill failed, process may be gone: {err}");
        }
        match tokio::time::timeout(self.config.grace_period, child.wait()).await {
            Ok(Ok(status)) => ProcessExit::from(status),
            Ok(Err(err)) => {
                warn!("waiting for killed agent failed: {err}");
                ProcessExit::default()
            }
            Err(_) => {
                warn!("agent did not exit after kill");
                ProcessExit::default()
            }
        }
    }
}

fn classify(
    user: UserId,
    exit: ProcessExit,
    handle: &ProcessHandle,
    stdout: &[u8],
    stderr: &[u8],
    elapsed: Duration,
) -> ExecutionResult {
    if exit.success() {
        let output = String::from_utf8_lossy(stdout).into_owned();
        info!(
            "agent for user {user} answered with {} chars in {}ms",
            output.chars().count(),
            elapsed.as_millis()
        );
        return ExecutionResult::success(output, elapsed);
    }

    if exit.is_termination(handle.termination_requested()) {
        info!("agent for user {user} was terminated ({})", exit.describe());
        return ExecutionResult::cancelled(elapsed);
    }

    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim_end();
    error!("agent for user {user} {}: {stderr}", exit.describe());

    let message = if !stderr.trim().is_empty() {
        stderr.to_string()
    } else {
        match exit.code {
            Some(code) => format!("agent exited with code {code}"),
            None => format!("agent {}", exit.describe()),
        }
    };
    ExecutionResult::error(message, elapsed)
}

/// Feed the prompt, drain both output streams, and reap the child.
async fn communicate(
    child: &mut Child,
    prompt: String,
) -> io::Result<(ExitStatus, Vec<u8>, Vec<u8>)> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let write = async move {
        if let Some(mut stdin) = stdin {
            match stdin.write_all(prompt.as_bytes()).await {
                // The agent may exit without reading its input.
                Err(err) if err.kind() != io::ErrorKind::BrokenPipe => return Err(err),
                _ => {}
            }
        }
        Ok(())
    };

    let (written, out, err) = tokio::join!(write, read_all(stdout), read_all(stderr));
    written?;
    let status = child.wait().await?;
    Ok((status, out?, err?))
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Releases the user's registry entry when an execution ends, however it
/// ends.
struct RegistrySlot<'a> {
    registry: &'a ProcessRegistry,
    user: UserId,
    handle: Arc<ProcessHandle>,
}

impl Drop for RegistrySlot<'_> {
    fn drop(&mut self) {
        if self.handle.is_running() {
            self.handle.mark_exited(ProcessExit::default());
        }
        if self.registry.release(self.user, &self.handle) {
            debug!("released registry entry for user {}", self.user);
        }
    }
}
