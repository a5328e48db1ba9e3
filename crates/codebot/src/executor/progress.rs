//! Periodic "still working" notifications while an agent runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::process::ProcessHandle;

/// Receiver of status updates, typically something that edits a chat
/// message in place. Errors are logged and otherwise ignored.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update(&self, status: String) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> ProgressSink for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn update(&self, status: String) -> anyhow::Result<()> {
        (self)(status).await
    }
}

/// Cadence and wording of progress updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressConfig {
    pub interval: Duration,
    /// Updates stop after this many; the execution itself carries on.
    pub max_updates: usize,
    /// Rotated round-robin.
    pub statuses: Vec<String>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_updates: 20,
            statuses: default_statuses(),
        }
    }
}

pub fn default_statuses() -> Vec<String> {
    [
        "⏳ Claude думает...",
        "⚙️ Обрабатываю запрос...",
        "🔄 Анализирую...",
        "📊 Готовлю ответ...",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Background task bound to one process handle.
///
/// The task ends on its own when the process exits or the update cap is
/// reached. [`stop`](Self::stop) ends it early and waits for it; dropping
/// the notifier aborts it.
#[derive(Debug)]
pub struct ProgressNotifier {
    task: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

impl ProgressNotifier {
    pub fn spawn(
        handle: Arc<ProcessHandle>,
        sink: Arc<dyn ProgressSink>,
        config: ProgressConfig,
    ) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(run(handle, sink, config, token));

        Self {
            task: Some(task),
            stop,
        }
    }

    /// Stop sending updates and wait for the task to finish.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
            && err.is_panic()
        {
            debug!("progress task panicked: {err}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ProgressNotifier {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    handle: Arc<ProcessHandle>,
    sink: Arc<dyn ProgressSink>,
    config: ProgressConfig,
    token: CancellationToken,
) {
    if config.statuses.is_empty() {
        return;
    }

    let mut sent = 0;
    while sent < config.max_updates {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = handle.wait() => return,
            _ = tokio::time::sleep(config.interval) => {}
        }

        let status = config.statuses[sent % config.statuses.len()].clone();
        tokio::select! {
            _ = token.cancelled() => return,
            result = sink.update(status) => {
                if let Err(err) = result {
                    debug!("progress update failed: {err:#}");
                }
            }
        }
        sent += 1;
    }

    debug!("progress updates capped at {}", config.max_updates);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::process::ProcessExit;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(max_updates: usize) -> ProgressConfig {
        ProgressConfig {
            interval: Duration::from_millis(10),
            max_updates,
            ..ProgressConfig::default()
        }
    }

    #[tokio::test]
    async fn rotates_statuses_and_stops_at_cap() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |status: String| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(status);
                    Ok::<(), anyhow::Error>(())
                }
            }
        };

        let handle = Arc::new(ProcessHandle::new());
        let notifier = ProgressNotifier::spawn(Arc::clone(&handle), Arc::new(sink), fast(5));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(notifier.is_finished());
        assert!(handle.is_running());
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 5);
        let statuses = default_statuses();
        assert_eq!(seen[0], statuses[0]);
        assert_eq!(seen[4], statuses[0]);
        assert_eq!(seen[3], statuses[3]);
        notifier.stop().await;
    }

    #[tokio::test]
    async fn failing_sink_is_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = {
            let calls = Arc::clone(&calls);
            move |_status: String| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("message was deleted"))
                }
            }
        };

        let handle = Arc::new(ProcessHandle::new());
        let notifier = ProgressNotifier::spawn(handle, Arc::new(sink), fast(3));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        notifier.stop().await;
    }

    #[tokio::test]
    async fn ends_when_process_exits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = {
            let calls = Arc::clone(&calls);
            move |_status: String| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), anyhow::Error>(())
                }
            }
        };

        let handle = Arc::new(ProcessHandle::new());
        let config = ProgressConfig {
            interval: Duration::from_secs(60),
            ..ProgressConfig::default()
        };
        let notifier = ProgressNotifier::spawn(Arc::clone(&handle), Arc::new(sink), config);

        handle.mark_exited(ProcessExit::from_code(0));
        tokio::time::timeout(Duration::from_secs(1), async {
            while !notifier.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("notifier ends after exit");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_is_prompt() {
        let sink = |_status: String| async { Ok::<(), anyhow::Error>(()) };
        let handle = Arc::new(ProcessHandle::new());
        let config = ProgressConfig {
            interval: Duration::from_secs(60),
            ..ProgressConfig::default()
        };
        let notifier = ProgressNotifier::spawn(handle, Arc::new(sink), config);

        tokio::time::timeout(Duration::from_secs(1), notifier.stop())
            .await
            .expect("stop returns without waiting for the interval");
    }
}
