//! Fire-and-forget task group for best-effort write-backs
//!
//! Search returns without awaiting salience writes. The tasks are tracked
//! here so a service can drain them on shutdown instead of dropping
//! in-flight writes when the runtime exits.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Bounded-lifetime group of detached background tasks
#[derive(Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task onto the current runtime.
    ///
    /// Finished tasks are reaped on every call, so the set only holds work
    /// that is still running.
    pub fn spawn<F>(&self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut tasks) = self.tasks.lock() else {
            warn!(task = name, "Background task set poisoned, dropping task");
            return;
        };
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                warn!(error = %e, "Background task panicked");
            }
        }
        tasks.spawn(task);
        debug!(task = name, pending = tasks.len(), "Background task scheduled");
    }

    /// Number of tasks not yet reaped
    pub fn pending(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Wait for every scheduled task to finish
    pub async fn flush(&self) {
        let mut tasks = self.take();
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                warn!(error = %e, "Background task panicked");
            }
        }
    }

    /// Drain in-flight tasks, aborting whatever is left after `timeout`.
    ///
    /// Returns the number of tasks that had to be aborted.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let mut tasks = self.take();
        let total = tasks.len();
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => {
                debug!(tasks = total, "Background tasks drained");
                0
            }
            Err(_) => {
                let remaining = tasks.len();
                warn!(remaining, timeout_ms = timeout.as_millis() as u64, "Aborting background tasks");
                tasks.abort_all();
                remaining
            }
        }
    }

    fn take(&self) -> JoinSet<()> {
        self.tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default()
    }
}
