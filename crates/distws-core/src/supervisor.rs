//! Supervised set of delivery tasks.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;

/// Outcome of shutting down a [`TaskSet`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished within the grace period.
    pub completed: usize,
    /// Tasks that were still running and got aborted.
    pub cancelled: usize,
}

/// Tracks in-flight delivery tasks so they can be joined or cancelled
/// together.
///
/// Finished tasks are reaped whenever a new one is spawned, so the set only
/// holds work that may still be running.
#[derive(Default)]
pub struct TaskSet {
    tasks: Mutex<JoinSet<()>>,
}

impl TaskSet {
    /// Create an empty task set.
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn a task onto the current runtime and track it.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while let Some(result) = tasks.try_join_next() {
            log_join_error(result);
        }
        tasks.spawn(task);
    }

    /// Number of tracked tasks, including finished ones not yet reaped.
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether no tasks are tracked.
    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Wait up to `grace` for tracked tasks to finish, then abort the rest.
    ///
    /// Tasks spawned while this runs land in a fresh set and are not waited
    /// on.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let mut report = ShutdownReport::default();

        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                log_join_error(result);
                report.completed += 1;
            }
        })
        .await;

        if drained.is_err() {
            report.cancelled = tasks.len();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        report
    }
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!(error = %e, "delivery task panicked");
        }
    }
}
