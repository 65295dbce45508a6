//! Supervisor for the exporter background loops.
//!
//! A [`TaskGroup`] owns every loop spawned by the exporters plus one shared
//! cancellation signal. `shutdown` broadcasts the signal once, then joins
//! every loop and reports the first error any of them returned. The group
//! is created lazily by the metrics reporter only when at least one loop
//! exists, so stopping a reporter that never started (or had nothing to
//! run) can never block on a signal nobody is listening to.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::MetricsError;

struct Task {
    name: &'static str,
    handle: JoinHandle<Result<(), MetricsError>>,
}

/// A set of cooperatively-cancelled background loops.
pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: Vec<Task>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self { cancel: CancellationToken::new(), tasks: Vec::new() }
    }

    /// Number of registered loops.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn a loop. The closure receives the group's cancellation token
    /// and must observe it at least once per tick interval.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<(), MetricsError>> + Send + 'static,
    {
        debug!(task = name, "spawning exporter loop");
        let handle = tokio::spawn(f(self.cancel.clone()));
        self.tasks.push(Task { name, handle });
    }

    /// Broadcast cancellation without waiting for the loops to exit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel every loop, wait for all of them to exit, and return the
    /// first error any loop produced.
    pub async fn shutdown(mut self) -> Result<(), MetricsError> {
        self.cancel.cancel();
        let mut first_error = None;
        for task in std::mem::take(&mut self.tasks) {
            let outcome = match task.handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => Err(MetricsError::LoopFailed {
                    task: task.name,
                    message: join_error.to_string(),
                }),
            };
            if let Err(error) = outcome {
                warn!(task = task.name, error = %error, "exporter loop exited with error");
                first_error.get_or_insert(error);
            } else {
                debug!(task = task.name, "exporter loop exited cleanly");
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        // Best-effort: a dropped group must not leave loops running.
        if !self.tasks.is_empty() && !self.cancel.is_cancelled() {
            warn!("task group dropped while loops are running; cancelling");
            self.cancel.cancel();
        }
    }
}
