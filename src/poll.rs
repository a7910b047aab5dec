//! Cancellable handle for a background polling task.
//!
//! Dropping the handle aborts the task, so a poller can never outlive the
//! owner that started it.

use tokio::task::JoinHandle;
use tracing::debug;

/// Owns a spawned poll loop.
#[derive(Debug)]
pub struct PollHandle<T> {
    job_id: String,
    task: Option<JoinHandle<T>>,
}

impl<T> PollHandle<T> {
    pub(crate) fn new(job_id: impl Into<String>, task: JoinHandle<T>) -> Self {
        Self {
            job_id: job_id.into(),
            task: Some(task),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Stop polling now. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!("Cancelling poll for job {}", self.job_id);
            }
            task.abort();
        }
    }

    /// Wait for the loop to finish on its own.
    ///
    /// Returns `None` if the task was cancelled or panicked.
    pub async fn join(mut self) -> Option<T> {
        let task = self.task.take()?;
        task.await.ok()
    }
}

impl<T> Drop for PollHandle<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
