//! Lifecycle-observer trait for job events.
//!
//! Inject an [`Arc<dyn LifecycleObserver>`] via
//! [`crate::config::ClientConfigBuilder::observer`] to hear about state
//! changes, poll ticks and failures as the controller drives a job. The CLI
//! uses this to drive its spinner; a UI layer would re-render from it.
//!
//! # Example
//!
//! ```rust
//! use handdoc::{ClientConfig, LifecycleObserver};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingObserver {
//!     polls: AtomicUsize,
//! }
//!
//! impl LifecycleObserver for CountingObserver {
//!     fn on_poll(&self, _job_id: &str, attempt: u32, max_polls: u32) {
//!         self.polls.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("poll {}/{}", attempt, max_polls);
//!     }
//! }
//!
//! let observer = Arc::new(CountingObserver { polls: AtomicUsize::new(0) });
//! let config = ClientConfig::builder()
//!     .observer(observer as Arc<dyn LifecycleObserver>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::NextAction;
use crate::job::JobState;
use std::sync::Arc;

/// Called by the controller as a job moves through its lifecycle.
///
/// Polling runs on a spawned task, so implementations must be `Send + Sync`.
/// No controller lock is held during a call, so an observer may call back
/// into the controller. All methods default to no-ops.
pub trait LifecycleObserver: Send + Sync {
    /// The job moved between states. `None` means "no job".
    fn on_state_change(&self, job_id: &str, from: Option<JobState>, to: Option<JobState>) {
        let _ = (job_id, from, to);
    }

    /// A status poll is about to be sent.
    ///
    /// # Arguments
    /// * `attempt`  : 1-indexed poll number
    /// * `max_polls`: the configured ceiling
    fn on_poll(&self, job_id: &str, attempt: u32, max_polls: u32) {
        let _ = (job_id, attempt, max_polls);
    }

    /// A poll result arrived too late to matter and was dropped.
    fn on_stale_result(&self, job_id: &str, reason: &str) {
        let _ = (job_id, reason);
    }

    /// Normalized content was cached for preview.
    fn on_content_ready(&self, job_id: &str, word_count: usize) {
        let _ = (job_id, word_count);
    }

    /// An operation failed; `next` is what the user should do about it.
    fn on_failure(&self, job_id: Option<&str>, error: &str, next: NextAction) {
        let _ = (job_id, error, next);
    }
}

/// The default when no observer is configured.
pub struct NoopObserver;

impl LifecycleObserver for NoopObserver {}

/// Convenience alias matching the type stored in [`crate::config::ClientConfig`].
pub type Observer = Arc<dyn LifecycleObserver>;
