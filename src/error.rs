//! Error types for the handdoc library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`HandDocError`] (**operation-level**): one user action (upload, start
//!   processing, checkout, capture, export) could not complete. Every variant
//!   maps to a concrete [`NextAction`] so a caller never leaves the user at a
//!   dead end.
//!
//! * [`TransitionError`] (**lifecycle**): the requested event is not legal
//!   from the job's current state. Raised by [`crate::job::transition`]
//!   before anything is persisted.
//!
//! * [`StoreError`] (**persistence**): the key-value backing store could not
//!   be written. Read failures are never errors; an unreadable record is
//!   treated as "no job".
//!
//! Document normalization has no error type at all: malformed content always
//! degrades to an editable blank document.

use crate::job::{JobEvent, JobState};
use std::path::PathBuf;
use thiserror::Error;

/// What the user can do after a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Start over with a fresh upload.
    Reupload,
    /// Fix the input (file type, size, configuration) and try again.
    FixInput,
    /// Repeat the same operation; the failure was transient.
    Retry,
    /// Start the payment again; the job was left unpaid.
    RetryPayment,
    /// Export again from the paid state.
    RetryExport,
}

/// All operation-level errors returned by the handdoc library.
#[derive(Debug, Error)]
pub enum HandDocError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Upload file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Upload file could not be read.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Upload file type is not one the OCR backend accepts.
    #[error("Unsupported file type '{mime}' for '{path}'\nPlease upload PDF, JPG, PNG, or GIF files only.")]
    UnsupportedFileType { path: PathBuf, mime: String },

    /// Upload file exceeds the configured size limit.
    #[error("File '{path}' is {size} bytes; the limit is {limit} bytes")]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    /// A job id was empty or did not match the active job.
    #[error("Invalid job id '{job_id}'")]
    InvalidJobId { job_id: String },

    // ── Transient backend errors ──────────────────────────────────────────
    /// The request never produced an HTTP response (DNS, connect, reset).
    #[error("{operation} failed: {reason}")]
    Network { operation: String, reason: String },

    /// The backend answered with a non-success status.
    #[error("{operation} failed with HTTP {status}: {body}")]
    BackendStatus {
        operation: String,
        status: u16,
        body: String,
    },

    /// The operation exceeded its configured time budget.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    // ── Protocol / contract violations ────────────────────────────────────
    /// The backend answered, but not with what the contract promises.
    #[error("{operation}: unexpected backend response: {detail}")]
    ProtocolViolation { operation: String, detail: String },

    // ── Payment errors ────────────────────────────────────────────────────
    /// A checkout session could not be created.
    #[error("Unable to start payment: {reason}")]
    CheckoutFailed { reason: String },

    /// The gateway refused to capture an approved order.
    #[error("Payment capture failed for order '{order_id}': {reason}")]
    CaptureFailed { order_id: String, reason: String },

    /// A checkout is already underway for this job.
    #[error("A payment is already in progress")]
    PaymentInProgress,

    /// Export of a paid document failed; the job stays paid and can be exported again.
    #[error("Export of job '{job_id}' failed: {source}")]
    ExportFailed {
        job_id: String,
        #[source]
        source: Box<HandDocError>,
    },

    /// The backend refused a paid export; the job is not paid on the ledger.
    /// The job goes back to `ready` and can be paid for again.
    #[error("Export not authorised: payment for job '{job_id}' is not confirmed by the server")]
    ExportNotAuthorized { job_id: String },

    // ── Lifecycle errors ──────────────────────────────────────────────────
    /// There is no active job on this device.
    #[error("No active job. Upload a document first.")]
    NoActiveJob,

    /// The event is not legal from the job's current state.
    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    /// The job has no structured content yet.
    #[error("Job '{job_id}' has no document content yet")]
    MissingContent { job_id: String },

    /// The OCR backend reported that it could not process the job.
    #[error("Processing of job '{job_id}' failed: {reason}\nPlease upload the document again.")]
    ProcessingFailed { job_id: String, reason: String },

    /// The job was still processing when the poll ceiling was reached.
    #[error("Job '{job_id}' was not ready after {attempts} status checks\nPlease upload the document again.")]
    PollBudgetExhausted { job_id: String, attempts: u32 },

    /// The action needs a paid job.
    #[error("Job '{job_id}' has not been paid for yet")]
    PaymentRequired { job_id: String },

    /// The action does not exist for a job in this state.
    #[error("Cannot {action} a job in state '{state}'")]
    ActionNotAvailable {
        action: &'static str,
        state: JobState,
    },

    // ── Persistence ───────────────────────────────────────────────────────
    #[error(transparent)]
    Store(#[from] StoreError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not write an exported document.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandDocError {
    /// True for failures that may succeed if the same call is repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            HandDocError::Network { .. } | HandDocError::Timeout { .. } => true,
            HandDocError::BackendStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// The concrete step the user should take next.
    pub fn next_action(&self) -> NextAction {
        match self {
            HandDocError::FileNotFound { .. }
            | HandDocError::ReadFailed { .. }
            | HandDocError::UnsupportedFileType { .. }
            | HandDocError::FileTooLarge { .. }
            | HandDocError::InvalidConfig(_)
            | HandDocError::OutputWriteFailed { .. } => NextAction::FixInput,
            HandDocError::CheckoutFailed { .. }
            | HandDocError::CaptureFailed { .. }
            | HandDocError::PaymentInProgress
            | HandDocError::PaymentRequired { .. }
            | HandDocError::ExportNotAuthorized { .. } => NextAction::RetryPayment,
            HandDocError::ExportFailed { .. } => NextAction::RetryExport,
            HandDocError::InvalidJobId { .. }
            | HandDocError::NoActiveJob
            | HandDocError::MissingContent { .. }
            | HandDocError::ProcessingFailed { .. }
            | HandDocError::PollBudgetExhausted { .. }
            | HandDocError::ActionNotAvailable { .. }
            | HandDocError::ProtocolViolation { .. }
            | HandDocError::IllegalTransition(_) => NextAction::Reupload,
            e if e.is_transient() => NextAction::Retry,
            _ => NextAction::Reupload,
        }
    }
}

/// An event that is not legal from the job's current lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot apply {event:?} to a job in state {}", describe(.from))]
pub struct TransitionError {
    pub from: Option<JobState>,
    pub event: JobEvent,
}

fn describe(state: &Option<JobState>) -> String {
    match state {
        Some(s) => format!("'{}'", s.as_str()),
        None => "'(none)'".to_string(),
    }
}

/// Failure writing to the key-value store backing the job record.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to serialise job record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write state file '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove state file '{path}': {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_names_operation() {
        let e = HandDocError::Timeout {
            operation: "start processing".into(),
            secs: 90,
        };
        let msg = e.to_string();
        assert!(msg.contains("start processing"), "got: {msg}");
        assert!(msg.contains("90s"), "got: {msg}");
    }

    #[test]
    fn transient_classification() {
        assert!(HandDocError::Network {
            operation: "poll".into(),
            reason: "connection reset".into(),
        }
        .is_transient());
        assert!(HandDocError::BackendStatus {
            operation: "poll".into(),
            status: 503,
            body: String::new(),
        }
        .is_transient());
        assert!(!HandDocError::BackendStatus {
            operation: "upload".into(),
            status: 400,
            body: String::new(),
        }
        .is_transient());
        assert!(!HandDocError::NoActiveJob.is_transient());
    }

    #[test]
    fn every_failure_has_a_next_action() {
        assert_eq!(
            HandDocError::CaptureFailed {
                order_id: "o1".into(),
                reason: "declined".into(),
            }
            .next_action(),
            NextAction::RetryPayment
        );
        assert_eq!(
            HandDocError::Timeout {
                operation: "export".into(),
                secs: 60,
            }
            .next_action(),
            NextAction::Retry
        );
        assert_eq!(
            HandDocError::ProtocolViolation {
                operation: "poll".into(),
                detail: "ready without content".into(),
            }
            .next_action(),
            NextAction::Reupload
        );
        assert_eq!(
            HandDocError::FileTooLarge {
                path: PathBuf::from("a.png"),
                size: 20,
                limit: 10,
            }
            .next_action(),
            NextAction::FixInput
        );
    }

    #[test]
    fn export_failure_keeps_source() {
        let e = HandDocError::ExportFailed {
            job_id: "j1".into(),
            source: Box::new(HandDocError::Timeout {
                operation: "export".into(),
                secs: 60,
            }),
        };
        assert_eq!(e.next_action(), NextAction::RetryExport);
        assert!(e.to_string().contains("timed out"), "got: {e}");
    }

    #[test]
    fn transition_error_display() {
        let e = TransitionError {
            from: Some(JobState::Ready),
            event: JobEvent::ExportSucceeded,
        };
        assert!(e.to_string().contains("'ready'"), "got: {e}");

        let e = TransitionError {
            from: None,
            event: JobEvent::Enqueued,
        };
        assert!(e.to_string().contains("(none)"), "got: {e}");
    }
}
