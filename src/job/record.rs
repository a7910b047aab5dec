//! The persisted record of the single active job.

use super::state::{transition, JobEvent, JobState};
use crate::document::StructuredDocument;
use crate::error::TransitionError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// How the job's content was produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobSource {
    /// Photographed or scanned pages sent through OCR.
    #[default]
    Scanned,
    /// A PDF with extractable text; OCR is skipped.
    DigitalPdf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gateway {
    /// Modal checkout confirmed in the client.
    Razorpay,
    /// Redirect checkout confirmed by a capture call.
    Paypal,
}

/// Proof that the client observed a payment confirmation.
///
/// This is a hint for the UI only. The backend decides whether a paid export
/// is authorised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub gateway: Gateway,
    pub order_id: String,
    pub confirmed_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Processing,
    Export,
}

/// Why the job entered `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage: FailureStage,
    pub message: String,
}

/// One conversion job, as stored on this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_json: Option<StructuredDocument>,
    #[serde(default)]
    pub file_path: String,
    #[serde(default = "default_strict")]
    pub strict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_count: Option<usize>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub source: JobSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<JobFailure>,
}

fn default_strict() -> bool {
    true
}

impl JobRecord {
    /// A freshly uploaded job.
    pub fn new(
        job_id: impl Into<String>,
        file_path: impl Into<String>,
        source: JobSource,
        strict: bool,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            state: JobState::Uploaded,
            content_json: None,
            file_path: file_path.into(),
            strict,
            word_count: None,
            created_at: now_millis(),
            processing_time: None,
            source,
            payment: None,
            last_failure: None,
        }
    }

    /// Move the record through `event`.
    ///
    /// Leaving `error` clears the failure. `RetryExport` is only legal after an
    /// export failure, and `Reset` is rejected because clearing a job is the
    /// store's job.
    pub fn apply(&mut self, event: JobEvent) -> Result<JobState, TransitionError> {
        let reject = || TransitionError {
            from: Some(self.state),
            event,
        };
        if event == JobEvent::RetryExport
            && !matches!(
                self.last_failure,
                Some(JobFailure {
                    stage: FailureStage::Export,
                    ..
                })
            )
        {
            return Err(reject());
        }
        let next = transition(Some(self.state), &event)?.ok_or_else(reject)?;
        if next != JobState::Error {
            self.last_failure = None;
        }
        self.state = next;
        Ok(next)
    }

    /// Apply a failure event and remember why it happened.
    pub fn fail(
        &mut self,
        event: JobEvent,
        stage: FailureStage,
        message: impl Into<String>,
    ) -> Result<JobState, TransitionError> {
        let next = self.apply(event)?;
        self.last_failure = Some(JobFailure {
            stage,
            message: message.into(),
        });
        Ok(next)
    }

    pub fn is_paid(&self) -> bool {
        matches!(self.state, JobState::Paid | JobState::Exporting)
    }
}

/// A shallow partial update for [`JobStore::patch`](super::JobStore::patch).
///
/// `job_id` is accepted so callers can pass whole objects through, but it is
/// never applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub job_id: Option<String>,
    pub state: Option<JobState>,
    pub content_json: Option<StructuredDocument>,
    pub file_path: Option<String>,
    pub strict: Option<bool>,
    pub word_count: Option<usize>,
    pub processing_time: Option<f64>,
    pub source: Option<JobSource>,
    pub payment: Option<PaymentReceipt>,
    pub last_failure: Option<JobFailure>,
}

impl JobPatch {
    pub(crate) fn merge_into(self, record: &mut JobRecord) {
        let JobPatch {
            job_id: _,
            state,
            content_json,
            file_path,
            strict,
            word_count,
            processing_time,
            source,
            payment,
            last_failure,
        } = self;
        if let Some(v) = state {
            record.state = v;
        }
        if let Some(v) = content_json {
            record.content_json = Some(v);
        }
        if let Some(v) = file_path {
            record.file_path = v;
        }
        if let Some(v) = strict {
            record.strict = v;
        }
        if let Some(v) = word_count {
            record.word_count = Some(v);
        }
        if let Some(v) = processing_time {
            record.processing_time = Some(v);
        }
        if let Some(v) = source {
            record.source = v;
        }
        if let Some(v) = payment {
            record.payment = Some(v);
        }
        if let Some(v) = last_failure {
            record.last_failure = Some(v);
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
