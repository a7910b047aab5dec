//! External collaborators: OCR, export and payment endpoints.
//!
//! The [`Backend`] trait is the seam between the lifecycle controller and the
//! network. [`HttpBackend`] talks to the real services; tests substitute an
//! in-process fake.
//!
//! Wire types mirror the JSON the services exchange. Status responses are
//! read leniently because several backend generations are deployed.

pub mod http;

pub use http::HttpBackend;

use crate::error::HandDocError;
use crate::export::{ExportFormat, ExportedFile};
use crate::document::StructuredDocument;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Every call the controller makes to the outside world.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store the uploaded file and classify it as scanned or digital.
    async fn upload(&self, file: UploadFile) -> Result<UploadResult, HandDocError>;

    /// Queue OCR for an uploaded job.
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<(), HandDocError>;

    /// Current processing status of a job.
    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, HandDocError>;

    /// Open a checkout with whichever gateway the server selects.
    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, HandDocError>;

    /// Finalise an approved redirect-gateway order.
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureResponse, HandDocError>;

    /// Render a document. Paid exports are authorised by the server, not the client.
    async fn export(&self, request: &ExportRequest) -> Result<ExportedFile, HandDocError>;

    /// Convert a digital PDF straight to DOCX.
    async fn export_digital(
        &self,
        request: &DigitalExportRequest,
    ) -> Result<ExportedFile, HandDocError>;
}

// ── Upload ──────────────────────────────────────────────────────────────────

/// A validated file ready to send.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    Digital,
    Scanned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub mode: UploadMode,
    /// Present for scanned uploads only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub file_path: String,
}

// ── Processing ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub job_id: String,
    pub file_path: String,
    pub strict: bool,
}

/// Status values reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStatus {
    Queued,
    Processing,
    #[serde(alias = "completed", alias = "complete")]
    Ready,
    #[serde(alias = "failed")]
    Error,
    /// Set by the payment webhook once the server has seen the payment.
    Paid,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    #[serde(alias = "status")]
    pub state: RemoteStatus,
    /// Raw document content; normalized by the controller.
    #[serde(default)]
    pub content_json: Option<serde_json::Value>,
    #[serde(default)]
    pub word_count: Option<usize>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl JobStatusResponse {
    /// What an unknown (not yet registered) job looks like.
    pub fn queued() -> Self {
        Self {
            state: RemoteStatus::Queued,
            content_json: None,
            word_count: None,
            processing_time: None,
            error: None,
        }
    }

    /// True when the response carries a document to show.
    pub fn has_content(&self) -> bool {
        self.content_json.as_ref().is_some_and(|v| !v.is_null())
    }
}

// ── Payment ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: u64,
    pub currency: String,
}

/// A checkout, tagged by the gateway the server picked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "gateway")]
pub enum CheckoutSession {
    /// Synchronous modal checkout, confirmed by a client-side callback.
    #[serde(rename = "razorpay", alias = "A")]
    Modal { key: String, order: GatewayOrder },
    /// Full-page redirect to the gateway, confirmed by a capture call on return.
    #[serde(rename = "paypal", alias = "B", rename_all = "camelCase")]
    Redirect {
        #[serde(default)]
        approve_url: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CaptureResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

// ── Export ──────────────────────────────────────────────────────────────────

/// Body of an export call. It carries no payment flag; the server checks its own ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub job_id: String,
    pub content_json: StructuredDocument,
    pub file_name: String,
    pub template_slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub design_key: Option<String>,
    pub brand: Option<serde_json::Value>,
    pub signatory: Option<serde_json::Value>,
    /// Preview render with a visible overlay.
    pub watermark: bool,
    #[serde(skip)]
    pub format: ExportFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitalExportRequest {
    pub file_path: String,
}
