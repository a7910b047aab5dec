//! reqwest implementation of [`Backend`].

use super::{
    Backend, CaptureRequest, CaptureResponse, CheckoutRequest, CheckoutSession,
    DigitalExportRequest, EnqueueRequest, ExportRequest, JobStatusResponse, UploadFile,
    UploadResult,
};
use crate::config::ClientConfig;
use crate::error::HandDocError;
use crate::export::{file_name_from_disposition, ExportFormat, ExportedFile, DEFAULT_FILE_NAME};
use async_trait::async_trait;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const UPLOAD_PATH: &str = "/api/handwritten/upload";
const PROCESS_PATH: &str = "/api/handwritten/process";
const STATUS_PATH: &str = "/api/job-status";
const CHECKOUT_PATH: &str = "/api/checkout/create-session";
const CAPTURE_PATH: &str = "/api/paypal/capture";
const EXPORT_DOCX_PATH: &str = "/api/export-docx";
const EXPORT_PDF_PATH: &str = "/api/export-pdf";
const EXPORT_DIGITAL_PATH: &str = "/api/export-digital-docx";

/// Talks to the application backend over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    api_base: Url,
    export_base: Url,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &ClientConfig) -> Result<Self, HandDocError> {
        let parse = |url: &str| {
            Url::parse(url).map_err(|e| {
                HandDocError::InvalidConfig(format!("'{}' is not a URL: {}", url, e))
            })
        };
        let api_base = parse(&config.api_base)?;
        let export_base = match &config.export_url {
            Some(url) => parse(url)?,
            None => api_base.clone(),
        };

        // Per-operation budgets are enforced by the controller; this only
        // bounds connection setup.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| HandDocError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base,
            export_base,
            api_key: config.api_key.clone(),
        })
    }

    fn url(&self, base: &Url, path: &str) -> Result<Url, HandDocError> {
        base.join(path)
            .map_err(|e| HandDocError::Internal(format!("Bad endpoint path '{}': {}", path, e)))
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, HandDocError> {
        let request = match &self.api_key {
            Some(key) => request.header("x-api-key", key),
            None => request,
        };
        let response = request.send().await.map_err(|e| network_error(operation, e))?;
        debug!("{} → HTTP {}", operation, response.status());
        Ok(response)
    }

    async fn send_ok(&self, operation: &str, request: RequestBuilder) -> Result<Response, HandDocError> {
        let response = self.send(operation, request).await?;
        ensure_success(operation, response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: RequestBuilder,
    ) -> Result<T, HandDocError> {
        let response = self.send_ok(operation, request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| HandDocError::ProtocolViolation {
                operation: operation.to_string(),
                detail: e.to_string(),
            })
    }

    async fn read_file(
        &self,
        operation: &str,
        response: Response,
        fallback_name: &str,
    ) -> Result<ExportedFile, HandDocError> {
        let headers = response.headers();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let file_name = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(file_name_from_disposition)
            .unwrap_or_else(|| fallback_name.to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| network_error(operation, e))?;
        Ok(ExportedFile {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn upload(&self, file: UploadFile) -> Result<UploadResult, HandDocError> {
        let part = reqwest::multipart::Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.mime)
            .map_err(|e| HandDocError::Internal(format!("Bad upload MIME type: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let url = self.url(&self.api_base, UPLOAD_PATH)?;
        self.send_json("upload", self.client.post(url).multipart(form))
            .await
    }

    async fn enqueue(&self, request: &EnqueueRequest) -> Result<(), HandDocError> {
        let url = self.url(&self.api_base, PROCESS_PATH)?;
        self.send_ok("start processing", self.client.post(url).json(request))
            .await?;
        Ok(())
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, HandDocError> {
        let mut url = self.url(&self.api_base, STATUS_PATH)?;
        url.query_pairs_mut().append_pair("jobId", job_id);
        let response = self.send("poll status", self.client.get(url)).await?;
        // The job is not registered yet.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(JobStatusResponse::queued());
        }
        let response = ensure_success("poll status", response).await?;
        response
            .json()
            .await
            .map_err(|e| HandDocError::ProtocolViolation {
                operation: "poll status".to_string(),
                detail: e.to_string(),
            })
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, HandDocError> {
        let url = self.url(&self.api_base, CHECKOUT_PATH)?;
        self.send_json("checkout", self.client.post(url).json(request))
            .await
            .map_err(|e| match e {
                HandDocError::ProtocolViolation { .. } => e,
                other => HandDocError::CheckoutFailed {
                    reason: other.to_string(),
                },
            })
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureResponse, HandDocError> {
        let url = self.url(&self.api_base, CAPTURE_PATH)?;
        self.send_json("capture", self.client.post(url).json(request))
            .await
    }

    async fn export(&self, request: &ExportRequest) -> Result<ExportedFile, HandDocError> {
        let path = match request.format {
            ExportFormat::Docx => EXPORT_DOCX_PATH,
            ExportFormat::Pdf => EXPORT_PDF_PATH,
        };
        let url = self.url(&self.export_base, path)?;
        let response = self.send("export", self.client.post(url).json(request)).await?;
        if !request.watermark
            && matches!(
                response.status(),
                StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN
            )
        {
            return Err(HandDocError::ExportNotAuthorized {
                job_id: request.job_id.clone(),
            });
        }
        let response = ensure_success("export", response).await?;
        self.read_file("export", response, &request.file_name).await
    }

    async fn export_digital(
        &self,
        request: &DigitalExportRequest,
    ) -> Result<ExportedFile, HandDocError> {
        let url = self.url(&self.api_base, EXPORT_DIGITAL_PATH)?;
        let response = self
            .send_ok("digital export", self.client.post(url).json(request))
            .await?;
        let fallback = format!("{}.docx", DEFAULT_FILE_NAME);
        self.read_file("digital export", response, &fallback).await
    }
}

async fn ensure_success(operation: &str, response: Response) -> Result<Response, HandDocError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(HandDocError::BackendStatus {
        operation: operation.to_string(),
        status: status.as_u16(),
        body: truncate(&body, 300),
    })
}

fn network_error(operation: &str, e: reqwest::Error) -> HandDocError {
    HandDocError::Network {
        operation: operation.to_string(),
        reason: e.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_default_config() {
        let backend = HttpBackend::new(&ClientConfig::default()).unwrap();
        let url = backend.url(&backend.api_base, STATUS_PATH).unwrap();
        assert_eq!(url.as_str(), "http://localhost:3000/api/job-status");
        assert_eq!(backend.export_base, backend.api_base);
    }

    #[test]
    fn export_url_overrides_base() {
        let config = ClientConfig::builder()
            .export_url("http://export.internal:8000")
            .build()
            .unwrap();
        let backend = HttpBackend::new(&config).unwrap();
        let url = backend.url(&backend.export_base, EXPORT_PDF_PATH).unwrap();
        assert_eq!(url.as_str(), "http://export.internal:8000/api/export-pdf");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("ok", 10), "ok");
    }
}
