//! Export options, filename sanitisation, and the exported artifact.

use crate::error::HandDocError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default download name when the user supplies none.
pub const DEFAULT_FILE_NAME: &str = "Converted_Document";
pub const DEFAULT_TEMPLATE: &str = "default";
const MAX_FILE_NAME_LEN: usize = 200;

const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Anything outside printable ASCII, plus characters that break paths or headers.
static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^\x20-\x7E]|[/\\:*?"<>|]"#).expect("valid regex"));

static DISPOSITION_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)filename(\*)?\s*=\s*(?:UTF-8'')?"?([^";]+)"?"#).expect("valid regex")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Docx,
    Pdf,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Docx => "docx",
            ExportFormat::Pdf => "pdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Docx => DOCX_CONTENT_TYPE,
            ExportFormat::Pdf => PDF_CONTENT_TYPE,
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = HandDocError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docx" | "word" => Ok(ExportFormat::Docx),
            "pdf" => Ok(ExportFormat::Pdf),
            other => Err(HandDocError::InvalidConfig(format!(
                "unknown export format '{}', expected docx or pdf",
                other
            ))),
        }
    }
}

/// Caller-chosen presentation of an export.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Unsanitised; see [`sanitize_file_name`].
    pub file_name: Option<String>,
    pub template_slug: String,
    pub design_key: Option<String>,
    pub brand: Option<serde_json::Value>,
    pub signatory: Option<serde_json::Value>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Docx,
            file_name: None,
            template_slug: DEFAULT_TEMPLATE.to_string(),
            design_key: None,
            brand: None,
            signatory: None,
        }
    }
}

impl ExportOptions {
    /// The sanitised download name, extension included.
    pub fn resolved_file_name(&self) -> String {
        sanitize_file_name(
            self.file_name.as_deref().unwrap_or(DEFAULT_FILE_NAME),
            self.format,
        )
    }
}

/// Reduce a user-supplied name to a safe ASCII file name with the right extension.
///
/// Non-printable and non-ASCII characters and path/header metacharacters
/// become `_`. An empty result falls back to [`DEFAULT_FILE_NAME`].
pub fn sanitize_file_name(name: &str, format: ExportFormat) -> String {
    let ext = format.extension();
    let cleaned = UNSAFE_CHARS.replace_all(name.trim(), "_");
    let mut stem = cleaned.trim().to_string();

    let suffix = format!(".{}", ext);
    if stem.to_ascii_lowercase().ends_with(&suffix) {
        stem.truncate(stem.len() - suffix.len());
    }
    let mut stem = stem.trim_matches('.').trim().to_string();
    if stem.is_empty() {
        stem = DEFAULT_FILE_NAME.to_string();
    }
    // ASCII only at this point, so byte truncation is safe.
    stem.truncate(MAX_FILE_NAME_LEN - suffix.len());
    format!("{}{}", stem, suffix)
}

/// Pull the file name out of a `Content-Disposition` header value.
///
/// Extended (`filename*=UTF-8''…`) values are percent-decoded. The result is
/// whatever the server sent; see [`download_file_name`] before using it.
pub fn file_name_from_disposition(header: &str) -> Option<String> {
    let caps = DISPOSITION_NAME.captures(header)?;
    let value = caps.get(2)?.as_str().trim();
    let name = if caps.get(1).is_some() {
        urlencoding::decode(value).unwrap_or(Cow::Borrowed(value))
    } else {
        Cow::Borrowed(value)
    };
    Some(name.trim().to_string()).filter(|s| !s.is_empty())
}

/// Reduce a server-supplied name to a bare, safe file name.
///
/// Directory parts are dropped before [`sanitize_file_name`] runs. The
/// extension follows the name, or the content type when the name has none.
pub fn download_file_name(raw: &str, content_type: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let lower = base.to_ascii_lowercase();
    let format = if lower.ends_with(".pdf") {
        ExportFormat::Pdf
    } else if lower.ends_with(".docx") {
        ExportFormat::Docx
    } else if content_type.to_ascii_lowercase().contains("pdf") {
        ExportFormat::Pdf
    } else {
        ExportFormat::Docx
    };
    sanitize_file_name(base, format)
}

/// A rendered document returned by the export backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ExportedFile {
    /// Reject anything that is not a Word or PDF document, and make the file
    /// name safe to write.
    pub fn into_document(mut self, operation: &str) -> Result<Self, HandDocError> {
        let ct = self.content_type.to_ascii_lowercase();
        if ct.contains("officedocument") || ct.contains("msword") || ct.contains("pdf") {
            self.file_name = download_file_name(&self.file_name, &self.content_type);
            Ok(self)
        } else {
            Err(HandDocError::ProtocolViolation {
                operation: operation.to_string(),
                detail: format!("expected a DOCX or PDF document, got '{}'", self.content_type),
            })
        }
    }

    /// Write into `dir` atomically (temp file + rename) and return the final path.
    pub async fn write_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf, HandDocError> {
        let dir = dir.as_ref();
        let path = dir.join(&self.file_name);
        let write_err = |source| HandDocError::OutputWriteFailed {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(dir).await.map_err(write_err)?;
        let tmp_path = dir.join(format!(".{}.tmp", self.file_name));
        tokio::fs::write(&tmp_path, &self.bytes)
            .await
            .map_err(write_err)?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(write_err)?;

        info!("Wrote {} ({} bytes)", path.display(), self.bytes.len());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_non_ascii_and_separators() {
        assert_eq!(
            sanitize_file_name("Résumé – final", ExportFormat::Docx),
            "R_sum_ _ final.docx"
        );
        assert_eq!(
            sanitize_file_name("../../etc/passwd", ExportFormat::Pdf),
            "_.._etc_passwd.pdf"
        );
    }

    #[test]
    fn keeps_single_extension() {
        assert_eq!(sanitize_file_name("report.DOCX", ExportFormat::Docx), "report.docx");
        assert_eq!(sanitize_file_name("report.docx", ExportFormat::Pdf), "report.docx.pdf");
    }

    #[test]
    fn empty_names_fall_back() {
        assert_eq!(sanitize_file_name("   ", ExportFormat::Docx), "Converted_Document.docx");
        assert_eq!(sanitize_file_name(".docx", ExportFormat::Docx), "Converted_Document.docx");
    }

    #[test]
    fn long_names_are_capped() {
        let name = sanitize_file_name(&"a".repeat(500), ExportFormat::Docx);
        assert_eq!(name.len(), MAX_FILE_NAME_LEN);
        assert!(name.ends_with(".docx"));
    }

    #[test]
    fn parses_content_disposition() {
        assert_eq!(
            file_name_from_disposition(r#"attachment; filename="Form.docx""#).as_deref(),
            Some("Form.docx")
        );
        assert_eq!(
            file_name_from_disposition("attachment; filename=Converted_Document.docx").as_deref(),
            Some("Converted_Document.docx")
        );
        assert_eq!(file_name_from_disposition("inline"), None);
    }

    #[test]
    fn extended_disposition_name_is_decoded() {
        assert_eq!(
            file_name_from_disposition("attachment; filename*=UTF-8''Q1%20report.docx").as_deref(),
            Some("Q1 report.docx")
        );
    }

    #[test]
    fn server_names_lose_their_directories() {
        assert_eq!(download_file_name("Q1/report.pdf", PDF_CONTENT_TYPE), "report.pdf");
        assert_eq!(download_file_name("..\\..\\Form.docx", DOCX_CONTENT_TYPE), "Form.docx");
        assert_eq!(download_file_name("scan", PDF_CONTENT_TYPE), "scan.pdf");
        assert_eq!(download_file_name("../", DOCX_CONTENT_TYPE), "Converted_Document.docx");
    }

    #[test]
    fn rejects_unexpected_content_type() {
        let file = ExportedFile {
            file_name: "x.docx".into(),
            content_type: "text/html; charset=utf-8".into(),
            bytes: b"<html>".to_vec(),
        };
        let err = file.clone().into_document("export").unwrap_err();
        assert!(matches!(err, HandDocError::ProtocolViolation { .. }));

        let ok = ExportedFile {
            content_type: DOCX_CONTENT_TYPE.into(),
            ..file
        };
        assert_eq!(ok.into_document("export").unwrap().file_name, "x.docx");
    }

    #[tokio::test]
    async fn write_to_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let file = ExportedFile {
            file_name: "Form.docx".into(),
            content_type: DOCX_CONTENT_TYPE.into(),
            bytes: vec![1, 2, 3],
        };
        let path = file.write_to(dir.path().join("out")).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert!(!dir.path().join("out/.Form.docx.tmp").exists());
    }
}
