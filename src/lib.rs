//! # handdoc
//!
//! Client core for turning handwritten or scanned documents into editable
//! Word/PDF files through a remote OCR and export service.
//!
//! The heavy lifting (OCR, layout detection, DOCX/PDF rendering, payment
//! settlement) happens on the server. This crate owns what the client is
//! responsible for: the job lifecycle, keeping local state consistent across
//! restarts and payment redirects, and making sure the structured document
//! coming back from OCR is valid before anything renders or exports it.
//!
//! ## Lifecycle
//!
//! ```text
//! (none) ─▶ uploaded ─▶ processing ─▶ ready ─▶ paid ⇄ exporting
//!              │             │                    ▲        │
//!              │             └──▶ error ◀─────────┼────────┘
//!              └─▶ free-ready (digital PDF)       └─ retry_export
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use handdoc::{ClientConfig, ExportOptions, JobController};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = JobController::from_config(ClientConfig::default())?;
//!     controller.upload("scan.jpg", None).await?;
//!     controller.start_processing().await?;
//!     let job = controller.run_polling().await?;
//!     println!("{} words", job.word_count.unwrap_or(0));
//!
//!     let preview = controller.download_preview(&ExportOptions::default()).await?;
//!     preview.write_to(".").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `handdoc` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! handdoc = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod controller;
pub mod document;
pub mod error;
pub mod export;
pub mod job;
pub mod payment;
pub mod poll;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{Backend, CheckoutSession, HttpBackend, JobStatusResponse, RemoteStatus};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use controller::{JobController, PollOutcome, PollTicket, Preview, Resume};
pub use document::{
    count_pages, count_words, extract_outline, normalize_document, normalize_str, plain_text,
    OutlineEntry, StructuredDocument,
};
pub use error::{HandDocError, NextAction, StoreError, TransitionError};
pub use export::{download_file_name, sanitize_file_name, ExportFormat, ExportOptions, ExportedFile};
pub use job::{
    transition, FileStore, JobEvent, JobPatch, JobRecord, JobSource, JobState, JobStore,
    KeyValueStore, MemoryStore,
};
pub use payment::{strip_return_token, ReturnOutcome};
pub use poll::PollHandle;
pub use progress::{LifecycleObserver, NoopObserver};
