//! Job lifecycle controller.
//!
//! Drives the single active job from upload to export:
//!
//! ```text
//!  upload ──▶ start_processing ──▶ run_polling ──▶ load_preview
//!    │                               (poll loop)        │
//!    │ digital PDF                                      ├─▶ download_preview (watermarked)
//!    ▼                                                  ├─▶ begin_checkout / capture (payment.rs)
//!  export_digital                                       └─▶ export ──▶ retry_export
//! ```
//!
//! Every state change goes through [`JobRecord::apply`] and is persisted
//! under a write lock before the next operation sees it. Network calls run
//! outside the lock with explicit time budgets; their results are re-checked
//! against the stored job when they land, so a reset or a newer poll result
//! always wins over a late response.

use crate::backend::{
    Backend, DigitalExportRequest, EnqueueRequest, ExportRequest, HttpBackend, JobStatusResponse,
    RemoteStatus, UploadFile, UploadMode,
};
use crate::config::ClientConfig;
use crate::document::{
    count_pages, count_words, extract_outline, normalize_document, OutlineEntry,
    StructuredDocument,
};
use crate::error::{HandDocError, NextAction, TransitionError};
use crate::export::{ExportOptions, ExportedFile};
use crate::job::{
    transition, FailureStage, FileStore, JobEvent, JobRecord, JobSource, JobState, JobStore,
    KeyValueStore,
};
use crate::poll::PollHandle;
use crate::progress::{NoopObserver, Observer};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// MIME types the OCR backend accepts.
const ACCEPTED_MIME: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "application/pdf"];

/// Orders status responses for one job.
///
/// Take a ticket before sending a poll and hand it back with the response;
/// a response whose ticket is older than one already applied is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTicket {
    pub job_id: String,
    pub seq: u64,
}

/// What a single poll response did to the job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Still queued or processing.
    Pending,
    /// Content arrived and was cached.
    Ready(JobRecord),
    /// The server reports the job as paid.
    Paid(JobRecord),
    /// The backend gave up on the job.
    Failed(JobRecord),
    /// The response was dropped without touching the job.
    Stale(String),
}

/// A status response merged under the write lock, awaiting notification.
enum Merged {
    Stale(String),
    Applied {
        from: JobState,
        job: JobRecord,
        ready_words: Option<usize>,
        outcome: PollOutcome,
    },
}

/// Where the user should land when the app starts or returns from a redirect.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    Upload,
    Processing(JobRecord),
    Preview(JobRecord),
    FreePreview(JobRecord),
}

/// Everything the preview surface shows.
#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub job_id: String,
    pub state: JobState,
    pub document: StructuredDocument,
    pub outline: Vec<OutlineEntry>,
    pub word_count: usize,
    pub page_count: usize,
    /// Unpaid previews are shown (and downloaded) with a watermark.
    pub watermarked: bool,
}

/// Owns the active job and the operations on it.
///
/// Cheap to clone; clones share state.
pub struct JobController<S> {
    pub(crate) inner: Arc<Inner<S>>,
}

impl<S> Clone for JobController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct Inner<S> {
    pub(crate) config: ClientConfig,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) store: JobStore<S>,
    pub(crate) observer: Observer,
    /// Serialises load-modify-save cycles on the store.
    write_lock: Mutex<()>,
    /// Jobs whose OCR start has been sent.
    started: Mutex<HashSet<String>>,
    next_seq: AtomicU64,
    applied_seq: Mutex<HashMap<String, u64>>,
    /// Job id with a checkout underway.
    pub(crate) checkout: Mutex<Option<String>>,
    /// Local path each job was uploaded from. Not persisted.
    original: Mutex<Option<(String, PathBuf)>>,
    /// Jobs with an export running in this process.
    exports: Mutex<HashSet<String>>,
}

impl JobController<FileStore> {
    /// A controller talking HTTP and persisting to `state_dir` (or the
    /// platform data directory).
    pub fn from_config(config: ClientConfig) -> Result<Self, HandDocError> {
        let backend = HttpBackend::new(&config)?;
        let dir = match &config.state_dir {
            Some(dir) => dir.clone(),
            None => FileStore::default_dir().ok_or_else(|| {
                HandDocError::InvalidConfig(
                    "No platform data directory; set a state directory".into(),
                )
            })?,
        };
        debug!("Job state directory: {}", dir.display());
        Ok(Self::new(config, Arc::new(backend), FileStore::new(dir)))
    }
}

impl<S: KeyValueStore + 'static> JobController<S> {
    pub fn new(config: ClientConfig, backend: Arc<dyn Backend>, kv: S) -> Self {
        let observer = config
            .observer
            .clone()
            .unwrap_or_else(|| Arc::new(NoopObserver));
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                store: JobStore::new(kv),
                observer,
                write_lock: Mutex::new(()),
                started: Mutex::new(HashSet::new()),
                next_seq: AtomicU64::new(0),
                applied_seq: Mutex::new(HashMap::new()),
                checkout: Mutex::new(None),
                original: Mutex::new(None),
                exports: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &JobStore<S> {
        &self.inner.store
    }

    /// The active job, if any.
    pub fn current(&self) -> Option<JobRecord> {
        self.inner.store.load()
    }

    // ── Upload ──────────────────────────────────────────────────────────────

    /// Upload a file and create the job for it, replacing any previous job.
    ///
    /// Scanned uploads land in `uploaded`; call [`start_processing`](Self::start_processing)
    /// next. Digital PDFs skip OCR and land in `free-ready`.
    pub async fn upload(
        &self,
        path: impl AsRef<Path>,
        strict: Option<bool>,
    ) -> Result<JobRecord, HandDocError> {
        let path = path.as_ref();
        let file = self.read_upload(path).await?;
        info!("Uploading {} ({} bytes, {})", path.display(), file.bytes.len(), file.mime);

        self.reset()?;

        let cfg = &self.inner.config;
        let result = within(
            "upload",
            cfg.request_timeout(),
            self.inner.backend.upload(file),
        )
        .await
        .inspect_err(|e| self.report(None, e))?;

        transition(None, &JobEvent::Uploaded)?;
        let strict = strict.unwrap_or(cfg.strict);
        let mut job = match result.mode {
            UploadMode::Scanned => {
                let job_id = result
                    .job_id
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| HandDocError::ProtocolViolation {
                        operation: "upload".into(),
                        detail: "scanned upload returned no job id".into(),
                    })
                    .inspect_err(|e| self.report(None, e))?;
                JobRecord::new(job_id, result.file_path, JobSource::Scanned, strict)
            }
            UploadMode::Digital => {
                let job_id = format!("digital-{}", uuid::Uuid::new_v4());
                let mut job =
                    JobRecord::new(job_id, result.file_path, JobSource::DigitalPdf, strict);
                job.apply(JobEvent::DigitalDetected)?;
                job
            }
        };
        *lock(&self.inner.original) = Some((job.job_id.clone(), path.to_path_buf()));

        {
            let _guard = self.lock_writes();
            self.inner.store.save(&job)?;
        }
        self.notify(&job.job_id, None, Some(job.state));
        info!("Job {} created ({})", job.job_id, job.state);
        Ok(job)
    }

    async fn read_upload(&self, path: &Path) -> Result<UploadFile, HandDocError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|_| HandDocError::FileNotFound {
                path: path.to_path_buf(),
            })?;
        if !meta.is_file() {
            return Err(HandDocError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let mime = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream");
        if !ACCEPTED_MIME.contains(&mime) {
            return Err(HandDocError::UnsupportedFileType {
                path: path.to_path_buf(),
                mime: mime.to_string(),
            });
        }

        let limit = self.inner.config.max_upload_bytes;
        if meta.len() > limit {
            return Err(HandDocError::FileTooLarge {
                path: path.to_path_buf(),
                size: meta.len(),
                limit,
            });
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| HandDocError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        Ok(UploadFile {
            file_name,
            mime: mime.to_string(),
            bytes,
        })
    }

    // ── Processing ──────────────────────────────────────────────────────────

    /// Ask the backend to start OCR for the uploaded job.
    ///
    /// At most one start is sent per job: repeated calls return the current
    /// record without contacting the backend. A transient failure leaves the
    /// job in `uploaded` so the start can be retried; any other failure moves
    /// it to `error`.
    pub async fn start_processing(&self) -> Result<JobRecord, HandDocError> {
        let job = self.active()?;
        match job.state {
            JobState::Uploaded => {}
            JobState::Processing => {
                debug!("Job {} is already processing", job.job_id);
                return Ok(job);
            }
            state => {
                return Err(TransitionError {
                    from: Some(state),
                    event: JobEvent::Enqueued,
                }
                .into())
            }
        }
        if !self.latch_start(&job.job_id) {
            debug!("OCR already started for job {}", job.job_id);
            return Ok(job);
        }

        let request = EnqueueRequest {
            job_id: job.job_id.clone(),
            file_path: job.file_path.clone(),
            strict: job.strict,
        };
        info!("Starting OCR for job {} (strict: {})", job.job_id, job.strict);
        let result = within(
            "start processing",
            self.inner.config.ocr_timeout(),
            self.inner.backend.enqueue(&request),
        )
        .await;

        match result {
            Ok(()) => {
                let (job, _) = self.modify(Some(&job.job_id), |j| {
                    j.apply(JobEvent::Enqueued).map_err(HandDocError::from)
                })?;
                Ok(job)
            }
            Err(e) if e.is_transient() => {
                warn!("OCR start for job {} failed, can be retried: {}", job.job_id, e);
                self.release_start(&job.job_id);
                self.report(Some(&job.job_id), &e);
                Err(e)
            }
            Err(e) => {
                error!("OCR start for job {} failed: {}", job.job_id, e);
                let message = e.to_string();
                self.modify(Some(&job.job_id), |j| {
                    j.fail(JobEvent::EnqueueFailed, FailureStage::Processing, message)
                        .map_err(HandDocError::from)
                })?;
                self.report(Some(&job.job_id), &e);
                Err(e)
            }
        }
    }

    /// Reserve a poll ticket for `job_id`.
    pub fn ticket(&self, job_id: &str) -> PollTicket {
        PollTicket {
            job_id: job_id.to_string(),
            seq: self.inner.next_seq.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Merge one status response into the job.
    ///
    /// The response is dropped when the job was reset or replaced, when a
    /// newer ticket was already applied, or when the job has moved past
    /// processing. A server-side `paid` is the one result that still upgrades
    /// a `ready` job. Scalars reported while the job is still processing are
    /// kept.
    pub fn apply_poll(
        &self,
        ticket: &PollTicket,
        response: JobStatusResponse,
    ) -> Result<PollOutcome, HandDocError> {
        let merged = {
            let _guard = self.lock_writes();
            self.merge_poll(ticket, response)?
        };
        match merged {
            Merged::Stale(reason) => Ok(self.stale(&ticket.job_id, &reason)),
            Merged::Applied {
                from,
                job,
                ready_words,
                outcome,
            } => {
                if let Some(words) = ready_words {
                    self.inner.observer.on_content_ready(&job.job_id, words);
                }
                self.notify(&job.job_id, Some(from), Some(job.state));
                Ok(outcome)
            }
        }
    }

    /// The load-merge-save half of [`apply_poll`](Self::apply_poll). Caller
    /// holds the write lock; nothing here reaches the observer.
    fn merge_poll(
        &self,
        ticket: &PollTicket,
        response: JobStatusResponse,
    ) -> Result<Merged, HandDocError> {
        let Some(mut job) = self.inner.store.load() else {
            return Ok(Merged::Stale("job was reset".into()));
        };
        if job.job_id != ticket.job_id {
            return Ok(Merged::Stale("job was replaced".into()));
        }
        {
            let mut applied = lock(&self.inner.applied_seq);
            let last = applied.entry(ticket.job_id.clone()).or_insert(0);
            if ticket.seq <= *last {
                return Ok(Merged::Stale("a newer status was already applied".into()));
            }
            *last = ticket.seq;
        }

        let from = job.state;
        let mut ready_words = None;
        let outcome = match (from, response.state) {
            (JobState::Ready, RemoteStatus::Paid) => {
                job.apply(JobEvent::PaymentConfirmed)?;
                info!("Server confirmed payment for job {}", job.job_id);
                PollOutcome::Paid(job.clone())
            }
            (state, _) if state != JobState::Processing => {
                return Ok(Merged::Stale(format!("job is already {}", state)));
            }
            (_, RemoteStatus::Ready | RemoteStatus::Paid) if !response.has_content() => {
                warn!("Job {} reported ready without content; still waiting", job.job_id);
                job.apply(JobEvent::PollReady { has_content: false })?;
                merge_scalars(&mut job, &response);
                PollOutcome::Pending
            }
            (_, RemoteStatus::Ready | RemoteStatus::Paid) => {
                let document =
                    normalize_document(response.content_json.as_ref().unwrap_or(&serde_json::Value::Null));
                let words = count_words(&document);
                job.apply(JobEvent::PollReady { has_content: true })?;
                job.content_json = Some(document);
                job.word_count = Some(words);
                job.processing_time = response.processing_time.or(job.processing_time);
                if response.state == RemoteStatus::Paid {
                    job.apply(JobEvent::PaymentConfirmed)?;
                }
                ready_words = Some(words);
                info!("Job {} ready ({} words)", job.job_id, words);
                PollOutcome::Ready(job.clone())
            }
            (_, RemoteStatus::Error) => {
                let reason = response
                    .error
                    .clone()
                    .unwrap_or_else(|| "processing failed".to_string());
                job.fail(JobEvent::PollFailed, FailureStage::Processing, reason)?;
                warn!("Job {} failed during processing", job.job_id);
                PollOutcome::Failed(job.clone())
            }
            (_, RemoteStatus::Queued | RemoteStatus::Processing | RemoteStatus::Unknown) => {
                job.apply(JobEvent::PollProgress)?;
                merge_scalars(&mut job, &response);
                PollOutcome::Pending
            }
        };

        self.inner.store.save(&job)?;
        Ok(Merged::Applied {
            from,
            job,
            ready_words,
            outcome,
        })
    }

    /// Send one status poll for the active job and apply it.
    ///
    /// Usable from any state; outside `processing` only a server-side payment
    /// confirmation has an effect.
    pub async fn refresh(&self) -> Result<PollOutcome, HandDocError> {
        let job = self.active()?;
        let ticket = self.ticket(&job.job_id);
        let response = within(
            "poll status",
            self.inner.config.request_timeout(),
            self.inner.backend.job_status(&job.job_id),
        )
        .await?;
        self.apply_poll(&ticket, response)
    }

    /// Poll until the job is ready, fails, or the poll ceiling is reached.
    ///
    /// Transient poll failures count against the ceiling and are retried on
    /// the next tick.
    pub async fn run_polling(&self) -> Result<JobRecord, HandDocError> {
        let job = self.active()?;
        match job.state {
            JobState::Processing => {}
            state if state.is_settled() => return Ok(job),
            state => {
                return Err(HandDocError::ActionNotAvailable {
                    action: "poll",
                    state,
                })
            }
        }

        let cfg = &self.inner.config;
        let job_id = job.job_id;
        for attempt in 1..=cfg.max_polls {
            if attempt > 1 {
                tokio::time::sleep(cfg.poll_interval()).await;
            }
            self.inner.observer.on_poll(&job_id, attempt, cfg.max_polls);
            debug!("Poll {}/{} for job {}", attempt, cfg.max_polls, job_id);

            let ticket = self.ticket(&job_id);
            let response = match within(
                "poll status",
                cfg.request_timeout(),
                self.inner.backend.job_status(&job_id),
            )
            .await
            {
                Ok(r) => r,
                Err(e) if e.is_transient() => {
                    warn!("Poll {} for job {} failed: {}", attempt, job_id, e);
                    continue;
                }
                Err(e) => {
                    error!("Poll for job {} failed: {}", job_id, e);
                    let message = e.to_string();
                    self.modify(Some(&job_id), |j| {
                        j.fail(JobEvent::PollFailed, FailureStage::Processing, message)
                            .map_err(HandDocError::from)
                    })?;
                    self.report(Some(&job_id), &e);
                    return Err(e);
                }
            };

            match self.apply_poll(&ticket, response)? {
                PollOutcome::Pending => {}
                PollOutcome::Ready(job) | PollOutcome::Paid(job) => return Ok(job),
                PollOutcome::Failed(job) => {
                    let reason = job
                        .last_failure
                        .map(|f| f.message)
                        .unwrap_or_else(|| "processing failed".into());
                    let e = HandDocError::ProcessingFailed { job_id, reason };
                    self.report(Some(&job.job_id), &e);
                    return Err(e);
                }
                PollOutcome::Stale(_) => match self.inner.store.load() {
                    Some(job) if job.job_id == job_id && job.state.is_settled() => return Ok(job),
                    Some(job) if job.job_id == job_id => {}
                    _ => return Err(HandDocError::NoActiveJob),
                },
            }
        }

        warn!("Job {} not ready after {} polls", job_id, cfg.max_polls);
        let attempts = cfg.max_polls;
        let outcome = self.modify(Some(&job_id), |j| {
            if j.state != JobState::Processing {
                return Ok(false);
            }
            j.fail(
                JobEvent::PollBudgetExhausted,
                FailureStage::Processing,
                format!("not ready after {} status checks", attempts),
            )?;
            Ok(true)
        })?;
        match outcome {
            (job, false) => Ok(job),
            (_, true) => {
                let e = HandDocError::PollBudgetExhausted {
                    job_id: job_id.clone(),
                    attempts,
                };
                self.report(Some(&job_id), &e);
                Err(e)
            }
        }
    }

    /// Run [`run_polling`](Self::run_polling) on a background task.
    ///
    /// Dropping the returned handle stops polling.
    pub fn spawn_polling(&self) -> Result<PollHandle<Result<JobRecord, HandDocError>>, HandDocError> {
        let job = self.active()?;
        let this = self.clone();
        let task = tokio::spawn(async move { this.run_polling().await });
        Ok(PollHandle::new(job.job_id, task))
    }

    // ── Preview ─────────────────────────────────────────────────────────────

    /// Decide where the user lands for the stored job.
    pub fn resume(&self) -> Resume {
        if let Err(e) = self.recover_export() {
            warn!("Could not recover an interrupted export: {}", e);
        }
        let Some(job) = self.inner.store.load() else {
            return Resume::Upload;
        };
        match job.state {
            JobState::Uploaded | JobState::Processing => Resume::Processing(job),
            JobState::FreeReady => Resume::FreePreview(job),
            JobState::Ready | JobState::Paid | JobState::Exporting
                if job.content_json.is_some() =>
            {
                Resume::Preview(job)
            }
            JobState::Error
                if job.content_json.is_some()
                    && job
                        .last_failure
                        .as_ref()
                        .is_some_and(|f| f.stage == FailureStage::Export) =>
            {
                Resume::Preview(job)
            }
            _ => Resume::Upload,
        }
    }

    /// The document and its derived metadata for display.
    pub fn load_preview(&self) -> Result<Preview, HandDocError> {
        let job = self.active()?;
        let document = job
            .content_json
            .clone()
            .ok_or_else(|| HandDocError::MissingContent {
                job_id: job.job_id.clone(),
            })?;
        Ok(Preview {
            outline: extract_outline(&document),
            word_count: job.word_count.unwrap_or_else(|| count_words(&document)),
            page_count: count_pages(&document),
            watermarked: !job.is_paid(),
            job_id: job.job_id,
            state: job.state,
            document,
        })
    }

    /// Replace the document with an edited one. Editing needs a paid job.
    pub fn update_content(&self, raw: &serde_json::Value) -> Result<JobRecord, HandDocError> {
        let document = normalize_document(raw);
        let words = count_words(&document);
        let (job, _) = self.modify(None, |j| {
            if j.state != JobState::Paid {
                return Err(HandDocError::PaymentRequired {
                    job_id: j.job_id.clone(),
                });
            }
            j.content_json = Some(document);
            j.word_count = Some(words);
            Ok(())
        })?;
        debug!("Updated content of job {} ({} words)", job.job_id, words);
        Ok(job)
    }

    // ── Export ──────────────────────────────────────────────────────────────

    /// Export the paid document.
    ///
    /// The job passes through `exporting` and returns to `paid` on success,
    /// or when the returned future is dropped before the export settles.
    /// On failure it enters `error`; [`retry_export`](Self::retry_export)
    /// brings it back. The backend checks payment itself: when it refuses
    /// with [`HandDocError::ExportNotAuthorized`] the local payment is
    /// discarded and the job is payable again.
    pub async fn export(&self, options: &ExportOptions) -> Result<ExportedFile, HandDocError> {
        self.recover_export()?;
        let job = self.active()?;
        if job.state == JobState::Ready {
            return Err(HandDocError::PaymentRequired { job_id: job.job_id });
        }
        let document = job
            .content_json
            .clone()
            .ok_or_else(|| HandDocError::MissingContent {
                job_id: job.job_id.clone(),
            })?;
        self.modify(Some(&job.job_id), |j| {
            j.apply(JobEvent::ExportRequested)?;
            lock(&self.inner.exports).insert(j.job_id.clone());
            Ok(())
        })?;
        let mut guard = ExportGuard {
            controller: self,
            job_id: job.job_id.clone(),
            settled: false,
        };

        let request = self.export_request(&job.job_id, document, options, false);
        info!("Exporting job {} as {}", job.job_id, request.file_name);
        let result = within(
            "export",
            self.inner.config.export_timeout(),
            self.inner.backend.export(&request),
        )
        .await
        .and_then(|file| file.into_document("export"));
        guard.settled = true;

        match result {
            Ok(file) => {
                match self.modify(Some(&job.job_id), |j| {
                    j.apply(JobEvent::ExportSucceeded).map_err(HandDocError::from)
                }) {
                    Ok(_) => {}
                    Err(e) => warn!("Export finished but job {} moved on: {}", job.job_id, e),
                }
                Ok(file)
            }
            Err(e @ HandDocError::ExportNotAuthorized { .. }) => {
                warn!("Backend has no payment for job {}; it can be paid again", job.job_id);
                if let Err(store_err) = self.modify(Some(&job.job_id), |j| {
                    j.apply(JobEvent::PaymentRejected)?;
                    j.payment = None;
                    Ok(())
                }) {
                    warn!("Could not record the refused export: {}", store_err);
                }
                self.report(Some(&job.job_id), &e);
                Err(e)
            }
            Err(e) => {
                error!("Export of job {} failed: {}", job.job_id, e);
                let message = e.to_string();
                if let Err(store_err) = self.modify(Some(&job.job_id), |j| {
                    j.fail(JobEvent::ExportFailed, FailureStage::Export, message)
                        .map_err(HandDocError::from)
                }) {
                    warn!("Could not record export failure: {}", store_err);
                }
                let e = HandDocError::ExportFailed {
                    job_id: job.job_id.clone(),
                    source: Box::new(e),
                };
                self.report(Some(&job.job_id), &e);
                Err(e)
            }
        }
    }

    /// Return a job whose export failed to `paid`.
    ///
    /// A job that is already `paid` is returned unchanged.
    pub fn retry_export(&self) -> Result<JobRecord, HandDocError> {
        self.recover_export()?;
        let (job, _) = self.modify(None, |j| {
            if j.state != JobState::Paid {
                j.apply(JobEvent::RetryExport)?;
            }
            Ok(())
        })?;
        Ok(job)
    }

    /// Move a job left in `exporting` by an export that is no longer running
    /// (dropped, or started by an earlier process) back to `paid`.
    fn recover_export(&self) -> Result<(), HandDocError> {
        match self.inner.store.load() {
            Some(job) if job.state == JobState::Exporting => {}
            _ => return Ok(()),
        }
        self.modify(None, |j| {
            if j.state == JobState::Exporting && !lock(&self.inner.exports).contains(&j.job_id) {
                j.apply(JobEvent::ExportAbandoned)?;
                info!("Export of job {} was interrupted; job is paid again", j.job_id);
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Download a watermarked render of an unpaid (or paid) document.
    ///
    /// No state change.
    pub async fn download_preview(
        &self,
        options: &ExportOptions,
    ) -> Result<ExportedFile, HandDocError> {
        self.recover_export()?;
        let job = self.active()?;
        if !matches!(job.state, JobState::Ready | JobState::Paid) {
            return Err(HandDocError::ActionNotAvailable {
                action: "download a preview of",
                state: job.state,
            });
        }
        let document = job
            .content_json
            .clone()
            .ok_or_else(|| HandDocError::MissingContent {
                job_id: job.job_id.clone(),
            })?;
        let request = self.export_request(&job.job_id, document, options, true);
        let file = within(
            "preview download",
            self.inner.config.export_timeout(),
            self.inner.backend.export(&request),
        )
        .await
        .inspect_err(|e| self.report(Some(&job.job_id), e))?;
        file.into_document("preview download")
    }

    /// Convert a digital PDF job straight to DOCX. Free; no state change.
    pub async fn export_digital(&self) -> Result<ExportedFile, HandDocError> {
        let job = self.active()?;
        if job.state != JobState::FreeReady || job.source != JobSource::DigitalPdf {
            return Err(HandDocError::ActionNotAvailable {
                action: "export as a digital PDF",
                state: job.state,
            });
        }
        let request = DigitalExportRequest {
            file_path: job.file_path.clone(),
        };
        info!("Exporting digital PDF for job {}", job.job_id);
        let file = within(
            "digital export",
            self.inner.config.export_timeout(),
            self.inner.backend.export_digital(&request),
        )
        .await
        .inspect_err(|e| self.report(Some(&job.job_id), e))?;
        file.into_document("digital export")
    }

    fn export_request(
        &self,
        job_id: &str,
        document: StructuredDocument,
        options: &ExportOptions,
        watermark: bool,
    ) -> ExportRequest {
        ExportRequest {
            job_id: job_id.to_string(),
            content_json: document,
            file_name: options.resolved_file_name(),
            template_slug: options.template_slug.clone(),
            design_key: options.design_key.clone(),
            brand: options.brand.clone(),
            signatory: options.signatory.clone(),
            watermark,
            format: options.format,
        }
    }

    // ── Reset ───────────────────────────────────────────────────────────────

    /// Forget the active job entirely.
    pub fn reset(&self) -> Result<(), HandDocError> {
        let previous = {
            let _guard = self.lock_writes();
            let previous = self.inner.store.load();
            self.inner.store.clear()?;
            previous
        };
        lock(&self.inner.checkout).take();
        lock(&self.inner.original).take();
        if let Some(job) = previous {
            transition(Some(job.state), &JobEvent::Reset)?;
            lock(&self.inner.started).remove(&job.job_id);
            lock(&self.inner.applied_seq).remove(&job.job_id);
            self.notify(&job.job_id, Some(job.state), None);
            info!("Reset job {}", job.job_id);
        }
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    pub(crate) fn active(&self) -> Result<JobRecord, HandDocError> {
        self.inner.store.load().ok_or(HandDocError::NoActiveJob)
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        lock(&self.inner.write_lock)
    }

    /// Load, change and save the active job under the write lock.
    ///
    /// With `expected_id`, fails if the active job is a different one.
    pub(crate) fn modify<R>(
        &self,
        expected_id: Option<&str>,
        f: impl FnOnce(&mut JobRecord) -> Result<R, HandDocError>,
    ) -> Result<(JobRecord, R), HandDocError> {
        let (job, from, out) = {
            let _guard = self.lock_writes();
            let mut job = self.active()?;
            if let Some(id) = expected_id {
                if job.job_id != id {
                    return Err(HandDocError::InvalidJobId {
                        job_id: id.to_string(),
                    });
                }
            }
            let from = job.state;
            let out = f(&mut job)?;
            self.inner.store.save(&job)?;
            (job, from, out)
        };
        self.notify(&job.job_id, Some(from), Some(job.state));
        Ok((job, out))
    }

    pub(crate) fn notify(&self, job_id: &str, from: Option<JobState>, to: Option<JobState>) {
        if from != to {
            info!(
                "Job {}: {} → {}",
                job_id,
                from.map_or("(none)", |s| s.as_str()),
                to.map_or("(none)", |s| s.as_str())
            );
            self.inner.observer.on_state_change(job_id, from, to);
        }
    }

    pub(crate) fn report(&self, job_id: Option<&str>, e: &HandDocError) {
        let next: NextAction = e.next_action();
        self.inner.observer.on_failure(job_id, &e.to_string(), next);
    }

    fn stale(&self, job_id: &str, reason: &str) -> PollOutcome {
        warn!("Discarding status for job {}: {}", job_id, reason);
        self.inner.observer.on_stale_result(job_id, reason);
        PollOutcome::Stale(reason.to_string())
    }

    fn latch_start(&self, job_id: &str) -> bool {
        lock(&self.inner.started).insert(job_id.to_string())
    }

    fn release_start(&self, job_id: &str) {
        lock(&self.inner.started).remove(job_id);
    }

    /// The file the active job was uploaded from in this process, if it is
    /// still on disk.
    pub fn original_file(&self) -> Option<PathBuf> {
        let job = self.active().ok()?;
        match &*lock(&self.inner.original) {
            Some((id, path)) if *id == job.job_id && path.exists() => Some(path.clone()),
            _ => None,
        }
    }
}

/// Progress reports carry timing (and sometimes a word count) before content.
fn merge_scalars(job: &mut JobRecord, response: &JobStatusResponse) {
    if response.processing_time.is_some() {
        job.processing_time = response.processing_time;
    }
    if response.word_count.is_some() {
        job.word_count = response.word_count;
    }
}

/// An export in flight. Dropped unsettled, it hands the job back to `paid`.
struct ExportGuard<'a, S: KeyValueStore + 'static> {
    controller: &'a JobController<S>,
    job_id: String,
    settled: bool,
}

impl<S: KeyValueStore + 'static> Drop for ExportGuard<'_, S> {
    fn drop(&mut self) {
        lock(&self.controller.inner.exports).remove(&self.job_id);
        if !self.settled {
            warn!("Export of job {} was abandoned", self.job_id);
            if let Err(e) = self.controller.recover_export() {
                warn!("Could not return job {} to paid: {}", self.job_id, e);
            }
        }
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Run `fut` within `budget`, turning an overrun into [`HandDocError::Timeout`].
pub(crate) async fn within<T>(
    operation: &str,
    budget: Duration,
    fut: impl Future<Output = Result<T, HandDocError>>,
) -> Result<T, HandDocError> {
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(HandDocError::Timeout {
            operation: operation.to_string(),
            secs: budget.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Block;
    use crate::job::MemoryStore;

    /// Backend that must never be called.
    struct Unreachable;

    #[async_trait::async_trait]
    impl Backend for Unreachable {
        async fn upload(&self, _: UploadFile) -> Result<crate::backend::UploadResult, HandDocError> {
            unreachable!()
        }
        async fn enqueue(&self, _: &EnqueueRequest) -> Result<(), HandDocError> {
            unreachable!()
        }
        async fn job_status(&self, _: &str) -> Result<JobStatusResponse, HandDocError> {
            unreachable!()
        }
        async fn create_checkout(
            &self,
            _: &crate::backend::CheckoutRequest,
        ) -> Result<crate::backend::CheckoutSession, HandDocError> {
            unreachable!()
        }
        async fn capture(
            &self,
            _: &crate::backend::CaptureRequest,
        ) -> Result<crate::backend::CaptureResponse, HandDocError> {
            unreachable!()
        }
        async fn export(&self, _: &ExportRequest) -> Result<ExportedFile, HandDocError> {
            unreachable!()
        }
        async fn export_digital(
            &self,
            _: &DigitalExportRequest,
        ) -> Result<ExportedFile, HandDocError> {
            unreachable!()
        }
    }

    fn controller_with(job: JobRecord) -> JobController<MemoryStore> {
        let c = JobController::new(ClientConfig::default(), Arc::new(Unreachable), MemoryStore::new());
        c.store().save(&job).unwrap();
        c
    }

    fn processing_job() -> JobRecord {
        let mut job = JobRecord::new("j1", "/tmp/j1.png", JobSource::Scanned, true);
        job.apply(JobEvent::Enqueued).unwrap();
        job
    }

    fn status(state: RemoteStatus, content: Option<serde_json::Value>) -> JobStatusResponse {
        let mut response = JobStatusResponse::queued();
        response.state = state;
        response.content_json = content;
        response
    }

    fn form_content() -> serde_json::Value {
        serde_json::json!({
            "type": "document",
            "content": [{"type": "heading", "level": 1, "content": [{"type": "text", "text": "Form"}]}]
        })
    }

    #[test]
    fn stale_processing_result_never_regresses_ready() {
        let c = controller_with(processing_job());
        let older = c.ticket("j1");
        let newer = c.ticket("j1");

        let out = c.apply_poll(&newer, status(RemoteStatus::Ready, Some(form_content()))).unwrap();
        assert!(matches!(out, PollOutcome::Ready(_)));

        let out = c.apply_poll(&older, status(RemoteStatus::Processing, None)).unwrap();
        assert!(matches!(out, PollOutcome::Stale(_)));
        let late = c.ticket("j1");
        let out = c.apply_poll(&late, status(RemoteStatus::Processing, None)).unwrap();
        assert!(matches!(out, PollOutcome::Stale(_)));

        let job = c.current().unwrap();
        assert_eq!(job.state, JobState::Ready);
        assert_eq!(job.word_count, Some(1));
        assert_eq!(job.content_json.unwrap().content, vec![Block::heading(1, "Form")]);
    }

    #[test]
    fn ready_without_content_keeps_waiting() {
        let c = controller_with(processing_job());
        let t = c.ticket("j1");
        let out = c.apply_poll(&t, status(RemoteStatus::Ready, None)).unwrap();
        assert_eq!(out, PollOutcome::Pending);
        assert_eq!(c.current().unwrap().state, JobState::Processing);
    }

    #[test]
    fn remote_paid_upgrades_ready_but_poll_never_downgrades_paid() {
        let mut job = processing_job();
        job.apply(JobEvent::PollReady { has_content: true }).unwrap();
        job.content_json = Some(StructuredDocument::empty());
        let c = controller_with(job);

        let t = c.ticket("j1");
        assert!(matches!(
            c.apply_poll(&t, status(RemoteStatus::Paid, None)).unwrap(),
            PollOutcome::Paid(_)
        ));
        let t = c.ticket("j1");
        assert!(matches!(
            c.apply_poll(&t, status(RemoteStatus::Ready, Some(form_content()))).unwrap(),
            PollOutcome::Stale(_)
        ));
        assert_eq!(c.current().unwrap().state, JobState::Paid);
    }

    #[test]
    fn result_for_reset_job_is_discarded() {
        let c = controller_with(processing_job());
        let t = c.ticket("j1");
        c.reset().unwrap();
        let out = c.apply_poll(&t, status(RemoteStatus::Ready, Some(form_content()))).unwrap();
        assert!(matches!(out, PollOutcome::Stale(_)));
        assert!(c.current().is_none());
    }

    #[test]
    fn backend_error_fails_the_job() {
        let c = controller_with(processing_job());
        let t = c.ticket("j1");
        let mut response = status(RemoteStatus::Error, None);
        response.error = Some("unreadable scan".into());
        assert!(matches!(c.apply_poll(&t, response).unwrap(), PollOutcome::Failed(_)));
        let job = c.current().unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(job.last_failure.unwrap().message, "unreadable scan");
        assert_eq!(c.resume(), Resume::Upload);
    }

    #[test]
    fn progress_reports_keep_their_timing() {
        let c = controller_with(processing_job());
        let t = c.ticket("j1");
        let mut response = status(RemoteStatus::Processing, None);
        response.processing_time = Some(4.5);
        assert_eq!(c.apply_poll(&t, response).unwrap(), PollOutcome::Pending);

        let t = c.ticket("j1");
        assert_eq!(c.apply_poll(&t, status(RemoteStatus::Queued, None)).unwrap(), PollOutcome::Pending);
        let job = c.current().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.processing_time, Some(4.5));
    }

    /// Resets the controller from inside its own notifications.
    #[derive(Default)]
    struct ResettingObserver {
        controller: std::sync::OnceLock<JobController<MemoryStore>>,
        stale: Mutex<Vec<String>>,
    }

    impl crate::progress::LifecycleObserver for ResettingObserver {
        fn on_state_change(&self, _job_id: &str, _from: Option<JobState>, to: Option<JobState>) {
            if to == Some(JobState::Ready) {
                if let Some(c) = self.controller.get() {
                    c.reset().unwrap();
                }
            }
        }

        fn on_stale_result(&self, _job_id: &str, reason: &str) {
            lock(&self.stale).push(reason.to_string());
            if let Some(c) = self.controller.get() {
                assert!(c.current().is_none());
                c.reset().unwrap();
            }
        }
    }

    #[test]
    fn observer_may_call_back_into_the_controller() {
        let observer = Arc::new(ResettingObserver::default());
        let config = ClientConfig::builder()
            .observer(observer.clone())
            .build()
            .unwrap();
        let c = JobController::new(config, Arc::new(Unreachable), MemoryStore::new());
        c.store().save(&processing_job()).unwrap();
        assert!(observer.controller.set(c.clone()).is_ok());

        let older = c.ticket("j1");
        let newer = c.ticket("j1");
        let out = c.apply_poll(&newer, status(RemoteStatus::Ready, Some(form_content()))).unwrap();
        assert!(matches!(out, PollOutcome::Ready(_)));
        assert!(c.current().is_none());

        let out = c.apply_poll(&older, status(RemoteStatus::Processing, None)).unwrap();
        assert_eq!(out, PollOutcome::Stale("job was reset".into()));
        assert_eq!(*lock(&observer.stale), vec!["job was reset".to_string()]);
    }

    #[test]
    fn export_left_running_by_an_earlier_process_is_recovered() {
        let mut job = processing_job();
        job.apply(JobEvent::PollReady { has_content: true }).unwrap();
        job.content_json = Some(StructuredDocument::empty());
        job.apply(JobEvent::PaymentConfirmed).unwrap();
        job.apply(JobEvent::ExportRequested).unwrap();
        let c = controller_with(job);

        match c.resume() {
            Resume::Preview(job) => assert_eq!(job.state, JobState::Paid),
            other => panic!("expected preview, got {:?}", other),
        }
        assert_eq!(c.current().unwrap().state, JobState::Paid);
        assert_eq!(c.retry_export().unwrap().state, JobState::Paid);
    }

    #[test]
    fn resume_routes_by_state() {
        let c = controller_with(processing_job());
        assert!(matches!(c.resume(), Resume::Processing(_)));
        c.reset().unwrap();
        assert_eq!(c.resume(), Resume::Upload);
    }

    #[test]
    fn editing_requires_payment() {
        let mut job = processing_job();
        job.apply(JobEvent::PollReady { has_content: true }).unwrap();
        job.content_json = Some(StructuredDocument::empty());
        let c = controller_with(job);

        let edit = serde_json::json!({"type": "doc", "content": [{"type": "paragraph", "content": [{"type": "text", "text": "two words"}]}]});
        assert!(matches!(
            c.update_content(&edit),
            Err(HandDocError::PaymentRequired { .. })
        ));

        c.modify(None, |j| j.apply(JobEvent::PaymentConfirmed).map_err(HandDocError::from))
            .unwrap();
        let job = c.update_content(&edit).unwrap();
        assert_eq!(job.word_count, Some(2));
        let preview = c.load_preview().unwrap();
        assert!(!preview.watermarked);
        assert_eq!(preview.outline, vec![OutlineEntry::whole_document()]);
    }
}
