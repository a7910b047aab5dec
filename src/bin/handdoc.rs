//! CLI binary for handdoc.
//!
//! A thin shim over the library crate: each subcommand maps to one
//! [`JobController`] operation on the job persisted in the state directory.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use handdoc::{
    plain_text, CheckoutSession, ClientConfig, ExportFormat, ExportOptions, ExportedFile,
    FileStore, HandDocError, JobController, JobRecord, JobState, LifecycleObserver, NextAction,
    PollOutcome, Resume, ReturnOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Terminal observer: a spinner while the job is being processed, plus one
/// log line per state change printed above it.
struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Working");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl LifecycleObserver for CliObserver {
    fn on_state_change(&self, job_id: &str, from: Option<JobState>, to: Option<JobState>) {
        let from = from.map_or("(none)", |s| s.as_str());
        let line = match to {
            Some(JobState::Error) => format!("  {} {}  {} → {}", red("✗"), dim(job_id), from, red("error")),
            Some(to) => format!("  {} {}  {} → {}", green("✓"), dim(job_id), from, bold(to.as_str())),
            None => format!("  {} {}  {} → {}", cyan("◆"), dim(job_id), from, dim("(none)")),
        };
        self.bar.println(line);
    }

    fn on_poll(&self, _job_id: &str, attempt: u32, max_polls: u32) {
        self.bar.set_prefix("Processing");
        self.bar.set_message(format!("status check {attempt}/{max_polls}"));
    }

    fn on_stale_result(&self, _job_id: &str, reason: &str) {
        self.bar.println(format!("  {} {}", dim("·"), dim(&format!("late status ignored: {reason}"))));
    }

    fn on_content_ready(&self, _job_id: &str, word_count: usize) {
        self.bar.println(format!(
            "  {} Document ready  {}",
            green("✓"),
            dim(&format!("{word_count} words"))
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Upload a scan, run OCR and wait for the result
  handdoc process notes.jpg

  # Read the recognised text
  handdoc show

  # Download a watermarked preview before paying
  handdoc download-preview --format pdf -o ./out

  # Pay, then export an editable Word file
  handdoc pay
  handdoc capture 5O190127TN364715T
  handdoc export --name "Meeting notes" -o ./out

  # A digital PDF skips OCR and converts for free
  handdoc upload report.pdf && handdoc export-digital -o ./out

  # Finish a redirect payment from the return URL
  handdoc return "https://app.example/preview?token=5O190127TN364715T&PayerID=X1"

LIFECYCLE:
  uploaded → processing → ready → paid ⇄ exporting
  Digital PDFs land in free-ready. Failures land in error; a failed export
  can be retried with `handdoc export --retry`.

ENVIRONMENT VARIABLES:
  HANDDOC_API_BASE        Application backend base URL
  HANDDOC_API_KEY         Sent as x-api-key on every request
  HANDDOC_EXPORT_URL      Separate export service base URL
  HANDDOC_STATE_DIR       Where the active job is kept
  RUST_LOG                Overrides the log filter
"#;

/// Convert handwritten and scanned documents into editable Word/PDF files.
#[derive(Parser, Debug)]
#[command(
    name = "handdoc",
    version,
    about = "Convert handwritten and scanned documents into editable Word/PDF files",
    long_about = "Upload a scan or photo of a handwritten document, let the OCR service \
structure it, preview the result, pay, and export it as DOCX or PDF. The active job is \
kept on disk, so each step can run as a separate command.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Application backend base URL.
    #[arg(long, global = true, env = "HANDDOC_API_BASE", default_value = "http://localhost:3000")]
    api_base: String,

    /// API key sent as x-api-key.
    #[arg(long, global = true, env = "HANDDOC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Export service base URL (defaults to the API base).
    #[arg(long, global = true, env = "HANDDOC_EXPORT_URL")]
    export_url: Option<String>,

    /// Directory holding the active job record.
    #[arg(long, global = true, env = "HANDDOC_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Delay between status checks in milliseconds.
    #[arg(long, global = true, env = "HANDDOC_POLL_INTERVAL_MS", default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Status checks before giving up on a job.
    #[arg(long, global = true, env = "HANDDOC_MAX_POLLS", default_value_t = 150)]
    max_polls: u32,

    /// Time budget for starting OCR in seconds.
    #[arg(long, global = true, env = "HANDDOC_OCR_TIMEOUT", default_value_t = 90)]
    ocr_timeout: u64,

    /// Time budget for one export in seconds.
    #[arg(long, global = true, env = "HANDDOC_EXPORT_TIMEOUT", default_value_t = 60)]
    export_timeout: u64,

    /// Time budget for other requests in seconds.
    #[arg(long, global = true, env = "HANDDOC_REQUEST_TIMEOUT", default_value_t = 30)]
    request_timeout: u64,

    /// Disable the spinner.
    #[arg(long, global = true, env = "HANDDOC_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "HANDDOC_VERBOSE")]
    verbose: bool,

    /// Suppress all output except results and errors.
    #[arg(short, long, global = true, env = "HANDDOC_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file and create a new job, replacing the current one.
    Upload {
        file: PathBuf,
        /// Let the OCR fill in illegible words instead of marking them.
        #[arg(long)]
        lenient: bool,
    },
    /// Start OCR for the uploaded job and wait until it is ready.
    Process {
        /// Upload this file first.
        file: Option<PathBuf>,
        #[arg(long)]
        lenient: bool,
        /// Start OCR without waiting for the result.
        #[arg(long)]
        no_wait: bool,
    },
    /// Show the active job and where it stands.
    Status {
        /// Ask the backend for the latest status first.
        #[arg(long)]
        refresh: bool,
        /// Print the job record as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the recognised document.
    Show {
        /// Print the structured document as JSON instead of text.
        #[arg(long)]
        json: bool,
        /// Print only the heading outline.
        #[arg(long)]
        outline: bool,
    },
    /// Replace the document with an edited JSON file (paid jobs only).
    Edit { file: PathBuf },
    /// Open a checkout for the ready job.
    Pay,
    /// Record a payment confirmed in the checkout dialog.
    Confirm { order_id: String },
    /// Capture an approved redirect-checkout order.
    Capture { order_id: String },
    /// Finish a redirect payment from the URL the gateway returned to.
    Return { url: String },
    /// Export the paid document.
    Export {
        #[command(flatten)]
        options: ExportArgs,
        /// Return a failed export to paid before exporting again.
        #[arg(long)]
        retry: bool,
    },
    /// Download a watermarked preview of the document.
    DownloadPreview {
        #[command(flatten)]
        options: ExportArgs,
    },
    /// Convert a digital PDF straight to DOCX.
    ExportDigital {
        /// Output directory.
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Forget the active job.
    Reset,
}

#[derive(clap::Args, Debug)]
struct ExportArgs {
    #[arg(long, value_enum, default_value = "docx")]
    format: FormatArg,
    /// Download name; unsafe characters are replaced.
    #[arg(long)]
    name: Option<String>,
    /// Export template.
    #[arg(long, default_value = "default")]
    template: String,
    /// Design variant within the template.
    #[arg(long)]
    design: Option<String>,
    /// Brand details as inline JSON.
    #[arg(long)]
    brand: Option<String>,
    /// Signatory details as inline JSON.
    #[arg(long)]
    signatory: Option<String>,
    /// Output directory.
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Docx,
    Pdf,
}

impl From<FormatArg> for ExportFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Docx => ExportFormat::Docx,
            FormatArg::Pdf => ExportFormat::Pdf,
        }
    }
}

impl ExportArgs {
    fn to_options(&self) -> Result<ExportOptions> {
        Ok(ExportOptions {
            format: self.format.into(),
            file_name: self.name.clone(),
            template_slug: self.template.clone(),
            design_key: self.design.clone(),
            brand: parse_json_arg("--brand", self.brand.as_deref())?,
            signatory: parse_json_arg("--signatory", self.signatory.as_deref())?,
        })
    }
}

fn parse_json_arg(flag: &str, raw: Option<&str>) -> Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(s).with_context(|| format!("{flag} is not valid JSON")))
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner replaces INFO-level library logs unless --verbose is set.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let observer = show_progress.then(CliObserver::new);
    let config = build_config(&cli, observer.clone())?;
    let controller = JobController::from_config(config).context("Failed to set up the client")?;

    let result = run(&cli, &controller).await;
    if let Some(observer) = &observer {
        observer.finish();
    }

    if let Err(ref e) = result {
        if let Some(err) = e.chain().find_map(|c| c.downcast_ref::<HandDocError>()) {
            eprintln!("{} {}", red("✘"), hint(err.next_action()));
        }
    }
    result
}

/// Map CLI args to `ClientConfig`.
fn build_config(cli: &Cli, observer: Option<Arc<CliObserver>>) -> Result<ClientConfig> {
    let mut builder = ClientConfig::builder()
        .api_base(cli.api_base.clone())
        .poll_interval_ms(cli.poll_interval_ms)
        .max_polls(cli.max_polls)
        .ocr_timeout_secs(cli.ocr_timeout)
        .export_timeout_secs(cli.export_timeout)
        .request_timeout_secs(cli.request_timeout);

    if let Some(ref key) = cli.api_key {
        builder = builder.api_key(key.clone());
    }
    if let Some(ref url) = cli.export_url {
        builder = builder.export_url(url.clone());
    }
    if let Some(ref dir) = cli.state_dir {
        builder = builder.state_dir(dir.clone());
    }
    if let Some(observer) = observer {
        builder = builder.observer(observer as Arc<dyn LifecycleObserver>);
    }

    builder.build().context("Invalid configuration")
}

async fn run(cli: &Cli, c: &JobController<FileStore>) -> Result<()> {
    match &cli.command {
        Command::Upload { file, lenient } => {
            let job = c
                .upload(file, lenient.then_some(false))
                .await
                .context("Upload failed")?;
            print_job(&job);
            if job.state == JobState::FreeReady {
                println!("{}", dim("Digital PDF detected: run `handdoc export-digital` to convert it for free."));
            }
        }

        Command::Process { file, lenient, no_wait } => {
            if let Some(file) = file {
                c.upload(file, lenient.then_some(false))
                    .await
                    .context("Upload failed")?;
            }
            if let Some(job) = c.current().filter(|j| j.state == JobState::FreeReady) {
                print_job(&job);
                println!("{}", dim("Digital PDF: no OCR needed."));
                return Ok(());
            }
            let job = c.start_processing().await.context("Could not start OCR")?;
            if *no_wait {
                print_job(&job);
                return Ok(());
            }
            let job = c.run_polling().await.context("Processing failed")?;
            print_job(&job);
        }

        Command::Status { refresh, json } => {
            if *refresh {
                match c.refresh().await.context("Status check failed")? {
                    PollOutcome::Stale(reason) => eprintln!("{}", dim(&format!("status ignored: {reason}"))),
                    PollOutcome::Pending => eprintln!("{}", dim("still processing")),
                    _ => {}
                }
            }
            let Some(job) = c.current() else {
                println!("No active job.");
                return Ok(());
            };
            if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&job).context("Failed to serialise job")?
                );
            } else {
                print_job(&job);
                let next = match c.resume() {
                    Resume::Upload => "upload a document",
                    Resume::Processing(_) => "wait for processing (`handdoc process`)",
                    Resume::Preview(job) if job.state == JobState::Error => "retry the export",
                    Resume::Preview(job) if job.is_paid() => "export the document",
                    Resume::Preview(_) => "preview and pay",
                    Resume::FreePreview(_) => "export the digital PDF",
                };
                println!("Next:       {}", next);
            }
        }

        Command::Show { json, outline } => {
            let preview = c.load_preview().context("Nothing to show")?;
            if *outline {
                for entry in &preview.outline {
                    println!("{:<6} {}", dim(&entry.id), entry.label);
                }
            } else if *json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&preview.document)
                        .context("Failed to serialise document")?
                );
            } else {
                println!("{}", plain_text(&preview.document));
            }
            if !cli.quiet {
                eprintln!(
                    "{}",
                    dim(&format!(
                        "{} words  /  {} pages{}",
                        preview.word_count,
                        preview.page_count,
                        if preview.watermarked { "  /  watermarked until paid" } else { "" }
                    ))
                );
            }
        }

        Command::Edit { file } => {
            let raw = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("Failed to read {:?}", file))?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).with_context(|| format!("{:?} is not JSON", file))?;
            let job = c.update_content(&value).context("Edit rejected")?;
            println!("{} {} words", green("✔"), job.word_count.unwrap_or(0));
        }

        Command::Pay => match c.begin_checkout().await.context("Checkout failed")? {
            CheckoutSession::Modal { key, order } => {
                println!("Gateway:    razorpay");
                println!("Key:        {}", key);
                println!("Order:      {}", order.id);
                println!("Amount:     {} {}", order.amount, order.currency);
                println!("{}", dim("After paying, run `handdoc confirm <order-id>`."));
            }
            CheckoutSession::Redirect { approve_url } => {
                println!("Gateway:    paypal");
                println!("Approve at: {}", approve_url.unwrap_or_default());
                println!("{}", dim("After approving, run `handdoc return <url>` with the page you land on."));
            }
        },

        Command::Confirm { order_id } => {
            let job = c.confirm_modal_payment(order_id).context("Could not record payment")?;
            print_job(&job);
        }

        Command::Capture { order_id } => {
            let job = c.capture(order_id).await.context("Capture failed")?;
            print_job(&job);
        }

        Command::Return { url } => match c.handle_return(url).await.context("Payment return failed")? {
            ReturnOutcome::NoToken => println!("{}", dim("No payment token in that URL; nothing to do.")),
            ReturnOutcome::Captured { job, clean_url } => {
                print_job(&job);
                println!("Continue:   {}", clean_url);
            }
        },

        Command::Export { options, retry } => {
            if *retry {
                c.retry_export().context("Nothing to retry")?;
            }
            let file = c
                .export(&options.to_options()?)
                .await
                .context("Export failed")?;
            write_file(cli, &file, &options.output).await?;
        }

        Command::DownloadPreview { options } => {
            let file = c
                .download_preview(&options.to_options()?)
                .await
                .context("Preview download failed")?;
            write_file(cli, &file, &options.output).await?;
        }

        Command::ExportDigital { output } => {
            let file = c.export_digital().await.context("Digital export failed")?;
            write_file(cli, &file, output).await?;
        }

        Command::Reset => {
            c.reset().context("Reset failed")?;
            if !cli.quiet {
                eprintln!("{} Job cleared", green("✔"));
            }
        }
    }
    Ok(())
}

async fn write_file(cli: &Cli, file: &ExportedFile, dir: &Path) -> Result<()> {
    let path = file.write_to(dir).await.context("Could not save the file")?;
    if cli.quiet {
        println!("{}", path.display());
    } else {
        eprintln!(
            "{}  {}  {}",
            green("✔"),
            bold(&path.display().to_string()),
            dim(&format!("{} bytes", file.bytes.len()))
        );
    }
    Ok(())
}

fn print_job(job: &JobRecord) {
    println!("Job:        {}", job.job_id);
    println!("State:      {}", bold(job.state.as_str()));
    if let Some(words) = job.word_count {
        println!("Words:      {}", words);
    }
    if let Some(ref receipt) = job.payment {
        println!("Paid:       order {}", receipt.order_id);
    }
    if let Some(ref failure) = job.last_failure {
        println!("Failure:    {}", red(&failure.message));
    }
}

fn hint(next: NextAction) -> &'static str {
    match next {
        NextAction::Reupload => "Upload the document again (`handdoc process <file>`).",
        NextAction::FixInput => "Fix the input and try again.",
        NextAction::Retry => "This looks temporary; run the same command again.",
        NextAction::RetryPayment => "Payment was not completed; run `handdoc pay` again.",
        NextAction::RetryExport => "The job is still paid; run `handdoc export --retry`.",
    }
}
