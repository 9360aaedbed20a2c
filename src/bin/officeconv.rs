//! CLI binary for officeconv.
//!
//! A thin shim over the library crate that maps CLI flags to `PoolConfig`,
//! submits every input to one pool and prints results.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use officeconv::{
    inspect_engine, CommandAdapter, ConversionOutput, ConversionPool, ConversionRequest,
    ConvertError, EngineAdapter, ErrorKind, InputSource, JobId, JobProgressCallback,
    LibreOfficeAdapter, PoolConfig, Priority, ProgressCallback, SourceFormat, Stamp,
    TargetFormat,
};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
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
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the whole batch plus a log line
/// per finished job. Jobs finish out of order, so labels are looked up by id.
struct CliProgressCallback {
    bar: ProgressBar,
    labels: Mutex<HashMap<JobId, String>>,
    started: Mutex<HashMap<JobId, Instant>>,
}

impl CliProgressCallback {
    fn new(total: usize) -> Arc<Self> {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        let bar = ProgressBar::new(total as u64);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.set_message("starting engine…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            labels: Mutex::new(HashMap::new()),
            started: Mutex::new(HashMap::new()),
        })
    }

    fn label(&self, id: JobId) -> String {
        self.labels
            .lock()
            .ok()
            .and_then(|l| l.get(&id).cloned())
            .unwrap_or_else(|| id.short())
    }

    fn elapsed(&self, id: JobId) -> String {
        let ms = self
            .started
            .lock()
            .ok()
            .and_then(|mut s| s.remove(&id))
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0);
        format!("{:.1}s", ms as f64 / 1000.0)
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_queued(&self, id: JobId, label: &str, _queue_depth: usize) {
        if let Ok(mut labels) = self.labels.lock() {
            labels.insert(id, label.to_string());
        }
    }

    fn on_job_started(&self, id: JobId, slot: usize) {
        if let Ok(mut started) = self.started.lock() {
            started.insert(id, Instant::now());
        }
        self.bar
            .set_message(format!("{} on engine {slot}", self.label(id)));
    }

    fn on_job_complete(&self, id: JobId, output: &ConversionOutput) {
        self.bar.println(format!(
            "  {} {}  →  {}  {}",
            green("✓"),
            self.label(id),
            output.output_path.display(),
            dim(&self.elapsed(id)),
        ));
        self.bar.inc(1);
    }

    fn on_job_failed(&self, id: JobId, error: &ConvertError) {
        let first_line = error.to_string().lines().next().unwrap_or_default().to_string();
        self.bar.println(format!(
            "  {} {}  {}  {}",
            red("✗"),
            self.label(id),
            red(&first_line),
            dim(&self.elapsed(id)),
        ));
        self.bar.inc(1);
    }

    fn on_pool_degraded(&self, consecutive_failures: u32) {
        self.bar.println(format!(
            "  {} engine failed {consecutive_failures} times in a row; pool paused",
            yellow("⚠")
        ));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one document to PDF next to the default output directory
  officeconv report.docx --to pdf

  # Batch convert into a directory with four engine instances
  officeconv *.xlsx --to pdf -o converted/ --pool-size 4

  # Convert a remote document, give it 30 seconds
  officeconv https://example.com/minutes.odt --to docx --timeout 30

  # Machine-readable results
  officeconv a.pptx b.pptx --to pdf --json > results.json

  # Where is LibreOffice, and which version?
  officeconv --inspect-engine

  # Keep the first 19 pages and sign page 1
  officeconv contract.docx --to pdf --max-pages 19 \
      --stamp "image:signature.png@1,250,293,120,30" --stamp "text:2024-05-01@2,230,162"

  # Any other command-line converter can be pooled
  officeconv in.docx --to pdf --engine-cmd "unoconvert --convert-to {ext} {input} {outdir}/{stem}.{ext}"

TARGET FORMATS:
  pdf, html                  any source
  docx, odt, rtf, txt        text documents
  xlsx, ods, csv             spreadsheets
  pptx, odp                  presentations

ENVIRONMENT VARIABLES:
  SOFFICE_PATH            Path to the soffice executable (skips discovery)
  OFFICECONV_CACHE_DIR    Parent of the workspace, profile and output directories
  OFFICECONV_*            Every flag below has a matching variable
  RUST_LOG                Log filter (overrides -v / -q)
"#;

/// Convert office documents through a supervised pool of headless LibreOffice instances.
#[derive(Parser, Debug)]
#[command(
    name = "officeconv",
    version,
    about = "Convert office documents with a supervised pool of headless LibreOffice instances",
    long_about = "Convert office documents (local files or URLs) to PDF or another office format. \
Each engine instance runs with a private profile; hung or crashed engines are killed and \
restarted, and every output is checked before it is reported as converted.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file paths or HTTP/HTTPS URLs.
    #[arg(required_unless_present = "inspect_engine")]
    inputs: Vec<String>,

    /// Target format: pdf, docx, xlsx, pptx, odt, ods, odp, rtf, html, txt, csv.
    #[arg(long, env = "OFFICECONV_TO", value_parser = parse_target,
          required_unless_present = "inspect_engine")]
    to: Option<TargetFormat>,

    /// Source format; detected from extension and content when omitted.
    #[arg(long, env = "OFFICECONV_FROM", value_parser = parse_source, default_value = "auto")]
    from: SourceFormat,

    /// Directory for converted files.
    #[arg(short, long, env = "OFFICECONV_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Number of engine instances (concurrent conversions).
    #[arg(long, env = "OFFICECONV_POOL_SIZE", default_value_t = 2,
          value_parser = clap::value_parser!(u16).range(1..=64))]
    pool_size: u16,

    /// Maximum queued jobs. Defaults to 64, or the number of inputs if larger.
    #[arg(long, env = "OFFICECONV_QUEUE_CAPACITY")]
    queue_capacity: Option<usize>,

    /// Per-document deadline in seconds, measured from submission.
    #[arg(long, env = "OFFICECONV_TIMEOUT", default_value_t = 120)]
    timeout: u64,

    /// Priority of the submitted jobs: low, normal, high, urgent.
    #[arg(long, env = "OFFICECONV_PRIORITY", value_parser = parse_priority, default_value = "normal")]
    priority: Priority,

    /// Path to the soffice executable.
    #[arg(long, env = "SOFFICE_PATH")]
    engine: Option<PathBuf>,

    /// Use an arbitrary converter command instead of LibreOffice.
    /// Placeholders: {input} {outdir} {ext} {filter} {profile} {channel} {stem}.
    #[arg(long, env = "OFFICECONV_ENGINE_CMD", conflicts_with = "engine")]
    engine_cmd: Option<String>,

    /// Run one soffice per conversion instead of a resident instance per slot.
    #[arg(long, env = "OFFICECONV_STANDALONE_ENGINE", conflicts_with = "engine_cmd")]
    standalone_engine: bool,

    /// PDF only: keep at most this many leading pages.
    #[arg(long, env = "OFFICECONV_MAX_PAGES",
          value_parser = clap::value_parser!(u32).range(1..))]
    max_pages: Option<u32>,

    /// PDF only: draw a stamp, `text:<TEXT>@page,x,y[,size]` or
    /// `image:<PNG|JPEG>@page,x,y,width,height` (points from the bottom-left). Repeatable.
    #[arg(long, value_parser = parse_stamp)]
    stamp: Vec<Stamp>,

    /// Start engine instances on first use instead of at startup.
    #[arg(long, env = "OFFICECONV_LAZY_START")]
    lazy_start: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "OFFICECONV_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Output structured JSON (one record per input) on stdout.
    #[arg(long, env = "OFFICECONV_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "OFFICECONV_NO_PROGRESS")]
    no_progress: bool,

    /// Print engine location and version, then exit.
    #[arg(long)]
    inspect_engine: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "OFFICECONV_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "OFFICECONV_QUIET")]
    quiet: bool,
}

fn parse_target(s: &str) -> std::result::Result<TargetFormat, String> {
    s.parse().map_err(|e: ConvertError| e.to_string())
}

fn parse_source(s: &str) -> std::result::Result<SourceFormat, String> {
    s.parse().map_err(|e: ConvertError| e.to_string())
}

fn parse_stamp(s: &str) -> std::result::Result<Stamp, String> {
    s.parse().map_err(|e: ConvertError| e.to_string())
}

fn parse_priority(s: &str) -> std::result::Result<Priority, String> {
    s.parse().map_err(|e: ConvertError| e.to_string())
}

/// One line of `--json` output.
#[derive(Serialize)]
struct JobReport<'a> {
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<ConversionOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorReport>,
}

#[derive(Serialize)]
struct ErrorReport {
    kind: ErrorKind,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    diagnostics: Option<String>,
}

impl From<&ConvertError> for ErrorReport {
    fn from(e: &ConvertError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            retryable: e.is_retryable(),
            diagnostics: e.diagnostics().map(str::to_string),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
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

    // ── Inspect-engine mode ──────────────────────────────────────────────
    if cli.inspect_engine {
        let info = inspect_engine().await.context("Failed to inspect engine")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&info).context("Failed to serialise engine info")?
            );
        } else {
            println!("Engine:       {}", info.path.display());
            println!(
                "Version:      {}",
                info.version.as_deref().unwrap_or("unknown")
            );
            println!("Runtime dir:  {}", info.runtime_dir.display());
            let targets: Vec<String> = info.targets.iter().map(|t| t.to_string()).collect();
            println!("Targets:      {}", targets.join(", "));
        }
        return Ok(());
    }

    let Some(target) = cli.to else {
        bail!("--to is required");
    };

    // ── Build config and engine ──────────────────────────────────────────
    let progress = show_progress.then(|| CliProgressCallback::new(cli.inputs.len()));
    let config = build_config(&cli, progress.clone().map(|p| p as ProgressCallback))?;
    let adapter = build_adapter(&cli)?;

    let pool = ConversionPool::start(config, adapter)
        .await
        .context("Failed to start the engine pool")?;

    // ── Submit and collect ───────────────────────────────────────────────
    let started = Instant::now();
    let requests = cli.inputs.iter().map(|input| {
        let mut request = ConversionRequest::new(InputSource::parse(input), target)
            .with_source_format(cli.from)
            .with_priority(cli.priority)
            .with_timeout(Duration::from_secs(cli.timeout));
        if let Some(pages) = cli.max_pages {
            request = request.with_max_pages(pages);
        }
        for stamp in &cli.stamp {
            request = request.with_stamp(stamp.clone());
        }
        request
    });
    let handles = pool.submit_many(requests).await;

    let mut results: Vec<(&str, Result<ConversionOutput, ConvertError>)> = Vec::new();
    let mut pending = Vec::new();
    for (input, handle) in cli.inputs.iter().zip(handles) {
        match handle {
            Ok(h) => pending.push((input.as_str(), h)),
            Err(e) => {
                // Rejected at submission; the callback never saw it.
                if let Some(ref p) = progress {
                    p.bar.println(format!("  {} {input}  {}", red("✗"), red(&e.to_string())));
                    p.bar.inc(1);
                }
                results.push((input.as_str(), Err(e)));
            }
        }
    }
    for (input, handle) in pending {
        results.push((input, handle.await));
    }

    if let Some(ref p) = progress {
        p.finish();
    }
    let stats = pool.stats();
    pool.shutdown().await;

    // ── Report ───────────────────────────────────────────────────────────
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if cli.json {
        let reports: Vec<JobReport<'_>> = results
            .iter()
            .map(|(input, r)| JobReport {
                input,
                output: r.as_ref().ok().cloned(),
                error: r.as_ref().err().map(ErrorReport::from),
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialise results")?
        );
    } else if !show_progress && !cli.quiet {
        for (input, r) in &results {
            match r {
                Ok(o) => println!("{input} → {}", o.output_path.display()),
                Err(e) => eprintln!("{input}: {e}"),
            }
        }
    }

    if !cli.quiet && !cli.json {
        let ok = results.len() - failed;
        eprintln!(
            "{} {}/{} converted in {:.1}s  {}",
            if failed == 0 { green("✔") } else { red("✘") },
            bold(&ok.to_string()),
            results.len(),
            started.elapsed().as_secs_f64(),
            dim(&format!(
                "({} engine restarts, {} timeouts)",
                stats.recycles, stats.timeouts
            )),
        );
    }

    if failed > 0 {
        bail!("{failed} of {} conversion(s) failed", results.len());
    }
    Ok(())
}

/// Map CLI args to `PoolConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<PoolConfig> {
    let mut builder = PoolConfig::builder()
        .pool_size(cli.pool_size as usize)
        .queue_capacity(cli.queue_capacity.unwrap_or(64.max(cli.inputs.len())))
        .job_timeout_secs(cli.timeout)
        .download_timeout_secs(cli.download_timeout)
        .warm_start(!cli.lazy_start);
    if let Some(ref dir) = cli.output_dir {
        builder = builder.output_dir(dir);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

fn build_adapter(cli: &Cli) -> Result<Arc<dyn EngineAdapter>> {
    if let Some(ref template) = cli.engine_cmd {
        let adapter = CommandAdapter::parse(template).context("Invalid --engine-cmd")?;
        return Ok(Arc::new(adapter));
    }
    let adapter = match cli.engine {
        Some(ref path) => LibreOfficeAdapter::new(path),
        None => LibreOfficeAdapter::locate().context(
            "LibreOffice not found. Install it (e.g. apt install libreoffice-core) \
             or pass --engine /path/to/soffice",
        )?,
    };
    if cli.standalone_engine {
        return Ok(Arc::new(adapter.standalone()));
    }
    Ok(Arc::new(adapter))
}
