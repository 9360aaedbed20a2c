//! Conversion jobs: identity, request, lifecycle state machine and the
//! caller-facing [`JobHandle`].
//!
//! A job moves through
//!
//! ```text
//! Queued → Assigned → Converting → Validating → Succeeded
//!    │         │           │            │
//!    └─────────┴───────────┴────────────┴──────→ Failed
//! ```
//!
//! Transitions only ever move forward. The internal [`ConversionJob`] is owned
//! by exactly one party at a time (the queue, then the worker that dequeued
//! it) and is consumed when it resolves, so a job can never deliver two
//! results.

use crate::error::ConvertError;
use crate::format::{SourceFormat, TargetFormat};
use crate::output::ConversionOutput;
use crate::pipeline::input::ResolvedInput;
use crate::pipeline::postprocess::{PostProcess, Stamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Opaque, unique identifier of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits; enough to tell jobs apart in file names and logs.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

/// Scheduling priority. Only reorders queued jobs; never preempts running ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        })
    }
}

impl FromStr for Priority {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            _ => Err(ConvertError::InvalidConfig(format!(
                "unknown priority '{s}' (expected low, normal, high or urgent)"
            ))),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Assigned,
    Converting,
    Validating,
    Succeeded,
    Failed,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            JobState::Queued => 0,
            JobState::Assigned => 1,
            JobState::Converting => 2,
            JobState::Validating => 3,
            JobState::Succeeded | JobState::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: JobState) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Queued => "queued",
            JobState::Assigned => "assigned",
            JobState::Converting => "converting",
            JobState::Validating => "validating",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        })
    }
}

// ── Request ──────────────────────────────────────────────────────────────

/// Where the source document comes from.
#[derive(Clone)]
pub enum InputSource {
    /// A readable local file.
    Path(PathBuf),
    /// An HTTP(S) URL, downloaded before admission.
    Url(String),
    /// An in-memory document; `name` supplies the extension and output stem.
    Bytes { name: String, data: Vec<u8> },
}

impl InputSource {
    /// Interpret a CLI-style argument: URLs stay URLs, everything else is a path.
    pub fn parse(input: &str) -> Self {
        if crate::pipeline::input::is_url(input) {
            InputSource::Url(input.to_string())
        } else {
            InputSource::Path(PathBuf::from(input))
        }
    }

    /// Human-readable label used in logs and error messages.
    pub fn label(&self) -> String {
        match self {
            InputSource::Path(p) => p.display().to_string(),
            InputSource::Url(u) => u.clone(),
            InputSource::Bytes { name, .. } => name.clone(),
        }
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            InputSource::Url(u) => f.debug_tuple("Url").field(u).finish(),
            InputSource::Bytes { name, data } => f
                .debug_struct("Bytes")
                .field("name", name)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// A caller's request to convert one document to one target format.
///
/// # Example
/// ```rust
/// use officeconv::{ConversionRequest, Priority, TargetFormat};
/// use std::time::Duration;
///
/// let req = ConversionRequest::from_path("report.docx", TargetFormat::Pdf)
///     .with_priority(Priority::High)
///     .with_timeout(Duration::from_secs(30));
/// assert_eq!(req.priority, Priority::High);
/// ```
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub source: InputSource,
    /// Declared source format; [`SourceFormat::Auto`] detects it.
    pub source_format: SourceFormat,
    pub target: TargetFormat,
    /// Overrides the pool's `job_timeout_secs`.
    pub timeout: Option<Duration>,
    pub priority: Priority,
    /// Explicit output file. When unset the result lands in the pool's output directory.
    pub destination: Option<PathBuf>,
    /// Edits applied to PDF output before delivery.
    pub post: PostProcess,
}

impl ConversionRequest {
    pub fn new(source: InputSource, target: TargetFormat) -> Self {
        Self {
            source,
            source_format: SourceFormat::Auto,
            target,
            timeout: None,
            priority: Priority::Normal,
            destination: None,
            post: PostProcess::default(),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>, target: TargetFormat) -> Self {
        Self::new(InputSource::Path(path.into()), target)
    }

    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>, target: TargetFormat) -> Self {
        Self::new(
            InputSource::Bytes {
                name: name.into(),
                data,
            },
            target,
        )
    }

    pub fn with_source_format(mut self, format: SourceFormat) -> Self {
        self.source_format = format;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    /// Keep only the first `pages` pages of the PDF.
    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.post.max_pages = Some(pages);
        self
    }

    pub fn with_stamp(mut self, stamp: Stamp) -> Self {
        self.post.stamps.push(stamp);
        self
    }
}

// ── Internal job ─────────────────────────────────────────────────────────

pub(crate) type JobResult = Result<ConversionOutput, ConvertError>;

/// A validated, admitted job. Owned by the queue, then by one worker.
pub(crate) struct ConversionJob {
    pub id: JobId,
    pub label: String,
    pub input: ResolvedInput,
    pub source_format: SourceFormat,
    pub target: TargetFormat,
    pub priority: Priority,
    pub destination: Option<PathBuf>,
    pub post: PostProcess,
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    state: watch::Sender<JobState>,
    reply: oneshot::Sender<JobResult>,
}

/// Removes a queued job on behalf of [`JobHandle::cancel`].
pub(crate) trait QueueCancel: Send + Sync {
    fn cancel_queued(&self, id: JobId);
}

pub(crate) struct NewJob {
    pub id: JobId,
    pub label: String,
    pub input: ResolvedInput,
    pub source_format: SourceFormat,
    pub target: TargetFormat,
    pub priority: Priority,
    pub destination: Option<PathBuf>,
    pub post: PostProcess,
    pub submitted_at: Instant,
    pub timeout: Duration,
}

impl ConversionJob {
    /// Create a job in `Queued` state together with its caller handle.
    pub fn create(new: NewJob, queue: Weak<dyn QueueCancel>) -> (Self, JobHandle) {
        let (state_tx, state_rx) = watch::channel(JobState::Queued);
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let job = ConversionJob {
            id: new.id,
            label: new.label,
            input: new.input,
            source_format: new.source_format,
            target: new.target,
            priority: new.priority,
            destination: new.destination,
            post: new.post,
            submitted_at: new.submitted_at,
            deadline: new.submitted_at + new.timeout,
            cancel: cancel.clone(),
            state: state_tx,
            reply: reply_tx,
        };
        let handle = JobHandle {
            id: new.id,
            state: state_rx,
            result: reply_rx,
            cancel,
            queue,
        };
        (job, handle)
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Advance to `next`. Returns `false` (and changes nothing) when the move
    /// would go backwards or leave a terminal state.
    pub fn advance(&self, next: JobState) -> bool {
        self.state.send_if_modified(|cur| {
            if cur.can_advance_to(next) {
                *cur = next;
                true
            } else {
                false
            }
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.submitted_at.elapsed().as_millis() as u64
    }

    /// Move to the terminal state matching `result` and deliver it.
    pub fn resolve(self, result: JobResult) {
        let terminal = if result.is_ok() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        self.advance(terminal);
        // A dropped handle means nobody is waiting; the result is discarded.
        let _ = self.reply.send(result);
    }
}

impl fmt::Debug for ConversionJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionJob")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("source_format", &self.source_format)
            .field("target", &self.target)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

// ── Handle ───────────────────────────────────────────────────────────────

/// Caller-side handle to a submitted job.
///
/// Await it to get the result. Dropping it does not cancel the job.
#[must_use = "a JobHandle does nothing unless awaited or cancelled"]
pub struct JobHandle {
    id: JobId,
    state: watch::Receiver<JobState>,
    result: oneshot::Receiver<JobResult>,
    cancel: CancellationToken,
    queue: Weak<dyn QueueCancel>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    /// Request cancellation.
    ///
    /// A queued job is removed and fails with [`ConvertError::Cancelled`]
    /// immediately. A job already bound to an engine finishes its engine run
    /// and then fails with `Cancelled`; its output is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Some(queue) = self.queue.upgrade() {
            queue.cancel_queued(self.id);
        }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Future for JobHandle {
    type Output = JobResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result).poll(cx).map(|r| {
            r.unwrap_or_else(|_| {
                Err(ConvertError::Internal(
                    "job was dropped without producing a result".into(),
                ))
            })
        })
    }
}
