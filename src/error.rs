//! Error types for the officeconv library.
//!
//! Every failure a caller can observe is a [`ConvertError`]. The variants are
//! deliberately fine-grained (a missing file and an empty file read
//! differently to a human) but each one maps onto a small, stable
//! [`ErrorKind`] so callers can branch on the category without matching every
//! variant:
//!
//! | Kind | Raised | Retried internally |
//! |------|--------|--------------------|
//! | `InvalidInput` | before queuing | never |
//! | `QueueFull` | at admission | yes, `admission_retries` times |
//! | `Workspace` | while preparing a job | never (fatal to the job only) |
//! | `ConversionTimeout` | engine exceeded the deadline | never; instance recycled |
//! | `EngineCrashed` | engine exited abnormally | never; instance recycled |
//! | `CorruptOutput` | engine exited cleanly, output unusable | never |
//! | `EngineUnavailable` | no healthy instance could be checked out | yes, `checkout_retries` times |
//! | `PoolUnavailable` | pool is degraded | no |

use crate::format::TargetFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the officeconv library.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Source file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The source exists but has zero bytes.
    #[error("Source '{input}' is empty")]
    EmptyInput { input: String },

    /// The source is larger than `max_input_bytes`.
    #[error("Source '{input}' is {size} bytes, above the {limit}-byte limit")]
    InputTooLarge { input: String, size: u64, limit: u64 },

    /// The source format is unknown, unsupported, or contradicts the file contents.
    #[error("Invalid input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },

    /// Source and target belong to different document families (e.g. xlsx → docx).
    #[error("Cannot convert {source_format} to {target}: {reason}")]
    IncompatibleFormats {
        source_format: String,
        target: TargetFormat,
        reason: String,
    },

    /// The requested target is not in the configured supported-format list.
    #[error("Target format '{target}' is not enabled (supported: {supported})")]
    UnsupportedTarget {
        target: TargetFormat,
        supported: String,
    },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Admission errors ──────────────────────────────────────────────────
    /// The job queue is at capacity; the caller should retry later.
    #[error("Job queue is full ({capacity} jobs waiting); retry later")]
    QueueFull { capacity: usize },

    /// The pool has seen too many consecutive engine failures.
    #[error(
        "Conversion pool is unavailable after {consecutive_failures} consecutive engine failures.\n\
         Check that the conversion engine starts correctly (run with --inspect-engine)."
    )]
    PoolUnavailable { consecutive_failures: u32 },

    /// The pool is shutting down and no longer accepts or runs jobs.
    #[error("Conversion pool is shutting down")]
    PoolShutdown,

    // ── Job errors ────────────────────────────────────────────────────────
    /// Could not create, populate or read the per-job workspace.
    #[error("Workspace error at '{path}': {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The engine did not finish before the job deadline.
    #[error("Conversion timed out after {elapsed_ms}ms{}", slot_suffix(.slot))]
    ConversionTimeout { slot: Option<usize>, elapsed_ms: u64 },

    /// The engine process died, exited non-zero, or could not be spawned.
    #[error("Conversion engine crashed on slot {slot} (exit code {}): {detail}", exit_code_label(.exit_code))]
    EngineCrashed {
        slot: usize,
        exit_code: Option<i32>,
        detail: String,
    },

    /// The engine exited cleanly but the output is missing or structurally invalid.
    #[error("Engine produced unusable {format} output: {detail}")]
    CorruptOutput { format: TargetFormat, detail: String },

    /// No healthy engine instance could be checked out.
    #[error("No engine instance became available after {attempts} attempts: {detail}")]
    EngineUnavailable { attempts: u32, detail: String },

    /// The caller cancelled the job.
    #[error("Job was cancelled")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not move the converted file to its destination.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn slot_suffix(slot: &Option<usize>) -> String {
    match slot {
        Some(s) => format!(" on slot {s}"),
        None => " while queued".to_string(),
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "none".to_string(),
    }
}

/// Stable category of a [`ConvertError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Download,
    QueueFull,
    PoolUnavailable,
    PoolShutdown,
    Workspace,
    ConversionTimeout,
    EngineCrashed,
    CorruptOutput,
    EngineUnavailable,
    Cancelled,
    OutputWrite,
    InvalidConfig,
    Internal,
}

impl ConvertError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileNotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::EmptyInput { .. }
            | Self::InputTooLarge { .. }
            | Self::InvalidInput { .. }
            | Self::IncompatibleFormats { .. }
            | Self::UnsupportedTarget { .. } => ErrorKind::InvalidInput,
            Self::DownloadFailed { .. } | Self::DownloadTimeout { .. } => ErrorKind::Download,
            Self::QueueFull { .. } => ErrorKind::QueueFull,
            Self::PoolUnavailable { .. } => ErrorKind::PoolUnavailable,
            Self::PoolShutdown => ErrorKind::PoolShutdown,
            Self::Workspace { .. } => ErrorKind::Workspace,
            Self::ConversionTimeout { .. } => ErrorKind::ConversionTimeout,
            Self::EngineCrashed { .. } => ErrorKind::EngineCrashed,
            Self::CorruptOutput { .. } => ErrorKind::CorruptOutput,
            Self::EngineUnavailable { .. } => ErrorKind::EngineUnavailable,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::OutputWriteFailed { .. } => ErrorKind::OutputWrite,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// `true` for transient resource conditions where resubmitting later
    /// may succeed without changing the input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::QueueFull
                | ErrorKind::PoolUnavailable
                | ErrorKind::EngineUnavailable
                | ErrorKind::Download
        )
    }

    /// `true` when the failure was caused by the engine misbehaving, as opposed
    /// to the input or the caller. These count towards pool degradation.
    pub fn is_engine_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConversionTimeout | ErrorKind::EngineCrashed
        )
    }

    /// Engine diagnostics (captured stderr) carried by the error, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::EngineCrashed { detail, .. } | Self::CorruptOutput { detail, .. } => {
                Some(detail.as_str())
            }
            _ => None,
        }
    }

    pub(crate) fn invalid_input(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace {
            path: path.into(),
            source,
        }
    }
}
