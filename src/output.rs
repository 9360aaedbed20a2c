//! Result and statistics types.

use crate::format::TargetFormat;
use crate::job::JobId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A successfully converted and validated document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionOutput {
    pub job_id: JobId,

    /// Final location of the converted file.
    pub output_path: PathBuf,

    pub target: TargetFormat,

    /// IANA media type of `output_path`.
    pub mime_type: String,

    /// Which signature check the output passed, e.g. `"PDF header (%PDF-)"`.
    pub signature: String,

    pub size_bytes: u64,

    /// Engine slot that performed the conversion.
    pub slot: usize,

    /// Time spent waiting in the queue and for an engine instance.
    pub queue_wait_ms: u64,

    /// Wall-clock time of the engine run.
    pub engine_duration_ms: u64,

    /// Submission to delivery.
    pub total_duration_ms: u64,

    /// Whatever the engine wrote to stdout/stderr. Often empty on success.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub diagnostics: String,
}

/// Counters describing pool activity since start.
///
/// `queued`, `converting` and `live_workspaces` are instantaneous; the others
/// are cumulative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub submitted: u64,
    /// Submissions refused at admission (queue full, degraded, shut down).
    pub rejected: u64,
    pub queued: usize,
    pub converting: usize,
    /// Highest `converting` value observed; never exceeds `pool_size`.
    pub peak_converting: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    pub crashes: u64,
    /// Engine instances torn down and restarted on a fresh profile.
    pub recycles: u64,
    pub live_workspaces: usize,
}

impl PoolStats {
    /// Jobs that reached a terminal state.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Whether the pool is accepting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PoolHealth {
    Healthy,
    /// Too many consecutive engine failures. New submissions are refused
    /// with `PoolUnavailable` until the degraded cooldown has elapsed.
    Degraded { consecutive_failures: u32 },
}

impl PoolHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, PoolHealth::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_serialises_with_status_tag() {
        let json = serde_json::to_string(&PoolHealth::Degraded {
            consecutive_failures: 10,
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"degraded","consecutive_failures":10}"#);
        assert!(PoolHealth::Healthy.is_healthy());
    }

    #[test]
    fn output_omits_empty_diagnostics() {
        let out = ConversionOutput {
            job_id: JobId::new(),
            output_path: "/tmp/a.pdf".into(),
            target: TargetFormat::Pdf,
            mime_type: "application/pdf".into(),
            signature: "PDF header (%PDF-)".into(),
            size_bytes: 1024,
            slot: 0,
            queue_wait_ms: 1,
            engine_duration_ms: 2,
            total_duration_ms: 3,
            diagnostics: String::new(),
        };
        let json = serde_json::to_value(&out).unwrap();
        assert!(json.get("diagnostics").is_none());
        assert_eq!(json["target"], "pdf");
    }
}
