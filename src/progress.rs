//! Progress-callback trait for job lifecycle events.
//!
//! Inject an [`Arc<dyn JobProgressCallback>`] via
//! [`crate::config::PoolConfigBuilder::progress_callback`] to observe jobs as
//! they are queued, picked up by an engine, and finished.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a broadcast channel, a metrics sink, or a
//! terminal progress bar without the library knowing how the host application
//! communicates. The trait is `Send + Sync` because events fire from every
//! worker task concurrently.
//!
//! # Example
//!
//! ```rust
//! use officeconv::{ConversionOutput, JobId, JobProgressCallback, PoolConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl JobProgressCallback for CountingCallback {
//!     fn on_job_complete(&self, _id: JobId, output: &ConversionOutput) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{done} done, latest {}", output.output_path.display());
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = PoolConfig::builder()
//!     .progress_callback(counter as Arc<dyn JobProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::error::ConvertError;
use crate::job::JobId;
use crate::output::ConversionOutput;
use std::sync::Arc;

/// Called by the pool as jobs move through their lifecycle.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Calls for different jobs arrive concurrently from
/// different worker tasks; protect shared mutable state accordingly.
pub trait JobProgressCallback: Send + Sync {
    /// A job passed admission and entered the queue.
    ///
    /// # Arguments
    /// * `id`: the new job
    /// * `label`: source path, URL or buffer name
    /// * `queue_depth`: jobs waiting, including this one
    fn on_job_queued(&self, id: JobId, label: &str, queue_depth: usize) {
        let _ = (id, label, queue_depth);
    }

    /// An engine instance on `slot` started converting the job.
    fn on_job_started(&self, id: JobId, slot: usize) {
        let _ = (id, slot);
    }

    /// The job succeeded and its output was delivered.
    fn on_job_complete(&self, id: JobId, output: &ConversionOutput) {
        let _ = (id, output);
    }

    /// The job failed (including cancellation and deadline expiry).
    fn on_job_failed(&self, id: JobId, error: &ConvertError) {
        let _ = (id, error);
    }

    /// The pool entered the degraded state.
    fn on_pool_degraded(&self, consecutive_failures: u32) {
        let _ = consecutive_failures;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PoolConfig`].
pub type ProgressCallback = Arc<dyn JobProgressCallback>;
