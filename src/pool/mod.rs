//! Job scheduler and worker pool.
//!
//! ```text
//!  submit ──► resolve input ──► inspect ──► JobQueue (priority, bounded)
//!                                               │
//!                 ┌─────────────────────────────┘   pool_size workers
//!                 ▼
//!   workspace acquire ─► checkout ─► run ─► checkin ─► validate ─► post-process
//!                                                                      │
//!                            release workspace ◄── deliver ◄───────────┘ ─► resolve
//! ```
//!
//! There are exactly `pool_size` workers and each holds at most one engine
//! instance at a time, so no more than `pool_size` jobs are ever converting.
//! Jobs are resolved through their own oneshot channel, so one failure never
//! affects another job's result.

mod queue;

use crate::config::PoolConfig;
use crate::engine::{EngineAdapter, EngineRequest, Supervisor};
use crate::error::{ConvertError, ErrorKind};
use crate::format::TargetFormat;
use crate::job::{ConversionJob, ConversionRequest, JobHandle, JobId, JobState, NewJob, QueueCancel};
use crate::output::{ConversionOutput, PoolHealth, PoolStats};
use crate::pipeline::deliver::{self, Destination};
use crate::pipeline::input::{inspect_source, resolve_input};
use crate::pipeline::postprocess;
use crate::pipeline::validate::validate;
use crate::pipeline::workspace::WorkspaceManager;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use queue::{JobQueue, PushError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A pool of supervised engine instances fed by a priority queue.
///
/// # Example
///
/// ```rust,no_run
/// use officeconv::{ConversionPool, ConversionRequest, LibreOfficeAdapter, PoolConfig, TargetFormat};
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), officeconv::ConvertError> {
/// let pool = ConversionPool::start(PoolConfig::default(), Arc::new(LibreOfficeAdapter::locate()?)).await?;
/// let handle = pool
///     .submit(ConversionRequest::from_path("report.docx", TargetFormat::Pdf))
///     .await?;
/// let output = handle.await?;
/// println!("{}", output.output_path.display());
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ConversionPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    expired: AtomicU64,
    converting: AtomicUsize,
    peak_converting: AtomicUsize,
}

struct Shared {
    config: PoolConfig,
    queue: JobQueue,
    supervisor: Arc<Supervisor>,
    workspaces: WorkspaceManager,
    output_dir: PathBuf,
    callback: ProgressCallback,
    counters: Counters,
    /// Set when the pool entered the degraded state.
    degraded_since: Mutex<Option<Instant>>,
    closed: AtomicBool,
    /// Per-pool profile parent; dropped after the supervisor.
    _profiles: TempDir,
}

impl ConversionPool {
    /// Create the runtime directories, remove workspaces left by dead
    /// processes, start the engine instances and spawn the workers.
    pub async fn start(
        config: PoolConfig,
        adapter: Arc<dyn EngineAdapter>,
    ) -> Result<Self, ConvertError> {
        let workspaces = WorkspaceManager::new(config.resolved_workspace_root())?;
        let swept = workspaces.sweep_stale();
        if swept > 0 {
            info!("removed {swept} stale workspace(s) from {}", workspaces.root().display());
        }

        // Engines want an absolute profile path, and concurrent pools must not
        // share slot directories.
        let profile_root = config.resolved_profile_root();
        let profile_root =
            std::path::absolute(&profile_root).map_err(|e| ConvertError::workspace(&profile_root, e))?;
        std::fs::create_dir_all(&profile_root)
            .map_err(|e| ConvertError::workspace(&profile_root, e))?;
        let profiles = tempfile::Builder::new()
            .prefix(&format!("pool-{}-", std::process::id()))
            .tempdir_in(&profile_root)
            .map_err(|e| ConvertError::workspace(&profile_root, e))?;

        let adapter_name = adapter.name().to_string();
        let supervisor = Supervisor::start(&config, adapter, profiles.path().to_path_buf()).await?;

        let callback = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback) as ProgressCallback);
        let output_dir = config.resolved_output_dir();
        let pool_size = config.pool_size;

        let shared = Arc::new(Shared {
            queue: JobQueue::new(config.queue_capacity),
            supervisor,
            workspaces,
            output_dir,
            callback,
            counters: Counters::default(),
            degraded_since: Mutex::new(None),
            closed: AtomicBool::new(false),
            _profiles: profiles,
            config,
        });

        let workers = (0..pool_size)
            .map(|index| tokio::spawn(worker_loop(Arc::clone(&shared), index)))
            .collect();

        info!(
            "conversion pool started: {pool_size} {adapter_name} instance(s), queue capacity {}",
            shared.queue.capacity()
        );
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Validate `request`, place it in the queue, and return its handle.
    ///
    /// Everything that can be rejected without an engine is rejected here:
    /// unreadable or empty input, unknown or contradicting formats, an
    /// unsupported target. Downloads for URL inputs also happen here.
    pub async fn submit(&self, request: ConversionRequest) -> Result<JobHandle, ConvertError> {
        let shared = &self.shared;
        if shared.is_closed() {
            shared.counters.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ConvertError::PoolShutdown);
        }
        if let Some(consecutive_failures) = shared.refusing() {
            shared.counters.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ConvertError::PoolUnavailable {
                consecutive_failures,
            });
        }
        if !shared.config.supports(request.target) {
            return Err(ConvertError::UnsupportedTarget {
                target: request.target,
                supported: shared
                    .config
                    .supported_formats
                    .iter()
                    .map(TargetFormat::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        request.post.check(request.target)?;

        let submitted_at = Instant::now();
        let label = request.source.label();
        let input = resolve_input(
            request.source,
            shared.config.download_timeout_secs,
            shared.config.max_input_bytes,
        )
        .await?;
        let source_format = inspect_source(
            &input,
            request.source_format,
            request.target,
            shared.config.max_input_bytes,
        )?;

        let id = JobId::new();
        let weak = Arc::downgrade(&self.shared) as Weak<dyn QueueCancel>;
        let (mut job, handle) = ConversionJob::create(
            NewJob {
                id,
                label: label.clone(),
                input,
                source_format,
                target: request.target,
                priority: request.priority,
                destination: request.destination,
                post: request.post,
                submitted_at,
                timeout: request.timeout.unwrap_or_else(|| shared.config.job_timeout()),
            },
            weak,
        );

        let retries = shared.config.admission_retries;
        for attempt in 0..=retries {
            match shared.queue.push(job) {
                Ok(depth) => {
                    shared.counters.submitted.fetch_add(1, Ordering::SeqCst);
                    debug!(job = %id, priority = %request.priority, depth, "queued {label}");
                    shared.callback.on_job_queued(id, &label, depth);
                    return Ok(handle);
                }
                Err(PushError::Closed(_)) => {
                    shared.counters.rejected.fetch_add(1, Ordering::SeqCst);
                    return Err(ConvertError::PoolShutdown);
                }
                Err(PushError::Full(back)) => {
                    job = back;
                    if attempt < retries {
                        let delay = shared.config.retry_delay(attempt);
                        debug!(job = %id, "queue full, retrying admission in {}ms", delay.as_millis());
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        shared.counters.rejected.fetch_add(1, Ordering::SeqCst);
        warn!(job = %id, "queue full, rejecting {label}");
        Err(ConvertError::QueueFull {
            capacity: shared.queue.capacity(),
        })
    }

    /// Submit each request in order. One result per request.
    pub async fn submit_many(
        &self,
        requests: impl IntoIterator<Item = ConversionRequest>,
    ) -> Vec<Result<JobHandle, ConvertError>> {
        let mut handles = Vec::new();
        for request in requests {
            handles.push(self.submit(request).await);
        }
        handles
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        let engine = self.shared.supervisor.stats();
        PoolStats {
            submitted: c.submitted.load(Ordering::SeqCst),
            rejected: c.rejected.load(Ordering::SeqCst),
            queued: self.shared.queue.len(),
            converting: c.converting.load(Ordering::SeqCst),
            peak_converting: c.peak_converting.load(Ordering::SeqCst),
            succeeded: c.succeeded.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            cancelled: c.cancelled.load(Ordering::SeqCst),
            timeouts: engine.timeouts + c.expired.load(Ordering::SeqCst),
            crashes: engine.crashes,
            recycles: engine.recycles,
            live_workspaces: self.shared.workspaces.live(),
        }
    }

    pub fn health(&self) -> PoolHealth {
        if self.shared.degraded().is_some() {
            PoolHealth::Degraded {
                consecutive_failures: self.shared.supervisor.consecutive_failures(),
            }
        } else {
            PoolHealth::Healthy
        }
    }

    /// Stop admission, fail queued jobs with `PoolShutdown`, wait for running
    /// jobs to finish, and destroy the engine instances.
    pub async fn shutdown(&self) {
        self.shared.close();
        let workers: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut w) => w.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for w in workers {
            if let Err(e) = w.await {
                error!("worker task failed: {e}");
            }
        }
        self.shared.supervisor.shutdown();
        info!("conversion pool stopped");
    }
}

impl Drop for ConversionPool {
    fn drop(&mut self) {
        self.shared.close();
        self.shared.supervisor.shutdown();
    }
}

impl std::fmt::Debug for ConversionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionPool")
            .field("supervisor", &self.shared.supervisor)
            .field("stats", &self.stats())
            .finish()
    }
}

// ── Shared state ─────────────────────────────────────────────────────────

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.close();
        for job in self.queue.drain() {
            self.finish(job, Err(ConvertError::PoolShutdown));
        }
    }

    fn degraded(&self) -> Option<Instant> {
        match self.degraded_since.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_degraded(&self, since: Option<Instant>) {
        match self.degraded_since.lock() {
            Ok(mut g) => *g = since,
            Err(poisoned) => *poisoned.into_inner() = since,
        }
    }

    /// `Some(failures)` while a degraded pool is still inside its cooldown.
    /// Once the cooldown has elapsed admission reopens until the next
    /// engine failure or success decides.
    fn refusing(&self) -> Option<u32> {
        let since = self.degraded()?;
        (since.elapsed() < self.config.degraded_cooldown())
            .then(|| self.supervisor.consecutive_failures())
    }

    /// Record the outcome, notify the observer, and hand the result over.
    fn finish(&self, job: ConversionJob, result: Result<ConversionOutput, ConvertError>) {
        let id = job.id;
        match &result {
            Ok(output) => {
                self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
                info!(
                    job = %id,
                    slot = output.slot,
                    "{} → {} ({} bytes, {}ms)",
                    job.label,
                    output.output_path.display(),
                    output.size_bytes,
                    output.total_duration_ms
                );
                self.callback.on_job_complete(id, output);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                match e {
                    ConvertError::Cancelled => {
                        self.counters.cancelled.fetch_add(1, Ordering::SeqCst);
                        info!(job = %id, "{} cancelled", job.label);
                    }
                    _ => warn!(job = %id, "{} failed: {e}", job.label),
                }
                self.callback.on_job_failed(id, e);
            }
        }
        job.resolve(result);
    }

    /// Enter or leave the degraded state after a job outcome.
    fn update_health(&self, engine_failed: bool) {
        let failures = self.supervisor.consecutive_failures();
        let degraded = self.degraded();

        if failures == 0 {
            if degraded.is_some() {
                info!("engine recovered; pool healthy again");
                self.set_degraded(None);
            }
            return;
        }
        if !engine_failed || failures < self.config.pool_failure_limit {
            return;
        }
        // Already degraded and still cooling down: nothing new to report.
        if degraded.is_some_and(|since| since.elapsed() < self.config.degraded_cooldown()) {
            return;
        }

        error!(
            "{failures} consecutive engine failures; refusing work for {}s",
            self.config.degraded_cooldown_secs
        );
        self.set_degraded(Some(Instant::now()));
        for job in self.queue.drain() {
            self.finish(
                job,
                Err(ConvertError::PoolUnavailable {
                    consecutive_failures: failures,
                }),
            );
        }
        self.callback.on_pool_degraded(failures);
    }

    fn enter_converting(&self) {
        let now = self.counters.converting.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_converting.fetch_max(now, Ordering::SeqCst);
    }

    fn leave_converting(&self) {
        self.counters.converting.fetch_sub(1, Ordering::SeqCst);
    }
}

impl QueueCancel for Shared {
    fn cancel_queued(&self, id: JobId) {
        if let Some(job) = self.queue.remove(id) {
            self.finish(job, Err(ConvertError::Cancelled));
        }
    }
}

fn counts_against_engine(e: &ConvertError) -> bool {
    e.is_engine_failure() || e.kind() == ErrorKind::EngineUnavailable
}

// ── Workers ──────────────────────────────────────────────────────────────

async fn worker_loop(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "worker started");
    while let Some(job) = shared.queue.pop().await {
        let result = execute(&shared, &job).await;
        // Health first, so a caller woken by the result already sees it.
        shared.update_health(matches!(&result, Err(e) if counts_against_engine(e)));
        shared.finish(job, result);
    }
    debug!(worker = index, "worker stopped");
}

/// Run one job from dequeue to delivery.
async fn execute(shared: &Arc<Shared>, job: &ConversionJob) -> Result<ConversionOutput, ConvertError> {
    if job.is_cancelled() {
        return Err(ConvertError::Cancelled);
    }
    if job.is_expired() {
        shared.counters.expired.fetch_add(1, Ordering::SeqCst);
        return Err(ConvertError::ConversionTimeout {
            slot: None,
            elapsed_ms: job.elapsed_ms(),
        });
    }

    job.advance(JobState::Assigned);
    let ext = job.source_format.extension().unwrap_or("bin");
    let workspace = shared.workspaces.acquire(job.id, &job.input, ext).await?;

    // Checkout is not interrupted: an instance taken out of the idle set must
    // always come back through checkin.
    let mut instance = shared.supervisor.checkout().await?;
    if job.is_cancelled() || job.is_expired() {
        shared.supervisor.checkin(instance);
        return Err(if job.is_cancelled() {
            ConvertError::Cancelled
        } else {
            shared.counters.expired.fetch_add(1, Ordering::SeqCst);
            ConvertError::ConversionTimeout {
                slot: None,
                elapsed_ms: job.elapsed_ms(),
            }
        });
    }

    let slot = instance.slot();
    job.advance(JobState::Converting);
    shared.enter_converting();
    shared.callback.on_job_started(job.id, slot);
    let queue_wait_ms = job.elapsed_ms();
    debug!(job = %job.id, slot, generation = instance.generation(), "converting {}", job.label);

    let request = EngineRequest {
        job_id: job.id,
        input: workspace.input().to_path_buf(),
        out_dir: workspace.out_dir().to_path_buf(),
        target: job.target,
    };
    let run = shared.supervisor.run(&mut instance, &request, job.deadline).await;
    shared.leave_converting();
    shared.supervisor.checkin(instance);
    let run = run?;

    if job.is_cancelled() {
        debug!(job = %job.id, "discarding output of cancelled job");
        return Err(ConvertError::Cancelled);
    }

    job.advance(JobState::Validating);
    let mut signature = validate(&run.output, job.target)?;
    if !job.post.is_empty() {
        let pages = postprocess::apply(&run.output, &job.post).await?;
        debug!(job = %job.id, pages, stamps = job.post.stamps.len(), "post-processed {}", job.label);
        signature = validate(&run.output, job.target)?;
    }
    let output_path = deliver_output(shared, job, &run.output).await?;
    workspace.release();

    Ok(ConversionOutput {
        job_id: job.id,
        output_path,
        target: job.target,
        mime_type: job.target.mime_type().to_string(),
        signature: signature.description.to_string(),
        size_bytes: signature.size_bytes,
        slot,
        queue_wait_ms,
        engine_duration_ms: run.duration.as_millis() as u64,
        total_duration_ms: job.elapsed_ms(),
        diagnostics: run.diagnostics,
    })
}

async fn deliver_output(
    shared: &Shared,
    job: &ConversionJob,
    produced: &Path,
) -> Result<PathBuf, ConvertError> {
    let stem = job.input.stem();
    let dest = match &job.destination {
        Some(path) => Destination::Exact(path),
        None => Destination::InDir {
            dir: &shared.output_dir,
            stem: &stem,
        },
    };
    deliver::deliver(produced, job.id, job.target, dest).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::supervisor::tests::{fast_builder, Fake, FakeAdapter};
    use crate::job::Priority;
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Env {
        _dir: TempDir,
        out: PathBuf,
        config: crate::config::PoolConfigBuilder,
    }

    fn env(pool_size: usize) -> Env {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let config = fast_builder(pool_size)
            .workspace_root(dir.path().join("ws"))
            .profile_root(dir.path().join("profiles"))
            .output_dir(&out);
        Env {
            _dir: dir,
            out,
            config,
        }
    }

    fn docx_bytes() -> Vec<u8> {
        let mut data = crate::format::tests::odf_header("application/vnd.oasis.opendocument.text");
        data.extend_from_slice(b"body");
        data
    }

    fn request(name: &str) -> ConversionRequest {
        ConversionRequest::from_bytes(name, docx_bytes(), TargetFormat::Pdf)
    }

    async fn start(config: PoolConfig, script: Vec<Fake>) -> (ConversionPool, Arc<FakeAdapter>) {
        let adapter = Arc::new(FakeAdapter::with_script(script));
        let pool = ConversionPool::start(config, adapter.clone()).await.unwrap();
        (pool, adapter)
    }

    #[tokio::test]
    async fn converts_and_delivers() {
        let e = env(1);
        let (pool, _) = start(e.config.build().unwrap(), vec![Fake::Succeed]).await;
        let output = pool.submit(request("letter.odt")).await.unwrap().await.unwrap();
        assert_eq!(output.output_path, e.out.join("letter.pdf"));
        assert_eq!(output.mime_type, "application/pdf");
        assert!(output.output_path.exists());
        let stats = pool.stats();
        assert_eq!((stats.submitted, stats.succeeded, stats.live_workspaces), (1, 1, 0));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn garbage_output_is_corrupt() {
        let e = env(1);
        let (pool, _) = start(e.config.build().unwrap(), vec![Fake::Garbage]).await;
        let err = pool.submit(request("a.odt")).await.unwrap().await.unwrap_err();
        assert_matches!(err, ConvertError::CorruptOutput { format: TargetFormat::Pdf, .. });
        assert!(!e.out.join("a.pdf").exists());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn page_limit_on_non_pdf_target_is_rejected_at_submission() {
        let e = env(1);
        let (pool, adapter) = start(e.config.build().unwrap(), vec![]).await;
        let err = pool
            .submit(
                ConversionRequest::from_bytes("a.odt", docx_bytes(), TargetFormat::Docx)
                    .with_max_pages(3),
            )
            .await
            .unwrap_err();
        assert_matches!(err, ConvertError::InvalidInput { .. });
        assert_eq!(adapter.runs.load(Ordering::SeqCst), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn pdf_that_cannot_be_post_processed_is_not_delivered() {
        let e = env(1);
        let (pool, _) = start(e.config.build().unwrap(), vec![Fake::Succeed]).await;
        // The fake engine's PDF has a header and trailer but no object graph.
        let err = pool
            .submit(request("a.odt").with_max_pages(1))
            .await
            .unwrap()
            .await
            .unwrap_err();
        assert_matches!(err, ConvertError::CorruptOutput { format: TargetFormat::Pdf, .. });
        assert!(!e.out.join("a.pdf").exists());
        assert_eq!(pool.stats().live_workspaces, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn incompatible_target_is_rejected_at_submission() {
        let e = env(1);
        let (pool, adapter) = start(e.config.build().unwrap(), vec![]).await;
        let err = pool
            .submit(ConversionRequest::from_bytes("a.odt", docx_bytes(), TargetFormat::Xlsx))
            .await
            .unwrap_err();
        assert_matches!(err, ConvertError::IncompatibleFormats { .. });
        assert_eq!(adapter.runs.load(Ordering::SeqCst), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unsupported_target_is_rejected() {
        let e = env(1);
        let config = e.config.supported_formats([TargetFormat::Pdf]).build().unwrap();
        let (pool, _) = start(config, vec![]).await;
        let err = pool
            .submit(ConversionRequest::from_bytes("a.odt", docx_bytes(), TargetFormat::Docx))
            .await
            .unwrap_err();
        assert_matches!(err, ConvertError::UnsupportedTarget { ref supported, .. } if supported == "pdf");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn queue_full_when_workers_are_busy() {
        let e = env(1);
        let config = e.config.queue_capacity(1).job_timeout_secs(1).build().unwrap();
        let (pool, _) = start(config, vec![Fake::Hang]).await;

        let running = pool.submit(request("a.odt")).await.unwrap();
        // Wait until the single worker has taken the first job.
        let mut state = running.watch_state();
        state.wait_for(|s| *s == JobState::Converting).await.unwrap();

        let queued = pool.submit(request("b.odt")).await.unwrap();
        let err = pool.submit(request("c.odt")).await.unwrap_err();
        assert_matches!(err, ConvertError::QueueFull { capacity: 1 });
        assert_eq!(pool.stats().rejected, 1);

        running.cancel();
        queued.cancel();
        assert_matches!(queued.await, Err(ConvertError::Cancelled));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_a_queued_job_never_runs_it() {
        let e = env(1);
        let config = e.config.job_timeout_secs(1).build().unwrap();
        let (pool, adapter) = start(config, vec![Fake::Hang]).await;

        let blocker = pool.submit(request("a.odt")).await.unwrap();
        blocker
            .watch_state()
            .wait_for(|s| *s == JobState::Converting)
            .await
            .unwrap();
        let victim = pool.submit(request("b.odt")).await.unwrap();
        assert_eq!(victim.state(), JobState::Queued);
        victim.cancel();
        assert_matches!(victim.await, Err(ConvertError::Cancelled));
        assert_eq!(pool.stats().cancelled, 1);
        assert_eq!(adapter.runs.load(Ordering::SeqCst), 1);
        blocker.cancel();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn cancelling_a_converting_job_discards_its_output() {
        let e = env(1);
        let (pool, _) = start(e.config.build().unwrap(), vec![Fake::Slow(500)]).await;
        let handle = pool.submit(request("a.odt")).await.unwrap();
        handle
            .watch_state()
            .wait_for(|s| *s == JobState::Converting)
            .await
            .unwrap();
        handle.cancel();
        assert_matches!(handle.await, Err(ConvertError::Cancelled));
        assert!(!e.out.join("a.pdf").exists());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn expired_in_queue_never_reaches_engine() {
        let e = env(1);
        let (pool, adapter) = start(e.config.build().unwrap(), vec![]).await;
        let handle = pool
            .submit(request("a.odt").with_timeout(Duration::ZERO))
            .await
            .unwrap();
        assert_matches!(handle.await, Err(ConvertError::ConversionTimeout { slot: None, .. }));
        assert_eq!(adapter.runs.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().timeouts, 1);
        pool.shutdown().await;
    }

    #[derive(Default)]
    struct StartOrder(Mutex<Vec<JobId>>);

    impl crate::progress::JobProgressCallback for StartOrder {
        fn on_job_started(&self, id: JobId, _slot: usize) {
            self.0.lock().unwrap().push(id);
        }
    }

    #[tokio::test]
    async fn priority_reorders_waiting_jobs() {
        let e = env(1);
        let order = Arc::new(StartOrder::default());
        let config = e
            .config
            .progress_callback(order.clone())
            .build()
            .unwrap();
        let (pool, _) = start(config, vec![Fake::Slow(300)]).await;

        let first = pool.submit(request("first.odt")).await.unwrap();
        first
            .watch_state()
            .wait_for(|s| *s == JobState::Converting)
            .await
            .unwrap();
        let low = pool.submit(request("low.odt").with_priority(Priority::Low)).await.unwrap();
        let normal = pool.submit(request("normal.odt")).await.unwrap();
        let urgent = pool
            .submit(request("urgent.odt").with_priority(Priority::Urgent))
            .await
            .unwrap();
        let expected = vec![first.id(), urgent.id(), normal.id(), low.id()];

        for h in [first, low, normal, urgent] {
            h.await.unwrap();
        }
        assert_eq!(*order.0.lock().unwrap(), expected);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_crashes_degrade_the_pool() {
        let e = env(1);
        let config = e
            .config
            .pool_failure_limit(2)
            .failure_threshold(10)
            .degraded_cooldown_secs(60)
            .build()
            .unwrap();
        let (pool, _) = start(config, vec![Fake::Crash(1), Fake::Crash(1)]).await;

        for name in ["a.odt", "b.odt"] {
            let err = pool.submit(request(name)).await.unwrap().await.unwrap_err();
            assert_matches!(err, ConvertError::EngineCrashed { .. });
        }
        assert_matches!(pool.health(), PoolHealth::Degraded { consecutive_failures: 2 });
        assert_matches!(
            pool.submit(request("c.odt")).await,
            Err(ConvertError::PoolUnavailable { consecutive_failures: 2 })
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn degraded_pool_reopens_after_cooldown_and_recovers_on_success() {
        let e = env(1);
        let config = e
            .config
            .pool_failure_limit(2)
            .failure_threshold(10)
            .degraded_cooldown_secs(1)
            .build()
            .unwrap();
        let (pool, _) = start(config, vec![Fake::Crash(1), Fake::Crash(1), Fake::Succeed]).await;

        for name in ["a.odt", "b.odt"] {
            let _ = pool.submit(request(name)).await.unwrap().await.unwrap_err();
        }
        assert_matches!(
            pool.submit(request("refused.odt")).await,
            Err(ConvertError::PoolUnavailable { .. })
        );

        tokio::time::sleep(Duration::from_millis(1100)).await;
        // Half-open: admission is back, health waits for a success.
        assert_matches!(pool.health(), PoolHealth::Degraded { .. });
        let output = pool.submit(request("c.odt")).await.unwrap().await.unwrap();
        assert!(output.output_path.exists());
        assert_eq!(pool.health(), PoolHealth::Healthy);
        assert_eq!(pool.stats().rejected, 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_admits_after_backoff_when_a_slot_frees() {
        let e = env(1);
        let config = e
            .config
            .queue_capacity(1)
            .admission_retries(6)
            .retry_backoff_ms(40)
            .build()
            .unwrap();
        let (pool, _) = start(config, vec![Fake::Slow(200)]).await;

        let running = pool.submit(request("a.odt")).await.unwrap();
        running
            .watch_state()
            .wait_for(|s| *s == JobState::Converting)
            .await
            .unwrap();
        let waiting = pool.submit(request("b.odt")).await.unwrap();
        assert_eq!(pool.stats().queued, 1);

        // Blocks in backoff until `a` finishes and `b` leaves the queue.
        let late = pool.submit(request("c.odt")).await.unwrap();
        for h in [running, waiting, late] {
            h.await.unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.succeeded, 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_without_retries_rejects() {
        let e = env(1);
        let config = e.config.queue_capacity(1).admission_retries(0).build().unwrap();
        let (pool, _) = start(config, vec![Fake::Slow(200)]).await;

        let running = pool.submit(request("a.odt")).await.unwrap();
        running
            .watch_state()
            .wait_for(|s| *s == JobState::Converting)
            .await
            .unwrap();
        let waiting = pool.submit(request("b.odt")).await.unwrap();
        assert_matches!(
            pool.submit(request("c.odt")).await,
            Err(ConvertError::QueueFull { capacity: 1 })
        );
        assert_eq!(pool.stats().rejected, 1);
        running.await.unwrap();
        waiting.await.unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_queued_jobs_and_refuses_new_ones() {
        let e = env(1);
        let config = e.config.job_timeout_secs(1).build().unwrap();
        let (pool, _) = start(config, vec![Fake::Hang]).await;
        let running = pool.submit(request("a.odt")).await.unwrap();
        running
            .watch_state()
            .wait_for(|s| *s == JobState::Converting)
            .await
            .unwrap();
        let queued = pool.submit(request("b.odt")).await.unwrap();

        pool.shutdown().await;
        assert_matches!(queued.await, Err(ConvertError::PoolShutdown));
        assert_matches!(running.await, Err(ConvertError::ConversionTimeout { .. }));
        assert_matches!(pool.submit(request("c.odt")).await, Err(ConvertError::PoolShutdown));
    }
}
