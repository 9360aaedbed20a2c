//! Engine process supervisor.
//!
//! The supervisor owns every [`EngineInstance`]. Instances are moved out by
//! value on [`Supervisor::checkout`] and moved back on [`Supervisor::checkin`],
//! so holding an instance *is* the exclusive right to its profile directory;
//! no flag or lock file is consulted to decide who may use a profile.
//!
//! ```text
//!            checkout                      run
//!   Idle ───────────────► Busy ─────────────────────────► checkin
//!    ▲   health check /                │ crash / hang / spawn failure
//!    │   respawn + probe               ▼
//!    └──────────── Restarting ◄──── Unhealthy (cooldown after N failures)
//! ```
//!
//! A run finishes on whichever comes first:
//!
//! 1. **process exit**: non-zero is `EngineCrashed` and recycles the instance;
//!    a clean exit without output is `CorruptOutput` and keeps it.
//! 2. **output materialised**: non-empty and the same size on two polls. The
//!    process gets `exit_grace` to exit. One that is still running has stalled
//!    with a possibly half-written file: it is killed, the instance recycled,
//!    and the job fails with `EngineCrashed`.
//! 3. **deadline**: the process group is SIGKILLed and reaped within
//!    `kill_grace`, the instance recycled, and the job fails with
//!    `ConversionTimeout`.
//!
//! When the adapter keeps a resident process per slot, it is started after
//! the warm-up probe and must stay alive (and reachable on its control
//! endpoints) for the instance to go back to Idle. Recycling kills it.

use crate::config::PoolConfig;
use crate::engine::adapter::{EngineAdapter, EngineRequest, SlotContext};
use crate::engine::process::{ProcessExit, ProcessHandle};
use crate::error::ConvertError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Lifecycle status of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Idle,
    Busy,
    Unhealthy,
    Restarting,
}

/// One engine slot: profile, process and failure bookkeeping.
pub struct EngineInstance {
    ctx: SlotContext,
    status: InstanceStatus,
    /// Long-lived engine process serving this slot, if the adapter keeps one.
    resident: Option<Box<dyn ProcessHandle>>,
    /// Killed processes not reaped yet; cleared before the slot is reused.
    leftovers: Vec<Box<dyn ProcessHandle>>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    needs_respawn: bool,
    needs_probe: bool,
}

impl EngineInstance {
    fn new(ctx: SlotContext) -> Self {
        Self {
            ctx,
            status: InstanceStatus::Unhealthy,
            resident: None,
            leftovers: Vec::new(),
            consecutive_failures: 0,
            cooldown_until: None,
            needs_respawn: false,
            needs_probe: true,
        }
    }

    pub fn slot(&self) -> usize {
        self.ctx.slot
    }

    pub fn generation(&self) -> u64 {
        self.ctx.generation
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn context(&self) -> &SlotContext {
        &self.ctx
    }

    pub fn has_resident(&self) -> bool {
        self.resident.is_some()
    }

    /// Why the resident process is no longer running, if it is not.
    fn resident_gone(&mut self) -> Option<String> {
        let resident = self.resident.as_mut()?;
        match resident.exit_status() {
            Ok(None) => None,
            Ok(Some(exit)) => Some(format!("{exit}: {}", resident.diagnostics().trim())),
            Err(e) => Some(format!("lost track of it: {e}")),
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn needs_work(&self) -> bool {
        self.needs_respawn || self.needs_probe || !self.leftovers.is_empty()
    }
}

impl std::fmt::Debug for EngineInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineInstance")
            .field("slot", &self.ctx.slot)
            .field("generation", &self.ctx.generation)
            .field("status", &self.status)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

/// What a successful engine run produced.
#[derive(Debug, Clone)]
pub struct EngineRun {
    pub output: PathBuf,
    pub diagnostics: String,
    pub duration: Duration,
}

/// Supervisor counters, folded into [`crate::PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub timeouts: u64,
    pub crashes: u64,
    pub recycles: u64,
}

pub struct Supervisor {
    adapter: Arc<dyn EngineAdapter>,
    config: PoolConfig,
    profile_root: PathBuf,
    idle: Mutex<Vec<EngineInstance>>,
    /// One permit per instance in `idle`.
    available: Semaphore,
    pool_failures: AtomicU32,
    timeouts: AtomicU64,
    crashes: AtomicU64,
    recycles: AtomicU64,
    closed: AtomicBool,
}

impl Supervisor {
    /// Create `config.pool_size` instance slots under `profile_root`.
    ///
    /// With `warm_start` every instance runs its warm-up probe now, in
    /// parallel. Fails only if warm start was requested and no instance
    /// came up.
    pub async fn start(
        config: &PoolConfig,
        adapter: Arc<dyn EngineAdapter>,
        profile_root: PathBuf,
    ) -> Result<Arc<Self>, ConvertError> {
        std::fs::create_dir_all(&profile_root)
            .map_err(|e| ConvertError::workspace(&profile_root, e))?;

        let sup = Arc::new(Self {
            adapter,
            config: config.clone(),
            profile_root,
            idle: Mutex::new(Vec::with_capacity(config.pool_size)),
            available: Semaphore::new(0),
            pool_failures: AtomicU32::new(0),
            timeouts: AtomicU64::new(0),
            crashes: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let instances: Vec<EngineInstance> = (0..config.pool_size)
            .map(|slot| {
                // Generations from an earlier process may still be on disk.
                let _ = std::fs::remove_dir_all(sup.profile_root.join(format!("slot-{slot}")));
                EngineInstance::new(SlotContext::new(&sup.profile_root, slot, 0))
            })
            .collect();

        if config.warm_start {
            let results =
                futures::future::join_all(instances.into_iter().map(|inst| sup.prepare(inst)))
                    .await;
            let mut healthy = 0;
            let mut last_err = None;
            for result in results {
                match result {
                    Ok(inst) => {
                        healthy += 1;
                        sup.put_back(inst);
                    }
                    Err((inst, e)) => {
                        warn!(slot = inst.slot(), "warm start failed: {e}");
                        last_err = Some(e);
                        sup.put_back(inst);
                    }
                }
            }
            if healthy == 0 {
                let detail = last_err.map(|e| e.to_string()).unwrap_or_default();
                sup.shutdown();
                return Err(ConvertError::EngineUnavailable {
                    attempts: config.pool_size as u32,
                    detail: format!("no {} instance started: {detail}", sup.adapter.name()),
                });
            }
            info!(
                "{} of {} {} instance(s) warm",
                healthy,
                config.pool_size,
                sup.adapter.name()
            );
        } else {
            for inst in instances {
                sup.put_back(inst);
            }
        }
        Ok(sup)
    }

    pub fn adapter(&self) -> &Arc<dyn EngineAdapter> {
        &self.adapter
    }

    /// Consecutive engine failures across all slots since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.pool_failures.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            timeouts: self.timeouts.load(Ordering::SeqCst),
            crashes: self.crashes.load(Ordering::SeqCst),
            recycles: self.recycles.load(Ordering::SeqCst),
        }
    }

    /// Number of instances currently checked in.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|v| v.len()).unwrap_or(0)
    }

    // ── Checkout / checkin ───────────────────────────────────────────────

    /// Take a healthy instance, waiting up to `checkout_timeout` per attempt.
    ///
    /// Instances that fail their health check or warm-up probe are returned
    /// for respawn and the next attempt follows after an exponential backoff.
    pub async fn checkout(&self) -> Result<EngineInstance, ConvertError> {
        let attempts = self.config.checkout_retries;
        let mut last_detail = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay(attempt - 1)).await;
            }
            let permit =
                match tokio::time::timeout(self.config.checkout_timeout(), self.available.acquire())
                    .await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(ConvertError::PoolShutdown),
                    Err(_) => {
                        last_detail = format!(
                            "no instance became idle within {}s",
                            self.config.checkout_timeout_secs
                        );
                        debug!("checkout attempt {}: {last_detail}", attempt + 1);
                        continue;
                    }
                };
            permit.forget();

            let Some(inst) = self.take_best() else {
                return Err(ConvertError::Internal(
                    "idle permit without an idle instance".into(),
                ));
            };

            match self.prepare(inst).await {
                Ok(mut inst) => {
                    inst.status = InstanceStatus::Busy;
                    debug!(
                        slot = inst.slot(),
                        generation = inst.generation(),
                        "instance checked out"
                    );
                    return Ok(inst);
                }
                Err((inst, e)) => {
                    last_detail = e.to_string();
                    debug!(slot = inst.slot(), "checkout attempt {}: {e}", attempt + 1);
                    self.put_back(inst);
                }
            }
        }

        Err(ConvertError::EngineUnavailable {
            attempts,
            detail: last_detail,
        })
    }

    /// Return an instance after a run.
    ///
    /// A resident process that died during the run marks the instance for
    /// respawn; one with control endpoints must still answer on them before
    /// the instance is Idle again. An instance that needs a respawn and has
    /// no cooldown pending is recycled in the background right away;
    /// otherwise recycling happens at its next checkout.
    pub fn checkin(self: &Arc<Self>, mut inst: EngineInstance) {
        if self.closed.load(Ordering::SeqCst) {
            self.destroy(inst);
            return;
        }
        if !inst.needs_respawn {
            if let Some(detail) = inst.resident_gone() {
                warn!(slot = inst.slot(), "resident engine died during the job ({detail})");
                self.crashes.fetch_add(1, Ordering::SeqCst);
                self.mark_for_respawn(&mut inst);
            }
        }
        if inst.needs_respawn {
            if inst.cooldown_remaining(Instant::now()).is_zero() {
                self.recycle_in_background(inst);
            } else {
                self.put_back(inst);
            }
            return;
        }
        if inst.status == InstanceStatus::Busy {
            if inst.has_resident() && !self.adapter.control_endpoints(&inst.ctx).is_empty() {
                let sup = Arc::clone(self);
                tokio::spawn(async move {
                    if !sup.verify_resident(&mut inst).await
                        && inst.cooldown_remaining(Instant::now()).is_zero()
                    {
                        inst.status = InstanceStatus::Restarting;
                        inst = match sup.prepare(inst).await {
                            Ok(inst) | Err((inst, _)) => inst,
                        };
                    }
                    sup.put_back(inst);
                });
                return;
            }
            inst.status = InstanceStatus::Idle;
        }
        self.put_back(inst);
    }

    fn recycle_in_background(self: &Arc<Self>, mut inst: EngineInstance) {
        inst.status = InstanceStatus::Restarting;
        let sup = Arc::clone(self);
        tokio::spawn(async move {
            let inst = match sup.prepare(inst).await {
                Ok(inst) | Err((inst, _)) => inst,
            };
            sup.put_back(inst);
        });
    }

    /// Check the resident of a returned instance. `false` marks it for respawn.
    async fn verify_resident(&self, inst: &mut EngineInstance) -> bool {
        let Some(resident) = inst.resident.as_mut() else {
            return true;
        };
        let ready = self
            .await_responsive(&inst.ctx, resident.as_mut(), self.config.kill_grace())
            .await;
        match ready {
            Ok(()) => {
                inst.status = InstanceStatus::Idle;
                true
            }
            Err(e) => {
                warn!(slot = inst.slot(), "resident engine failed its health check: {e}");
                self.crashes.fetch_add(1, Ordering::SeqCst);
                self.mark_for_respawn(inst);
                false
            }
        }
    }

    fn put_back(&self, mut inst: EngineInstance) {
        if self.closed.load(Ordering::SeqCst) {
            self.destroy(inst);
            return;
        }
        if inst.status == InstanceStatus::Restarting {
            inst.status = InstanceStatus::Unhealthy;
        }
        match self.idle.lock() {
            Ok(mut idle) => idle.push(inst),
            Err(poisoned) => poisoned.into_inner().push(inst),
        }
        self.available.add_permits(1);
    }

    /// Pick the instance that can serve soonest, preferring ones that need
    /// no respawn or probe.
    fn take_best(&self) -> Option<EngineInstance> {
        let mut idle = match self.idle.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        let (idx, _) = idle
            .iter()
            .enumerate()
            .min_by_key(|(_, i)| (i.cooldown_remaining(now), i.needs_work()))?;
        Some(idle.swap_remove(idx))
    }

    // ── Health check, respawn, probe ─────────────────────────────────────

    /// Make `inst` ready to serve: wait out its cooldown, check the resident,
    /// clear leftovers and stale locks, respawn on a fresh profile if needed,
    /// warm up.
    async fn prepare(
        &self,
        mut inst: EngineInstance,
    ) -> Result<EngineInstance, (EngineInstance, ConvertError)> {
        let wait = inst.cooldown_remaining(Instant::now());
        if !wait.is_zero() {
            if wait > self.config.checkout_timeout() {
                let e = ConvertError::EngineUnavailable {
                    attempts: 1,
                    detail: format!(
                        "slot {} cooling down for another {}ms",
                        inst.slot(),
                        wait.as_millis()
                    ),
                };
                return Err((inst, e));
            }
            debug!(slot = inst.slot(), "waiting {}ms for respawn cooldown", wait.as_millis());
            tokio::time::sleep(wait).await;
        }
        inst.cooldown_until = None;

        if !inst.needs_respawn {
            if let Some(detail) = inst.resident_gone() {
                warn!(slot = inst.slot(), "resident engine exited while idle ({detail})");
                self.crashes.fetch_add(1, Ordering::SeqCst);
                inst.needs_respawn = true;
            }
        }
        if inst.needs_respawn {
            self.retire_resident(&mut inst);
        }

        let leftovers = std::mem::take(&mut inst.leftovers);
        let had_leftovers = !leftovers.is_empty();
        for mut proc in leftovers {
            if proc.is_alive() {
                debug!(slot = inst.slot(), pid = ?proc.id(), "killing leftover engine process");
                let _ = proc.terminate();
                if self.reap(proc.as_mut(), self.config.kill_grace()).await.is_none() {
                    inst.leftovers.push(proc);
                }
            }
        }
        if !inst.leftovers.is_empty() {
            inst.status = InstanceStatus::Unhealthy;
            let e = ConvertError::EngineUnavailable {
                attempts: 1,
                detail: format!("slot {} has an unkillable engine process", inst.slot()),
            };
            return Err((inst, e));
        }
        if had_leftovers {
            inst.needs_respawn = true;
        }

        if inst.needs_respawn {
            self.respawn(&mut inst);
        } else if !inst.has_resident() {
            // A live resident holds its profile lock legitimately.
            self.clear_stale_locks(&inst);
        }

        if let Err(e) = std::fs::create_dir_all(&inst.ctx.profile_dir) {
            let e = ConvertError::workspace(&inst.ctx.profile_dir, e);
            inst.status = InstanceStatus::Unhealthy;
            return Err((inst, e));
        }

        if inst.needs_probe {
            match self.warm_up(&inst.ctx).await {
                Ok(resident) => {
                    inst.resident = resident;
                    inst.needs_probe = false;
                }
                Err(e) => {
                    self.record_failure(&mut inst);
                    inst.needs_respawn = true;
                    inst.status = InstanceStatus::Unhealthy;
                    return Err((inst, e));
                }
            }
        }

        inst.status = InstanceStatus::Idle;
        Ok(inst)
    }

    /// Move `inst` to a fresh profile generation.
    fn respawn(&self, inst: &mut EngineInstance) {
        let old = inst.ctx.profile_dir.clone();
        if let Err(e) = std::fs::remove_dir_all(&old) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(slot = inst.slot(), "cannot remove profile {}: {e}", old.display());
            }
        }
        inst.ctx = SlotContext::new(&self.profile_root, inst.ctx.slot, inst.ctx.generation + 1);
        inst.needs_respawn = false;
        inst.needs_probe = true;
        inst.status = InstanceStatus::Restarting;
        self.recycles.fetch_add(1, Ordering::SeqCst);
        info!(
            slot = inst.slot(),
            generation = inst.generation(),
            "recycling engine instance"
        );
    }

    fn clear_stale_locks(&self, inst: &EngineInstance) {
        for lock in self.adapter.stale_locks(&inst.ctx) {
            if lock.exists() {
                warn!(slot = inst.slot(), "removing stale profile lock {}", lock.display());
                let _ = std::fs::remove_file(&lock);
            }
        }
    }

    /// Run the warm-up probe, then start the resident process and wait until
    /// it is responsive.
    async fn warm_up(
        &self,
        ctx: &SlotContext,
    ) -> Result<Option<Box<dyn ProcessHandle>>, ConvertError> {
        self.probe(ctx).await?;

        let mut resident = match self.adapter.start_resident(ctx) {
            Ok(Some(p)) => p,
            Ok(None) => return Ok(None),
            Err(e) => {
                return Err(ConvertError::EngineCrashed {
                    slot: ctx.slot,
                    exit_code: None,
                    detail: format!("cannot start resident {}: {e}", self.adapter.name()),
                })
            }
        };
        let started = Instant::now();
        let ready = self
            .await_responsive(ctx, resident.as_mut(), self.config.probe_timeout())
            .await;
        match ready {
            Ok(()) => {
                debug!(
                    slot = ctx.slot,
                    generation = ctx.generation,
                    pid = ?resident.id(),
                    "resident engine ready in {}ms",
                    started.elapsed().as_millis()
                );
                Ok(Some(resident))
            }
            Err(e) => {
                let _ = resident.terminate();
                let _ = self.reap(resident.as_mut(), self.config.kill_grace()).await;
                Err(e)
            }
        }
    }

    /// Wait until `resident` accepts a connection on one of the adapter's
    /// control endpoints, failing if it exits or `wait` runs out first.
    async fn await_responsive(
        &self,
        ctx: &SlotContext,
        resident: &mut dyn ProcessHandle,
        wait: Duration,
    ) -> Result<(), ConvertError> {
        let endpoints = self.adapter.control_endpoints(ctx);
        let started = Instant::now();
        let until = started + wait;
        let step = self.config.poll_interval().min(Duration::from_millis(50));
        loop {
            match resident.exit_status() {
                Ok(None) => {}
                Ok(Some(exit)) => {
                    return Err(ConvertError::EngineCrashed {
                        slot: ctx.slot,
                        exit_code: exit.code,
                        detail: format!("resident engine exited ({exit}): {}", resident.diagnostics()),
                    })
                }
                Err(e) => {
                    return Err(ConvertError::EngineCrashed {
                        slot: ctx.slot,
                        exit_code: None,
                        detail: format!("lost track of resident engine: {e}"),
                    })
                }
            }
            if endpoints.is_empty() {
                return Ok(());
            }
            for endpoint in &endpoints {
                if endpoint_reachable(endpoint).await {
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= until {
                debug!(slot = ctx.slot, ?endpoints, "no control endpoint answered");
                return Err(ConvertError::ConversionTimeout {
                    slot: Some(ctx.slot),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(step.min(until - now)).await;
        }
    }

    async fn probe(&self, ctx: &SlotContext) -> Result<(), ConvertError> {
        let crashed = |exit_code, detail| ConvertError::EngineCrashed {
            slot: ctx.slot,
            exit_code,
            detail,
        };

        let mut proc = match self.adapter.probe(ctx) {
            Ok(Some(p)) => p,
            Ok(None) => return Ok(()),
            Err(e) => {
                return Err(crashed(
                    None,
                    format!("cannot start {} probe: {e}", self.adapter.name()),
                ))
            }
        };

        let started = Instant::now();
        match self.reap(proc.as_mut(), self.config.probe_timeout()).await {
            Some(exit) if exit.success() => {
                debug!(
                    slot = ctx.slot,
                    generation = ctx.generation,
                    "probe ok in {}ms",
                    started.elapsed().as_millis()
                );
                Ok(())
            }
            Some(exit) => Err(crashed(
                exit.code,
                format!("warm-up probe failed ({exit}): {}", proc.diagnostics()),
            )),
            None => {
                let _ = proc.terminate();
                let _ = self.reap(proc.as_mut(), self.config.kill_grace()).await;
                Err(ConvertError::ConversionTimeout {
                    slot: Some(ctx.slot),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Poll until the process exits or `grace` elapses.
    async fn reap(&self, proc: &mut dyn ProcessHandle, grace: Duration) -> Option<ProcessExit> {
        let until = Instant::now() + grace;
        let step = self.config.poll_interval().min(Duration::from_millis(50));
        loop {
            match proc.exit_status() {
                Ok(Some(exit)) => return Some(exit),
                Ok(None) => {}
                Err(e) => {
                    warn!("cannot query engine process: {e}");
                    return None;
                }
            }
            let now = Instant::now();
            if now >= until {
                return None;
            }
            tokio::time::sleep(step.min(until - now)).await;
        }
    }

    fn record_failure(&self, inst: &mut EngineInstance) {
        inst.consecutive_failures += 1;
        self.pool_failures.fetch_add(1, Ordering::SeqCst);
        let cooldown = self.config.respawn_cooldown(inst.consecutive_failures);
        if !cooldown.is_zero() {
            warn!(
                slot = inst.slot(),
                failures = inst.consecutive_failures,
                "respawn delayed by {}ms",
                cooldown.as_millis()
            );
            inst.cooldown_until = Some(Instant::now() + cooldown);
        }
    }

    fn record_success(&self, inst: &mut EngineInstance) {
        inst.consecutive_failures = 0;
        self.pool_failures.store(0, Ordering::SeqCst);
    }

    // ── Run ──────────────────────────────────────────────────────────────

    /// Run one conversion on a checked-out instance.
    pub async fn run(
        &self,
        inst: &mut EngineInstance,
        request: &EngineRequest,
        deadline: Instant,
    ) -> Result<EngineRun, ConvertError> {
        let slot = inst.slot();
        let started = Instant::now();
        let output = self.adapter.output_path(request);

        let mut proc = match self.adapter.convert(&inst.ctx, request) {
            Ok(p) => p,
            Err(e) => {
                self.crashes.fetch_add(1, Ordering::SeqCst);
                self.mark_for_respawn(inst);
                return Err(ConvertError::EngineCrashed {
                    slot,
                    exit_code: None,
                    detail: format!("cannot start {}: {e}", self.adapter.name()),
                });
            }
        };
        debug!(job = %request.job_id, slot, pid = ?proc.id(), "engine started");

        let mut last_size: Option<u64> = None;
        loop {
            // (1) process exit
            let status = proc.exit_status();
            match status {
                Ok(Some(exit)) if exit.success() => {
                    let diagnostics = proc.diagnostics();
                    return if file_size(&output) > 0 {
                        self.record_success(inst);
                        Ok(EngineRun {
                            output,
                            diagnostics,
                            duration: started.elapsed(),
                        })
                    } else {
                        // Clean exit is not an engine fault; the instance stays.
                        Err(ConvertError::CorruptOutput {
                            format: request.target,
                            detail: no_output_detail(&output, &diagnostics),
                        })
                    };
                }
                Ok(Some(exit)) => {
                    return Err(self.crashed(inst, exit.code, exit, proc.diagnostics()));
                }
                Err(e) => {
                    let _ = proc.terminate();
                    let detail = format!("lost track of engine process: {e}");
                    inst.leftovers.push(proc);
                    self.crashes.fetch_add(1, Ordering::SeqCst);
                    self.mark_for_respawn(inst);
                    return Err(ConvertError::EngineCrashed {
                        slot,
                        exit_code: None,
                        detail,
                    });
                }
                Ok(None) => {}
            }

            // (2) output materialised and stable
            let size = file_size(&output);
            if size > 0 && last_size == Some(size) {
                return self.finish_lingering(inst, proc, request, output, started).await;
            }
            last_size = (size > 0).then_some(size);

            // (3) deadline
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(inst, proc, request, started).await);
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    /// The output stopped growing but the engine is still running. Only an
    /// exit within `exit_grace` proves the file was finished.
    async fn finish_lingering(
        &self,
        inst: &mut EngineInstance,
        mut proc: Box<dyn ProcessHandle>,
        request: &EngineRequest,
        output: PathBuf,
        started: Instant,
    ) -> Result<EngineRun, ConvertError> {
        match self.reap(proc.as_mut(), self.config.exit_grace()).await {
            Some(exit) if exit.success() => {
                self.record_success(inst);
                Ok(EngineRun {
                    output,
                    diagnostics: proc.diagnostics(),
                    duration: started.elapsed(),
                })
            }
            Some(exit) => Err(self.crashed(inst, exit.code, exit, proc.diagnostics())),
            None => {
                let written = file_size(&output);
                warn!(
                    job = %request.job_id,
                    slot = inst.slot(),
                    "engine stalled for {}ms after writing {written} bytes; killing it",
                    self.config.exit_grace_ms
                );
                let _ = proc.terminate();
                let diagnostics = proc.diagnostics();
                if self.reap(proc.as_mut(), self.config.kill_grace()).await.is_none() {
                    inst.leftovers.push(proc);
                }
                self.crashes.fetch_add(1, Ordering::SeqCst);
                self.mark_for_respawn(inst);
                let mut detail = format!(
                    "engine stopped writing after {written} bytes and did not exit within {}ms; \
                     the output may be incomplete and was discarded",
                    self.config.exit_grace_ms
                );
                if !diagnostics.trim().is_empty() {
                    detail.push_str(": ");
                    detail.push_str(diagnostics.trim());
                }
                Err(ConvertError::EngineCrashed {
                    slot: inst.slot(),
                    exit_code: None,
                    detail,
                })
            }
        }
    }

    async fn timed_out(
        &self,
        inst: &mut EngineInstance,
        mut proc: Box<dyn ProcessHandle>,
        request: &EngineRequest,
        started: Instant,
    ) -> ConvertError {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        warn!(
            job = %request.job_id,
            slot = inst.slot(),
            pid = ?proc.id(),
            "engine hit the job deadline after {elapsed_ms}ms; killing it"
        );
        if let Err(e) = proc.terminate() {
            warn!(slot = inst.slot(), "terminate failed: {e}");
        }
        if self.reap(proc.as_mut(), self.config.kill_grace()).await.is_none() {
            inst.leftovers.push(proc);
        }
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        self.mark_for_respawn(inst);
        ConvertError::ConversionTimeout {
            slot: Some(inst.slot()),
            elapsed_ms,
        }
    }

    fn crashed(
        &self,
        inst: &mut EngineInstance,
        exit_code: Option<i32>,
        exit: ProcessExit,
        diagnostics: String,
    ) -> ConvertError {
        warn!(slot = inst.slot(), "engine exited abnormally ({exit})");
        self.crashes.fetch_add(1, Ordering::SeqCst);
        self.mark_for_respawn(inst);
        let detail = if diagnostics.trim().is_empty() {
            exit.to_string()
        } else {
            diagnostics
        };
        ConvertError::EngineCrashed {
            slot: inst.slot(),
            exit_code,
            detail,
        }
    }

    fn mark_for_respawn(&self, inst: &mut EngineInstance) {
        self.record_failure(inst);
        self.retire_resident(inst);
        inst.needs_respawn = true;
        inst.status = InstanceStatus::Unhealthy;
    }

    /// Kill the resident process; it is reaped with the other leftovers.
    fn retire_resident(&self, inst: &mut EngineInstance) {
        if let Some(mut resident) = inst.resident.take() {
            if let Err(e) = resident.terminate() {
                warn!(slot = inst.slot(), "cannot kill resident engine: {e}");
            }
            inst.leftovers.push(resident);
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Stop handing out instances and destroy the idle ones. Busy instances
    /// are destroyed when they are checked in.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.available.close();
        let drained: Vec<EngineInstance> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for inst in drained {
            self.destroy(inst);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn destroy(&self, mut inst: EngineInstance) {
        for mut proc in inst.resident.take().into_iter().chain(inst.leftovers.drain(..)) {
            let _ = proc.terminate();
        }
        let slot_dir = self.profile_root.join(format!("slot-{}", inst.slot()));
        if let Err(e) = std::fs::remove_dir_all(&slot_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(slot = inst.slot(), "cannot remove {}: {e}", slot_dir.display());
            }
        }
        debug!(slot = inst.slot(), "instance destroyed");
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("adapter", &self.adapter.name())
            .field("profile_root", &self.profile_root)
            .field("idle", &self.idle_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(unix)]
async fn endpoint_reachable(path: &Path) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_millis(500),
            tokio::net::UnixStream::connect(path)
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(not(unix))]
async fn endpoint_reachable(path: &Path) -> bool {
    path.exists()
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn no_output_detail(output: &Path, diagnostics: &str) -> String {
    let mut detail = format!(
        "engine exited cleanly without producing {}",
        output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    if !diagnostics.trim().is_empty() {
        detail.push_str(": ");
        detail.push_str(diagnostics.trim());
    }
    detail
}
