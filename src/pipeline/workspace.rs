//! Per-job workspaces.
//!
//! Every job gets a fresh directory under the workspace root:
//!
//! ```text
//! <root>/job-<pid>-<job id>-XXXXXX/
//!   in/input.<ext>     private copy of the source (or the in-memory bytes)
//!   out/               engine output directory
//! ```
//!
//! The directory is a [`TempDir`], so it is removed on every exit path:
//! explicitly by [`Workspace::release`], or by `Drop` if the job panics or
//! the worker is aborted. Engines leave lock and temp files behind; they go
//! with the directory.
//!
//! A caller's file is always copied, never hard-linked: an engine that
//! rewrites its input in place must not reach the original. Only a
//! download, which already belongs to the job, may be linked.

use crate::error::ConvertError;
use crate::job::JobId;
use crate::pipeline::input::ResolvedInput;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

const DIR_PREFIX: &str = "job-";

/// Creates and tracks job workspaces under one root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    live: Arc<AtomicUsize>,
}

impl WorkspaceManager {
    /// Use `root` as the workspace parent, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ConvertError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ConvertError::workspace(&root, e))?;
        Ok(Self {
            root,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of workspaces acquired and not yet released or dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Create a workspace for `job` and place the source in it as
    /// `in/input.<ext>`.
    pub async fn acquire(
        &self,
        job: JobId,
        input: &ResolvedInput,
        ext: &str,
    ) -> Result<Workspace, ConvertError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{DIR_PREFIX}{}-{}-", std::process::id(), job))
            .tempdir_in(&self.root)
            .map_err(|e| ConvertError::workspace(&self.root, e))?;

        // From here on `ws` owns the directory; any early return drops it.
        self.live.fetch_add(1, Ordering::SeqCst);
        let ws = Workspace {
            job,
            input_path: dir.path().join("in").join(format!("input.{ext}")),
            out_dir: dir.path().join("out"),
            dir: Some(dir),
            live: Arc::clone(&self.live),
        };

        let in_dir = ws.dir().join("in");
        tokio::fs::create_dir(&in_dir)
            .await
            .map_err(|e| ConvertError::workspace(&in_dir, e))?;
        tokio::fs::create_dir(&ws.out_dir)
            .await
            .map_err(|e| ConvertError::workspace(&ws.out_dir, e))?;

        match input {
            ResolvedInput::InMemory { data, .. } => {
                tokio::fs::write(&ws.input_path, data)
                    .await
                    .map_err(|e| ConvertError::workspace(&ws.input_path, e))?;
            }
            ResolvedInput::Local(src) => copy(src, &ws.input_path).await?,
            ResolvedInput::Downloaded { path, .. } => link_or_copy(path, &ws.input_path).await?,
        }

        debug!(job = %job, dir = %ws.dir().display(), "workspace acquired");
        Ok(ws)
    }

    /// Remove workspace directories left by processes that are no longer
    /// running. Returns the number removed.
    pub fn sweep_stale(&self) -> usize {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) => {
                warn!("cannot scan workspace root {}: {e}", self.root.display());
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let Some(owner) = name.to_str().and_then(owner_pid) else {
                continue;
            };
            if owner == std::process::id() || process_alive(owner) {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!("cannot remove stale workspace {}: {e}", entry.path().display()),
            }
        }
        if removed > 0 {
            debug!("removed {removed} stale workspace(s) from {}", self.root.display());
        }
        removed
    }
}

/// Parse the owning pid out of a `job-<pid>-…` directory name.
fn owner_pid(name: &str) -> Option<u32> {
    name.strip_prefix(DIR_PREFIX)?.split('-').next()?.parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes for existence; EPERM means it exists under another user.
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

async fn copy(src: &Path, dst: &Path) -> Result<(), ConvertError> {
    tokio::fs::copy(src, dst)
        .await
        .map(|_| ())
        .map_err(|e| ConvertError::workspace(dst, e))
}

async fn link_or_copy(src: &Path, dst: &Path) -> Result<(), ConvertError> {
    if tokio::fs::hard_link(src, dst).await.is_ok() {
        return Ok(());
    }
    copy(src, dst).await
}

/// One job's working directory.
pub struct Workspace {
    job: JobId,
    dir: Option<TempDir>,
    input_path: PathBuf,
    out_dir: PathBuf,
    live: Arc<AtomicUsize>,
}

impl Workspace {
    pub fn job(&self) -> JobId {
        self.job
    }

    /// The workspace directory itself.
    pub fn dir(&self) -> &Path {
        self.dir
            .as_ref()
            .map(|d| d.path())
            .unwrap_or_else(|| Path::new(""))
    }

    /// The staged source file.
    pub fn input(&self) -> &Path {
        &self.input_path
    }

    /// The engine's output directory.
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Remove the workspace now.
    ///
    /// Errors are logged, not returned: a leftover directory is picked up by
    /// the next [`WorkspaceManager::sweep_stale`] and must not fail the job.
    pub fn release(mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(job = %self.job, "cannot remove workspace {}: {e}", path.display());
                let _ = std::fs::remove_dir_all(&path);
            } else {
                debug!(job = %self.job, "workspace released");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // `TempDir`'s own drop removes the directory if `release` was skipped.
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("job", &self.job)
            .field("dir", &self.dir())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_stages_bytes_and_release_removes() {
        let root = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(root.path()).unwrap();
        let input = ResolvedInput::InMemory {
            name: "memo.txt".into(),
            data: b"hello".to_vec(),
        };

        let ws = mgr.acquire(JobId::new(), &input, "txt").await.unwrap();
        assert_eq!(mgr.live(), 1);
        assert_eq!(std::fs::read(ws.input()).unwrap(), b"hello");
        assert!(ws.input().ends_with("in/input.txt"));
        assert!(ws.out_dir().is_dir());
        let dir = ws.dir().to_path_buf();

        ws.release();
        assert!(!dir.exists());
        assert_eq!(mgr.live(), 0);
    }

    #[tokio::test]
    async fn local_source_is_copied() {
        let root = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("deck.pptx");
        std::fs::write(&src, b"PK\x03\x04slides").unwrap();

        let mgr = WorkspaceManager::new(root.path()).unwrap();
        let ws = mgr
            .acquire(JobId::new(), &ResolvedInput::Local(src.clone()), "pptx")
            .await
            .unwrap();
        assert_eq!(std::fs::read(ws.input()).unwrap(), b"PK\x03\x04slides");
        ws.release();
        assert!(src.exists(), "source must survive workspace removal");
    }

    #[tokio::test]
    async fn engine_rewriting_its_input_leaves_the_original_alone() {
        let root = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("minutes.odt");
        std::fs::write(&src, b"original").unwrap();

        let mgr = WorkspaceManager::new(root.path()).unwrap();
        let ws = mgr
            .acquire(JobId::new(), &ResolvedInput::Local(src.clone()), "odt")
            .await
            .unwrap();
        // Truncate and rewrite in place, as an editing engine would.
        std::fs::write(ws.input(), b"rewritten by engine").unwrap();
        assert_eq!(std::fs::read(&src).unwrap(), b"original");

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let staged = std::fs::metadata(ws.input()).unwrap();
            assert_eq!(staged.nlink(), 1);
            assert_ne!(staged.ino(), std::fs::metadata(&src).unwrap().ino());
        }
        ws.release();
    }

    #[tokio::test]
    async fn drop_without_release_still_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(root.path()).unwrap();
        let input = ResolvedInput::InMemory {
            name: "a.txt".into(),
            data: b"x".to_vec(),
        };
        let ws = mgr.acquire(JobId::new(), &input, "txt").await.unwrap();
        let dir = ws.dir().to_path_buf();
        // Simulate engine leftovers.
        std::fs::write(ws.out_dir().join(".~lock.input.txt#"), b"lock").unwrap();
        drop(ws);
        assert!(!dir.exists());
        assert_eq!(mgr.live(), 0);
    }

    #[tokio::test]
    async fn missing_local_source_is_workspace_error() {
        let root = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(root.path()).unwrap();
        let err = mgr
            .acquire(
                JobId::new(),
                &ResolvedInput::Local("/no/such/input.docx".into()),
                "docx",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Workspace { .. }), "{err}");
        assert_eq!(mgr.live(), 0);
    }

    #[test]
    fn sweep_removes_only_dead_owners() {
        let root = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(root.path()).unwrap();

        // u32::MAX is never a live pid.
        let stale = root.path().join(format!("job-{}-abc-XYZ", u32::MAX));
        let ours = root.path().join(format!("job-{}-def-XYZ", std::process::id()));
        let unrelated = root.path().join("keep-me");
        for d in [&stale, &ours, &unrelated] {
            std::fs::create_dir_all(d).unwrap();
        }

        assert_eq!(mgr.sweep_stale(), 1);
        assert!(!stale.exists());
        assert!(ours.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn owner_pid_parsing() {
        assert_eq!(owner_pid("job-1234-5f0e-abc"), Some(1234));
        assert_eq!(owner_pid("job-x-1"), None);
        assert_eq!(owner_pid("other-1234"), None);
    }
}
