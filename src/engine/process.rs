//! Portable process-handle capability set.
//!
//! The supervisor never touches a `tokio::process::Child` directly. It works
//! against [`ProcessHandle`], which keeps the run loop testable with
//! in-process fakes and keeps platform details (process groups, signals) in
//! one place: [`ChildProcess`].

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// Bytes of stdout/stderr retained per process (the tail is kept).
pub const DIAGNOSTICS_CAPACITY: usize = 16 * 1024;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    /// Terminating signal on Unix.
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(c), _) => write!(f, "exit code {c}"),
            (None, Some(s)) => write!(f, "killed by signal {s}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// What the supervisor may do with an engine process.
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if the process is (or was) running.
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check. `Ok(None)` while running.
    fn exit_status(&mut self) -> io::Result<Option<ProcessExit>>;

    fn is_alive(&mut self) -> bool {
        matches!(self.exit_status(), Ok(None))
    }

    /// Kill the process and everything it spawned. Idempotent.
    fn terminate(&mut self) -> io::Result<()>;

    /// Captured stdout/stderr so far.
    fn diagnostics(&self) -> String;
}

/// Bounded tail buffer shared with the drain tasks.
///
/// Raw bytes are kept and decoded on read, so a multibyte character split
/// across two pipe reads survives intact.
#[derive(Debug, Default)]
struct TailBuffer {
    bytes: Vec<u8>,
    truncated: bool,
}

impl TailBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > DIAGNOSTICS_CAPACITY {
            let cut = self.bytes.len() - DIAGNOSTICS_CAPACITY;
            self.bytes.drain(..cut);
            self.truncated = true;
        }
    }

    fn snapshot(&self) -> String {
        if !self.truncated {
            return String::from_utf8_lossy(&self.bytes).into_owned();
        }
        // Skip continuation bytes left over from the cut.
        let start = self
            .bytes
            .iter()
            .position(|b| b & 0xC0 != 0x80)
            .unwrap_or(self.bytes.len());
        format!("…{}", String::from_utf8_lossy(&self.bytes[start..]))
    }
}

/// A real engine process.
///
/// On Unix the child leads its own process group so [`terminate`] can kill
/// helper processes the engine forks (LibreOffice's `soffice` launcher runs
/// `soffice.bin` as a child). stdin is closed and stdout/stderr are drained
/// into a bounded buffer by background tasks so the engine never blocks on a
/// full pipe.
///
/// The group is only ever signalled while its leader is unreaped: once the
/// leader's pid is released it may belong to an unrelated process group.
/// Stragglers are swept at the moment the exit is first observed.
///
/// [`terminate`]: ProcessHandle::terminate
pub struct ChildProcess {
    child: Child,
    pid: Option<u32>,
    exit: Option<ProcessExit>,
    output: Arc<Mutex<TailBuffer>>,
}

impl ChildProcess {
    /// Spawn `cmd`. Must be called inside a tokio runtime.
    pub fn spawn(mut cmd: Command) -> io::Result<Self> {
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let output = Arc::new(Mutex::new(TailBuffer::default()));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain(stderr, Arc::clone(&output)));
        }

        Ok(Self {
            child,
            pid,
            exit: None,
            output,
        })
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Arc<Mutex<TailBuffer>>) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut tail) = sink.lock() {
                    tail.push(&buf[..n]);
                }
            }
        }
    }
}

impl ChildProcess {
    /// Process group that may still be signalled: the leader's pid, until the
    /// leader has been reaped.
    fn signalable_group(&self) -> Option<u32> {
        match self.exit {
            None => self.pid,
            Some(_) => None,
        }
    }
}

impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn exit_status(&mut self) -> io::Result<Option<ProcessExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let status = self.child.try_wait()?.map(ProcessExit::from);
        if status.is_some() {
            // Members outliving the leader keep the pgid allocated, so this
            // last signal cannot reach a recycled group.
            #[cfg(unix)]
            if let Some(pid) = self.pid {
                kill_group(pid);
            }
            self.exit = status;
        }
        Ok(status)
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.signalable_group() {
            kill_group(pid);
        }
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn diagnostics(&self) -> String {
        self.output
            .lock()
            .map(|t| t.snapshot())
            .unwrap_or_default()
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // `kill_on_drop` only reaches the direct child; take the group with it.
        #[cfg(unix)]
        if let Some(pid) = self.signalable_group() {
            kill_group(pid);
        }
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("exit", &self.exit)
            .finish()
    }
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        // ESRCH (group already gone) is the common case after a clean exit.
        let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_exit(p: &mut ChildProcess) -> ProcessExit {
        for _ in 0..200 {
            if let Some(exit) = p.exit_status().unwrap() {
                return exit;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("process did not exit");
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_exit_code_and_stderr() {
        let mut p = ChildProcess::spawn(sh("echo boom >&2; exit 3")).unwrap();
        let exit = wait_exit(&mut p).await;
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
        // Drain tasks may lag the exit slightly.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(p.diagnostics().contains("boom"), "{:?}", p.diagnostics());
        assert!(!p.is_alive());
    }

    #[tokio::test]
    async fn terminate_kills_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", marker.display());
        let mut p = ChildProcess::spawn(sh(&script)).unwrap();

        for _ in 0..100 {
            if std::fs::read_to_string(&marker).is_ok_and(|s| !s.trim().is_empty()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(p.is_alive());
        let grandchild: i32 = std::fs::read_to_string(&marker).unwrap().trim().parse().unwrap();

        p.terminate().unwrap();
        let exit = wait_exit(&mut p).await;
        assert_eq!(exit.signal, Some(9));

        // The backgrounded sleep shared the group and must be gone too.
        // Containers without an init may leave it as an unreaped zombie.
        let is_zombie = |pid: i32| {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .is_ok_and(|s| s.rsplit(')').next().is_some_and(|r| r.trim_start().starts_with('Z')))
        };
        let mut gone = false;
        for _ in 0..100 {
            if nix::sys::signal::kill(nix::unistd::Pid::from_raw(grandchild), None).is_err()
                || is_zombie(grandchild)
            {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone, "grandchild {grandchild} survived");
    }

    #[tokio::test]
    async fn terminate_after_exit_is_harmless() {
        let mut p = ChildProcess::spawn(sh("exit 0")).unwrap();
        assert!(wait_exit(&mut p).await.success());
        p.terminate().unwrap();
    }

    #[tokio::test]
    async fn reaped_leader_no_longer_targets_its_group() {
        let mut p = ChildProcess::spawn(sh("sleep 30")).unwrap();
        assert_eq!(p.signalable_group(), p.id());
        p.terminate().unwrap();
        wait_exit(&mut p).await;
        assert_eq!(p.signalable_group(), None);
        // Nothing left to signal; must not fail either.
        p.terminate().unwrap();
    }

    #[tokio::test]
    async fn leader_exit_sweeps_stragglers() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("straggler.pid");
        let script = format!("sleep 30 & echo $! > {}", marker.display());
        let mut p = ChildProcess::spawn(sh(&script)).unwrap();
        assert!(wait_exit(&mut p).await.success());
        let straggler: i32 = std::fs::read_to_string(&marker).unwrap().trim().parse().unwrap();

        let alive = |pid: i32| {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
                && !std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|s| {
                    s.rsplit(')').next().is_some_and(|r| r.trim_start().starts_with('Z'))
                })
        };
        let mut gone = false;
        for _ in 0..100 {
            if !alive(straggler) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone, "straggler {straggler} survived its leader");
    }

    #[test]
    fn handles_are_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<ChildProcess>();
        assert_send_sync::<dyn ProcessHandle>();
    }

    #[test]
    fn tail_buffer_keeps_the_end() {
        let mut t = TailBuffer::default();
        t.push("a".repeat(DIAGNOSTICS_CAPACITY).as_bytes());
        t.push(b"END");
        let s = t.snapshot();
        assert!(s.ends_with("END"));
        assert!(s.starts_with('…'));
    }

    #[test]
    fn tail_buffer_joins_split_characters() {
        let mut t = TailBuffer::default();
        let text = "Übersicht gespeichert";
        let bytes = text.as_bytes();
        // 'Ü' is two bytes; split between them.
        t.push(&bytes[..1]);
        t.push(&bytes[1..]);
        assert_eq!(t.snapshot(), text);
    }

    #[test]
    fn tail_buffer_truncation_skips_partial_character() {
        let mut t = TailBuffer::default();
        t.push("ü".repeat(DIAGNOSTICS_CAPACITY).as_bytes());
        t.push(b"x");
        let s = t.snapshot();
        assert!(!s.contains('\u{FFFD}'), "{s:?}");
        assert!(s.ends_with("üx"));
    }

    #[test]
    fn exit_display() {
        assert_eq!(ProcessExit::code(2).to_string(), "exit code 2");
        let killed = ProcessExit {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by signal 9");
    }
}
