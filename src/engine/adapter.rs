//! Engine adapters: how to launch a conversion for a given slot.
//!
//! An adapter only builds and spawns commands. Deadlines, health checks,
//! recycling and output detection belong to the supervisor, so a new engine
//! needs nothing more than an [`EngineAdapter`] implementation.
//!
//! An adapter may keep one resident engine process per slot. The supervisor
//! starts it after warm-up, checks it before the slot is handed out or
//! returned, and kills it when the slot is recycled. Each conversion is still
//! a separate process; for LibreOffice it is a short-lived client that hands
//! the document to the resident instance sharing its profile.

use crate::engine::process::{ChildProcess, ProcessHandle};
use crate::error::ConvertError;
use crate::format::TargetFormat;
use crate::job::JobId;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Identity and private state of one engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotContext {
    pub slot: usize,
    /// Bumped on every recycle; each generation gets a fresh profile.
    pub generation: u64,
    /// Profile directory used exclusively by this slot and generation.
    pub profile_dir: PathBuf,
    /// Unique control-channel name (`officeconv-<pid>-<slot>-<generation>`).
    pub channel: String,
}

impl SlotContext {
    pub fn new(profile_root: &Path, slot: usize, generation: u64) -> Self {
        Self {
            slot,
            generation,
            profile_dir: profile_root
                .join(format!("slot-{slot}"))
                .join(format!("gen-{generation}")),
            channel: format!("officeconv-{}-{slot}-{generation}", std::process::id()),
        }
    }
}

/// One conversion to perform.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub job_id: JobId,
    pub input: PathBuf,
    pub out_dir: PathBuf,
    pub target: TargetFormat,
}

impl EngineRequest {
    /// Input file stem; engines name their output after it.
    pub fn stem(&self) -> &str {
        self.input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("input")
    }
}

/// Launches engine processes.
pub trait EngineAdapter: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Start converting `request` on `slot`.
    fn convert(
        &self,
        slot: &SlotContext,
        request: &EngineRequest,
    ) -> io::Result<Box<dyn ProcessHandle>>;

    /// Start a warm-up probe that initialises `slot`'s profile and exits.
    /// `None` means the engine needs no warm-up.
    fn probe(&self, slot: &SlotContext) -> io::Result<Option<Box<dyn ProcessHandle>>> {
        let _ = slot;
        Ok(None)
    }

    /// Start the long-lived process that serves `slot` until it is recycled.
    /// `None` means every conversion runs standalone.
    fn start_resident(&self, slot: &SlotContext) -> io::Result<Option<Box<dyn ProcessHandle>>> {
        let _ = slot;
        Ok(None)
    }

    /// Local sockets the resident process listens on for `slot`. The
    /// resident counts as responsive once any of them accepts a connection;
    /// an empty list means liveness alone is checked.
    fn control_endpoints(&self, slot: &SlotContext) -> Vec<PathBuf> {
        let _ = slot;
        Vec::new()
    }

    /// Where the engine writes its result for `request`.
    fn output_path(&self, request: &EngineRequest) -> PathBuf {
        request
            .out_dir
            .join(format!("{}.{}", request.stem(), request.target.extension()))
    }

    /// Lock files a crashed engine may leave in `slot`'s profile.
    fn stale_locks(&self, slot: &SlotContext) -> Vec<PathBuf> {
        let _ = slot;
        Vec::new()
    }
}

// ── LibreOffice ──────────────────────────────────────────────────────────

/// Flags that keep LibreOffice from opening windows, dialogs or recovery UI.
const HEADLESS_FLAGS: &[&str] = &[
    "--headless",
    "--invisible",
    "--nologo",
    "--nodefault",
    "--nofirststartwizard",
    "--norestore",
    "--nolockcheck",
];

/// Drives LibreOffice's `soffice --convert-to`.
///
/// Every slot gets its own `-env:UserInstallation` profile, which is what lets
/// several instances run side by side: two processes sharing a profile hand
/// their work to whichever started first.
///
/// By default each slot keeps a resident `soffice` listening on the slot's
/// control pipe (`--accept=pipe,name=<channel>;urp;`). A conversion then
/// starts a `--convert-to` client on the same profile, which forwards the
/// document to the warm resident instance and exits once it is written.
/// [`standalone`](Self::standalone) turns this off and cold-starts
/// `soffice` for every job instead.
#[derive(Clone)]
pub struct LibreOfficeAdapter {
    program: PathBuf,
    extra_args: Vec<String>,
    resident: bool,
}

impl LibreOfficeAdapter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            resident: true,
        }
    }

    /// Find `soffice` via [`soffice_locate::locate_soffice`].
    pub fn locate() -> Result<Self, ConvertError> {
        soffice_locate::locate_soffice()
            .map(Self::new)
            .map_err(|e| ConvertError::EngineUnavailable {
                attempts: 0,
                detail: e.to_string(),
            })
    }

    /// Extra arguments inserted before `--convert-to`.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run every conversion in its own cold `soffice`, without a resident
    /// instance per slot.
    pub fn standalone(mut self) -> Self {
        self.resident = false;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    fn base_command(&self, slot: &SlotContext) -> io::Result<Command> {
        let profile_url = reqwest::Url::from_directory_path(&slot.profile_dir).map_err(|()| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "profile directory must be absolute: {}",
                    slot.profile_dir.display()
                ),
            )
        })?;
        let mut cmd = Command::new(&self.program);
        cmd.args(HEADLESS_FLAGS)
            .arg(format!("-env:UserInstallation={profile_url}"))
            .args(&self.extra_args);
        Ok(cmd)
    }

    pub(crate) fn convert_command(
        &self,
        slot: &SlotContext,
        request: &EngineRequest,
    ) -> io::Result<Command> {
        let mut cmd = self.base_command(slot)?;
        cmd.arg("--convert-to")
            .arg(request.target.libreoffice_filter())
            .arg("--outdir")
            .arg(&request.out_dir)
            .arg(&request.input);
        Ok(cmd)
    }

    pub(crate) fn resident_command(&self, slot: &SlotContext) -> io::Result<Command> {
        let mut cmd = self.base_command(slot)?;
        cmd.arg(accept_arg(&slot.channel));
        Ok(cmd)
    }
}

/// UNO acceptor on a named local pipe.
fn accept_arg(channel: &str) -> String {
    format!("--accept=pipe,name={channel};urp;StarOffice.ComponentContext")
}

/// Socket paths LibreOffice creates for a named pipe: `OSL_PIPE_<uid>_<name>`
/// in `/tmp`, or `/var/tmp` when `/tmp` is unusable.
#[cfg(unix)]
fn uno_pipe_paths(channel: &str) -> Vec<PathBuf> {
    let uid = nix::unistd::getuid();
    ["/tmp", "/var/tmp"]
        .iter()
        .map(|dir| Path::new(dir).join(format!("OSL_PIPE_{uid}_{channel}")))
        .collect()
}

impl fmt::Debug for LibreOfficeAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibreOfficeAdapter")
            .field("program", &self.program)
            .field("resident", &self.resident)
            .finish()
    }
}

impl EngineAdapter for LibreOfficeAdapter {
    fn name(&self) -> &str {
        "libreoffice"
    }

    fn convert(
        &self,
        slot: &SlotContext,
        request: &EngineRequest,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let cmd = self.convert_command(slot, request)?;
        Ok(Box::new(ChildProcess::spawn(cmd)?))
    }

    fn probe(&self, slot: &SlotContext) -> io::Result<Option<Box<dyn ProcessHandle>>> {
        // The resident instance initialises the profile itself.
        if self.resident {
            return Ok(None);
        }
        let mut cmd = self.base_command(slot)?;
        cmd.arg("--terminate_after_init");
        Ok(Some(Box::new(ChildProcess::spawn(cmd)?)))
    }

    fn start_resident(&self, slot: &SlotContext) -> io::Result<Option<Box<dyn ProcessHandle>>> {
        if !self.resident {
            return Ok(None);
        }
        let cmd = self.resident_command(slot)?;
        Ok(Some(Box::new(ChildProcess::spawn(cmd)?)))
    }

    fn control_endpoints(&self, slot: &SlotContext) -> Vec<PathBuf> {
        #[cfg(unix)]
        if self.resident {
            return uno_pipe_paths(&slot.channel);
        }
        let _ = slot;
        Vec::new()
    }

    fn stale_locks(&self, slot: &SlotContext) -> Vec<PathBuf> {
        vec![slot.profile_dir.join(".lock")]
    }
}

// ── Generic command template ─────────────────────────────────────────────

/// Runs an arbitrary program with placeholder substitution.
///
/// Placeholders, replaced inside every argument:
///
/// | Placeholder | Value |
/// |-------------|-------|
/// | `{input}` | staged input file |
/// | `{outdir}` | output directory |
/// | `{ext}` | target extension |
/// | `{filter}` | LibreOffice filter string for the target |
/// | `{profile}` | slot profile directory |
/// | `{channel}` | slot control-channel name |
/// | `{stem}` | input file stem |
///
/// The slot is also exported as `OFFICECONV_SLOT`, `OFFICECONV_PROFILE` and
/// `OFFICECONV_CHANNEL`.
///
/// The staged input is a private copy, so a program that rewrites its input
/// in place never touches the caller's file.
///
/// ```rust
/// use officeconv::CommandAdapter;
///
/// let adapter = CommandAdapter::parse("unoconvert --convert-to {ext} {input} {outdir}/{stem}.{ext}")
///     .unwrap();
/// assert_eq!(adapter.program(), "unoconvert");
/// ```
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    program: String,
    args: Vec<String>,
    probe_args: Option<Vec<String>>,
    resident_args: Option<Vec<String>>,
    endpoint: Option<String>,
}

impl CommandAdapter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            probe_args: None,
            resident_args: None,
            endpoint: None,
        }
    }

    /// Split a whitespace-separated template into program and arguments.
    pub fn parse(template: &str) -> Result<Self, ConvertError> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ConvertError::InvalidConfig("empty engine command".into()))?;
        Ok(Self::new(program, parts.collect()))
    }

    /// Run the same program with `args` as the warm-up probe.
    pub fn with_probe(mut self, args: Vec<String>) -> Self {
        self.probe_args = Some(args);
        self
    }

    /// Keep the same program running with `args` as the slot's resident
    /// process. `{profile}` and `{channel}` are expanded.
    pub fn with_resident(mut self, args: Vec<String>) -> Self {
        self.resident_args = Some(args);
        self
    }

    /// Socket the resident process listens on; `{profile}` and `{channel}`
    /// are expanded.
    pub fn with_control_socket(mut self, template: impl Into<String>) -> Self {
        self.endpoint = Some(template.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn expand_slot(slot: &SlotContext, arg: &str) -> String {
        arg.replace("{profile}", &slot.profile_dir.display().to_string())
            .replace("{channel}", &slot.channel)
    }

    fn command(&self, slot: &SlotContext, args: Vec<String>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .env("OFFICECONV_SLOT", slot.slot.to_string())
            .env("OFFICECONV_PROFILE", &slot.profile_dir)
            .env("OFFICECONV_CHANNEL", &slot.channel);
        cmd
    }

    pub(crate) fn expand(&self, slot: &SlotContext, request: &EngineRequest) -> Vec<String> {
        let vars = [
            ("{input}", request.input.display().to_string()),
            ("{outdir}", request.out_dir.display().to_string()),
            ("{ext}", request.target.extension().to_string()),
            ("{filter}", request.target.libreoffice_filter().to_string()),
            ("{profile}", slot.profile_dir.display().to_string()),
            ("{channel}", slot.channel.clone()),
            ("{stem}", request.stem().to_string()),
        ];
        self.args
            .iter()
            .map(|arg| {
                vars.iter()
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect()
    }
}

impl EngineAdapter for CommandAdapter {
    fn name(&self) -> &str {
        &self.program
    }

    fn convert(
        &self,
        slot: &SlotContext,
        request: &EngineRequest,
    ) -> io::Result<Box<dyn ProcessHandle>> {
        let cmd = self.command(slot, self.expand(slot, request));
        Ok(Box::new(ChildProcess::spawn(cmd)?))
    }

    fn probe(&self, slot: &SlotContext) -> io::Result<Option<Box<dyn ProcessHandle>>> {
        let Some(args) = &self.probe_args else {
            return Ok(None);
        };
        let args = args.iter().map(|a| Self::expand_slot(slot, a)).collect();
        Ok(Some(Box::new(ChildProcess::spawn(self.command(slot, args))?)))
    }

    fn start_resident(&self, slot: &SlotContext) -> io::Result<Option<Box<dyn ProcessHandle>>> {
        let Some(args) = &self.resident_args else {
            return Ok(None);
        };
        let args = args.iter().map(|a| Self::expand_slot(slot, a)).collect();
        Ok(Some(Box::new(ChildProcess::spawn(self.command(slot, args))?)))
    }

    fn control_endpoints(&self, slot: &SlotContext) -> Vec<PathBuf> {
        self.endpoint
            .iter()
            .map(|t| PathBuf::from(Self::expand_slot(slot, t)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EngineRequest {
        EngineRequest {
            job_id: JobId::new(),
            input: PathBuf::from("/ws/job-1/in/input.docx"),
            out_dir: PathBuf::from("/ws/job-1/out"),
            target: TargetFormat::Pdf,
        }
    }

    #[test]
    fn slot_context_is_unique_per_generation() {
        let a = SlotContext::new(Path::new("/p"), 1, 0);
        let b = SlotContext::new(Path::new("/p"), 1, 1);
        assert_eq!(a.profile_dir, PathBuf::from("/p/slot-1/gen-0"));
        assert_ne!(a.profile_dir, b.profile_dir);
        assert_ne!(a.channel, b.channel);
        assert!(a.channel.ends_with("-1-0"));
    }

    #[test]
    fn libreoffice_command_line() {
        let adapter = LibreOfficeAdapter::new("/usr/lib/libreoffice/program/soffice");
        let slot = SlotContext::new(Path::new("/var/profiles"), 0, 2);
        let cmd = adapter.convert_command(&slot, &request()).unwrap();
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(&args[..HEADLESS_FLAGS.len()], HEADLESS_FLAGS);
        assert!(args.contains(&"-env:UserInstallation=file:///var/profiles/slot-0/gen-2/".to_string()));
        let tail = &args[args.len() - 5..];
        assert_eq!(
            tail,
            ["--convert-to", "pdf", "--outdir", "/ws/job-1/out", "/ws/job-1/in/input.docx"]
        );
    }

    #[test]
    fn libreoffice_resident_listens_on_slot_channel() {
        let adapter = LibreOfficeAdapter::new("soffice");
        assert!(adapter.is_resident());
        let slot = SlotContext::new(Path::new("/var/profiles"), 1, 0);
        let cmd = adapter.resident_command(&slot).unwrap();
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args.last().unwrap(),
            &format!("--accept=pipe,name={};urp;StarOffice.ComponentContext", slot.channel)
        );
        assert!(args.contains(&"-env:UserInstallation=file:///var/profiles/slot-1/gen-0/".to_string()));
        assert!(!args.iter().any(|a| a == "--convert-to"));

        #[cfg(unix)]
        {
            let endpoints = adapter.control_endpoints(&slot);
            assert_eq!(endpoints.len(), 2);
            assert!(endpoints[0].starts_with("/tmp"));
            let name = endpoints[0].file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("OSL_PIPE_") && name.ends_with(&slot.channel), "{name}");
        }
    }

    #[test]
    fn standalone_libreoffice_has_no_resident() {
        let adapter = LibreOfficeAdapter::new("soffice").standalone();
        let slot = SlotContext::new(Path::new("/var/profiles"), 0, 0);
        assert!(!adapter.is_resident());
        assert!(adapter.control_endpoints(&slot).is_empty());
    }

    #[test]
    fn command_adapter_endpoint_expands_slot() {
        let adapter = CommandAdapter::parse("engine {input}")
            .unwrap()
            .with_control_socket("{profile}/ctl-{channel}.sock");
        let slot = SlotContext::new(Path::new("/p"), 2, 1);
        assert_eq!(
            adapter.control_endpoints(&slot),
            vec![PathBuf::from(format!("/p/slot-2/gen-1/ctl-{}.sock", slot.channel))]
        );
    }

    #[test]
    fn libreoffice_rejects_relative_profile() {
        let adapter = LibreOfficeAdapter::new("soffice");
        let slot = SlotContext::new(Path::new("relative"), 0, 0);
        assert!(adapter.convert_command(&slot, &request()).is_err());
    }

    #[test]
    fn default_output_path_uses_stem() {
        let adapter = LibreOfficeAdapter::new("soffice");
        assert_eq!(
            adapter.output_path(&request()),
            PathBuf::from("/ws/job-1/out/input.pdf")
        );
    }

    #[test]
    fn command_template_expansion() {
        let adapter =
            CommandAdapter::parse("engine --to {ext} --filter {filter} {input} {outdir}/{stem}.{ext} {channel}")
                .unwrap();
        let slot = SlotContext::new(Path::new("/p"), 3, 0);
        let args = adapter.expand(&slot, &request());
        assert_eq!(args[1], "pdf");
        assert_eq!(args[3], "pdf");
        assert_eq!(args[4], "/ws/job-1/in/input.docx");
        assert_eq!(args[5], "/ws/job-1/out/input.pdf");
        assert_eq!(args[6], slot.channel);
    }

    #[test]
    fn empty_template_is_invalid() {
        assert!(CommandAdapter::parse("   ").is_err());
    }
}
