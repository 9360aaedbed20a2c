//! # soffice-locate
//!
//! Find a LibreOffice `soffice` executable and a per-user runtime directory,
//! so that callers driving LibreOffice headlessly no longer need to hard-code
//! install paths per distribution or platform.
//!
//! ## How it works
//!
//! On first call to [`locate_soffice`]:
//!
//! 1. Honours `SOFFICE_PATH` when it points at an existing file.
//! 2. Searches `PATH` for `soffice`, then `libreoffice`.
//! 3. Probes the well-known install locations for the current platform
//!    (`/usr/lib/libreoffice/program/soffice`, `/opt/libreoffice*/…`,
//!    the macOS app bundle, `Program Files` on Windows).
//!
//! The resolved path is cached for the lifetime of the process.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use soffice_locate::{locate_soffice, soffice_version};
//!
//! let soffice = locate_soffice().expect("LibreOffice not installed");
//! println!("{} ({})", soffice.display(), soffice_version(&soffice).unwrap_or_default());
//! ```
//!
//! ## Environment variable overrides
//!
//! - `SOFFICE_PATH`: path to an existing `soffice` executable; skips discovery.
//! - `OFFICECONV_CACHE_DIR`: override the default runtime directory.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use thiserror::Error;

// ── Public constants ─────────────────────────────────────────────────────────

/// Executable names searched on `PATH`, in order.
pub const EXECUTABLE_NAMES: &[&str] = &["soffice", "libreoffice"];

/// Environment variable pointing at an explicit `soffice` binary.
pub const SOFFICE_PATH_ENV: &str = "SOFFICE_PATH";

/// Environment variable overriding [`default_runtime_dir`].
pub const CACHE_DIR_ENV: &str = "OFFICECONV_CACHE_DIR";

// ── Error type ───────────────────────────────────────────────────────────────

/// Errors returned by soffice-locate operations.
#[derive(Error, Debug)]
pub enum LocateError {
    /// No executable was found anywhere.
    #[error(
        "LibreOffice executable not found (searched: {searched}).\n\
         Install LibreOffice or set {SOFFICE_PATH_ENV}=/path/to/soffice."
    )]
    NotFound { searched: String },

    /// The executable exists but `--version` could not be run.
    #[error("Failed to run '{path}' --version: {reason}")]
    VersionProbe { path: PathBuf, reason: String },
}

// ── Platform install locations ───────────────────────────────────────────────

fn well_known_locations() -> Vec<PathBuf> {
    let mut out = Vec::new();

    match std::env::consts::OS {
        "linux" | "freebsd" | "openbsd" | "netbsd" => {
            out.push(PathBuf::from("/usr/lib/libreoffice/program/soffice"));
            out.push(PathBuf::from("/usr/lib64/libreoffice/program/soffice"));
            out.push(PathBuf::from("/usr/local/lib/libreoffice/program/soffice"));
            out.push(PathBuf::from("/snap/bin/libreoffice"));
            // Upstream tarballs install versioned directories: /opt/libreoffice7.6/…
            if let Ok(entries) = std::fs::read_dir("/opt") {
                let mut versioned: Vec<PathBuf> = entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.starts_with("libreoffice"))
                    })
                    .map(|p| p.join("program").join("soffice"))
                    .collect();
                // Newest version first.
                versioned.sort();
                versioned.reverse();
                out.extend(versioned);
            }
        }
        "macos" => {
            out.push(PathBuf::from(
                "/Applications/LibreOffice.app/Contents/MacOS/soffice",
            ));
            if let Some(home) = dirs::home_dir() {
                out.push(home.join("Applications/LibreOffice.app/Contents/MacOS/soffice"));
            }
        }
        "windows" => {
            for var in ["ProgramFiles", "ProgramFiles(x86)"] {
                if let Ok(base) = std::env::var(var) {
                    out.push(
                        PathBuf::from(base)
                            .join("LibreOffice")
                            .join("program")
                            .join("soffice.exe"),
                    );
                }
            }
        }
        _ => {}
    }

    out
}

// ── Runtime directory resolution ─────────────────────────────────────────────

/// Returns the runtime directory used for engine profiles and job workspaces.
///
/// Default locations:
/// - **macOS**: `~/Library/Caches/officeconv/`
/// - **Linux**: `~/.cache/officeconv/`
/// - **Windows**: `%LOCALAPPDATA%\officeconv\`
///
/// Override by setting `OFFICECONV_CACHE_DIR`.
pub fn default_runtime_dir() -> PathBuf {
    if let Ok(override_dir) = std::env::var(CACHE_DIR_ENV) {
        if !override_dir.is_empty() {
            return PathBuf::from(override_dir);
        }
    }

    let base = dirs::cache_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
        .unwrap_or_else(std::env::temp_dir);

    base.join("officeconv")
}

// ── Thread-safe singleton path cache ─────────────────────────────────────────

static RESOLVED_PATH: OnceLock<PathBuf> = OnceLock::new();

// ── Public API ───────────────────────────────────────────────────────────────

/// Locate the `soffice` executable, caching the answer for the process.
pub fn locate_soffice() -> Result<PathBuf, LocateError> {
    if let Some(path) = RESOLVED_PATH.get() {
        return Ok(path.clone());
    }

    let path = resolve()?;
    // Best-effort cache in the OnceLock (ignore race; both will succeed).
    let _ = RESOLVED_PATH.set(path.clone());
    Ok(path)
}

/// Returns `true` when [`locate_soffice`] would succeed.
pub fn is_soffice_available() -> bool {
    locate_soffice().is_ok()
}

/// Run `<soffice> --version` and return the trimmed first line,
/// e.g. `LibreOffice 7.6.4.1 60(Build:1)`.
///
/// This spawns a short-lived process; do not call it on a hot path.
pub fn soffice_version(path: &Path) -> Result<String, LocateError> {
    let output = Command::new(path)
        .arg("--version")
        .output()
        .map_err(|e| LocateError::VersionProbe {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(LocateError::VersionProbe {
            path: path.to_path_buf(),
            reason: format!("exited with {}", output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().trim().to_string())
}

// ── Internal helpers ─────────────────────────────────────────────────────────

fn resolve() -> Result<PathBuf, LocateError> {
    let mut searched = Vec::new();

    // 1. Environment variable override.
    if let Ok(env_path) = std::env::var(SOFFICE_PATH_ENV) {
        let p = PathBuf::from(&env_path);
        if p.is_file() {
            return Ok(p);
        }
        searched.push(format!("{SOFFICE_PATH_ENV}={env_path}"));
    }

    // 2. PATH lookup.
    for name in EXECUTABLE_NAMES {
        if let Ok(p) = which::which(name) {
            return Ok(p);
        }
        searched.push(format!("$PATH/{name}"));
    }

    // 3. Well-known install locations.
    for candidate in well_known_locations() {
        if candidate.is_file() {
            return Ok(candidate);
        }
        searched.push(candidate.display().to_string());
    }

    Err(LocateError::NotFound {
        searched: searched.join(", "),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_dir_override_via_env() {
        std::env::set_var(CACHE_DIR_ENV, "/tmp/test_officeconv_override");
        let d = default_runtime_dir();
        std::env::remove_var(CACHE_DIR_ENV);
        assert_eq!(d, PathBuf::from("/tmp/test_officeconv_override"));

        let fallback = default_runtime_dir();
        assert!(fallback.ends_with("officeconv"));
    }

    #[test]
    fn well_known_locations_are_absolute() {
        for p in well_known_locations() {
            assert!(p.is_absolute(), "{} should be absolute", p.display());
        }
    }

    #[test]
    fn not_found_message_mentions_override() {
        let e = LocateError::NotFound {
            searched: "$PATH/soffice".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains(SOFFICE_PATH_ENV));
        assert!(msg.contains("$PATH/soffice"));
    }

    #[test]
    fn version_probe_of_missing_binary_fails() {
        let err = soffice_version(Path::new("/definitely/not/soffice")).unwrap_err();
        assert!(matches!(err, LocateError::VersionProbe { .. }));
    }
}
