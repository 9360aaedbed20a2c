//! Hand-off of a validated result from the workspace to its destination.
//!
//! The file is moved with a rename when source and destination share a
//! filesystem. Otherwise it is copied to a temporary name next to the
//! destination and renamed into place, so readers never observe a partial
//! file.

use crate::error::ConvertError;
use crate::format::TargetFormat;
use crate::job::JobId;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{N}._\-]+").expect("valid regex"));

/// Make a source stem safe to use as an output file name.
pub fn sanitize_stem(stem: &str) -> String {
    let cleaned = UNSAFE_CHARS.replace_all(stem.trim(), "_");
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned.chars().take(120).collect()
    }
}

/// Where a job's output should land.
#[derive(Debug, Clone)]
pub enum Destination<'a> {
    /// Caller-chosen path; overwritten if it exists.
    Exact(&'a Path),
    /// `<dir>/<stem>.<ext>`, disambiguated with the job id on collision.
    InDir { dir: &'a Path, stem: &'a str },
}

/// Move `produced` to its destination and return the final path.
pub async fn deliver(
    produced: &Path,
    job: JobId,
    target: TargetFormat,
    dest: Destination<'_>,
) -> Result<PathBuf, ConvertError> {
    let (final_path, reserved) = match dest {
        Destination::Exact(path) => {
            ensure_parent(path).await?;
            (path.to_path_buf(), false)
        }
        Destination::InDir { dir, stem } => {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| write_failed(dir, e))?;
            let path = reserve(dir, &sanitize_stem(stem), job, target.extension()).await?;
            (path, true)
        }
    };

    if let Err(e) = move_into_place(produced, &final_path, job, target).await {
        if reserved {
            let _ = tokio::fs::remove_file(&final_path).await;
        }
        return Err(e);
    }

    debug!(job = %job, "delivered {}", final_path.display());
    Ok(final_path)
}

async fn move_into_place(
    produced: &Path,
    final_path: &Path,
    job: JobId,
    target: TargetFormat,
) -> Result<(), ConvertError> {
    if tokio::fs::rename(produced, final_path).await.is_ok() {
        return Ok(());
    }
    // Cross-device: stage next to the destination, then rename.
    let tmp = final_path.with_extension(format!("{}.tmp-{}", target.extension(), job.short()));
    if let Err(e) = tokio::fs::copy(produced, &tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(write_failed(final_path, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, final_path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(write_failed(final_path, e));
    }
    Ok(())
}

/// Claim a free output name by creating it exclusively.
///
/// Two jobs converting `report.docx` at the same time must not overwrite each
/// other, so the name is reserved before the rename replaces the placeholder.
async fn reserve(dir: &Path, stem: &str, job: JobId, ext: &str) -> Result<PathBuf, ConvertError> {
    let short = job.short();
    let candidates = [
        format!("{stem}.{ext}"),
        format!("{stem}-{short}.{ext}"),
        format!("{stem}-{job}.{ext}"),
    ];
    let mut last_err = None;
    for name in candidates {
        let path = dir.join(name);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => last_err = Some(e),
            Err(e) => return Err(write_failed(&path, e)),
        }
    }
    let path = dir.join(format!("{stem}-{job}.{ext}"));
    Err(write_failed(
        &path,
        last_err.unwrap_or_else(|| std::io::Error::other("no free output name")),
    ))
}

async fn ensure_parent(path: &Path) -> Result<(), ConvertError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| write_failed(path, e)),
        _ => Ok(()),
    }
}

fn write_failed(path: &Path, source: std::io::Error) -> ConvertError {
    ConvertError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    }
}
