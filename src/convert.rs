//! One-shot conversion entry points.
//!
//! ## Why a temporary pool?
//!
//! Callers converting a single document should not have to manage a
//! [`ConversionPool`]. These functions start a one-instance pool, run the job
//! through exactly the same admission, supervision and validation path as a
//! long-lived pool, and shut it down again. Anything converting more than a
//! handful of documents should keep a [`ConversionPool`] around instead and
//! pay the engine's cold start once.

use crate::config::PoolConfig;
use crate::engine::{EngineAdapter, LibreOfficeAdapter};
use crate::error::ConvertError;
use crate::format::TargetFormat;
use crate::job::{ConversionRequest, InputSource};
use crate::output::ConversionOutput;
use crate::pool::ConversionPool;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Convert one document with the LibreOffice engine found on this host.
///
/// # Errors
/// Everything [`ConversionPool::submit`] and the job itself can return, plus
/// `EngineUnavailable` when no `soffice` executable can be found.
pub async fn convert(
    request: ConversionRequest,
    config: &PoolConfig,
) -> Result<ConversionOutput, ConvertError> {
    let adapter = LibreOfficeAdapter::locate()?;
    convert_with(request, config, Arc::new(adapter)).await
}

/// Convert one document with an explicit engine adapter.
pub async fn convert_with(
    request: ConversionRequest,
    config: &PoolConfig,
    adapter: Arc<dyn EngineAdapter>,
) -> Result<ConversionOutput, ConvertError> {
    let mut config = config.clone();
    config.pool_size = 1;
    // The single instance is started on first checkout anyway.
    config.warm_start = false;

    let pool = ConversionPool::start(config, adapter).await?;
    let result = match pool.submit(request).await {
        Ok(handle) => handle.await,
        Err(e) => Err(e),
    };
    pool.shutdown().await;
    result
}

/// Convert a file or URL and write the result to `output_path`.
///
/// The result is moved into place atomically; an existing file is replaced.
pub async fn convert_to_file(
    input: impl AsRef<str>,
    output_path: impl AsRef<Path>,
    target: TargetFormat,
    config: &PoolConfig,
) -> Result<ConversionOutput, ConvertError> {
    let request = ConversionRequest::new(InputSource::parse(input.as_ref()), target)
        .with_destination(output_path.as_ref());
    convert(request, config).await
}

/// Synchronous wrapper around [`convert`].
///
/// Creates a temporary tokio runtime internally.
pub fn convert_sync(
    request: ConversionRequest,
    config: &PoolConfig,
) -> Result<ConversionOutput, ConvertError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ConvertError::Internal(format!("Failed to create tokio runtime: {e}")))?
        .block_on(convert(request, config))
}

/// Convert an in-memory document.
///
/// `name` supplies the extension used for format detection and the stem of
/// the output file. The bytes are staged directly into the job workspace; no
/// other temporary file is created.
///
/// # Example
/// ```rust,no_run
/// use officeconv::{convert_from_bytes, PoolConfig, TargetFormat};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let bytes: Vec<u8> = std::fs::read("minutes.docx")?;
/// let output = convert_from_bytes("minutes.docx", bytes, TargetFormat::Pdf, &PoolConfig::default()).await?;
/// println!("{}", output.output_path.display());
/// # Ok(())
/// # }
/// ```
pub async fn convert_from_bytes(
    name: impl Into<String>,
    bytes: Vec<u8>,
    target: TargetFormat,
    config: &PoolConfig,
) -> Result<ConversionOutput, ConvertError> {
    convert(ConversionRequest::from_bytes(name, bytes, target), config).await
}

/// What `officeconv --inspect-engine` reports.
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub path: PathBuf,
    /// First line of `soffice --version`, when it could be run.
    pub version: Option<String>,
    /// Parent of the default workspace, profile and output directories.
    pub runtime_dir: PathBuf,
    pub targets: Vec<TargetFormat>,
}

/// Locate the engine and query its version without converting anything.
pub async fn inspect_engine() -> Result<EngineInfo, ConvertError> {
    let adapter = LibreOfficeAdapter::locate()?;
    let path = adapter.program().to_path_buf();
    let probe_path = path.clone();
    let version = tokio::task::spawn_blocking(move || soffice_locate::soffice_version(&probe_path))
        .await
        .map_err(|e| ConvertError::Internal(format!("version probe task failed: {e}")))?;
    let version = match version {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("{e}");
            None
        }
    };
    Ok(EngineInfo {
        path,
        version,
        runtime_dir: soffice_locate::default_runtime_dir(),
        targets: TargetFormat::ALL.to_vec(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::CommandAdapter;
    use assert_matches::assert_matches;

    fn config(dir: &Path) -> PoolConfig {
        PoolConfig::builder()
            .poll_interval_ms(10)
            .workspace_root(dir.join("ws"))
            .profile_root(dir.join("profiles"))
            .output_dir(dir.join("out"))
            .build()
            .unwrap()
    }

    /// Copies the input and prefixes it with an RTF header.
    fn rtf_engine() -> Arc<dyn EngineAdapter> {
        Arc::new(CommandAdapter::new(
            "sh",
            vec![
                "-c".into(),
                r#"{ printf '{\\rtf1 '; cat "$0"; } > "$1""#.into(),
                "{input}".into(),
                "{outdir}/{stem}.{ext}".into(),
            ],
        ))
    }

    #[tokio::test]
    async fn one_shot_pool_converts_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let request = ConversionRequest::from_bytes("notes.txt", b"hello".to_vec(), TargetFormat::Rtf);
        let output = convert_with(request, &config(dir.path()), rtf_engine())
            .await
            .unwrap();
        assert_eq!(output.output_path, dir.path().join("out/notes.rtf"));
        let body = std::fs::read_to_string(&output.output_path).unwrap();
        assert!(body.starts_with("{\\rtf1 hello"), "{body}");
        // Workspaces and the per-pool profile directory are gone.
        assert_eq!(std::fs::read_dir(dir.path().join("ws")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("profiles")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_file_is_reported_before_any_engine_run() {
        let dir = tempfile::tempdir().unwrap();
        let request = ConversionRequest::from_path(dir.path().join("nope.docx"), TargetFormat::Pdf);
        let err = convert_with(request, &config(dir.path()), rtf_engine())
            .await
            .unwrap_err();
        assert_matches!(err, ConvertError::FileNotFound { .. });
    }
}
