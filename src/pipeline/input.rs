//! Input resolution: normalise a path, URL or byte buffer to something the
//! workspace can materialise, and decide the source format before admission.
//!
//! ## Why download before queuing?
//!
//! A job holds an engine instance for its whole run. Downloading inside the
//! worker would pin a slow-starting engine while the network is slow, so URL
//! inputs are fetched into a `TempDir` at submission. The `TempDir` lives in
//! [`ResolvedInput::Downloaded`] and is removed when the job drops it, even if
//! the job is cancelled while queued.
//!
//! Bodies are streamed to disk and abandoned as soon as they pass
//! `max_input_bytes`, so an oversized URL costs at most the limit.

use crate::error::ConvertError;
use crate::format::{self, SourceFormat, TargetFormat};
use crate::job::InputSource;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// The resolved input: a local file, a downloaded temp file, or bytes.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; downloaded to a temp directory kept alive here.
    Downloaded { path: PathBuf, _temp_dir: TempDir },
    /// Input was supplied in memory.
    InMemory { name: String, data: Vec<u8> },
}

impl ResolvedInput {
    /// Path of the source on disk, if it has one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ResolvedInput::Local(p) => Some(p),
            ResolvedInput::Downloaded { path, .. } => Some(path),
            ResolvedInput::InMemory { .. } => None,
        }
    }

    /// File name used for extension-based detection and the output stem.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            ResolvedInput::Local(p) | ResolvedInput::Downloaded { path: p, .. } => {
                p.file_name().and_then(|n| n.to_str())
            }
            ResolvedInput::InMemory { name, .. } => Some(name.as_str()),
        }
    }

    /// Output stem: the file name without its extension, `"document"` when unknown.
    pub fn stem(&self) -> String {
        self.file_name()
            .map(Path::new)
            .and_then(|p| p.file_stem())
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("document")
            .to_string()
    }

    /// Size of the source in bytes.
    pub fn len(&self) -> std::io::Result<u64> {
        match self {
            ResolvedInput::InMemory { data, .. } => Ok(data.len() as u64),
            other => match other.path() {
                Some(p) => Ok(std::fs::metadata(p)?.len()),
                None => Ok(0),
            },
        }
    }

    /// Leading bytes for format detection.
    pub fn head(&self) -> std::io::Result<Vec<u8>> {
        match self {
            ResolvedInput::InMemory { data, .. } => {
                Ok(data[..data.len().min(format::SNIFF_LEN)].to_vec())
            }
            other => match other.path() {
                Some(p) => format::sniff(p),
                None => Ok(Vec::new()),
            },
        }
    }
}

impl std::fmt::Debug for ResolvedInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedInput::Local(p) => f.debug_tuple("Local").field(p).finish(),
            ResolvedInput::Downloaded { path, .. } => {
                f.debug_struct("Downloaded").field("path", path).finish()
            }
            ResolvedInput::InMemory { name, data } => f
                .debug_struct("InMemory")
                .field("name", name)
                .field("len", &data.len())
                .finish(),
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a request source to local content.
///
/// URLs are downloaded, up to `max_bytes`; local paths are checked for
/// existence and read permission; byte buffers pass through.
pub async fn resolve_input(
    source: InputSource,
    timeout_secs: u64,
    max_bytes: u64,
) -> Result<ResolvedInput, ConvertError> {
    match source {
        InputSource::Url(url) => download_url(&url, timeout_secs, max_bytes).await,
        InputSource::Path(path) => resolve_local(path),
        InputSource::Bytes { name, data } => Ok(ResolvedInput::InMemory { name, data }),
    }
}

/// Resolve a local file path, validating existence and read permission.
fn resolve_local(path: PathBuf) -> Result<ResolvedInput, ConvertError> {
    if !path.exists() {
        return Err(ConvertError::FileNotFound { path });
    }
    if path.is_dir() {
        return Err(ConvertError::invalid_input(
            path.display().to_string(),
            "is a directory",
        ));
    }

    // Check read permission by attempting to open
    match std::fs::File::open(&path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ConvertError::PermissionDenied { path });
        }
        Err(_) => return Err(ConvertError::FileNotFound { path }),
    }

    debug!("Resolved local source: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Stream a URL into a temporary directory and return the path.
async fn download_url(
    url: &str,
    timeout_secs: u64,
    max_bytes: u64,
) -> Result<ResolvedInput, ConvertError> {
    info!("Downloading source from: {}", url);

    let fetch_error = |e: reqwest::Error| {
        if e.is_timeout() {
            ConvertError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            ConvertError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(fetch_error)?;

    let response = client.get(url).send().await.map_err(fetch_error)?;

    if !response.status().is_success() {
        return Err(ConvertError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let filename = extract_filename(url, response.headers());
    let too_large = |size: u64| ConvertError::InputTooLarge {
        input: filename.clone(),
        size,
        limit: max_bytes,
    };
    if let Some(declared) = response.content_length() {
        if declared > max_bytes {
            return Err(too_large(declared));
        }
    }

    let temp_dir = TempDir::with_prefix("officeconv-dl-")
        .map_err(|e| ConvertError::workspace(std::env::temp_dir(), e))?;
    let file_path = temp_dir.path().join(&filename);
    let write_error = |e: std::io::Error| ConvertError::workspace(&file_path, e);

    let mut file = tokio::fs::File::create(&file_path).await.map_err(write_error)?;
    let mut body = response.bytes_stream();
    let mut downloaded: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(fetch_error)?;
        downloaded += chunk.len() as u64;
        if downloaded > max_bytes {
            // Dropping `temp_dir` removes the partial file.
            return Err(too_large(downloaded));
        }
        file.write_all(&chunk).await.map_err(write_error)?;
    }
    file.flush().await.map_err(write_error)?;

    info!("Downloaded {} bytes to: {}", downloaded, file_path.display());

    Ok(ResolvedInput::Downloaded {
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Pick a file name from `Content-Disposition`, then the URL path.
fn extract_filename(url: &str, headers: &reqwest::header::HeaderMap) -> String {
    if let Some(name) = headers
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(content_disposition_filename)
    {
        return name;
    }

    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded".to_string()
}

fn content_disposition_filename(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|v| v.trim_matches('"'))
        // Never let a header pick a path outside the temp dir.
        .and_then(|v| Path::new(v).file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

/// Validate size and decide the concrete source format.
///
/// Runs every check that can reject a job without an engine: empty or
/// oversized input, undetectable or self-contradicting format, and a target
/// outside the source's document family.
pub fn inspect_source(
    input: &ResolvedInput,
    declared: SourceFormat,
    target: TargetFormat,
    max_bytes: u64,
) -> Result<SourceFormat, ConvertError> {
    let label = input
        .file_name()
        .map(str::to_string)
        .unwrap_or_else(|| "<input>".to_string());

    let size = match input.path() {
        Some(p) => input.len().map_err(|e| ConvertError::workspace(p, e))?,
        None => input.len().unwrap_or(0),
    };
    if size == 0 {
        return Err(ConvertError::EmptyInput { input: label });
    }
    if size > max_bytes {
        return Err(ConvertError::InputTooLarge {
            input: label,
            size,
            limit: max_bytes,
        });
    }

    let head = match input.path() {
        Some(p) => input.head().map_err(|e| ConvertError::workspace(p, e))?,
        None => input.head().unwrap_or_default(),
    };
    let source = format::detect_source_format(declared, input.file_name(), &head)?;
    format::check_compatible(source, target)?;
    debug!("{label}: {source} ({size} bytes) → {target}");
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use reqwest::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION};

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.docx"));
        assert!(is_url("http://example.com/doc.docx"));
        assert!(!is_url("/tmp/doc.docx"));
        assert!(!is_url("doc.docx"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_from_url_and_header() {
        let empty = HeaderMap::new();
        assert_eq!(
            extract_filename("https://x.test/files/q3.xlsx?sig=1", &empty),
            "q3.xlsx"
        );
        assert_eq!(extract_filename("https://x.test/download", &empty), "downloaded");

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"../../etc/report.docx\""),
        );
        assert_eq!(extract_filename("https://x.test/download", &headers), "report.docx");
    }

    #[tokio::test]
    async fn missing_local_file() {
        let err = resolve_input(InputSource::Path("/no/such/file.docx".into()), 5, 1024)
            .await
            .unwrap_err();
        assert_matches!(err, ConvertError::FileNotFound { .. });
    }

    #[tokio::test]
    async fn directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_input(InputSource::Path(dir.path().to_path_buf()), 5, 1024)
            .await
            .unwrap_err();
        assert_matches!(err, ConvertError::InvalidInput { .. });
    }

    /// Serve one canned HTTP response on a local port.
    async fn serve_once(response: Vec<u8>) -> String {
        use tokio::io::AsyncReadExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 1024];
            let _ = sock.read(&mut req).await;
            let _ = sock.write_all(&response).await;
            let _ = sock.shutdown().await;
        });
        format!("http://{addr}/files/report.txt")
    }

    fn http_response(headers: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 200 OK\r\n{headers}Connection: close\r\n\r\n").into_bytes();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn download_streams_body_to_disk() {
        let body = b"quarterly figures";
        let url = serve_once(http_response(
            &format!("Content-Length: {}\r\n", body.len()),
            body,
        ))
        .await;
        let input = resolve_input(InputSource::Url(url), 5, 1024).await.unwrap();
        assert_eq!(input.file_name(), Some("report.txt"));
        assert_eq!(std::fs::read(input.path().unwrap()).unwrap(), body);
    }

    #[tokio::test]
    async fn download_refuses_declared_oversized_body() {
        let url = serve_once(http_response("Content-Length: 5000000\r\n", b"")).await;
        let err = resolve_input(InputSource::Url(url), 5, 1024).await.unwrap_err();
        assert_matches!(
            err,
            ConvertError::InputTooLarge { size: 5_000_000, limit: 1024, .. }
        );
    }

    #[tokio::test]
    async fn download_stops_once_body_passes_the_limit() {
        // No Content-Length: the size is only known while reading.
        let url = serve_once(http_response("", &vec![b'x'; 4096])).await;
        let err = resolve_input(InputSource::Url(url), 5, 1024).await.unwrap_err();
        assert_matches!(err, ConvertError::InputTooLarge { size, limit: 1024, .. } if size > 1024);
    }

    #[test]
    fn inspect_rejects_empty_and_oversized() {
        let empty = ResolvedInput::InMemory {
            name: "a.txt".into(),
            data: Vec::new(),
        };
        assert_matches!(
            inspect_source(&empty, SourceFormat::Auto, TargetFormat::Pdf, 100),
            Err(ConvertError::EmptyInput { .. })
        );

        let big = ResolvedInput::InMemory {
            name: "a.txt".into(),
            data: vec![b'x'; 101],
        };
        assert_matches!(
            inspect_source(&big, SourceFormat::Auto, TargetFormat::Pdf, 100),
            Err(ConvertError::InputTooLarge { size: 101, limit: 100, .. })
        );
    }

    #[test]
    fn inspect_detects_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "meeting notes").unwrap();
        let input = ResolvedInput::Local(path);
        assert_eq!(
            inspect_source(&input, SourceFormat::Auto, TargetFormat::Odt, 1024).unwrap(),
            SourceFormat::Txt
        );
        assert_eq!(input.stem(), "notes");
    }

    #[test]
    fn inspect_rejects_cross_family() {
        let input = ResolvedInput::InMemory {
            name: "table.csv".into(),
            data: b"a,b\n1,2\n".to_vec(),
        };
        assert_matches!(
            inspect_source(&input, SourceFormat::Auto, TargetFormat::Pptx, 1024),
            Err(ConvertError::IncompatibleFormats { .. })
        );
    }
}
