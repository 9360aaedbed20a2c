//! # officeconv
//!
//! Convert office documents (docx, xlsx, pptx, odt, rtf, html, ...) to PDF
//! or another office format by driving LibreOffice headless through a
//! supervised pool of isolated engine instances.
//!
//! ## Why a pool?
//!
//! `soffice --convert-to` is easy to call once and hard to call at scale. It
//! takes seconds to start, it silently hands work to any running instance
//! sharing its profile, it leaves lock files behind when it crashes, and some
//! malformed documents make it hang forever. This crate keeps N instances,
//! each with a private profile, behind a bounded priority queue, and treats
//! every engine run as untrusted: deadlines are enforced by killing the whole
//! process group, crashed or hung instances are recycled on a fresh profile,
//! and a zero exit code counts for nothing until the output file passes a
//! signature check.
//!
//! ## Pipeline Overview
//!
//! ```text
//! request
//!  │
//!  ├─ 1. Input      resolve local file, download URL, or take bytes
//!  ├─ 2. Inspect    size limits, format detection, family compatibility
//!  ├─ 3. Queue      bounded, priority then FIFO
//!  ├─ 4. Workspace  private in/ and out/ directories per job
//!  ├─ 5. Engine     checkout → run under deadline → checkin / recycle
//!  ├─ 6. Validate   non-empty output with the target's signature and trailer
//!  ├─ 7. Post       optional PDF page limit and text/image stamps
//!  └─ 8. Deliver    atomic move to the destination, workspace removed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use officeconv::{ConversionPool, ConversionRequest, LibreOfficeAdapter, PoolConfig, TargetFormat};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PoolConfig::builder().pool_size(4).output_dir("converted").build()?;
//!     let pool = ConversionPool::start(config, Arc::new(LibreOfficeAdapter::locate()?)).await?;
//!
//!     let handles = pool
//!         .submit_many(["q1.xlsx", "q2.xlsx"].map(|p| ConversionRequest::from_path(p, TargetFormat::Pdf)))
//!         .await;
//!     for handle in handles {
//!         let output = handle?.await?;
//!         eprintln!("{} ({} bytes)", output.output_path.display(), output.size_bytes);
//!     }
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! For a single document, [`convert`] starts and stops a one-instance pool.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `officeconv` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! officeconv = { version = "0.1", default-features = false }
//! ```
//!
//! ## Other engines
//!
//! Anything that converts a file on the command line can be pooled through
//! [`CommandAdapter`], or through your own [`EngineAdapter`].

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod engine;
pub mod error;
pub mod format;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PoolConfig, PoolConfigBuilder};
pub use convert::{
    convert, convert_from_bytes, convert_sync, convert_to_file, convert_with, inspect_engine,
    EngineInfo,
};
pub use engine::{CommandAdapter, EngineAdapter, LibreOfficeAdapter, ProcessHandle, SlotContext};
pub use error::{ConvertError, ErrorKind};
pub use format::{DocumentFamily, SourceFormat, TargetFormat};
pub use job::{ConversionRequest, InputSource, JobHandle, JobId, JobState, Priority};
pub use output::{ConversionOutput, PoolHealth, PoolStats};
pub use pipeline::postprocess::{PostProcess, Stamp, StampContent};
pub use pipeline::validate::{validate, Signature};
pub use pool::ConversionPool;
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback};
