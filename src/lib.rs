//! # edgequake-pdf2img
//!
//! Convert PDF documents to PNG page images behind a durable job API.
//!
//! Clients submit a PDF and get a job id back immediately. A fixed pool of
//! workers rasterises the document page by page through pdfium, stores each
//! PNG in a content-addressed store and attaches it to the job, so pages can
//! be fetched while the rest of the document is still rendering.
//!
//! ## Architecture
//!
//! ```text
//! HTTP (api) ─▶ ConversionService ─▶ Admission ─▶ JobRegistry ─┐
//!                    ▲                                          │ claim
//!                    │ status / fetch                           ▼
//!                    └──────── JobRegistry ◀── Worker ─▶ Rasterizer (pdfium)
//!                                                 │
//!                                                 ▼
//!                                         Storage (SHA-256 keyed)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2img::{FsStorage, PdfiumRasterizer, ServiceConfig, ServiceRuntime, Upload};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder().storage_root("output_images").build()?;
//!     let storage = Arc::new(FsStorage::open(config.storage_root.clone()).await?);
//!     let rasterizer = Arc::new(PdfiumRasterizer::default());
//!     let runtime = ServiceRuntime::start(config, storage, rasterizer).await?;
//!
//!     let job_id = runtime
//!         .service()
//!         .submit(Upload {
//!             bytes: std::fs::read("document.pdf")?,
//!             content_type: Some("application/pdf".into()),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("{:?}", runtime.service().status(job_id)?);
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2img-server` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding the service as a library:
//! ```toml
//! edgequake-pdf2img = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod service;
pub mod storage;
pub mod sweeper;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use admission::{AdmissionController, AdmissionLimits};
pub use api::router;
pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use error::{JobError, RasterError, ServiceError, StorageError};
pub use model::{DocumentInfo, ImageEncoding, JobId, JobRecord, JobSnapshot, JobState, PageImage};
pub use pipeline::render::{PdfiumRasterizer, Rasterizer, RenderOptions};
pub use progress::{ConversionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use registry::{JobRegistry, Journal};
pub use service::{ConversionService, FetchedPage, ServiceRuntime, Upload};
pub use storage::{ContentId, FsStorage, MemoryStorage, Storage};
