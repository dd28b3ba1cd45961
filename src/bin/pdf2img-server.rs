//! HTTP server binary for edgequake-pdf2img.
//!
//! Maps CLI flags onto `ServiceConfig`, starts the worker pool and serves the
//! job API until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdf2img::{router, FsStorage, PdfiumRasterizer, ServiceConfig, ServiceRuntime};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"ENDPOINTS:
  POST   /jobs                 multipart upload, field "file" (application/pdf)
  POST   /jobs/url             JSON {"url": "https://…/doc.pdf"}
  GET    /jobs/{id}            job status and page list
  GET    /jobs/{id}/pages/{n}  PNG of page n (1-based)
  DELETE /jobs/{id}            cancel a job
  GET    /health               queue and worker counters

EXAMPLES:
  pdf2img-server --listen 0.0.0.0:5001 --storage-root /var/lib/pdf2img
  curl -F file=@paper.pdf -H 'x-client-id: alice' http://localhost:5001/jobs

PDFIUM:
  Set PDF2IMG_PDFIUM_PATH to the directory containing libpdfium, or install
  it on the system library path.
"#;

/// Serve PDF → PNG conversion jobs over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2img-server",
    version,
    about = "Serve PDF to PNG conversion jobs over HTTP",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "PDF2IMG_LISTEN", default_value = "127.0.0.1:5001")]
    listen: SocketAddr,

    /// Directory for stored documents, page images and the job journal.
    #[arg(long, env = "PDF2IMG_STORAGE_ROOT", default_value = "output_images")]
    storage_root: PathBuf,

    /// Rendering DPI (72–600).
    #[arg(long, env = "PDF2IMG_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Longest edge of a rendered page in pixels.
    #[arg(long, env = "PDF2IMG_MAX_PIXELS", default_value_t = 6000)]
    max_rendered_pixels: u32,

    /// Number of worker tasks.
    #[arg(short, long, env = "PDF2IMG_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Jobs converted at the same time.
    #[arg(long, env = "PDF2IMG_MAX_CONCURRENT", default_value_t = 4)]
    max_concurrent_jobs: usize,

    /// Jobs waiting to start before submissions are rejected.
    #[arg(long, env = "PDF2IMG_MAX_QUEUE", default_value_t = 64)]
    max_queue_depth: usize,

    /// Active jobs allowed per x-client-id.
    #[arg(long, env = "PDF2IMG_MAX_PER_CLIENT", default_value_t = 16)]
    max_jobs_per_client: usize,

    /// Per-job timeout in seconds.
    #[arg(long, env = "PDF2IMG_JOB_TIMEOUT", default_value_t = 600)]
    job_timeout: u64,

    /// Fail a running job after this many seconds without a new page.
    #[arg(long, env = "PDF2IMG_STALL_TIMEOUT", default_value_t = 120)]
    stall_timeout: u64,

    /// Seconds between stall and retention sweeps.
    #[arg(long, env = "PDF2IMG_SWEEP_INTERVAL", default_value_t = 5)]
    sweep_interval: u64,

    /// Delete finished jobs after this many seconds (0 keeps them forever).
    #[arg(long, env = "PDF2IMG_RETENTION", default_value_t = 86_400)]
    retention: u64,

    /// Maximum upload size in MiB.
    #[arg(long, env = "PDF2IMG_MAX_UPLOAD_MB", default_value_t = 64)]
    max_upload_mb: usize,

    /// HTTP download timeout in seconds for URL submissions.
    #[arg(long, env = "PDF2IMG_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Directory containing the pdfium shared library.
    #[arg(long, env = "PDF2IMG_PDFIUM_PATH")]
    pdfium_path: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2IMG_PASSWORD")]
    password: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2IMG_VERBOSE")]
    verbose: bool,
}

impl Cli {
    fn to_config(&self) -> Result<ServiceConfig> {
        let mut builder = ServiceConfig::builder()
            .storage_root(self.storage_root.clone())
            .dpi(self.dpi)
            .max_rendered_pixels(self.max_rendered_pixels)
            .worker_count(self.workers)
            .max_concurrent_jobs(self.max_concurrent_jobs)
            .max_queue_depth(self.max_queue_depth)
            .max_jobs_per_client(self.max_jobs_per_client)
            .job_timeout(Duration::from_secs(self.job_timeout))
            .stall_timeout(Duration::from_secs(self.stall_timeout))
            .sweep_interval(Duration::from_secs(self.sweep_interval))
            .retention((self.retention > 0).then(|| Duration::from_secs(self.retention)))
            .max_upload_bytes(self.max_upload_mb.saturating_mul(1024 * 1024))
            .download_timeout(Duration::from_secs(self.download_timeout));
        if let Some(dir) = &self.pdfium_path {
            builder = builder.pdfium_library_dir(dir.clone());
        }
        if let Some(pwd) = &self.password {
            builder = builder.password(pwd.clone());
        }
        builder.build().context("Invalid configuration")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = cli.to_config()?;

    let rasterizer =
        PdfiumRasterizer::new(config.pdfium_library_dir.clone(), config.password.clone());
    rasterizer
        .check_binding()
        .context("pdfium is not available")?;

    let storage = FsStorage::open(config.storage_root.clone())
        .await
        .with_context(|| format!("Cannot open storage at {}", config.storage_root.display()))?;
    info!("Storage initialised at {}", storage.root().display());

    let runtime = ServiceRuntime::start(config, Arc::new(storage), Arc::new(rasterizer))
        .await
        .context("Failed to start conversion service")?;

    let app = router(runtime.service().clone());
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Cannot bind {}", cli.listen))?;
    info!("Listening on http://{}", cli.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, shutting down");
}
