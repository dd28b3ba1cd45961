//! Configuration for the conversion service.
//!
//! Every knob lives in [`ServiceConfig`], built via [`ServiceConfigBuilder`].
//! Setters clamp values into their valid range; [`ServiceConfigBuilder::build`]
//! rejects combinations that cannot work.

use crate::admission::AdmissionLimits;
use crate::error::ServiceError;
use crate::pipeline::render::RenderOptions;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a conversion service instance.
///
/// # Example
/// ```rust
/// use edgequake_pdf2img::ServiceConfig;
/// use std::time::Duration;
///
/// let config = ServiceConfig::builder()
///     .dpi(150)
///     .worker_count(2)
///     .max_queue_depth(8)
///     .job_timeout(Duration::from_secs(120))
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 150);
/// ```
#[derive(Clone)]
pub struct ServiceConfig {
    /// Directory holding blobs and the job journal. Default: `output_images`.
    pub storage_root: PathBuf,

    /// Rendering DPI. Range: 72–600. Default: 300.
    pub dpi: u32,

    /// Longest edge of a rendered page in pixels. Default: 6000.
    ///
    /// Caps memory per page regardless of the physical page size.
    pub max_rendered_pixels: u32,

    /// Number of worker tasks. Default: 4.
    pub worker_count: usize,

    /// Jobs allowed to run at once. Default: 4.
    pub max_concurrent_jobs: usize,

    /// Accepted-but-unstarted jobs before `Overloaded`. Default: 64.
    pub max_queue_depth: usize,

    /// Queued plus running jobs per `x-client-id`. Default: 16.
    pub max_jobs_per_client: usize,

    /// Wall-clock budget for one job. Default: 10 minutes.
    pub job_timeout: Duration,

    /// A running job that writes no page for this long is failed. Default: 2 minutes.
    pub stall_timeout: Duration,

    /// How often the sweeper checks for stalls and expired jobs. Default: 5 s.
    pub sweep_interval: Duration,

    /// Finished jobs (and their blobs) are removed after this long.
    /// `None` keeps them forever. Default: 24 hours.
    pub retention: Option<Duration>,

    /// Maximum upload size in bytes. Default: 64 MiB.
    pub max_upload_bytes: usize,

    /// Download timeout for URL submissions. Default: 120 s.
    pub download_timeout: Duration,

    /// Directory containing the pdfium shared library. `None` uses the
    /// system library search path.
    pub pdfium_library_dir: Option<PathBuf>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Receives per-job progress events from the workers.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let limits = AdmissionLimits::default();
        Self {
            storage_root: PathBuf::from("output_images"),
            dpi: 300,
            max_rendered_pixels: 6000,
            worker_count: 4,
            max_concurrent_jobs: limits.max_concurrent_jobs,
            max_queue_depth: limits.max_queue_depth,
            max_jobs_per_client: limits.max_jobs_per_client,
            job_timeout: Duration::from_secs(600),
            stall_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(5),
            retention: Some(Duration::from_secs(24 * 60 * 60)),
            max_upload_bytes: 64 * 1024 * 1024,
            download_timeout: Duration::from_secs(120),
            pdfium_library_dir: None,
            password: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("storage_root", &self.storage_root)
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("worker_count", &self.worker_count)
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("max_queue_depth", &self.max_queue_depth)
            .field("max_jobs_per_client", &self.max_jobs_per_client)
            .field("job_timeout", &self.job_timeout)
            .field("stall_timeout", &self.stall_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("retention", &self.retention)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("pdfium_library_dir", &self.pdfium_library_dir)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ConversionProgressCallback>"),
            )
            .finish()
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            max_concurrent_jobs: self.max_concurrent_jobs,
            max_queue_depth: self.max_queue_depth,
            max_jobs_per_client: self.max_jobs_per_client,
        }
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            dpi: self.dpi,
            max_rendered_pixels: self.max_rendered_pixels,
        }
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.storage_root.join("jobs")
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.storage_root = root.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.config.worker_count = n.max(1);
        self
    }

    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.config.max_concurrent_jobs = n.max(1);
        self
    }

    pub fn max_queue_depth(mut self, n: usize) -> Self {
        self.config.max_queue_depth = n;
        self
    }

    pub fn max_jobs_per_client(mut self, n: usize) -> Self {
        self.config.max_jobs_per_client = n;
        self
    }

    pub fn job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.stall_timeout = timeout;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn retention(mut self, retention: Option<Duration>) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    pub fn pdfium_library_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_dir = Some(dir.into());
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, ServiceError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(ServiceError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.worker_count == 0 || c.max_concurrent_jobs == 0 {
            return Err(ServiceError::InvalidConfig(
                "worker_count and max_concurrent_jobs must be ≥ 1".into(),
            ));
        }
        if c.max_queue_depth == 0 {
            return Err(ServiceError::InvalidConfig(
                "max_queue_depth must be ≥ 1".into(),
            ));
        }
        if c.max_jobs_per_client == 0 {
            return Err(ServiceError::InvalidConfig(
                "max_jobs_per_client must be ≥ 1".into(),
            ));
        }
        if c.job_timeout.is_zero() || c.stall_timeout.is_zero() || c.sweep_interval.is_zero() {
            return Err(ServiceError::InvalidConfig(
                "timeouts and sweep interval must be non-zero".into(),
            ));
        }
        if c.max_upload_bytes == 0 {
            return Err(ServiceError::InvalidConfig(
                "max_upload_bytes must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}
