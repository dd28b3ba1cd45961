//! Ingress operations and the runtime that owns workers and the sweeper.
//!
//! [`ConversionService`] is the transport-independent API: the HTTP layer in
//! [`crate::api`] is a thin mapping onto it, and tests call it directly.

use crate::admission::AdmissionController;
use crate::config::ServiceConfig;
use crate::error::{ServiceError, StorageError};
use crate::model::{DocumentInfo, JobId, JobSnapshot, PageImage};
use crate::pipeline::input::{download, validate_upload};
use crate::pipeline::render::Rasterizer;
use crate::registry::{JobRegistry, Journal, RegistryStats, Reservation};
use crate::storage::Storage;
use crate::sweeper::Sweeper;
use crate::worker::{Worker, WorkerPool};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// An uploaded document as received by ingress.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub filename: Option<String>,
    /// Caller identity for per-client limits; `None` is exempt.
    pub client_id: Option<String>,
}

/// A stored page ready to be returned to a client.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub image: PageImage,
    pub bytes: Vec<u8>,
}

/// Submit, poll, fetch and cancel conversion jobs.
#[derive(Clone)]
pub struct ConversionService {
    registry: Arc<JobRegistry>,
    storage: Arc<dyn Storage>,
    config: Arc<ServiceConfig>,
}

impl ConversionService {
    pub fn new(
        registry: Arc<JobRegistry>,
        storage: Arc<dyn Storage>,
        config: Arc<ServiceConfig>,
    ) -> Self {
        Self {
            registry,
            storage,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validate, admit, store and enqueue an upload.
    ///
    /// Returns once the document and the job record are durable. Nothing is
    /// enqueued when validation, admission or storage fails.
    pub async fn submit(&self, upload: Upload) -> Result<JobId, ServiceError> {
        self.check_size(upload.bytes.len())?;
        let mime = validate_upload(&upload.bytes, upload.content_type.as_deref())?;
        let reservation = self.registry.reserve(upload.client_id.as_deref())?;
        self.store_and_commit(reservation, upload.bytes, mime, upload.filename)
            .await
    }

    /// Download a PDF and submit it.
    ///
    /// The queue slot is reserved before downloading so an overloaded
    /// service rejects the request without fetching anything.
    pub async fn submit_url(
        &self,
        url: &str,
        client_id: Option<&str>,
    ) -> Result<JobId, ServiceError> {
        let reservation = self.registry.reserve(client_id)?;
        let downloaded = download(
            url,
            self.config.download_timeout,
            self.config.max_upload_bytes,
        )
        .await?;
        let content_type = downloaded
            .content_type
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let mime = validate_upload(&downloaded.bytes, Some(&content_type))?;
        self.store_and_commit(
            reservation,
            downloaded.bytes,
            mime,
            Some(downloaded.filename),
        )
        .await
    }

    async fn store_and_commit(
        &self,
        reservation: Reservation,
        bytes: Vec<u8>,
        mime_type: String,
        filename: Option<String>,
    ) -> Result<JobId, ServiceError> {
        let _shared = self.registry.content_read().await;
        let id = self.storage.put(&bytes).await?;
        let document = DocumentInfo {
            id,
            size: bytes.len() as u64,
            mime_type,
            filename,
            uploaded_at: Utc::now(),
        };
        reservation.commit(document).await
    }

    fn check_size(&self, len: usize) -> Result<(), ServiceError> {
        if len > self.config.max_upload_bytes {
            return Err(ServiceError::invalid(format!(
                "document is {len} bytes, limit is {}",
                self.config.max_upload_bytes
            )));
        }
        Ok(())
    }

    pub fn status(&self, job_id: JobId) -> Result<JobSnapshot, ServiceError> {
        self.registry
            .snapshot(job_id)
            .ok_or_else(|| ServiceError::not_found(format!("job {job_id}")))
    }

    /// PNG bytes of page `page_index` (1-based), available as soon as the
    /// page is written regardless of the job's state.
    pub async fn fetch(&self, job_id: JobId, page_index: usize) -> Result<FetchedPage, ServiceError> {
        let image = self.registry.page(job_id, page_index)?;
        match self.storage.get(&image.content_id).await {
            Ok(bytes) => Ok(FetchedPage { image, bytes }),
            // Expired between the lookup and the read.
            Err(StorageError::NotFound { .. }) => Err(ServiceError::not_found(format!(
                "page {page_index} of job {job_id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<JobSnapshot, ServiceError> {
        self.registry.cancel(job_id).await
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }
}

/// Parse a job id from a path segment. Malformed ids cannot name a job, so
/// they are reported as not found.
pub fn parse_job_id(raw: &str) -> Result<JobId, ServiceError> {
    raw.parse()
        .map_err(|_| ServiceError::not_found(format!("job {raw}")))
}

/// A running service: ingress plus its worker pool and sweeper.
pub struct ServiceRuntime {
    service: ConversionService,
    workers: WorkerPool,
    sweeper: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl ServiceRuntime {
    /// Start with a journal under `config.storage_root/jobs`, recovering any
    /// jobs left by a previous run.
    pub async fn start(
        config: ServiceConfig,
        storage: Arc<dyn Storage>,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> Result<Self, ServiceError> {
        let journal = Journal::open(config.journal_dir()).await?;
        let admission = AdmissionController::new(config.admission_limits());
        let registry = Arc::new(JobRegistry::recover(admission, journal).await?);
        Ok(Self::launch(config, registry, storage, rasterizer))
    }

    /// Start without a journal; jobs do not survive the process.
    pub fn ephemeral(
        config: ServiceConfig,
        storage: Arc<dyn Storage>,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> Self {
        let admission = AdmissionController::new(config.admission_limits());
        let registry = Arc::new(JobRegistry::new(admission));
        Self::launch(config, registry, storage, rasterizer)
    }

    fn launch(
        config: ServiceConfig,
        registry: Arc<JobRegistry>,
        storage: Arc<dyn Storage>,
        rasterizer: Arc<dyn Rasterizer>,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);

        let worker = Worker::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            rasterizer,
            &config,
        );
        let workers = WorkerPool::spawn(worker, config.worker_count, rx.clone());

        let sweeper = Sweeper::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            config.stall_timeout,
            config.retention,
        );
        let sweeper = tokio::spawn(sweeper.run(config.sweep_interval, rx));

        info!(
            "Service started: {} workers, {} concurrent jobs, queue depth {}",
            config.worker_count, config.max_concurrent_jobs, config.max_queue_depth
        );
        let service = ConversionService::new(registry, storage, Arc::new(config));
        Self {
            service,
            workers,
            sweeper,
            shutdown,
        }
    }

    pub fn service(&self) -> &ConversionService {
        &self.service
    }

    /// Stop taking jobs and wait for workers to finish the ones they hold.
    pub async fn shutdown(self) {
        info!("Shutting down: waiting for {} workers", self.workers.len());
        let _ = self.shutdown.send(true);
        self.workers.join().await;
        if let Err(e) = self.sweeper.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_job_id_is_not_found() {
        let err = parse_job_id("not-a-uuid").unwrap_err();
        assert_eq!(err.code(), "NotFound");
        assert!(parse_job_id(&JobId::new().to_string()).is_ok());
    }
}
