//! Worker pool: claims queued jobs and drives them through
//! fetch → count pages → render → encode → store → attach.
//!
//! Each page is attached to the job as soon as it is stored, so clients can
//! fetch page 1 while page 2 is still rendering. A failure on page N keeps
//! pages 1..N-1.
//!
//! The rasterizer runs on the blocking pool. A panic inside it surfaces as a
//! `JoinError` (or [`RasterError::Panicked`]) and fails only the job being
//! processed; the worker task keeps going.
//!
//! A blocking render cannot be interrupted. When a job times out mid-page the
//! render keeps its claim, and with it the concurrency slot, until it
//! returns.

use crate::config::ServiceConfig;
use crate::error::{JobError, RasterError};
use crate::model::{ImageEncoding, JobId, JobState, PageImage};
use crate::pipeline::encode::{encode_png, EncodedPage};
use crate::pipeline::render::{panic_message, Rasterizer, RenderOptions};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::registry::{Claim, JobRegistry, TransitionError};
use crate::storage::{ContentId, Storage};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Why a conversion stopped before every page was attached.
#[derive(Debug)]
enum Stop {
    /// Record this error on the job.
    Failed(JobError),
    /// The job was cancelled, or someone else already decided its outcome.
    Abandoned,
}

impl From<TransitionError> for Stop {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Journal { .. } => error!("Stopping job: {}", e),
            _ => debug!("Registry refused update: {}", e),
        }
        Stop::Abandoned
    }
}

/// Shared dependencies of a worker task.
#[derive(Clone)]
pub struct Worker {
    registry: Arc<JobRegistry>,
    storage: Arc<dyn Storage>,
    rasterizer: Arc<dyn Rasterizer>,
    render: RenderOptions,
    job_timeout: Duration,
    progress: ProgressCallback,
}

impl Worker {
    pub fn new(
        registry: Arc<JobRegistry>,
        storage: Arc<dyn Storage>,
        rasterizer: Arc<dyn Rasterizer>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            registry,
            storage,
            rasterizer,
            render: config.render_options(),
            job_timeout: config.job_timeout,
            progress: config
                .progress_callback
                .clone()
                .unwrap_or_else(|| Arc::new(NoopProgressCallback)),
        }
    }

    /// Wait for jobs and process them until `shutdown` flips to `true`.
    ///
    /// A job already being processed is finished (or timed out) first.
    pub async fn run(self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!("Worker {} started", worker_id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            let claim = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                claim = self.registry.next_job() => claim,
            };
            self.process(worker_id, claim).await;
        }
        info!("Worker {} stopped", worker_id);
    }

    /// Claim and process one job if any is claimable. Returns whether a job
    /// was processed.
    pub async fn process_next_job(&self) -> bool {
        match self.registry.try_claim().await {
            Some(claim) => {
                self.process(0, claim).await;
                true
            }
            None => false,
        }
    }

    async fn process(&self, worker_id: usize, claim: Claim) {
        let claim = Arc::new(claim);
        let job_id = claim.job_id();
        info!(
            "Worker {} processing job {} ({} bytes)",
            worker_id,
            job_id,
            claim.document().size
        );

        let outcome = match tokio::time::timeout(self.job_timeout, self.convert(&claim)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                claim.cancel();
                Err(Stop::Failed(JobError::Timeout {
                    secs: self.job_timeout.as_secs(),
                }))
            }
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.registry.succeed(job_id).await {
                    debug!("Job {} finished but was not marked Succeeded: {}", job_id, e);
                }
            }
            Err(Stop::Failed(err)) => {
                if let Err(e) = self.registry.fail(job_id, err).await {
                    debug!("Job {} failure not recorded: {}", job_id, e);
                }
            }
            Err(Stop::Abandoned) => {
                debug!("Worker {} abandoned job {}", worker_id, job_id);
            }
        }

        let (state, pages_ready) = self
            .registry
            .snapshot(job_id)
            .map(|s| (s.state, s.pages_ready))
            .unwrap_or((JobState::Failed, 0));
        self.progress.on_job_finished(job_id, state, pages_ready);
        info!(
            "Worker {} done with job {}: {} ({} pages)",
            worker_id, job_id, state, pages_ready
        );
        drop(claim);
    }

    async fn convert(&self, claim: &Arc<Claim>) -> Result<(), Stop> {
        let job_id = claim.job_id();
        let document = self
            .storage
            .get(&claim.document().id)
            .await
            .map(Arc::new)
            .map_err(|e| {
                Stop::Failed(JobError::StorageFailed {
                    detail: e.to_string(),
                })
            })?;

        let total = self.page_count(claim, &document).await?;
        self.registry.set_total_pages(job_id, total).await?;
        self.progress.on_job_start(job_id, total);
        debug!("Job {} has {} pages", job_id, total);

        for page_index in 1..=total {
            if claim.is_cancelled() {
                return Err(Stop::Abandoned);
            }
            let encoded = self.render_page(claim, &document, page_index).await?;
            self.attach(job_id, page_index, encoded).await?;
            self.progress.on_page_complete(job_id, page_index, total);
        }
        Ok(())
    }

    async fn page_count(&self, claim: &Arc<Claim>, document: &Arc<Vec<u8>>) -> Result<usize, Stop> {
        let rasterizer = Arc::clone(&self.rasterizer);
        let doc = Arc::clone(document);
        let slot = Arc::clone(claim);
        let counted = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            rasterizer.page_count(&doc)
        });
        match counted.await {
            Ok(Ok(0)) => Err(Stop::Failed(JobError::InvalidDocument {
                detail: "document has no pages".into(),
            })),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(RasterError::Panicked(detail))) => {
                Err(Stop::Failed(JobError::RasterizerCrashed { page: 0, detail }))
            }
            Ok(Err(e)) => Err(Stop::Failed(JobError::InvalidDocument {
                detail: e.to_string(),
            })),
            Err(join) => Err(Stop::Failed(JobError::RasterizerCrashed {
                page: 0,
                detail: panic_detail(join),
            })),
        }
    }

    async fn render_page(
        &self,
        claim: &Arc<Claim>,
        document: &Arc<Vec<u8>>,
        page_index: usize,
    ) -> Result<EncodedPage, Stop> {
        let rasterizer = Arc::clone(&self.rasterizer);
        let doc = Arc::clone(document);
        let options = self.render;
        let slot = Arc::clone(claim);
        let rendered = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            let image = rasterizer
                .render_page(&doc, page_index, &options)
                .map_err(|e| match e {
                    RasterError::Panicked(detail) => JobError::RasterizerCrashed {
                        page: page_index,
                        detail,
                    },
                    e => JobError::RenderFailed {
                        page: page_index,
                        detail: e.to_string(),
                    },
                })?;
            encode_png(&image).map_err(|e| JobError::RenderFailed {
                page: page_index,
                detail: format!("PNG encoding failed: {e}"),
            })
        })
        .await;

        match rendered {
            Ok(result) => result.map_err(Stop::Failed),
            Err(join) => {
                error!("Rasterizer crashed on page {}", page_index);
                Err(Stop::Failed(JobError::RasterizerCrashed {
                    page: page_index,
                    detail: panic_detail(join),
                }))
            }
        }
    }

    /// Store a page and attach it to the job. The page becomes visible to
    /// `fetch` only once both steps succeed.
    async fn attach(
        &self,
        job_id: JobId,
        page_index: usize,
        encoded: EncodedPage,
    ) -> Result<(), Stop> {
        let shared = self.registry.content_read().await;
        let content_id = self.storage.put(&encoded.png).await.map_err(|e| {
            Stop::Failed(JobError::StorageFailed {
                detail: format!("page {page_index}: {e}"),
            })
        })?;

        let page = PageImage {
            job_id,
            page_index,
            content_id: content_id.clone(),
            width: encoded.width,
            height: encoded.height,
            encoding: ImageEncoding::Png,
        };
        match self.registry.record_page(page).await {
            Ok(()) => Ok(()),
            Err(refused) => {
                drop(shared);
                self.discard(&content_id).await;
                Err(refused.into())
            }
        }
    }

    /// Delete a blob nobody references. Content is shared across jobs, so
    /// this only happens under the exclusive content lock.
    async fn discard(&self, id: &ContentId) {
        let _exclusive = self.registry.content_write().await;
        if self.registry.is_referenced(id) {
            return;
        }
        if let Err(e) = self.storage.delete(id).await {
            warn!("Could not delete unattached page {}: {}", id, e);
        }
    }
}

fn panic_detail(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    panic_message(&*err.into_panic())
}

/// A fixed set of worker tasks sharing one [`Worker`].
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(worker: Worker, count: usize, shutdown: watch::Receiver<bool>) -> Self {
        let handles = (0..count)
            .map(|id| tokio::spawn(worker.clone().run(id, shutdown.clone())))
            .collect();
        info!("Spawned {} workers", count);
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker task to exit.
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                error!("Worker task ended abnormally: {}", e);
            }
        }
    }
}
