//! Job registry: lifecycle state, exclusive claims, and status queries.
//!
//! All state lives behind one mutex. Admission, reservation, claiming and
//! every state transition happen inside that critical section, which is what
//! makes "check capacity then enqueue" and "pop then mark Running" atomic.
//!
//! ## Write-ahead
//!
//! A job record changes in three steps: the next record is built from the
//! published one, written to the journal, then published. Clients never see
//! a state the journal does not hold, so a restart cannot move a job
//! backwards. These steps are serialised through one async lock; the state
//! mutex is never held across the journal write.
//!
//! ## Slots
//!
//! * A [`Reservation`] holds a queue slot while the upload is being stored.
//!   Dropping it without [`Reservation::commit`] gives the slot back.
//! * A [`Claim`] is a worker's exclusive ownership of a running job. Dropping
//!   it frees the concurrency slot and wakes another worker.

pub mod journal;

use crate::admission::{AdmissionController, Load};
use crate::error::{JobError, ServiceError};
use crate::model::{DocumentInfo, JobId, JobRecord, JobSnapshot, JobState, PageImage};
use crate::storage::ContentId;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

pub use journal::Journal;

/// A registry update that the state machine refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {0} not found")]
    UnknownJob(JobId),

    #[error("job {job_id} is {state}; cannot move to {to}")]
    Illegal {
        job_id: JobId,
        state: JobState,
        to: JobState,
    },

    #[error("job {job_id} is {state}; page updates require Running")]
    NotRunning { job_id: JobId, state: JobState },

    #[error("job {job_id}: page {got} arrived, expected page {expected}")]
    PageOutOfOrder {
        job_id: JobId,
        expected: usize,
        got: usize,
    },

    #[error("job {job_id}: {ready} pages written, document has {total:?}")]
    Incomplete {
        job_id: JobId,
        ready: usize,
        total: Option<usize>,
    },

    /// The update was not journalled and therefore not applied.
    #[error("job {job_id}: journal write failed: {detail}")]
    Journal { job_id: JobId, detail: String },
}

/// Queue and slot counters for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub queued: usize,
    pub running: usize,
    pub jobs: usize,
}

struct JobEntry {
    record: JobRecord,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<JobId, JobEntry>,
    queue: VecDeque<JobId>,
    /// Admitted uploads not yet committed.
    reserved: usize,
    /// Outstanding claims.
    running: usize,
    clients: HashMap<String, usize>,
}

impl RegistryState {
    fn queued(&self) -> usize {
        self.queue.len() + self.reserved
    }

    fn client_started(&mut self, client: Option<&str>) {
        if let Some(c) = client {
            *self.clients.entry(c.to_string()).or_default() += 1;
        }
    }

    fn client_done(&mut self, client: Option<&str>) {
        if let Some(c) = client {
            if let Some(n) = self.clients.get_mut(c) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    self.clients.remove(c);
                }
            }
        }
    }
}

pub struct JobRegistry {
    state: Mutex<RegistryState>,
    admission: AdmissionController,
    journal: Option<Journal>,
    /// Serialises build → journal → publish of record changes.
    transitions: AsyncMutex<()>,
    work_available: Notify,
    /// Held shared while blobs are written and attached, exclusively while
    /// expired blobs are deleted, so expiry never removes content that is
    /// about to be referenced.
    content_lock: RwLock<()>,
}

impl JobRegistry {
    /// Empty in-memory registry without a journal.
    pub fn new(admission: AdmissionController) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            admission,
            journal: None,
            transitions: AsyncMutex::new(()),
            work_available: Notify::new(),
            content_lock: RwLock::new(()),
        }
    }

    /// Registry backed by `journal`, replaying whatever it already holds.
    ///
    /// Queued jobs are re-enqueued in creation order. Jobs that were running
    /// when the process stopped end up `Failed` with [`JobError::Interrupted`].
    pub async fn recover(
        admission: AdmissionController,
        journal: Journal,
    ) -> Result<Self, ServiceError> {
        let records = journal.load().await?;
        let mut state = RegistryState::default();
        let mut interrupted = Vec::new();

        for mut record in records {
            match record.state {
                JobState::Queued => {
                    state.queue.push_back(record.id);
                    state.client_started(record.client_id.as_deref());
                }
                JobState::Running => {
                    record.transition(JobState::Failed);
                    record.error = Some(JobError::Interrupted);
                    interrupted.push(record.clone());
                }
                _ => {}
            }
            state.jobs.insert(
                record.id,
                JobEntry {
                    record,
                    cancel: Arc::new(AtomicBool::new(false)),
                },
            );
        }

        for record in &interrupted {
            journal.write(record).await?;
        }
        info!(
            "Recovered {} jobs ({} queued, {} interrupted)",
            state.jobs.len(),
            state.queue.len(),
            interrupted.len()
        );

        Ok(Self {
            state: Mutex::new(state),
            admission,
            journal: Some(journal),
            transitions: AsyncMutex::new(()),
            work_available: Notify::new(),
            content_lock: RwLock::new(()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write `record` to the journal, if there is one.
    async fn write_ahead(&self, record: &JobRecord) -> Result<(), TransitionError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        journal.write(record).await.map_err(|e| {
            error!("Journal write for job {} failed: {}", record.id, e);
            TransitionError::Journal {
                job_id: record.id,
                detail: e.to_string(),
            }
        })
    }

    /// Build the next record with `f`, journal it, then publish it.
    ///
    /// Nothing is published when `f` refuses the change or the journal
    /// write fails.
    async fn apply<F>(&self, job_id: JobId, f: F) -> Result<JobRecord, TransitionError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), TransitionError>,
    {
        let _serial = self.transitions.lock().await;
        let mut next = self
            .record(job_id)
            .ok_or(TransitionError::UnknownJob(job_id))?;
        f(&mut next)?;
        self.write_ahead(&next).await?;
        self.publish(next.clone())?;
        Ok(next)
    }

    fn publish(&self, record: JobRecord) -> Result<(), TransitionError> {
        let mut state = self.lock();
        let entry = state
            .jobs
            .get_mut(&record.id)
            .ok_or(TransitionError::UnknownJob(record.id))?;
        entry.record = record;
        Ok(())
    }

    /// Shared guard for writers of blobs that will be attached to a job.
    pub async fn content_read(&self) -> RwLockReadGuard<'_, ()> {
        self.content_lock.read().await
    }

    /// Exclusive guard for deleting expired blobs.
    pub async fn content_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.content_lock.write().await
    }

    // ── Admission ─────────────────────────────────────────────────────────

    /// Atomically check capacity and reserve a queue slot.
    pub fn reserve(self: &Arc<Self>, client_id: Option<&str>) -> Result<Reservation, ServiceError> {
        let mut state = self.lock();
        let load = Load {
            running: state.running,
            queued: state.queued(),
            client_active: client_id
                .and_then(|c| state.clients.get(c).copied())
                .unwrap_or(0),
        };
        if let Err(rejection) = self.admission.admit(&load, client_id.is_some()) {
            debug!("Admission rejected: {}", rejection);
            return Err(ServiceError::Overloaded {
                reason: rejection.to_string(),
                retry_after_secs: 1,
            });
        }
        state.reserved += 1;
        state.client_started(client_id);

        Ok(Reservation {
            registry: Arc::clone(self),
            client_id: client_id.map(str::to_string),
            committed: false,
        })
    }

    // ── Claiming ──────────────────────────────────────────────────────────

    /// Claim the oldest queued job if a running slot is free.
    ///
    /// The job is popped and its running slot taken before `Running` is
    /// journalled. If that write fails the job goes back to the front of the
    /// queue and stays `Queued`.
    pub async fn try_claim(self: &Arc<Self>) -> Option<Claim> {
        let _serial = self.transitions.lock().await;
        let mut next = {
            let mut state = self.lock();
            if !self.admission.may_start(state.running) {
                return None;
            }
            let job_id = state.queue.pop_front()?;
            let Some(entry) = state.jobs.get(&job_id) else {
                warn!("Queued job {} has no record; dropping it", job_id);
                return None;
            };
            let record = entry.record.clone();
            state.running += 1;
            record
        };
        let job_id = next.id;

        let written = if next.transition(JobState::Running) {
            self.write_ahead(&next).await
        } else {
            Err(TransitionError::Illegal {
                job_id,
                state: next.state,
                to: JobState::Running,
            })
        };

        let mut state = self.lock();
        if let Err(e) = written {
            state.running = state.running.saturating_sub(1);
            if matches!(e, TransitionError::Journal { .. }) {
                state.queue.push_front(job_id);
            } else {
                warn!("Queued entry {} refused: {}; dropping it", job_id, e);
            }
            return None;
        }
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            state.running = state.running.saturating_sub(1);
            return None;
        };
        entry.record = next;
        let claim = Claim {
            registry: Arc::clone(self),
            job_id,
            document: entry.record.document.clone(),
            cancel: Arc::clone(&entry.cancel),
        };
        drop(state);
        debug!("Claimed job {}", job_id);
        Some(claim)
    }

    /// Wait until a job can be claimed.
    pub async fn next_job(self: &Arc<Self>) -> Claim {
        loop {
            let notified = self.work_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claim) = self.try_claim().await {
                return claim;
            }
            notified.await;
        }
    }

    fn release(self: &Arc<Self>, job_id: JobId) {
        let still_running = {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            let record = state.jobs.get(&job_id).map(|e| e.record.clone());
            let client = record.as_ref().and_then(|r| r.client_id.clone());
            state.client_done(client.as_deref());
            record.is_some_and(|r| r.state == JobState::Running)
        };
        self.work_available.notify_one();
        if !still_running {
            return;
        }

        // The worker never reached a verdict (its task was aborted, or the
        // verdict could not be journalled).
        warn!("Job {} released without a verdict; failing it", job_id);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to fail job {}; left to the stall sweep", job_id);
            return;
        };
        let registry = Arc::clone(self);
        handle.spawn(async move {
            if let Err(e) = registry.fail(job_id, JobError::Interrupted).await {
                debug!("Job {} not marked Interrupted: {}", job_id, e);
            }
        });
    }

    // ── Worker updates (require an outstanding claim) ─────────────────────

    /// Record the page count once the document has been opened.
    pub async fn set_total_pages(&self, job_id: JobId, total: usize) -> Result<(), TransitionError> {
        self.apply(job_id, |r| {
            if r.state != JobState::Running {
                return Err(TransitionError::NotRunning {
                    job_id,
                    state: r.state,
                });
            }
            r.total_pages = Some(total);
            r.touch();
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Attach the next page. Pages must arrive as 1, 2, 3, … and only while
    /// the job is running.
    pub async fn record_page(&self, page: PageImage) -> Result<(), TransitionError> {
        let job_id = page.job_id;
        self.apply(job_id, |r| {
            if r.state != JobState::Running {
                return Err(TransitionError::NotRunning {
                    job_id,
                    state: r.state,
                });
            }
            let expected = r.pages.len() + 1;
            if page.page_index != expected {
                return Err(TransitionError::PageOutOfOrder {
                    job_id,
                    expected,
                    got: page.page_index,
                });
            }
            r.pages.push(page);
            r.last_progress_at = Some(Utc::now());
            r.touch();
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// `Running → Succeeded`, only with pages 1..=total all attached.
    pub async fn succeed(&self, job_id: JobId) -> Result<(), TransitionError> {
        let record = self
            .apply(job_id, |r| {
                let complete = r.total_pages.is_some_and(|t| t > 0 && t == r.pages.len());
                if r.state == JobState::Running && !complete {
                    return Err(TransitionError::Incomplete {
                        job_id,
                        ready: r.pages.len(),
                        total: r.total_pages,
                    });
                }
                let from = r.state;
                if !r.transition(JobState::Succeeded) {
                    return Err(TransitionError::Illegal {
                        job_id,
                        state: from,
                        to: JobState::Succeeded,
                    });
                }
                Ok(())
            })
            .await?;
        info!("Job {} succeeded ({} pages)", job_id, record.pages.len());
        Ok(())
    }

    /// `Running → Failed`. Pages already attached are kept.
    pub async fn fail(&self, job_id: JobId, error: JobError) -> Result<(), TransitionError> {
        let record = self
            .apply(job_id, |r| {
                let from = r.state;
                if !r.transition(JobState::Failed) {
                    return Err(TransitionError::Illegal {
                        job_id,
                        state: from,
                        to: JobState::Failed,
                    });
                }
                r.error = Some(error);
                Ok(())
            })
            .await?;
        warn!(
            "Job {} failed after {} pages: {}",
            job_id,
            record.pages.len(),
            record.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
        );
        Ok(())
    }

    // ── Ingress queries and commands ──────────────────────────────────────

    /// Cancel a job. Queued jobs leave the queue immediately; running jobs
    /// are marked Cancelled and their worker stops at the next page
    /// boundary. Terminal jobs are returned unchanged.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobSnapshot, ServiceError> {
        let _serial = self.transitions.lock().await;
        let mut next = self
            .record(job_id)
            .ok_or_else(|| ServiceError::not_found(format!("job {job_id}")))?;
        let from = next.state;
        if !next.transition(JobState::Cancelled) {
            return Ok(next.snapshot());
        }
        self.write_ahead(&next)
            .await
            .map_err(|e| ServiceError::Journal(e.to_string()))?;

        let snapshot = next.snapshot();
        {
            let mut state = self.lock();
            let entry = state
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| ServiceError::not_found(format!("job {job_id}")))?;
            entry.cancel.store(true, Ordering::SeqCst);
            let client = next.client_id.clone();
            entry.record = next;
            if from == JobState::Queued {
                state.queue.retain(|id| *id != job_id);
                state.client_done(client.as_deref());
            }
        }
        info!("Job {} cancelled", job_id);
        Ok(snapshot)
    }

    pub fn snapshot(&self, job_id: JobId) -> Option<JobSnapshot> {
        self.lock().jobs.get(&job_id).map(|e| e.record.snapshot())
    }

    pub fn record(&self, job_id: JobId) -> Option<JobRecord> {
        self.lock().jobs.get(&job_id).map(|e| e.record.clone())
    }

    /// Page `index` (1-based) of a job, if already written.
    pub fn page(&self, job_id: JobId, index: usize) -> Result<PageImage, ServiceError> {
        let state = self.lock();
        let entry = state
            .jobs
            .get(&job_id)
            .ok_or_else(|| ServiceError::not_found(format!("job {job_id}")))?;
        index
            .checked_sub(1)
            .and_then(|i| entry.record.pages.get(i))
            .cloned()
            .ok_or_else(|| ServiceError::not_found(format!("page {index} of job {job_id}")))
    }

    /// Whether any job still references `id`.
    pub fn is_referenced(&self, id: &ContentId) -> bool {
        self.lock()
            .jobs
            .values()
            .any(|e| e.record.content_ids().any(|c| c == id))
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.lock();
        RegistryStats {
            queued: state.queued(),
            running: state.running,
            jobs: state.jobs.len(),
        }
    }

    // ── Sweeps ────────────────────────────────────────────────────────────

    /// Fail running jobs that have not written a page within `stall`.
    pub async fn fail_stalled(&self, stall: Duration) -> Vec<JobId> {
        let Some(cutoff) = cutoff_before(stall) else {
            return Vec::new();
        };
        let is_stalled = |r: &JobRecord| {
            r.state == JobState::Running && r.last_progress_at.is_some_and(|t| t < cutoff)
        };
        let candidates: Vec<JobId> = self
            .lock()
            .jobs
            .values()
            .filter(|e| is_stalled(&e.record))
            .map(|e| e.record.id)
            .collect();

        let mut stalled = Vec::new();
        for job_id in candidates {
            let verdict = self
                .apply(job_id, |r| {
                    if !is_stalled(&*r) || !r.transition(JobState::Failed) {
                        return Err(TransitionError::NotRunning {
                            job_id,
                            state: r.state,
                        });
                    }
                    r.error = Some(JobError::Stalled {
                        secs: stall.as_secs(),
                    });
                    Ok(())
                })
                .await;
            match verdict {
                Ok(record) => {
                    if let Some(entry) = self.lock().jobs.get(&job_id) {
                        entry.cancel.store(true, Ordering::SeqCst);
                    }
                    warn!(
                        "Job {} stalled after {} pages; marked Failed",
                        job_id,
                        record.pages.len()
                    );
                    stalled.push(job_id);
                }
                Err(e) => debug!("Stall verdict for {} not applied: {}", job_id, e),
            }
        }
        stalled
    }

    /// Drop terminal jobs finished more than `retention` ago. Returns the
    /// content ids that no remaining job references; the caller deletes
    /// them while holding [`JobRegistry::content_write`].
    pub async fn expire(&self, retention: Duration) -> Vec<ContentId> {
        let Some(cutoff) = cutoff_before(retention) else {
            return Vec::new();
        };
        let _serial = self.transitions.lock().await;
        let (expired, orphaned) = {
            let mut state = self.lock();
            let ids: Vec<JobId> = state
                .jobs
                .values()
                .filter(|e| {
                    e.record.state.is_terminal()
                        && e.record.finished_at.is_some_and(|t| t < cutoff)
                })
                .map(|e| e.record.id)
                .collect();
            let removed: Vec<JobRecord> = ids
                .iter()
                .filter_map(|id| state.jobs.remove(id).map(|e| e.record))
                .collect();

            let live: HashSet<&ContentId> = state
                .jobs
                .values()
                .flat_map(|e| e.record.content_ids())
                .collect();
            let mut orphaned: Vec<ContentId> = removed
                .iter()
                .flat_map(|r| r.content_ids())
                .filter(|c| !live.contains(c))
                .cloned()
                .collect();
            orphaned.sort();
            orphaned.dedup();
            (ids, orphaned)
        };

        if let Some(journal) = &self.journal {
            for id in &expired {
                if let Err(e) = journal.remove(*id).await {
                    warn!("Could not remove journal entry for {}: {}", id, e);
                }
            }
        }
        if !expired.is_empty() {
            info!(
                "Expired {} jobs, {} blobs unreferenced",
                expired.len(),
                orphaned.len()
            );
        }
        orphaned
    }
}

/// `now - age`, or `None` when `age` reaches before the representable range.
fn cutoff_before(age: Duration) -> Option<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|d| Utc::now().checked_sub_signed(d))
}

/// A reserved queue slot for an upload that is still being stored.
pub struct Reservation {
    registry: Arc<JobRegistry>,
    client_id: Option<String>,
    committed: bool,
}

impl Reservation {
    /// Journal the new job, then make it visible and claimable.
    pub async fn commit(mut self, document: DocumentInfo) -> Result<JobId, ServiceError> {
        let record = JobRecord::new(document, self.client_id.clone());
        if let Some(journal) = &self.registry.journal {
            journal.write(&record).await?;
        }
        let job_id = record.id;
        {
            let mut state = self.registry.lock();
            state.reserved = state.reserved.saturating_sub(1);
            state.queue.push_back(job_id);
            state.jobs.insert(
                job_id,
                JobEntry {
                    record,
                    cancel: Arc::new(AtomicBool::new(false)),
                },
            );
        }
        self.committed = true;
        self.registry.work_available.notify_one();
        info!("Job {} queued", job_id);
        Ok(job_id)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.registry.lock();
        state.reserved = state.reserved.saturating_sub(1);
        state.client_done(self.client_id.as_deref());
    }
}

/// A worker's exclusive ownership of a running job.
pub struct Claim {
    registry: Arc<JobRegistry>,
    job_id: JobId,
    document: DocumentInfo,
    cancel: Arc<AtomicBool>,
}

impl Claim {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn document(&self) -> &DocumentInfo {
        &self.document
    }

    /// Set when the job was cancelled, timed out or declared stalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.registry.release(self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionLimits;
    use crate::model::ImageEncoding;
    use futures::future::join_all;

    fn registry(limits: AdmissionLimits) -> Arc<JobRegistry> {
        Arc::new(JobRegistry::new(AdmissionController::new(limits)))
    }

    fn limits(running: usize, queue: usize, per_client: usize) -> AdmissionLimits {
        AdmissionLimits {
            max_concurrent_jobs: running,
            max_queue_depth: queue,
            max_jobs_per_client: per_client,
        }
    }

    fn document(tag: &str) -> DocumentInfo {
        DocumentInfo {
            id: ContentId::of(tag.as_bytes()),
            size: tag.len() as u64,
            mime_type: "application/pdf".into(),
            filename: None,
            uploaded_at: Utc::now(),
        }
    }

    fn page(job_id: JobId, index: usize) -> PageImage {
        PageImage {
            job_id,
            page_index: index,
            content_id: ContentId::of(format!("{job_id}/{index}").as_bytes()),
            width: 10,
            height: 10,
            encoding: ImageEncoding::Png,
        }
    }

    async fn enqueue(reg: &Arc<JobRegistry>, tag: &str) -> JobId {
        reg.reserve(None).unwrap().commit(document(tag)).await.unwrap()
    }

    #[tokio::test]
    async fn reservation_counts_against_queue_depth_until_dropped() {
        let reg = registry(limits(1, 2, 16));
        let first = reg.reserve(None).unwrap();
        let _second = reg.reserve(None).unwrap();
        assert!(matches!(
            reg.reserve(None),
            Err(ServiceError::Overloaded { .. })
        ));
        drop(first);
        assert!(reg.reserve(None).is_ok());
    }

    #[tokio::test]
    async fn per_client_limit_covers_queued_and_running() {
        let reg = registry(limits(4, 16, 2));
        reg.reserve(Some("alice"))
            .unwrap()
            .commit(document("a1"))
            .await
            .unwrap();
        reg.reserve(Some("alice"))
            .unwrap()
            .commit(document("a2"))
            .await
            .unwrap();
        let _running = reg.try_claim().await.unwrap();

        assert!(reg.reserve(Some("alice")).is_err());
        assert!(reg.reserve(Some("bob")).is_ok());
        assert!(reg.reserve(None).is_ok());
    }

    #[tokio::test]
    async fn claims_are_exclusive_and_bounded() {
        let reg = registry(limits(3, 64, 16));
        for i in 0..10 {
            enqueue(&reg, &format!("doc-{i}")).await;
        }

        let claims: Vec<Claim> = join_all((0..8).map(|_| reg.try_claim()))
            .await
            .into_iter()
            .flatten()
            .collect();

        assert_eq!(claims.len(), 3);
        let ids: HashSet<JobId> = claims.iter().map(|c| c.job_id()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(reg.stats().running, 3);
        assert_eq!(reg.stats().queued, 7);
    }

    #[tokio::test]
    async fn pages_must_be_contiguous_and_complete() {
        let reg = registry(AdmissionLimits::default());
        let id = enqueue(&reg, "doc").await;
        let claim = reg.try_claim().await.unwrap();

        reg.set_total_pages(id, 2).await.unwrap();
        assert_eq!(
            reg.record_page(page(id, 2)).await,
            Err(TransitionError::PageOutOfOrder {
                job_id: id,
                expected: 1,
                got: 2
            })
        );
        reg.record_page(page(id, 1)).await.unwrap();
        assert!(matches!(
            reg.succeed(id).await,
            Err(TransitionError::Incomplete { ready: 1, .. })
        ));
        reg.record_page(page(id, 2)).await.unwrap();
        reg.succeed(id).await.unwrap();

        drop(claim);
        let snap = reg.snapshot(id).unwrap();
        assert_eq!(snap.state, JobState::Succeeded);
        assert_eq!(snap.pages_ready, 2);
        assert_eq!(reg.stats().running, 0);
    }

    #[tokio::test]
    async fn terminal_jobs_reject_further_updates() {
        let reg = registry(AdmissionLimits::default());
        let id = enqueue(&reg, "doc").await;
        let _claim = reg.try_claim().await.unwrap();
        reg.fail(id, JobError::Timeout { secs: 1 }).await.unwrap();

        assert!(matches!(
            reg.succeed(id).await,
            Err(TransitionError::Illegal { .. })
        ));
        assert!(matches!(
            reg.record_page(page(id, 1)).await,
            Err(TransitionError::NotRunning { .. })
        ));
        let snap = reg.cancel(id).await.unwrap();
        assert_eq!(snap.state, JobState::Failed);
    }

    #[tokio::test]
    async fn cancel_queued_job_frees_its_slot() {
        let reg = registry(limits(1, 1, 16));
        let id = enqueue(&reg, "doc").await;
        assert!(reg.reserve(None).is_err());

        let snap = reg.cancel(id).await.unwrap();
        assert_eq!(snap.state, JobState::Cancelled);
        assert_eq!(reg.stats().queued, 0);
        assert!(reg.try_claim().await.is_none());
        assert!(reg.reserve(None).is_ok());
    }

    #[tokio::test]
    async fn cancel_running_job_raises_flag() {
        let reg = registry(AdmissionLimits::default());
        let id = enqueue(&reg, "doc").await;
        let claim = reg.try_claim().await.unwrap();
        assert!(!claim.is_cancelled());

        reg.cancel(id).await.unwrap();
        assert!(claim.is_cancelled());
        assert!(reg.record_page(page(id, 1)).await.is_err());
    }

    #[tokio::test]
    async fn dropped_claim_without_verdict_fails_job() {
        let reg = registry(AdmissionLimits::default());
        let id = enqueue(&reg, "doc").await;
        drop(reg.try_claim().await.unwrap());
        assert_eq!(reg.stats().running, 0);

        let mut record = reg.record(id).unwrap();
        for _ in 0..100 {
            if record.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            record = reg.record(id).unwrap();
        }
        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.error, Some(JobError::Interrupted));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let reg = registry(AdmissionLimits::default());
        let ghost = JobId::new();
        assert!(reg.snapshot(ghost).is_none());
        assert!(matches!(
            reg.cancel(ghost).await,
            Err(ServiceError::NotFound { .. })
        ));
        assert!(matches!(
            reg.page(ghost, 1),
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stalled_running_jobs_are_failed() {
        let reg = registry(AdmissionLimits::default());
        let id = enqueue(&reg, "doc").await;
        let claim = reg.try_claim().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stalled = reg.fail_stalled(Duration::from_millis(5)).await;
        assert_eq!(stalled, vec![id]);
        assert!(claim.is_cancelled());
        let snap = reg.snapshot(id).unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.error.unwrap().kind, "Timeout");
    }

    #[tokio::test]
    async fn expire_keeps_content_shared_with_live_jobs() {
        let reg = registry(AdmissionLimits::default());
        let old = enqueue(&reg, "shared").await;
        let live = enqueue(&reg, "shared").await;
        let solo = enqueue(&reg, "solo").await;
        reg.cancel(old).await.unwrap();
        reg.cancel(solo).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let orphaned = reg.expire(Duration::from_millis(5)).await;
        assert_eq!(orphaned, vec![ContentId::of(b"solo")]);
        assert!(reg.snapshot(old).is_none());
        assert!(reg.snapshot(solo).is_none());
        assert!(reg.snapshot(live).is_some());
        assert!(reg.is_referenced(&ContentId::of(b"shared")));
    }

    #[tokio::test]
    async fn recover_requeues_queued_and_fails_running() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::open(dir.path()).await.unwrap();

        let queued = JobRecord::new(document("q"), Some("alice".into()));
        let mut running = JobRecord::new(document("r"), None);
        assert!(running.transition(JobState::Running));
        let mut done = JobRecord::new(document("d"), None);
        assert!(done.transition(JobState::Cancelled));
        for r in [&queued, &running, &done] {
            journal.write(r).await.unwrap();
        }

        let reg = Arc::new(
            JobRegistry::recover(AdmissionController::new(AdmissionLimits::default()), journal)
                .await
                .unwrap(),
        );
        assert_eq!(reg.stats(), RegistryStats { queued: 1, running: 0, jobs: 3 });

        let interrupted = reg.record(running.id).unwrap();
        assert_eq!(interrupted.state, JobState::Failed);
        assert_eq!(interrupted.error, Some(JobError::Interrupted));
        assert_eq!(reg.record(done.id).unwrap().state, JobState::Cancelled);

        let claim = reg.try_claim().await.unwrap();
        assert_eq!(claim.job_id(), queued.id);

        // The interrupted verdict was written back.
        let reloaded = Journal::open(dir.path()).await.unwrap().load().await.unwrap();
        let on_disk = reloaded.iter().find(|r| r.id == running.id).unwrap();
        assert_eq!(on_disk.state, JobState::Failed);
    }

    fn break_journal(dir: &std::path::Path) {
        std::fs::remove_dir_all(dir.join("tmp")).unwrap();
        std::fs::write(dir.join("tmp"), b"not a directory").unwrap();
    }

    fn repair_journal(dir: &std::path::Path) {
        std::fs::remove_file(dir.join("tmp")).unwrap();
        std::fs::create_dir(dir.join("tmp")).unwrap();
    }

    async fn journalled(dir: &std::path::Path) -> Arc<JobRegistry> {
        let journal = Journal::open(dir).await.unwrap();
        Arc::new(
            JobRegistry::recover(AdmissionController::new(AdmissionLimits::default()), journal)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn verdict_is_published_only_after_it_is_journalled() {
        let dir = tempfile::tempdir().unwrap();
        let reg = journalled(dir.path()).await;
        let id = enqueue(&reg, "doc").await;
        let claim = reg.try_claim().await.unwrap();
        reg.set_total_pages(id, 1).await.unwrap();
        reg.record_page(page(id, 1)).await.unwrap();

        break_journal(dir.path());
        assert!(matches!(
            reg.succeed(id).await,
            Err(TransitionError::Journal { .. })
        ));
        assert_eq!(reg.snapshot(id).unwrap().state, JobState::Running);
        assert!(matches!(
            reg.cancel(id).await,
            Err(ServiceError::Journal(_))
        ));
        assert!(!claim.is_cancelled());
        assert_eq!(reg.snapshot(id).unwrap().state, JobState::Running);

        repair_journal(dir.path());
        reg.succeed(id).await.unwrap();
        drop(claim);

        let restarted = journalled(dir.path()).await;
        let record = restarted.record(id).unwrap();
        assert_eq!(record.state, JobState::Succeeded);
        assert_eq!(record.pages.len(), 1);
        assert_eq!(record.error, None);
    }

    #[tokio::test]
    async fn claim_is_undone_when_running_cannot_be_journalled() {
        let dir = tempfile::tempdir().unwrap();
        let reg = journalled(dir.path()).await;
        let id = enqueue(&reg, "doc").await;

        break_journal(dir.path());
        assert!(reg.try_claim().await.is_none());
        assert_eq!(reg.snapshot(id).unwrap().state, JobState::Queued);
        assert_eq!(reg.stats(), RegistryStats { queued: 1, running: 0, jobs: 1 });

        repair_journal(dir.path());
        let claim = reg.try_claim().await.unwrap();
        assert_eq!(claim.job_id(), id);
        assert_eq!(reg.snapshot(id).unwrap().state, JobState::Running);
    }
}
