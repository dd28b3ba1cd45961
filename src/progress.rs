//! Progress-callback trait for per-job conversion events.
//!
//! Inject an [`Arc<dyn ConversionProgressCallback>`] via
//! [`crate::config::ServiceConfigBuilder::progress_callback`] to observe the
//! worker pool: forward events to a broadcast channel, a metrics sink, or a
//! websocket without the service knowing how the host communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdf2img::{ConversionProgressCallback, JobId, ServiceConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct PageCounter(AtomicUsize);
//!
//! impl ConversionProgressCallback for PageCounter {
//!     fn on_page_complete(&self, _job: JobId, _page: usize, _total: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let config = ServiceConfig::builder()
//!     .progress_callback(Arc::new(PageCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::model::{JobId, JobState};
use std::sync::Arc;

/// Called by workers as they process jobs.
///
/// Implementations must be `Send + Sync`: every worker calls into the same
/// instance concurrently. All methods default to no-ops.
pub trait ConversionProgressCallback: Send + Sync {
    /// Called once the document is opened and its page count is known.
    fn on_job_start(&self, job_id: JobId, total_pages: usize) {
        let _ = (job_id, total_pages);
    }

    /// Called after page `page` (1-based) is stored and visible to `fetch`.
    fn on_page_complete(&self, job_id: JobId, page: usize, total_pages: usize) {
        let _ = (job_id, page, total_pages);
    }

    /// Called when the worker reaches a verdict for the job.
    ///
    /// * `state` — final state as decided by the worker
    /// * `pages_ready` — pages stored before the verdict
    fn on_job_finished(&self, job_id: JobId, state: JobState, pages_ready: usize) {
        let _ = (job_id, state, pages_ready);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl ConversionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ServiceConfig`].
pub type ProgressCallback = Arc<dyn ConversionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        started_total: AtomicUsize,
        pages: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ConversionProgressCallback for TrackingCallback {
        fn on_job_start(&self, _job_id: JobId, total_pages: usize) {
            self.started_total.store(total_pages, Ordering::SeqCst);
        }

        fn on_page_complete(&self, _job_id: JobId, _page: usize, _total: usize) {
            self.pages.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_finished(&self, _job_id: JobId, _state: JobState, pages_ready: usize) {
            self.finished.store(pages_ready, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        let job = JobId::new();
        cb.on_job_start(job, 5);
        cb.on_page_complete(job, 1, 5);
        cb.on_job_finished(job, JobState::Failed, 1);
    }

    #[test]
    fn arc_dyn_callback_receives_events() {
        let tracker = Arc::new(TrackingCallback::default());
        let cb: ProgressCallback = tracker.clone();
        let job = JobId::new();

        cb.on_job_start(job, 3);
        cb.on_page_complete(job, 1, 3);
        cb.on_page_complete(job, 2, 3);
        cb.on_job_finished(job, JobState::Cancelled, 2);

        assert_eq!(tracker.started_total.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.pages.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.finished.load(Ordering::SeqCst), 2);
    }
}
