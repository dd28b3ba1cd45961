//! Error types for the edgequake-pdf2img service.
//!
//! Four error types, one per failure boundary:
//!
//! * [`ServiceError`] — **Synchronous**: the request itself cannot be served
//!   (bad upload, overload, unknown id, storage failure during submit).
//!   Returned as `Err(ServiceError)` from the ingress operations and mapped
//!   to an HTTP status by [`crate::api`].
//!
//! * [`JobError`] — **Per-job**: the conversion of one job failed. Stored on
//!   the job record (and journalled), never propagated to other jobs.
//!
//! * [`StorageError`] — a content store operation failed.
//!
//! * [`RasterError`] — the external rasterizer rejected a document or page.

use crate::storage::ContentId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors returned synchronously by the ingress operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    // ── Request errors ────────────────────────────────────────────────────
    /// Upload is missing, empty, not a PDF, or of an unsupported type.
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Admission control rejected the submission; retry with backoff.
    #[error("Service overloaded: {reason}")]
    Overloaded {
        reason: String,
        retry_after_secs: u64,
    },

    /// Unknown job, or page not (yet) available.
    #[error("{what} not found")]
    NotFound { what: String },

    // ── URL input errors ──────────────────────────────────────────────────
    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Infrastructure errors ─────────────────────────────────────────────
    /// The content store failed while persisting or reading data.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The job journal could not be written or read.
    #[error("Journal error: {0}")]
    Journal(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ServiceError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        ServiceError::NotFound { what: what.into() }
    }

    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput { .. } => "InvalidInput",
            ServiceError::Overloaded { .. } => "Overloaded",
            ServiceError::NotFound { .. } => "NotFound",
            ServiceError::DownloadFailed { .. } | ServiceError::DownloadTimeout { .. } => {
                "DownloadFailed"
            }
            ServiceError::InvalidConfig(_) => "InvalidConfig",
            ServiceError::Storage(_) | ServiceError::Journal(_) | ServiceError::Internal(_) => {
                "InternalError"
            }
        }
    }
}

/// Why a job ended in `Failed`.
///
/// Stored on the job record so callers polling status can see how far the
/// conversion progressed and why it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobError {
    /// The document could not be opened or has no pages.
    #[error("document could not be opened: {detail}")]
    InvalidDocument { detail: String },

    /// The rasterizer returned an error for a page.
    #[error("page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// The rasterizer panicked; the worker survived.
    #[error("page {page}: rasterizer crashed: {detail}")]
    RasterizerCrashed { page: usize, detail: String },

    /// The job exceeded its wall-clock budget.
    #[error("conversion timed out after {secs}s")]
    Timeout { secs: u64 },

    /// No page was written within the stall window.
    #[error("no progress for {secs}s, conversion abandoned")]
    Stalled { secs: u64 },

    /// Source document or page output could not be read or written.
    #[error("storage failure: {detail}")]
    StorageFailed { detail: String },

    /// The process stopped while the job was running.
    #[error("interrupted by service restart")]
    Interrupted,
}

impl JobError {
    /// Coarse category reported to clients: timeouts are a subtype of
    /// conversion errors but are called out separately.
    pub fn category(&self) -> &'static str {
        match self {
            JobError::Timeout { .. } | JobError::Stalled { .. } => "Timeout",
            JobError::StorageFailed { .. } | JobError::Interrupted => "InternalError",
            _ => "ConversionError",
        }
    }
}

/// Errors from the content-addressed store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("content {id} not found")]
    NotFound { id: ContentId },

    #[error("invalid content id '{0}'")]
    InvalidContentId(String),

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(op: &'static str) -> impl FnOnce(std::io::Error) -> StorageError {
        move |source| StorageError::Io { op, source }
    }
}

/// Errors reported by a [`crate::pipeline::render::Rasterizer`].
#[derive(Debug, Clone, Error)]
pub enum RasterError {
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDF2IMG_PDFIUM_PATH to the directory containing libpdfium."
    )]
    Binding(String),

    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {0}")]
    Corrupt(String),

    /// PDF requires a password but none (or a wrong one) was provided.
    #[error("PDF is encrypted and requires a password")]
    PasswordRequired,

    /// Rendering a specific page failed.
    #[error("page {page}: {detail}")]
    Page { page: usize, detail: String },

    /// The library panicked. The binding was dropped after the unwind, so
    /// later calls are unaffected.
    #[error("rasterizer panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloaded_display() {
        let e = ServiceError::Overloaded {
            reason: "queue full (2/2)".into(),
            retry_after_secs: 1,
        };
        assert!(e.to_string().contains("queue full"), "got: {e}");
        assert_eq!(e.code(), "Overloaded");
    }

    #[test]
    fn storage_errors_are_internal() {
        let e: ServiceError = StorageError::Io {
            op: "write",
            source: std::io::Error::other("disk full"),
        }
        .into();
        assert_eq!(e.code(), "InternalError");
        assert!(e.to_string().contains("disk full"));
    }

    #[test]
    fn timeout_is_its_own_category() {
        assert_eq!(JobError::Timeout { secs: 5 }.category(), "Timeout");
        assert_eq!(JobError::Stalled { secs: 5 }.category(), "Timeout");
        assert_eq!(
            JobError::RenderFailed {
                page: 3,
                detail: "bad".into()
            }
            .category(),
            "ConversionError"
        );
    }

    #[test]
    fn job_error_serialises_with_kind_tag() {
        let json = serde_json::to_value(JobError::RenderFailed {
            page: 3,
            detail: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "renderFailed");
        assert_eq!(json["page"], 3);
    }
}
