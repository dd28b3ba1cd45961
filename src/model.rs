//! Data model: documents, jobs, page images and the job state machine.

use crate::error::JobError;
use crate::storage::ContentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// Queued ──▶ Running ──▶ Succeeded
///   │          │  └────▶ Failed
///   └──────────┴───────▶ Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "Queued",
            JobState::Running => "Running",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
            JobState::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// An uploaded source document, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub id: ContentId,
    pub size: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Image encoding of a stored page. Only PNG is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEncoding {
    #[default]
    Png,
}

impl ImageEncoding {
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageEncoding::Png => "image/png",
        }
    }
}

/// One rasterised page of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageImage {
    pub job_id: JobId,
    /// 1-based; pages of a job are contiguous from 1.
    pub page_index: usize,
    pub content_id: ContentId,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub encoding: ImageEncoding,
}

/// Full record of a job as held by the registry and written to the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub document: DocumentInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Time of the last page written (or of the claim), for stall detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,
    #[serde(default)]
    pub pages: Vec<PageImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Bumped on every change; the journal never overwrites a newer revision.
    #[serde(default)]
    pub revision: u64,
}

impl JobRecord {
    pub fn new(document: DocumentInfo, client_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            document,
            client_id,
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_progress_at: None,
            total_pages: None,
            pages: Vec::new(),
            error: None,
            revision: 0,
        }
    }

    /// Move to `next`, stamping timestamps. Returns `false` (and changes
    /// nothing) when the edge is not part of the state machine.
    pub(crate) fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        self.state = next;
        match next {
            JobState::Running => {
                self.started_at = Some(now);
                self.last_progress_at = Some(now);
            }
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.touch();
        true
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.revision += 1;
    }

    /// Content ids owned by this job: the document and every page.
    pub fn content_ids(&self) -> impl Iterator<Item = &ContentId> {
        std::iter::once(&self.document.id).chain(self.pages.iter().map(|p| &p.content_id))
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id,
            state: self.state,
            pages_ready: self.pages.len(),
            total_pages: self.total_pages,
            error: self.error.as_ref().map(|e| ErrorInfo {
                kind: e.category().to_string(),
                message: e.to_string(),
            }),
            pages: self
                .pages
                .iter()
                .map(|p| PageSummary {
                    index: p.page_index,
                    content_id: p.content_id.clone(),
                    width: p.width,
                    height: p.height,
                    url: format!("/jobs/{}/pages/{}", self.id, p.page_index),
                })
                .collect(),
            document_id: self.document.id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time view of a job returned by `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub state: JobState,
    pub pages_ready: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub pages: Vec<PageSummary>,
    pub document_id: ContentId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSummary {
    pub index: usize,
    pub content_id: ContentId,
    pub width: u32,
    pub height: u32,
    pub url: String,
}
