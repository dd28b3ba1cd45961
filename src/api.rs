//! HTTP surface over [`ConversionService`].
//!
//! | Method | Path                     | Result                                  |
//! |--------|--------------------------|-----------------------------------------|
//! | POST   | `/jobs`                  | 202 `{jobId, state, statusUrl}`         |
//! | POST   | `/jobs/url`              | 202 `{jobId, state, statusUrl}`         |
//! | GET    | `/jobs/:id`              | 200 job snapshot                        |
//! | GET    | `/jobs/:id/pages/:n`     | 200 `image/png`                         |
//! | DELETE | `/jobs/:id`              | 200 job snapshot after cancellation     |
//! | GET    | `/health`                | 200 `{status, queued, running, jobs}`   |
//!
//! Errors use the body `{"error": <code>, "message": <text>}`.

use crate::error::ServiceError;
use crate::model::{JobId, JobState};
use crate::service::{parse_job_id, ConversionService, Upload};
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Header carrying the caller identity used for per-client limits.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// Room for multipart boundaries and part headers on top of the document.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, message) = match &self {
            Self::InvalidInput { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::Overloaded { .. } => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, self.to_string()),
            Self::DownloadFailed { .. } | Self::DownloadTimeout { .. } => {
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            Self::Storage(_) | Self::Journal(_) | Self::InvalidConfig(_) | Self::Internal(_) => {
                error!("Internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": message,
        }));
        let mut response = (status, body).into_response();
        if let Self::Overloaded {
            retry_after_secs, ..
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreated {
    pub job_id: JobId,
    pub state: JobState,
    pub status_url: String,
}

impl JobCreated {
    fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            state: JobState::Queued,
            status_url: format!("/jobs/{job_id}"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    pub url: String,
}

/// Build the router. Upload size is bounded by the service configuration.
pub fn router(service: ConversionService) -> Router {
    let body_limit = service
        .config()
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(create_job))
        .route("/jobs/url", post(create_job_from_url))
        .route("/jobs/:id", get(job_status).delete(cancel_job))
        .route("/jobs/:id/pages/:page", get(job_page))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

fn client_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

async fn health(State(service): State<ConversionService>) -> impl IntoResponse {
    let stats = service.stats();
    Json(json!({
        "status": "ok",
        "queued": stats.queued,
        "running": stats.running,
        "jobs": stats.jobs,
    }))
}

async fn create_job(
    State(service): State<ConversionService>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let mut multipart = multipart.map_err(|e| ServiceError::invalid(e.body_text()))?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::invalid(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field.content_type().map(str::to_string);
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ServiceError::invalid(e.body_text()))?;
        upload = Some(Upload {
            bytes: bytes.to_vec(),
            content_type,
            filename,
            client_id: client_id(&headers),
        });
        break;
    }
    let upload = upload.ok_or_else(|| ServiceError::invalid("no file part in the request"))?;

    info!(
        "Upload received: {} bytes ({})",
        upload.bytes.len(),
        upload.filename.as_deref().unwrap_or("unnamed")
    );
    let job_id = service.submit(upload).await?;
    Ok((StatusCode::ACCEPTED, Json(JobCreated::new(job_id))))
}

async fn create_job_from_url(
    State(service): State<ConversionService>,
    headers: HeaderMap,
    body: Result<Json<UrlRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ServiceError> {
    let Json(request) = body.map_err(|e| ServiceError::invalid(e.body_text()))?;
    let job_id = service
        .submit_url(&request.url, client_id(&headers).as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(JobCreated::new(job_id))))
}

async fn job_status(
    State(service): State<ConversionService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(service.status(job_id)?))
}

async fn job_page(
    State(service): State<ConversionService>,
    Path((id, page)): Path<(String, String)>,
) -> Result<Response, ServiceError> {
    let job_id = parse_job_id(&id)?;
    let page_index: usize = page
        .parse()
        .map_err(|_| ServiceError::not_found(format!("page {page} of job {job_id}")))?;
    let fetched = service.fetch(job_id, page_index).await?;

    let headers = [
        (header::CONTENT_TYPE, fetched.image.encoding.mime_type().to_string()),
        (header::ETAG, format!("\"{}\"", fetched.image.content_id)),
    ];
    Ok((headers, fetched.bytes).into_response())
}

async fn cancel_job(
    State(service): State<ConversionService>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(service.cancel(job_id).await?))
}
