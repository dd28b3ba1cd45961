//! Input validation: decide whether an upload is a PDF we accept, and fetch
//! PDFs submitted by URL.
//!
//! Checking the `%PDF` magic bytes up front means callers get an
//! `InvalidInput` answer immediately instead of a job that fails later
//! inside pdfium.

use crate::error::ServiceError;
use std::time::Duration;
use tracing::{debug, info};

/// Content types accepted as-is.
pub const SUPPORTED_CONTENT_TYPES: &[&str] = &["application/pdf", "application/x-pdf"];

/// Generic binary type; accepted only when the payload sniffs as a PDF.
const OCTET_STREAM: &str = "application/octet-stream";

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// Strip parameters (`; charset=…`) and lowercase a MIME type.
pub fn normalise_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Validate an upload and return its normalised MIME type.
pub fn validate_upload(bytes: &[u8], content_type: Option<&str>) -> Result<String, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::invalid("uploaded file is empty"));
    }

    let mime = content_type.map(normalise_content_type).unwrap_or_default();
    let declared_pdf = SUPPORTED_CONTENT_TYPES.contains(&mime.as_str());
    if !declared_pdf && mime != OCTET_STREAM {
        return Err(ServiceError::invalid(if mime.is_empty() {
            "missing content type".to_string()
        } else {
            format!("unsupported content type '{mime}', expected application/pdf")
        }));
    }

    if !bytes.starts_with(PDF_MAGIC) {
        let magic: Vec<u8> = bytes.iter().take(4).copied().collect();
        return Err(ServiceError::invalid(format!(
            "file is not a valid PDF (first bytes: {magic:?})"
        )));
    }

    debug!("Accepted upload: {} bytes, {}", bytes.len(), mime);
    Ok(if declared_pdf {
        mime
    } else {
        SUPPORTED_CONTENT_TYPES[0].to_string()
    })
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// A PDF fetched over HTTP.
#[derive(Debug)]
pub struct Downloaded {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub filename: String,
}

/// Download a URL into memory, bounded by `timeout` and `max_bytes`.
pub async fn download(
    url: &str,
    timeout: Duration,
    max_bytes: usize,
) -> Result<Downloaded, ServiceError> {
    if !is_url(url) {
        return Err(ServiceError::invalid(format!(
            "'{url}' is not a valid HTTP/HTTPS URL"
        )));
    }
    info!("Downloading PDF from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ServiceError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let map_err = |e: reqwest::Error| {
        if e.is_timeout() {
            ServiceError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout.as_secs(),
            }
        } else {
            ServiceError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let mut response = client.get(url).send().await.map_err(map_err)?;

    if !response.status().is_success() {
        return Err(ServiceError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    if response
        .content_length()
        .is_some_and(|len| len > max_bytes as u64)
    {
        return Err(ServiceError::invalid(format!(
            "document exceeds {max_bytes} bytes"
        )));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let filename = extract_filename(url);

    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(map_err)? {
        if bytes.len() + chunk.len() > max_bytes {
            return Err(ServiceError::invalid(format!(
                "document exceeds {max_bytes} bytes"
            )));
        }
        bytes.extend_from_slice(&chunk);
    }

    info!("Downloaded {} bytes from {}", bytes.len(), url);
    Ok(Downloaded {
        bytes,
        content_type,
        filename,
    })
}

/// Extract a reasonable filename from the URL path.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded.pdf".to_string()
}
