//! Shared fixtures for integration tests.
//!
//! [`ScriptedRasterizer`] reads its behaviour from the "document" itself, so
//! each test controls page count and faults through the bytes it uploads:
//!
//! ```text
//! %PDF-1.7
//! pages=5 fail=3 panic=0 delay_ms=0 tag=anything
//! ```

#![allow(dead_code)]

use edgequake_pdf2img::{
    ConversionService, JobId, JobSnapshot, RasterError, Rasterizer, RenderOptions,
    ServiceConfig, Upload,
};
use image::{DynamicImage, Rgba, RgbaImage};
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
pub struct Script {
    pub pages: usize,
    pub fail: usize,
    pub panic: usize,
    pub delay_ms: u64,
    pub broken: bool,
}

impl Script {
    fn parse(document: &[u8]) -> Script {
        let text = String::from_utf8_lossy(document);
        let mut script = Script {
            pages: 1,
            ..Script::default()
        };
        for token in text.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "pages" => script.pages = value.parse().unwrap_or(1),
                "fail" => script.fail = value.parse().unwrap_or(0),
                "panic" => script.panic = value.parse().unwrap_or(0),
                "delay_ms" => script.delay_ms = value.parse().unwrap_or(0),
                "broken" => script.broken = value == "1",
                _ => {}
            }
        }
        script
    }
}

/// A rasterizer driven by the document text.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedRasterizer;

impl Rasterizer for ScriptedRasterizer {
    fn page_count(&self, document: &[u8]) -> Result<usize, RasterError> {
        let script = Script::parse(document);
        if script.broken {
            return Err(RasterError::Corrupt("xref table missing".into()));
        }
        Ok(script.pages)
    }

    fn render_page(
        &self,
        document: &[u8],
        page_index: usize,
        _options: &RenderOptions,
    ) -> Result<DynamicImage, RasterError> {
        let script = Script::parse(document);
        if script.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(script.delay_ms));
        }
        if script.panic == page_index {
            panic!("rasterizer crashed on page {page_index}");
        }
        if script.fail == page_index {
            return Err(RasterError::Page {
                page: page_index,
                detail: "unsupported shading".into(),
            });
        }
        Ok(page_image(page_index))
    }
}

/// The image [`ScriptedRasterizer`] produces for `page_index`: height grows
/// with the index so pages are distinguishable after decoding.
pub fn page_image(page_index: usize) -> DynamicImage {
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        16,
        10 + page_index as u32,
        Rgba([(page_index * 40 % 256) as u8, 80, 160, 255]),
    ))
}

/// A PDF-looking document carrying a script.
pub fn pdf(script: &str) -> Vec<u8> {
    format!("%PDF-1.7\n{script}\n%%EOF\n").into_bytes()
}

pub fn upload(bytes: Vec<u8>) -> Upload {
    Upload {
        bytes,
        content_type: Some("application/pdf".into()),
        filename: Some("test.pdf".into()),
        client_id: None,
    }
}

pub fn config(root: &std::path::Path) -> ServiceConfig {
    ServiceConfig::builder()
        .storage_root(root)
        .worker_count(2)
        .max_concurrent_jobs(2)
        .sweep_interval(Duration::from_millis(50))
        .build()
        .unwrap()
}

/// Poll until the job reaches a terminal state.
pub async fn wait_terminal(service: &ConversionService, job_id: JobId) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snap = service.status(job_id).expect("job should exist");
        if snap.state.is_terminal() {
            return snap;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} still {} after 10s",
            snap.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
