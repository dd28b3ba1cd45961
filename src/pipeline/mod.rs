//! Pipeline stages for PDF-to-PNG conversion.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ storage
//! (upload/URL) (pdfium)   (PNG)     (content-addressed)
//! ```
//!
//! 1. [`input`]  — validate an upload (type, magic bytes) or download a URL
//! 2. [`render`] — rasterise one page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`encode`] — PNG-encode the `DynamicImage`

pub mod encode;
pub mod input;
pub mod render;
