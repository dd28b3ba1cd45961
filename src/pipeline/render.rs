//! PDF rasterisation behind the [`Rasterizer`] seam.
//!
//! The service treats the rasterizer as an opaque function
//! `(document bytes, page index, dpi) → image`. [`PdfiumRasterizer`] is the
//! production implementation; tests plug in scripted fakes.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! Workers call the rasterizer through `tokio::task::spawn_blocking`, which
//! also turns a panic inside a rasterizer into a `JoinError` the worker can
//! report instead of dying.
//!
//! ## Panics inside pdfium-render
//!
//! With the `thread_safe` feature a bound [`Pdfium`] holds a process-wide
//! lock until it is dropped. Dropping it while a panic unwinds poisons that
//! lock and every later bind panics. [`PdfiumRasterizer`] therefore catches
//! panics inside the bound scope ([`guarded`]) and drops the binding only
//! after the unwind has stopped.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Page sizes vary wildly: an A0 poster at 300 DPI would produce a
//! 10,000 × 14,000 px image. `max_rendered_pixels` caps the longest edge
//! regardless of physical size, keeping memory per worker bounded.

use crate::error::RasterError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::debug;

/// Per-render settings taken from the service configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub dpi: u32,
    pub max_rendered_pixels: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 6000,
        }
    }
}

/// External document rasterizer.
///
/// Methods are blocking and may be slow; callers run them on the blocking
/// thread pool. Implementations may panic: the worker treats a panic as a
/// crash of that job only.
pub trait Rasterizer: Send + Sync + 'static {
    /// Number of pages in `document`.
    fn page_count(&self, document: &[u8]) -> Result<usize, RasterError>;

    /// Render page `page_index` (1-based).
    fn render_page(
        &self,
        document: &[u8],
        page_index: usize,
        options: &RenderOptions,
    ) -> Result<DynamicImage, RasterError>;
}

/// Rasterizer backed by the pdfium library.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasterizer {
    /// Directory holding the platform pdfium library; `None` searches the
    /// system library path.
    library_dir: Option<PathBuf>,
    password: Option<String>,
}

impl PdfiumRasterizer {
    pub fn new(library_dir: Option<PathBuf>, password: Option<String>) -> Self {
        Self {
            library_dir,
            password,
        }
    }

    /// Fail fast at startup if the library cannot be loaded.
    pub fn check_binding(&self) -> Result<(), RasterError> {
        self.bind().map(|_| ())
    }

    fn bind(&self) -> Result<Pdfium, RasterError> {
        let bindings = match &self.library_dir {
            Some(dir) => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(dir))
            }
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| RasterError::Binding(format!("{e:?}")))?;
        Ok(Pdfium::new(bindings))
    }

    fn open<'a>(
        &'a self,
        pdfium: &'a Pdfium,
        document: &'a [u8],
    ) -> Result<PdfDocument<'a>, RasterError> {
        pdfium
            .load_pdf_from_byte_slice(document, self.password.as_deref())
            .map_err(|e| {
                let err_str = format!("{e:?}");
                if err_str.contains("Password") || err_str.contains("password") {
                    RasterError::PasswordRequired
                } else {
                    RasterError::Corrupt(err_str)
                }
            })
    }
}

impl Rasterizer for PdfiumRasterizer {
    fn page_count(&self, document: &[u8]) -> Result<usize, RasterError> {
        guarded(self.bind()?, |pdfium| {
            let doc = self.open(pdfium, document)?;
            Ok(doc.pages().len() as usize)
        })
    }

    fn render_page(
        &self,
        document: &[u8],
        page_index: usize,
        options: &RenderOptions,
    ) -> Result<DynamicImage, RasterError> {
        guarded(self.bind()?, |pdfium| {
            let doc = self.open(pdfium, document)?;
            render_one(&doc, page_index, options)
        })
    }
}

fn render_one(
    doc: &PdfDocument<'_>,
    page_index: usize,
    options: &RenderOptions,
) -> Result<DynamicImage, RasterError> {
    let pages = doc.pages();
    let index = page_index
        .checked_sub(1)
        .and_then(|i| u16::try_from(i).ok())
        .ok_or_else(|| RasterError::Page {
            page: page_index,
            detail: "page index out of range".into(),
        })?;
    let page = pages.get(index).map_err(|e| RasterError::Page {
        page: page_index,
        detail: format!("{e:?}"),
    })?;

    let max = options.max_rendered_pixels as i32;
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(options.dpi as f32 / 72.0)
        .set_maximum_width(max)
        .set_maximum_height(max);

    let bitmap = page
        .render_with_config(&render_config)
        .map_err(|e| RasterError::Page {
            page: page_index,
            detail: format!("{e:?}"),
        })?;

    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px",
        page_index,
        image.width(),
        image.height()
    );
    Ok(image)
}

/// Run `f` against `binding`, turning a panic into [`RasterError::Panicked`].
///
/// `binding` outlives the unwind and is dropped on the normal path.
pub(crate) fn guarded<B, T>(
    binding: B,
    f: impl FnOnce(&B) -> Result<T, RasterError>,
) -> Result<T, RasterError> {
    let outcome = catch_unwind(AssertUnwindSafe(|| f(&binding)));
    drop(binding);
    outcome.unwrap_or_else(|payload| Err(RasterError::Panicked(panic_message(&*payload))))
}

/// Text of a panic payload, for `&str` and `String` payloads.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "rasterizer panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Records whether it was dropped during an unwind.
    struct Binding {
        dropped_while_panicking: Arc<AtomicBool>,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for Binding {
        fn drop(&mut self) {
            self.dropped_while_panicking
                .store(std::thread::panicking(), Ordering::SeqCst);
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn binding() -> (Binding, Arc<AtomicBool>, Arc<AtomicBool>) {
        let panicking = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));
        let b = Binding {
            dropped_while_panicking: Arc::clone(&panicking),
            dropped: Arc::clone(&dropped),
        };
        (b, panicking, dropped)
    }

    #[test]
    fn panic_inside_bound_scope_does_not_unwind_through_binding() {
        let (b, panicking, dropped) = binding();
        let result: Result<(), RasterError> = guarded(b, |_| panic!("bad xref stream"));

        assert_eq!(
            result.unwrap_err().to_string(),
            "rasterizer panicked: bad xref stream"
        );
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!panicking.load(Ordering::SeqCst));
    }

    #[test]
    fn guarded_passes_results_through() {
        let (b, _, dropped) = binding();
        assert_eq!(guarded(b, |_| Ok(7)).unwrap(), 7);
        assert!(dropped.load(Ordering::SeqCst));

        let (b, _, _) = binding();
        let err = guarded::<_, ()>(b, |_| Err(RasterError::PasswordRequired)).unwrap_err();
        assert!(matches!(err, RasterError::PasswordRequired));
    }

    #[test]
    fn formatted_panic_payloads_are_kept() {
        let payload = catch_unwind(|| panic!("page {} failed", 4)).unwrap_err();
        assert_eq!(panic_message(&*payload), "page 4 failed");
    }
}
