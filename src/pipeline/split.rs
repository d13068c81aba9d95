//! Page splitting: turn one uploaded document into an ordered sequence of
//! page images.
//!
//! Splitting is synchronous with respect to job creation — the page count is
//! required before a job row can exist — and happens exactly once per job.
//!
//! ## Why a trait?
//!
//! The rasterisation backend is the one stage that needs a native library
//! (pdfium). Putting it behind [`DocumentSplitter`] lets the orchestrator be
//! exercised end-to-end with synthetic pages in tests, and would let a host
//! swap in a different renderer without touching the pipeline.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which uses thread-local
//! state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work onto the blocking thread
//! pool so Tokio worker threads never stall during CPU-heavy rendering.

use crate::error::DocFieldsError;
use crate::model::PageImage;
use crate::pipeline::encode;
use async_trait::async_trait;
use pdfium_render::prelude::*;
use tracing::{debug, info};

/// Splits raw document bytes into ordered, 1-based page images.
#[async_trait]
pub trait DocumentSplitter: Send + Sync {
    /// Rasterise every page, failing with `UnsupportedFormat`,
    /// `PageLimitExceeded`, or `CorruptInput`.
    async fn split(&self, bytes: Vec<u8>, max_pages: u32)
        -> Result<Vec<PageImage>, DocFieldsError>;

    /// Page count without rasterising (used for inspection).
    async fn page_count(&self, bytes: Vec<u8>) -> Result<u32, DocFieldsError>;
}

/// pdfium-backed splitter for PDF documents.
pub struct PdfiumSplitter {
    dpi: u32,
    max_rendered_pixels: u32,
}

impl PdfiumSplitter {
    pub fn new(dpi: u32, max_rendered_pixels: u32) -> Self {
        Self {
            dpi,
            max_rendered_pixels,
        }
    }
}

/// Reject anything without the PDF magic header before handing bytes to
/// pdfium, so callers get a typed error rather than a renderer crash.
fn check_magic(bytes: &[u8]) -> Result<(), DocFieldsError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let magic: Vec<u8> = bytes.iter().take(4).copied().collect();
        return Err(DocFieldsError::UnsupportedFormat {
            detail: format!("expected a PDF, first bytes: {magic:02X?}"),
        });
    }
    Ok(())
}

#[async_trait]
impl DocumentSplitter for PdfiumSplitter {
    async fn split(
        &self,
        bytes: Vec<u8>,
        max_pages: u32,
    ) -> Result<Vec<PageImage>, DocFieldsError> {
        check_magic(&bytes)?;
        let max_pixels = self.max_rendered_pixels;
        let dpi = self.dpi;

        tokio::task::spawn_blocking(move || split_blocking(&bytes, max_pages, dpi, max_pixels))
            .await
            .map_err(|e| DocFieldsError::Internal(format!("split task panicked: {e}")))?
    }

    async fn page_count(&self, bytes: Vec<u8>) -> Result<u32, DocFieldsError> {
        check_magic(&bytes)?;
        tokio::task::spawn_blocking(move || {
            let pdfium = Pdfium::default();
            let document = pdfium
                .load_pdf_from_byte_slice(&bytes, None)
                .map_err(|e| DocFieldsError::CorruptInput {
                    detail: format!("{e:?}"),
                })?;
            Ok(document.pages().len() as u32)
        })
        .await
        .map_err(|e| DocFieldsError::Internal(format!("page count task panicked: {e}")))?
    }
}

/// Blocking implementation of page rasterisation.
///
/// The pixel cap, not the DPI, bounds memory: page sizes vary wildly and an
/// oversized page at high DPI could otherwise allocate gigabytes of pixels.
fn split_blocking(
    bytes: &[u8],
    max_pages: u32,
    _dpi: u32,
    max_pixels: u32,
) -> Result<Vec<PageImage>, DocFieldsError> {
    let pdfium = Pdfium::default();

    let document =
        pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| DocFieldsError::CorruptInput {
                detail: format!("{e:?}"),
            })?;

    let pages = document.pages();
    let total = pages.len() as u32;
    info!("Document loaded: {} pages", total);

    if total > max_pages {
        return Err(DocFieldsError::PageLimitExceeded {
            pages: total,
            limit: max_pages,
        });
    }

    let render_config = PdfRenderConfig::new()
        .set_target_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(total as usize);
    for idx in 0..total {
        let page_number = idx + 1;
        let page = pages
            .get(idx as u16)
            .map_err(|e| DocFieldsError::CorruptInput {
                detail: format!("page {page_number}: {e:?}"),
            })?;

        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| DocFieldsError::CorruptInput {
                    detail: format!("page {page_number} rasterisation failed: {e:?}"),
                })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            page_number,
            image.width(),
            image.height()
        );

        let png = encode::encode_png(&image).map_err(|e| DocFieldsError::CorruptInput {
            detail: format!("page {page_number} PNG encoding failed: {e}"),
        })?;

        results.push(PageImage { page_number, png });
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_check_rejects_non_pdf() {
        let err = check_magic(b"PK\x03\x04zipfile").unwrap_err();
        assert!(matches!(err, DocFieldsError::UnsupportedFormat { .. }));
    }

    #[test]
    fn magic_check_rejects_short_input() {
        assert!(check_magic(b"%P").is_err());
    }

    #[test]
    fn magic_check_accepts_pdf_header() {
        assert!(check_magic(b"%PDF-1.7\n...").is_ok());
    }

    #[tokio::test]
    async fn split_surfaces_unsupported_format() {
        let splitter = PdfiumSplitter::new(150, 2000);
        let err = splitter.split(b"not a pdf".to_vec(), 10).await.unwrap_err();
        assert!(matches!(err, DocFieldsError::UnsupportedFormat { .. }));
    }
}
