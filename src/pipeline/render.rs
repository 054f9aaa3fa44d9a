//! Page rendering and sampling via Google PDFium.
//!
//! Renders individual PDF pages to PNG for vision calls, or reads the
//! embedded text layer for text-native documents. Also provides the cheap
//! per-page signals (text length, image objects) used by topology
//! classification.
//!
//! `PdfiumRenderer` is stateless (`Send + Sync`). Each operation creates
//! a fresh `Pdfium` instance because the upstream type is `!Send`.
//! The OS caches `dlopen` calls, so repeat loads are near-free.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use image::ImageOutputFormat;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::traits::{PageRenderer, PageSampler};
use super::types::AgentId;

/// Maximum dimension (width or height) for rendered page images.
const MAX_DIMENSION_PX: u32 = 4096;

/// Default rendering DPI for vision calls.
pub const DEFAULT_RENDER_DPI: u32 = 150;

/// PDF points per inch (standard PDF unit).
const POINTS_PER_INCH: f32 = 72.0;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("PDF rendering failed on page {page}: {reason}")]
    PdfRendering { page: u32, reason: String },

    #[error("PDF is encrypted")]
    PdfEncrypted,

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ═══════════════════════════════════════════
// Rendered output
// ═══════════════════════════════════════════

/// How a page is handed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    Image,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageContent {
    Png(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPage {
    pub page_number: u32,
    pub content: PageContent,
}

impl RenderedPage {
    pub fn byte_len(&self) -> usize {
        match &self.content {
            PageContent::Png(bytes) => bytes.len(),
            PageContent::Text(text) => text.len(),
        }
    }
}

/// Cheap per-page signals used for topology classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSample {
    pub page_number: u32,
    /// Non-whitespace characters in the embedded text layer.
    pub text_chars: usize,
    /// Image objects placed on the page.
    pub image_count: usize,
}

// ═══════════════════════════════════════════
// Scoped page buffers
// ═══════════════════════════════════════════

/// Counts rendered page buffers that are currently alive.
///
/// Shared by every `RenderedPages` created through it; a run that has fully
/// unwound (success, failure or cancellation) leaves `live()` at zero.
#[derive(Debug, Clone, Default)]
pub struct RenderTracker {
    live: Arc<AtomicUsize>,
    rendered_total: Arc<AtomicU64>,
}

impl RenderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages currently held by live `RenderedPages` guards.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn rendered_total(&self) -> u64 {
        self.rendered_total.load(Ordering::SeqCst)
    }

    /// Take ownership of rendered pages; they are released when the guard drops.
    pub fn acquire(&self, agent_id: &AgentId, pages: Vec<RenderedPage>) -> RenderedPages {
        self.live.fetch_add(pages.len(), Ordering::SeqCst);
        self.rendered_total.fetch_add(pages.len() as u64, Ordering::SeqCst);
        RenderedPages {
            agent_id: agent_id.clone(),
            pages,
            tracker: self.clone(),
        }
    }
}

/// Rendered pages for one agent task, released on drop.
pub struct RenderedPages {
    agent_id: AgentId,
    pages: Vec<RenderedPage>,
    tracker: RenderTracker,
}

impl RenderedPages {
    pub fn pages(&self) -> &[RenderedPage] {
        &self.pages
    }

    pub fn page_numbers(&self) -> BTreeSet<u32> {
        self.pages.iter().map(|p| p.page_number).collect()
    }

    pub fn total_bytes(&self) -> usize {
        self.pages.iter().map(RenderedPage::byte_len).sum()
    }
}

impl Drop for RenderedPages {
    fn drop(&mut self) {
        self.tracker.live.fetch_sub(self.pages.len(), Ordering::SeqCst);
        debug!(
            agent_id = %self.agent_id,
            pages = self.pages.len(),
            "Released rendered pages"
        );
    }
}

// ═══════════════════════════════════════════
// PDFium renderer
// ═══════════════════════════════════════════

/// Renders and samples PDF pages using Google PDFium.
pub struct PdfiumRenderer;

impl PdfiumRenderer {
    /// Create a new renderer, verifying the PDFium library is loadable.
    ///
    /// Discovery order:
    /// 1. `PDFIUM_DYNAMIC_LIB_PATH` env var (explicit path to library file)
    /// 2. Alongside the running executable
    /// 3. System library search paths
    pub fn new() -> Result<Self, RenderError> {
        let _ = load_pdfium()?;
        Ok(Self)
    }
}

fn load_pdfium() -> Result<Pdfium, RenderError> {
    if let Ok(path) = std::env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        debug!(path = %path, "Loading PDFium from env var");
        let bindings = Pdfium::bind_to_library(&path).map_err(|e| RenderError::PdfRendering {
            page: 0,
            reason: format!("Failed to load PDFium from {path}: {e}"),
        })?;
        return Ok(Pdfium::new(bindings));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            let lib_path =
                Pdfium::pdfium_platform_library_name_at_path(exe_dir.to_string_lossy().as_ref());
            if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
                debug!(dir = %exe_dir.display(), "Loaded PDFium next to executable");
                return Ok(Pdfium::new(bindings));
            }
        }
    }

    let bindings = Pdfium::bind_to_system_library().map_err(|e| RenderError::PdfRendering {
        page: 0,
        reason: format!(
            "PDFium library not found. Set PDFIUM_DYNAMIC_LIB_PATH or install PDFium: {e}"
        ),
    })?;
    Ok(Pdfium::new(bindings))
}

/// Map PDF load errors, detecting encrypted PDFs.
fn map_load_error(e: PdfiumError) -> RenderError {
    let msg = format!("{e}");
    let lower = msg.to_lowercase();
    if lower.contains("password") || lower.contains("encrypt") {
        RenderError::PdfEncrypted
    } else {
        RenderError::PdfRendering {
            page: 0,
            reason: format!("Failed to load PDF: {e}"),
        }
    }
}

/// Compute pixel dimensions for rendering, applying the dimension guard.
///
/// Returns (width_px, height_px), both clamped to [1, MAX_DIMENSION_PX].
/// Preserves aspect ratio when capping.
fn compute_render_dimensions(width_points: f32, height_points: f32, dpi: u32) -> (u32, u32) {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let raw_w = (width_points * scale).max(1.0);
    let raw_h = (height_points * scale).max(1.0);

    let max_dim = raw_w.max(raw_h);
    if max_dim > MAX_DIMENSION_PX as f32 {
        let ratio = MAX_DIMENSION_PX as f32 / max_dim;
        let w = ((raw_w * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        let h = ((raw_h * ratio) as u32).clamp(1, MAX_DIMENSION_PX);
        (w, h)
    } else {
        (raw_w as u32, raw_h as u32)
    }
}

/// Convert a 1-based page number to PDFium's 0-based page index.
fn page_index(page_number: u32) -> Result<u16, RenderError> {
    page_number
        .checked_sub(1)
        .and_then(|i| u16::try_from(i).ok())
        .ok_or_else(|| RenderError::PdfRendering {
            page: page_number,
            reason: format!("Page number {page_number} is not addressable"),
        })
}

fn non_whitespace_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

impl PageSampler for PdfiumRenderer {
    fn page_count(&self, path: &Path) -> Result<u32, RenderError> {
        let pdfium = load_pdfium()?;
        let document = pdfium.load_pdf_from_file(path, None).map_err(map_load_error)?;
        Ok(document.pages().len() as u32)
    }

    fn sample_page(&self, path: &Path, page_number: u32) -> Result<PageSample, RenderError> {
        let pdfium = load_pdfium()?;
        let document = pdfium.load_pdf_from_file(path, None).map_err(map_load_error)?;
        let page = document
            .pages()
            .get(page_index(page_number)?)
            .map_err(|e| RenderError::PdfRendering {
                page: page_number,
                reason: format!("Page lookup failed: {e}"),
            })?;

        let text_chars = page
            .text()
            .map(|t| non_whitespace_chars(&t.all()))
            .unwrap_or(0);
        let image_count = page
            .objects()
            .iter()
            .filter(|o| o.object_type() == PdfPageObjectType::Image)
            .count();

        Ok(PageSample {
            page_number,
            text_chars,
            image_count,
        })
    }
}

impl PageRenderer for PdfiumRenderer {
    fn render_page(
        &self,
        path: &Path,
        page_number: u32,
        mode: RenderMode,
        dpi: u32,
    ) -> Result<RenderedPage, RenderError> {
        let pdfium = load_pdfium()?;
        let document = pdfium.load_pdf_from_file(path, None).map_err(map_load_error)?;
        let pages = document.pages();
        let page = pages
            .get(page_index(page_number)?)
            .map_err(|_| RenderError::PdfRendering {
                page: page_number,
                reason: format!(
                    "Page {page_number} out of range (document has {} pages)",
                    pages.len()
                ),
            })?;

        if mode == RenderMode::Text {
            let text = page
                .text()
                .map_err(|e| RenderError::PdfRendering {
                    page: page_number,
                    reason: format!("Text layer unreadable: {e}"),
                })?
                .all();
            return Ok(RenderedPage {
                page_number,
                content: PageContent::Text(text),
            });
        }

        let width_points = page.width().value;
        let height_points = page.height().value;
        let (target_w, target_h) = compute_render_dimensions(width_points, height_points, dpi);

        let uncapped_w = (width_points * dpi as f32 / POINTS_PER_INCH) as u32;
        if target_w < uncapped_w {
            warn!(
                page = page_number,
                raw_width = uncapped_w,
                capped_width = target_w,
                "Page dimensions capped to {MAX_DIMENSION_PX}px",
            );
        }

        let config = PdfRenderConfig::new()
            .set_target_width(target_w as i32)
            .set_maximum_height(target_h as i32);

        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| RenderError::PdfRendering {
                page: page_number,
                reason: format!("Rendering failed: {e}"),
            })?;

        let mut cursor = Cursor::new(Vec::new());
        bitmap
            .as_image()
            .write_to(&mut cursor, ImageOutputFormat::Png)
            .map_err(|e| RenderError::ImageProcessing(format!("PNG encoding failed: {e}")))?;
        let png_bytes = cursor.into_inner();

        debug!(
            page = page_number,
            width = target_w,
            height = target_h,
            png_size = png_bytes.len(),
            "Rendered PDF page to PNG"
        );

        Ok(RenderedPage {
            page_number,
            content: PageContent::Png(png_bytes),
        })
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Mock renderer/sampler over a synthetic document.
///
/// Pages render to a minimal PNG (image mode) or `"Sida N"` text unless
/// custom text is registered. Pages listed in `failing_pages` fail to render.
pub struct MockPageRenderer {
    page_count: u32,
    samples: BTreeMap<u32, PageSample>,
    texts: BTreeMap<u32, String>,
    failing_pages: BTreeSet<u32>,
}

impl MockPageRenderer {
    /// A scanned document: no text layer, one image per page.
    pub fn scanned(page_count: u32) -> Self {
        let samples = (1..=page_count)
            .map(|n| {
                (
                    n,
                    PageSample {
                        page_number: n,
                        text_chars: 0,
                        image_count: 1,
                    },
                )
            })
            .collect();
        Self {
            page_count,
            samples,
            texts: BTreeMap::new(),
            failing_pages: BTreeSet::new(),
        }
    }

    /// A text-native document: a rich text layer, no images.
    pub fn text_native(page_count: u32) -> Self {
        let mut mock = Self::scanned(page_count);
        for sample in mock.samples.values_mut() {
            sample.text_chars = 1500;
            sample.image_count = 0;
        }
        mock
    }

    pub fn with_sample(mut self, sample: PageSample) -> Self {
        self.samples.insert(sample.page_number, sample);
        self
    }

    pub fn with_text(mut self, page_number: u32, text: &str) -> Self {
        self.texts.insert(page_number, text.to_string());
        self
    }

    pub fn failing_on(mut self, page_number: u32) -> Self {
        self.failing_pages.insert(page_number);
        self
    }

    fn check_range(&self, page_number: u32) -> Result<(), RenderError> {
        if page_number == 0 || page_number > self.page_count {
            return Err(RenderError::PdfRendering {
                page: page_number,
                reason: format!(
                    "Page {page_number} out of range (mock has {} pages)",
                    self.page_count
                ),
            });
        }
        Ok(())
    }
}

impl PageSampler for MockPageRenderer {
    fn page_count(&self, _path: &Path) -> Result<u32, RenderError> {
        Ok(self.page_count)
    }

    fn sample_page(&self, _path: &Path, page_number: u32) -> Result<PageSample, RenderError> {
        self.check_range(page_number)?;
        Ok(self.samples.get(&page_number).copied().unwrap_or(PageSample {
            page_number,
            text_chars: 0,
            image_count: 0,
        }))
    }
}

impl PageRenderer for MockPageRenderer {
    fn render_page(
        &self,
        _path: &Path,
        page_number: u32,
        mode: RenderMode,
        _dpi: u32,
    ) -> Result<RenderedPage, RenderError> {
        self.check_range(page_number)?;
        if self.failing_pages.contains(&page_number) {
            return Err(RenderError::PdfRendering {
                page: page_number,
                reason: "mock render failure".to_string(),
            });
        }
        let content = match mode {
            RenderMode::Image => PageContent::Png(minimal_png()),
            RenderMode::Text => PageContent::Text(
                self.texts
                    .get(&page_number)
                    .cloned()
                    .unwrap_or_else(|| format!("Sida {page_number}")),
            ),
        };
        Ok(RenderedPage {
            page_number,
            content,
        })
    }
}

/// Minimal valid 1x1 PNG for mock rendering.
fn minimal_png() -> Vec<u8> {
    vec![
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, // PNG signature
        0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52, // IHDR chunk
        0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, // 1x1
        0x08, 0x02, 0x00, 0x00, 0x00, 0x90, 0x77, 0x53, // 8-bit RGB
        0xDE, // IHDR CRC
        0x00, 0x00, 0x00, 0x0C, 0x49, 0x44, 0x41, 0x54, // IDAT chunk
        0x08, 0xD7, 0x63, 0xF8, 0xCF, 0xC0, 0x00, 0x00, // compressed
        0x00, 0x02, 0x00, 0x01, 0xE2, 0x21, 0xBC, 0x33, // IDAT CRC
        0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, // IEND chunk
        0xAE, 0x42, 0x60, 0x82, // IEND CRC
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a4_at_150dpi() {
        let (w, h) = compute_render_dimensions(595.0, 842.0, 150);
        // 595 * 150/72 ~ 1240, 842 * 150/72 ~ 1754
        assert!(w > 1200 && w < 1280, "A4 width at 150dpi: got {w}");
        assert!(h > 1700 && h < 1800, "A4 height at 150dpi: got {h}");
    }

    #[test]
    fn dimension_guard_caps_oversized() {
        let (w, h) = compute_render_dimensions(5000.0, 7000.0, 200);
        assert!(w <= MAX_DIMENSION_PX, "Width {w} exceeds {MAX_DIMENSION_PX}");
        assert!(h <= MAX_DIMENSION_PX, "Height {h} exceeds {MAX_DIMENSION_PX}");
        assert!(w >= 1 && h >= 1);
    }

    #[test]
    fn dimension_guard_preserves_aspect_ratio() {
        let (w, h) = compute_render_dimensions(5000.0, 10000.0, 200);
        let ratio = h as f32 / w as f32;
        assert!((ratio - 2.0).abs() < 0.15, "Aspect ratio should be ~2:1, got {ratio}");
    }

    #[test]
    fn zero_points_clamped_to_1() {
        let (w, h) = compute_render_dimensions(0.0, 0.0, 200);
        assert!(w >= 1 && h >= 1);
    }

    #[test]
    fn page_index_is_zero_based() {
        assert_eq!(page_index(1).unwrap(), 0);
        assert_eq!(page_index(10).unwrap(), 9);
        assert!(page_index(0).is_err());
        assert!(page_index(70_000).is_err());
    }

    #[test]
    fn tracker_counts_live_pages_until_drop() {
        let tracker = RenderTracker::new();
        let agent: AgentId = "financial".into();
        let pages = vec![
            RenderedPage { page_number: 1, content: PageContent::Text("a".into()) },
            RenderedPage { page_number: 2, content: PageContent::Text("bc".into()) },
        ];
        let guard = tracker.acquire(&agent, pages);
        assert_eq!(tracker.live(), 2);
        assert_eq!(guard.total_bytes(), 3);
        assert_eq!(guard.page_numbers().into_iter().collect::<Vec<_>>(), vec![1, 2]);
        drop(guard);
        assert_eq!(tracker.live(), 0);
        assert_eq!(tracker.rendered_total(), 2);
    }

    #[test]
    fn mock_renders_png_and_text() {
        let mock = MockPageRenderer::scanned(3).with_text(2, "Resultaträkning");
        let png = mock.render_page(Path::new("x.pdf"), 1, RenderMode::Image, 150).unwrap();
        match png.content {
            PageContent::Png(bytes) => assert_eq!(&bytes[..4], &[0x89, 0x50, 0x4E, 0x47]),
            other => panic!("expected PNG, got {other:?}"),
        }
        let text = mock.render_page(Path::new("x.pdf"), 2, RenderMode::Text, 150).unwrap();
        assert_eq!(text.content, PageContent::Text("Resultaträkning".into()));
    }

    #[test]
    fn mock_errors_for_out_of_range_and_failing_pages() {
        let mock = MockPageRenderer::scanned(2).failing_on(1);
        assert!(mock.render_page(Path::new("x.pdf"), 3, RenderMode::Image, 150).is_err());
        assert!(mock.render_page(Path::new("x.pdf"), 0, RenderMode::Image, 150).is_err());
        let err = mock.render_page(Path::new("x.pdf"), 1, RenderMode::Image, 150).unwrap_err();
        assert!(matches!(err, RenderError::PdfRendering { page: 1, .. }));
    }

    #[test]
    fn mock_samples_reflect_document_kind() {
        let scanned = MockPageRenderer::scanned(2);
        let s = scanned.sample_page(Path::new("x.pdf"), 1).unwrap();
        assert_eq!((s.text_chars, s.image_count), (0, 1));

        let native = MockPageRenderer::text_native(2);
        let s = native.sample_page(Path::new("x.pdf"), 2).unwrap();
        assert!(s.text_chars > 1000);
        assert_eq!(native.page_count(Path::new("x.pdf")).unwrap(), 2);
    }
}
