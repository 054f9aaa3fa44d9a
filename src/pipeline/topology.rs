//! Document topology classification.
//!
//! Decides per sampled page whether it carries a usable text layer, then
//! folds the pages into a document-level verdict. When nothing is confident
//! the document is treated as scanned, which forces image rendering.

use std::path::Path;

use tracing::debug;

use super::render::{PageSample, RenderError};
use super::traits::PageSampler;
use super::types::{PageClassification, Topology};

/// Non-whitespace characters that make a page text-native.
const TEXT_NATIVE_MIN_CHARS: usize = 200;

/// Below this a page with images is considered scanned.
const SCANNED_MAX_CHARS: usize = 20;

/// Per-page confidence required to count toward the document verdict.
pub const CONFIDENT_THRESHOLD: f32 = 0.6;

/// Outcome of classifying a whole document.
#[derive(Debug, Clone)]
pub struct TopologyReport {
    pub topology: Topology,
    pub pages: Vec<PageClassification>,
}

/// Classifies documents from a bounded sample of their pages.
#[derive(Debug, Clone, Copy)]
pub struct TopologyClassifier {
    sample_pages: u32,
}

impl TopologyClassifier {
    pub fn new(sample_pages: u32) -> Self {
        Self {
            sample_pages: sample_pages.max(1),
        }
    }

    /// Sample pages through `sampler` and classify the document.
    pub fn classify(
        &self,
        sampler: &dyn PageSampler,
        path: &Path,
        page_count: u32,
    ) -> Result<TopologyReport, RenderError> {
        let mut samples = Vec::new();
        for page in sample_page_numbers(page_count, self.sample_pages) {
            samples.push(sampler.sample_page(path, page)?);
        }
        let pages: Vec<PageClassification> = samples.iter().map(classify_page).collect();
        let topology = classify_document(&pages);
        debug!(
            path = %path.display(),
            sampled = pages.len(),
            topology = %topology,
            "Classified document topology"
        );
        Ok(TopologyReport { topology, pages })
    }
}

/// At most `max_samples` page numbers spread evenly over `1..=page_count`,
/// always including the first and last page.
pub fn sample_page_numbers(page_count: u32, max_samples: u32) -> Vec<u32> {
    if page_count == 0 || max_samples == 0 {
        return Vec::new();
    }
    if page_count <= max_samples {
        return (1..=page_count).collect();
    }
    if max_samples == 1 {
        return vec![1];
    }
    let span = (page_count - 1) as f64;
    let steps = (max_samples - 1) as f64;
    let mut pages: Vec<u32> = (0..max_samples)
        .map(|i| 1 + (span * i as f64 / steps).round() as u32)
        .collect();
    pages.dedup();
    pages
}

/// Classify a single page from its text and image signals.
pub fn classify_page(sample: &PageSample) -> PageClassification {
    let (topology, confidence) = match (sample.text_chars, sample.image_count) {
        (chars, 0) if chars >= TEXT_NATIVE_MIN_CHARS => (Topology::TextNative, 0.95),
        (chars, _) if chars >= TEXT_NATIVE_MIN_CHARS => (Topology::TextNative, 0.75),
        (chars, images) if chars < SCANNED_MAX_CHARS && images > 0 => (Topology::Scanned, 0.9),
        (0, 0) => (Topology::Scanned, 0.3),
        (_, images) if images > 0 => (Topology::Scanned, 0.6),
        _ => (Topology::TextNative, 0.4),
    };
    PageClassification {
        page_number: sample.page_number,
        topology,
        confidence,
    }
}

/// Fold confident page verdicts into a document topology.
pub fn classify_document(pages: &[PageClassification]) -> Topology {
    let mut text_native = false;
    let mut scanned = false;
    for page in pages.iter().filter(|p| p.confidence >= CONFIDENT_THRESHOLD) {
        match page.topology {
            Topology::TextNative => text_native = true,
            Topology::Scanned => scanned = true,
            Topology::Hybrid => {
                text_native = true;
                scanned = true;
            }
        }
    }
    match (text_native, scanned) {
        (true, true) => Topology::Hybrid,
        (true, false) => Topology::TextNative,
        _ => Topology::Scanned,
    }
}
