//! Boundary to the external layout engine.
//!
//! The engine's raw section list is treated as untrusted: page ranges are
//! clamped to the document, inverted ranges swapped, hints parsed leniently
//! and missing confidence defaulted. An empty list normalizes to a single
//! whole-document section so downstream routing always has something to do.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::traits::StructureDetector;
use super::types::{ContentHint, Document, Section};

/// Confidence assumed when the layout engine omits one.
pub const DEFAULT_SECTION_CONFIDENCE: f32 = 0.5;

/// Heading given to the fallback section spanning the whole document.
pub const WHOLE_DOCUMENT_HEADING: &str = "Hela dokumentet";

#[derive(Error, Debug)]
pub enum StructureError {
    #[error("Layout engine unavailable: {0}")]
    Unavailable(String),

    #[error("No layout output at {0}")]
    MissingOutput(PathBuf),

    #[error("Layout engine timed out after {0}s")]
    Timeout(u64),

    #[error("Layout engine returned invalid output: {0}")]
    InvalidOutput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StructureError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Section exactly as the layout engine reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSection {
    #[serde(alias = "title")]
    pub heading: String,
    pub page_start: u32,
    pub page_end: u32,
    #[serde(default, alias = "content_type", alias = "hint")]
    pub content_type_hint: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LayoutOutput {
    Wrapped { sections: Vec<RawSection> },
    Bare(Vec<RawSection>),
}

// ═══════════════════════════════════════════
// Normalization
// ═══════════════════════════════════════════

/// One section covering every page of the document.
pub fn whole_document_section(page_count: u32) -> Section {
    Section {
        heading: WHOLE_DOCUMENT_HEADING.to_string(),
        page_start: 1,
        page_end: page_count.max(1),
        content_hint: ContentHint::Mixed,
        confidence: DEFAULT_SECTION_CONFIDENCE,
    }
}

/// Turn the engine's raw output into ordered, in-range sections.
///
/// Overlapping ranges are kept as-is. Returns the whole-document fallback
/// when nothing usable remains.
pub fn normalize_sections(raw: Vec<RawSection>, page_count: u32) -> Vec<Section> {
    let mut sections: Vec<Section> = raw
        .into_iter()
        .filter_map(|r| normalize_one(r, page_count))
        .collect();

    sections.sort_by(|a, b| {
        a.page_start
            .cmp(&b.page_start)
            .then(a.page_end.cmp(&b.page_end))
    });

    if sections.is_empty() {
        debug!(page_count, "No usable sections, using whole document");
        return vec![whole_document_section(page_count)];
    }
    sections
}

fn normalize_one(raw: RawSection, page_count: u32) -> Option<Section> {
    let (mut start, mut end) = (raw.page_start, raw.page_end);
    if start > end {
        std::mem::swap(&mut start, &mut end);
    }
    let start = start.max(1);
    if page_count == 0 || start > page_count {
        warn!(
            heading = %raw.heading,
            page_start = raw.page_start,
            page_end = raw.page_end,
            page_count,
            "Dropping section outside document"
        );
        return None;
    }
    let end = end.clamp(start, page_count);

    let heading = raw.heading.trim();
    let heading = if heading.is_empty() { "(untitled)" } else { heading };

    let confidence = raw
        .confidence
        .filter(|c| c.is_finite())
        .unwrap_or(DEFAULT_SECTION_CONFIDENCE)
        .clamp(0.0, 1.0);

    Some(Section {
        heading: heading.to_string(),
        page_start: start,
        page_end: end,
        content_hint: ContentHint::parse_lenient(raw.content_type_hint.as_deref()),
        confidence,
    })
}

// ═══════════════════════════════════════════
// Layout-file detector
// ═══════════════════════════════════════════

/// Reads sections the external layout engine wrote to disk.
///
/// Accepts either `{"sections": [...]}` or a bare array. Without an explicit
/// path, looks for `<document>.layout.json` next to the document.
pub struct LayoutFileDetector {
    path: Option<PathBuf>,
}

impl LayoutFileDetector {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Layout file path used for a given document.
    pub fn layout_path_for(&self, document_path: &Path) -> PathBuf {
        match &self.path {
            Some(p) => p.clone(),
            None => document_path.with_extension("layout.json"),
        }
    }
}

#[async_trait]
impl StructureDetector for LayoutFileDetector {
    async fn detect(&self, document: &Document) -> Result<Vec<RawSection>, StructureError> {
        let path = self.layout_path_for(&document.path);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StructureError::MissingOutput(path));
            }
            Err(e) => return Err(StructureError::Io(e)),
        };

        let parsed: LayoutOutput = serde_json::from_slice(&bytes)
            .map_err(|e| StructureError::InvalidOutput(format!("{}: {e}", path.display())))?;
        let sections = match parsed {
            LayoutOutput::Wrapped { sections } => sections,
            LayoutOutput::Bare(sections) => sections,
        };

        debug!(path = %path.display(), sections = sections.len(), "Read layout output");
        Ok(sections)
    }
}

// ── Mock for testing ──────────────────────────────────────

/// Mock layout engine returning fixed sections, optionally failing first.
pub struct MockStructureDetector {
    sections: Vec<RawSection>,
    failures_remaining: AtomicU32,
    permanent_failure: bool,
    calls: AtomicU32,
}

impl MockStructureDetector {
    pub fn new(sections: Vec<RawSection>) -> Self {
        Self {
            sections,
            failures_remaining: AtomicU32::new(0),
            permanent_failure: false,
            calls: AtomicU32::new(0),
        }
    }

    /// Fail with a transient error `n` times before succeeding.
    pub fn flaky(sections: Vec<RawSection>, n: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(n),
            ..Self::new(sections)
        }
    }

    /// Always fail with invalid output.
    pub fn broken() -> Self {
        Self {
            permanent_failure: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StructureDetector for MockStructureDetector {
    async fn detect(&self, _document: &Document) -> Result<Vec<RawSection>, StructureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent_failure {
            return Err(StructureError::InvalidOutput("mock layout failure".into()));
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StructureError::Unavailable("mock layout engine busy".into()));
        }
        Ok(self.sections.clone())
    }
}

/// Shorthand for building raw sections in tests and fixtures.
pub fn raw_section(heading: &str, page_start: u32, page_end: u32) -> RawSection {
    RawSection {
        heading: heading.to_string(),
        page_start,
        page_end,
        content_type_hint: None,
        confidence: None,
    }
}
