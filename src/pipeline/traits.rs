//! Trait definitions for the pipeline's external collaborators.
//!
//! Four traits define the boundaries the core depends on:
//! - PageSampler: page count + cheap per-page signals for topology
//! - PageRenderer: materializes pages as images or embedded text
//! - StructureDetector: the external layout engine
//! - VisionModel: the external vision-capable model call

use std::path::Path;

use async_trait::async_trait;

use super::error::ModelError;
use super::render::{PageSample, RenderError, RenderMode, RenderedPage};
use super::structure::{RawSection, StructureError};
use super::types::{AgentId, Document};

/// Reads page-level signals used to classify a document's topology.
pub trait PageSampler: Send + Sync {
    fn page_count(&self, path: &Path) -> Result<u32, RenderError>;

    /// Inspect one page (1-based).
    fn sample_page(&self, path: &Path, page_number: u32) -> Result<PageSample, RenderError>;
}

/// Materializes document pages as model-consumable input.
pub trait PageRenderer: Send + Sync {
    /// Render one page (1-based).
    fn render_page(
        &self,
        path: &Path,
        page_number: u32,
        mode: RenderMode,
        dpi: u32,
    ) -> Result<RenderedPage, RenderError>;
}

/// Boundary to the external layout/structure engine.
#[async_trait]
pub trait StructureDetector: Send + Sync {
    async fn detect(&self, document: &Document) -> Result<Vec<RawSection>, StructureError>;
}

/// One request to the vision model.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub agent_id: &'a AgentId,
    pub prompt: &'a str,
    /// JSON schema descriptor the response must conform to.
    pub schema: &'a serde_json::Value,
    pub pages: &'a [RenderedPage],
}

/// Boundary to the external vision-capable model.
#[async_trait]
pub trait VisionModel: Send + Sync {
    fn name(&self) -> &str;

    /// Returns raw text expected to parse as JSON conforming to the schema.
    async fn call(&self, request: &ModelRequest<'_>) -> Result<String, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify traits are object-safe (can be used as `dyn Trait`)
    #[test]
    fn traits_are_object_safe() {
        fn _assert_sampler(_: &dyn PageSampler) {}
        fn _assert_renderer(_: &dyn PageRenderer) {}
        fn _assert_detector(_: &dyn StructureDetector) {}
        fn _assert_model(_: &dyn VisionModel) {}
    }
}
