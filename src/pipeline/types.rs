//! Core types for the annual-report extraction pipeline.
//!
//! These types model the full lifecycle:
//! Document → Sections → AgentTasks → ExtractionResults → Links → Scores.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════
// Agent identity
// ═══════════════════════════════════════════

/// Identifier of a configured extraction agent ("governance", "financial", ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ═══════════════════════════════════════════
// Document & topology
// ═══════════════════════════════════════════

/// How a document's pages carry their content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Embedded text layer on every page; text can be read directly.
    TextNative,
    /// Page images only; must be rendered for a vision call.
    Scanned,
    /// Mix of text-native and scanned pages.
    Hybrid,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextNative => "text_native",
            Self::Scanned => "scanned",
            Self::Hybrid => "hybrid",
        }
    }

    /// Whether agents should receive page images rather than embedded text.
    pub fn needs_images(&self) -> bool {
        !matches!(self, Self::TextNative)
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-page classification produced by the topology classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageClassification {
    pub page_number: u32,
    pub topology: Topology,
    pub confidence: f32,
}

/// A loaded, classified document. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub path: PathBuf,
    /// Hex SHA-256 of the file bytes.
    pub content_hash: String,
    pub topology: Topology,
    pub page_count: u32,
    pub page_classifications: Vec<PageClassification>,
}

impl Document {
    /// File stem used to group cache entries on disk.
    pub fn stem(&self) -> String {
        document_stem(&self.path)
    }

    pub fn fingerprint(&self) -> &str {
        &self.content_hash
    }
}

/// Filesystem-safe stem for a document path.
pub fn document_stem(path: &Path) -> String {
    let raw = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let clean: String = raw
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if clean.is_empty() {
        "document".to_string()
    } else {
        clean
    }
}

// ═══════════════════════════════════════════
// Sections
// ═══════════════════════════════════════════

/// What kind of content a section mostly holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentHint {
    Narrative,
    Table,
    Mixed,
}

impl ContentHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Narrative => "narrative",
            Self::Table => "table",
            Self::Mixed => "mixed",
        }
    }

    /// Lenient parse of the layout engine's hint. Unknown values become `Mixed`.
    pub fn parse_lenient(s: Option<&str>) -> Self {
        match s.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("narrative") | Some("text") | Some("paragraph") => Self::Narrative,
            Some("table") | Some("tabular") => Self::Table,
            _ => Self::Mixed,
        }
    }
}

/// A detected structural unit of the document. Page numbers are 1-based, inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub heading: String,
    pub page_start: u32,
    pub page_end: u32,
    pub content_hint: ContentHint,
    pub confidence: f32,
}

impl Section {
    pub fn pages(&self) -> impl Iterator<Item = u32> {
        self.page_start..=self.page_end
    }
}

// ═══════════════════════════════════════════
// Agent tasks
// ═══════════════════════════════════════════

/// Work assigned to one agent for one document. Created by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub agent_id: AgentId,
    pub section_headings: Vec<String>,
    pub pages: BTreeSet<u32>,
    pub schema_version: String,
}

/// Which extraction pass an agent belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    /// Context-establishing agents.
    First,
    /// Agents that read Pass-1 results as context.
    Second,
}

// ═══════════════════════════════════════════
// Extraction results
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Success,
    Failed,
    /// Deliberately not run, e.g. no pages were routed to the agent.
    Skipped,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Outcome of running one agent task (or reading it back from the cache).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub agent_id: AgentId,
    pub status: ExtractionStatus,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Cited evidence pages, restricted to pages actually rendered to the agent.
    #[serde(default)]
    pub evidence_pages: BTreeSet<u32>,
    pub evidence_verified: bool,
    /// Claimed evidence pages that were never rendered to the agent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected_evidence_pages: Vec<u32>,
    #[serde(default)]
    pub pages_rendered: BTreeSet<u32>,
    #[serde(default)]
    pub verified_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_fields: Vec<String>,
    /// Seconds spent producing this result.
    pub extraction_time: f64,
    #[serde(default)]
    pub model_calls: u32,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn failed(agent_id: AgentId, pages_rendered: BTreeSet<u32>, error: String) -> Self {
        Self {
            agent_id,
            status: ExtractionStatus::Failed,
            data: serde_json::Map::new(),
            evidence_pages: BTreeSet::new(),
            evidence_verified: false,
            rejected_evidence_pages: Vec::new(),
            pages_rendered,
            verified_fields: Vec::new(),
            dropped_fields: Vec::new(),
            extraction_time: 0.0,
            model_calls: 0,
            cost: 0.0,
            error: Some(error),
        }
    }

    pub fn skipped(agent_id: AgentId, reason: String) -> Self {
        Self {
            status: ExtractionStatus::Skipped,
            ..Self::failed(agent_id, BTreeSet::new(), reason)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExtractionStatus::Success
    }

    /// Non-null value for a field, treating empty strings and lists as absent.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.data.get(name).filter(|v| is_populated(v))
    }
}

/// Whether a JSON value carries information (not null, not blank, not empty).
pub fn is_populated(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

// ═══════════════════════════════════════════
// Validation
// ═══════════════════════════════════════════

/// How closely an extracted value matched the expected one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Exact,
    /// Within ±1 unit and inside the relative band.
    Rounded,
    /// Within the configured tolerance band.
    Tolerant,
    Mismatch,
    Missing,
}

impl MatchTier {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Exact | Self::Rounded | Self::Tolerant)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub field_path: String,
    pub expected: serde_json::Value,
    pub actual: Option<serde_json::Value>,
    pub tier: MatchTier,
    /// Relative numeric deviation, when both sides are numbers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deviation: Option<f64>,
}

// ═══════════════════════════════════════════
// Pipeline result
// ═══════════════════════════════════════════

/// Document-complexity category that decides which fields are applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Simple,
    Standard,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub archetype: Archetype,
    pub applicable_fields: usize,
    pub populated_fields: usize,
    pub coverage: f64,
    pub evidence_ratio: f64,
    pub validation_pass_rate: f64,
    pub overall_score: f64,
    pub linked_fields: usize,
    pub conflicts: usize,
}

/// Timing and success flag for one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentMetric {
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationMetrics {
    pub components: BTreeMap<String, ComponentMetric>,
    pub agents_succeeded: usize,
    pub agents_failed: usize,
    pub agents_skipped: usize,
    /// Roster agents no section was routed to.
    pub agents_unrouted: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Requests that joined another caller's in-flight computation.
    pub cache_coalesced: u64,
    pub model_calls: u64,
}

impl IntegrationMetrics {
    /// Count agent outcomes by status.
    pub fn tally<'a>(&mut self, results: impl IntoIterator<Item = &'a ExtractionResult>) {
        for result in results {
            match result.status {
                ExtractionStatus::Success => self.agents_succeeded += 1,
                ExtractionStatus::Failed => self.agents_failed += 1,
                ExtractionStatus::Skipped => self.agents_skipped += 1,
            }
        }
    }

    pub fn record(&mut self, component: &str, success: bool, duration_ms: u64, detail: Option<String>) {
        self.components.insert(
            component.to_string(),
            ComponentMetric {
                success,
                duration_ms,
                detail,
            },
        );
    }
}

/// Summary of the document a pipeline run processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub path: PathBuf,
    pub content_hash: String,
    pub topology: Topology,
    pub page_count: u32,
    pub sections: Vec<Section>,
}

/// Which agents a section was routed to, and with which scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub heading: String,
    pub assigned: Vec<(AgentId, f32)>,
    pub fallback: bool,
}

/// Final artifact of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,
    pub document: DocumentSummary,
    pub routing: Vec<RoutingDecision>,
    pub pass1_result: BTreeMap<AgentId, ExtractionResult>,
    pub pass2_result: BTreeMap<AgentId, ExtractionResult>,
    pub links: crate::pipeline::linker::LinkReport,
    pub validation: Vec<ValidationOutcome>,
    pub quality_metrics: QualityMetrics,
    pub integration_metrics: IntegrationMetrics,
    /// Seconds.
    pub total_time: f64,
    pub total_cost: f64,
}

impl PipelineResult {
    /// All results across both passes.
    pub fn all_results(&self) -> impl Iterator<Item = &ExtractionResult> {
        self.pass1_result.values().chain(self.pass2_result.values())
    }

    pub fn result(&self, agent_id: &str) -> Option<&ExtractionResult> {
        let id = AgentId::new(agent_id);
        self.pass1_result.get(&id).or_else(|| self.pass2_result.get(&id))
    }

    /// Write the result as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), crate::pipeline::PipelineError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_serde_and_display() {
        let json = serde_json::to_string(&Topology::TextNative).unwrap();
        assert_eq!(json, "\"text_native\"");
        assert_eq!(Topology::Hybrid.to_string(), "hybrid");
        assert!(Topology::Scanned.needs_images());
        assert!(Topology::Hybrid.needs_images());
        assert!(!Topology::TextNative.needs_images());
    }

    #[test]
    fn content_hint_lenient_parse() {
        assert_eq!(ContentHint::parse_lenient(Some("Table")), ContentHint::Table);
        assert_eq!(ContentHint::parse_lenient(Some(" text ")), ContentHint::Narrative);
        assert_eq!(ContentHint::parse_lenient(Some("figure")), ContentHint::Mixed);
        assert_eq!(ContentHint::parse_lenient(None), ContentHint::Mixed);
    }

    #[test]
    fn document_stem_is_filesystem_safe() {
        assert_eq!(document_stem(Path::new("/tmp/BRF Solen 2023.pdf")), "BRF_Solen_2023");
        assert_eq!(document_stem(Path::new("/tmp/årsredovisning.pdf")), "årsredovisning");
        assert_eq!(document_stem(Path::new("/")), "document");
    }

    #[test]
    fn section_pages_inclusive() {
        let section = Section {
            heading: "Noter".into(),
            page_start: 4,
            page_end: 6,
            content_hint: ContentHint::Mixed,
            confidence: 0.5,
        };
        assert_eq!(section.pages().collect::<Vec<_>>(), vec![4, 5, 6]);
    }

    #[test]
    fn populated_ignores_blank_values() {
        assert!(!is_populated(&serde_json::Value::Null));
        assert!(!is_populated(&serde_json::json!("  ")));
        assert!(!is_populated(&serde_json::json!([])));
        assert!(is_populated(&serde_json::json!(0)));
        assert!(is_populated(&serde_json::json!(["a"])));
    }

    #[test]
    fn match_tier_pass_set() {
        assert!(MatchTier::Exact.is_pass());
        assert!(MatchTier::Rounded.is_pass());
        assert!(MatchTier::Tolerant.is_pass());
        assert!(!MatchTier::Mismatch.is_pass());
        assert!(!MatchTier::Missing.is_pass());
    }

    #[test]
    fn skipped_status_serializes_as_skipped() {
        let r = ExtractionResult::skipped("loans".into(), "no pages routed".into());
        assert_eq!(r.status.as_str(), "skipped");
        assert!(!r.is_success());
        assert!(r.pages_rendered.is_empty());
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "skipped");
    }

    #[test]
    fn extraction_result_serde_roundtrip_preserves_evidence_order() {
        let mut r = ExtractionResult::failed("financial".into(), [3, 1, 2].into_iter().collect(), "x".into());
        r.status = ExtractionStatus::Success;
        r.error = None;
        r.evidence_pages = [2, 1].into_iter().collect();
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"evidence_pages\":[1,2]"));
        let back: ExtractionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
