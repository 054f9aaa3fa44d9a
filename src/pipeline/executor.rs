//! Agent execution state machine.
//!
//! `Pending → Rendering → CallingModel → Parsing → Enforcing →
//! VerifyingEvidence → {Success, Failed}`. Every failure is folded into the
//! returned `ExtractionResult`; nothing escapes the task boundary. Rendered
//! pages live in a `RenderedPages` guard, so they are released on success,
//! failure, or when the task future is dropped by cancellation.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

use super::agents::{build_prompt, build_repair_prompt, schema_descriptor, AgentSpec};
use super::error::{AgentError, ParseError};
use super::parser::{parse_response, ParsedResponse};
use super::render::{RenderMode, RenderTracker, RenderedPage, RenderedPages};
use super::retry::RetryPolicy;
use super::schema::enforce;
use super::traits::{ModelRequest, PageRenderer, VisionModel};
use super::types::{AgentTask, Document, ExtractionResult, ExtractionStatus};

/// Stage of one agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Pending,
    Rendering,
    CallingModel,
    Parsing,
    Enforcing,
    VerifyingEvidence,
    Success,
    Failed,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Rendering => "rendering",
            Self::CallingModel => "calling_model",
            Self::Parsing => "parsing",
            Self::Enforcing => "enforcing",
            Self::VerifyingEvidence => "verifying_evidence",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call pricing used for cost accounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub per_call: f64,
    pub per_page: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            per_call: 0.002,
            per_page: 0.001,
        }
    }
}

impl CostModel {
    pub fn call_cost(&self, pages: usize) -> f64 {
        self.per_call + self.per_page * pages as f64
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub render_dpi: u32,
    pub call_timeout: Duration,
    /// Re-prompts allowed after an unparseable response.
    pub repair_retries: u32,
    pub retry: RetryPolicy,
    pub cost: CostModel,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            render_dpi: super::render::DEFAULT_RENDER_DPI,
            call_timeout: Duration::from_secs(180),
            repair_retries: 2,
            retry: RetryPolicy::default(),
            cost: CostModel::default(),
        }
    }
}

/// Evidence check outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceCheck {
    pub accepted: BTreeSet<u32>,
    pub rejected: Vec<u32>,
    pub verified: bool,
}

/// Split claimed evidence into pages that were rendered and pages that were not.
///
/// Verified only when something was claimed and every claim was rendered.
pub fn verify_evidence(claimed: &[u32], rendered: &BTreeSet<u32>) -> EvidenceCheck {
    let mut accepted = BTreeSet::new();
    let mut rejected = Vec::new();
    for page in claimed {
        if rendered.contains(page) {
            accepted.insert(*page);
        } else if !rejected.contains(page) {
            rejected.push(*page);
        }
    }
    let verified = !claimed.is_empty() && rejected.is_empty();
    EvidenceCheck {
        accepted,
        rejected,
        verified,
    }
}

/// Accounting carried through a task, whichever way it ends.
struct TaskLedger {
    stage: TaskStage,
    model_calls: u32,
    cost: f64,
    pages_rendered: BTreeSet<u32>,
}

/// Runs agent tasks against the page renderer and the vision model.
pub struct AgentExecutor {
    renderer: Arc<dyn PageRenderer>,
    model: Arc<dyn VisionModel>,
    call_permits: Arc<Semaphore>,
    tracker: RenderTracker,
    settings: ExecutorSettings,
}

impl AgentExecutor {
    /// `max_in_flight_calls` bounds concurrent model calls; excess calls queue.
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        model: Arc<dyn VisionModel>,
        max_in_flight_calls: usize,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            renderer,
            model,
            call_permits: Arc::new(Semaphore::new(max_in_flight_calls.max(1))),
            tracker: RenderTracker::new(),
            settings,
        }
    }

    pub fn tracker(&self) -> &RenderTracker {
        &self.tracker
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Run one task to a terminal state.
    pub async fn execute(
        &self,
        spec: &AgentSpec,
        task: &AgentTask,
        document: &Document,
        context: &Map<String, Value>,
    ) -> ExtractionResult {
        let span = info_span!("agent", agent_id = %task.agent_id, pages = task.pages.len());
        async move {
            if task.pages.is_empty() {
                info!("Agent skipped, no pages routed");
                return ExtractionResult::skipped(task.agent_id.clone(), "no pages routed".to_string());
            }
            let start = Instant::now();
            let mut ledger = TaskLedger {
                stage: TaskStage::Pending,
                model_calls: 0,
                cost: 0.0,
                pages_rendered: BTreeSet::new(),
            };

            let outcome = self.run_stages(spec, task, document, context, &mut ledger).await;
            let elapsed = start.elapsed();

            match outcome {
                Ok(mut result) => {
                    result.extraction_time = elapsed.as_secs_f64();
                    info!(
                        fields = result.verified_fields.len(),
                        evidence_verified = result.evidence_verified,
                        model_calls = result.model_calls,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Agent succeeded"
                    );
                    result
                }
                Err(e) => {
                    warn!(
                        stage = %ledger.stage,
                        error = %e,
                        model_calls = ledger.model_calls,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Agent failed"
                    );
                    let mut result = ExtractionResult::failed(
                        task.agent_id.clone(),
                        ledger.pages_rendered,
                        format!("[{}] {e}", ledger.stage),
                    );
                    result.extraction_time = elapsed.as_secs_f64();
                    result.model_calls = ledger.model_calls;
                    result.cost = ledger.cost;
                    result
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        spec: &AgentSpec,
        task: &AgentTask,
        document: &Document,
        context: &Map<String, Value>,
        ledger: &mut TaskLedger,
    ) -> Result<ExtractionResult, AgentError> {
        ledger.stage = TaskStage::Rendering;
        let rendered = self.render(task, document).await?;
        ledger.pages_rendered = rendered.page_numbers();
        debug!(pages = ledger.pages_rendered.len(), bytes = rendered.total_bytes(), "Rendered pages");

        let parsed = self.call_with_repair(spec, task, context, &rendered, ledger).await?;

        ledger.stage = TaskStage::Enforcing;
        let enforced = enforce(spec, parsed.data);
        if !enforced.dropped_fields.is_empty() {
            debug!(dropped = ?enforced.dropped_fields, "Fields dropped during enforcement");
        }

        ledger.stage = TaskStage::VerifyingEvidence;
        let evidence = verify_evidence(&parsed.evidence_pages, &ledger.pages_rendered);
        if !evidence.rejected.is_empty() {
            warn!(
                rejected = ?evidence.rejected,
                rendered = ?ledger.pages_rendered,
                "Claimed evidence pages were never rendered to this agent"
            );
        } else if parsed.evidence_pages.is_empty() {
            warn!("Agent cited no evidence pages");
        }

        ledger.stage = TaskStage::Success;
        drop(rendered);

        Ok(ExtractionResult {
            agent_id: task.agent_id.clone(),
            status: ExtractionStatus::Success,
            data: enforced.data,
            evidence_pages: evidence.accepted,
            evidence_verified: evidence.verified,
            rejected_evidence_pages: evidence.rejected,
            pages_rendered: std::mem::take(&mut ledger.pages_rendered),
            verified_fields: enforced.verified_fields,
            dropped_fields: enforced.dropped_fields,
            extraction_time: 0.0,
            model_calls: ledger.model_calls,
            cost: ledger.cost,
            error: None,
        })
    }

    /// Materialize the task's pages on the blocking pool.
    async fn render(&self, task: &AgentTask, document: &Document) -> Result<RenderedPages, AgentError> {
        let mode = if document.topology.needs_images() {
            RenderMode::Image
        } else {
            RenderMode::Text
        };
        let renderer = self.renderer.clone();
        let path: PathBuf = document.path.clone();
        let pages: Vec<u32> = task.pages.iter().copied().collect();
        let dpi = self.settings.render_dpi;

        let rendered: Vec<RenderedPage> = tokio::task::spawn_blocking(move || {
            pages
                .iter()
                .map(|p| renderer.render_page(&path, *p, mode, dpi))
                .collect::<Result<Vec<_>, _>>()
        })
        .await
        .map_err(|e| AgentError::Panicked(format!("render worker: {e}")))??;

        Ok(self.tracker.acquire(&task.agent_id, rendered))
    }

    /// Call the model, re-prompting on unparseable output up to `repair_retries` times.
    async fn call_with_repair(
        &self,
        spec: &AgentSpec,
        task: &AgentTask,
        context: &Map<String, Value>,
        rendered: &RenderedPages,
        ledger: &mut TaskLedger,
    ) -> Result<ParsedResponse, AgentError> {
        let base_prompt = build_prompt(spec, task, context, rendered.pages());
        let schema = schema_descriptor(spec);
        let page_count = rendered.pages().len();
        let max_rounds = self.settings.repair_retries + 1;

        let mut prompt = base_prompt.clone();
        let mut last_error = ParseError::NoJson;

        for round in 1..=max_rounds {
            ledger.stage = TaskStage::CallingModel;
            let raw = self
                .call_model(task, &prompt, &schema, rendered.pages(), page_count, ledger)
                .await?;

            ledger.stage = TaskStage::Parsing;
            match parse_response(&raw) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => {
                    warn!(round, max_rounds, error = %e, "Malformed model response");
                    prompt = build_repair_prompt(&base_prompt, &raw, &e.to_string());
                    last_error = e;
                }
            }
        }

        Err(AgentError::Malformed {
            attempts: max_rounds,
            last: last_error,
        })
    }

    async fn call_model(
        &self,
        task: &AgentTask,
        prompt: &str,
        schema: &Value,
        pages: &[RenderedPage],
        page_count: usize,
        ledger: &mut TaskLedger,
    ) -> Result<String, AgentError> {
        let _permit = self
            .call_permits
            .acquire()
            .await
            .map_err(|_| AgentError::Cancelled)?;

        let request = ModelRequest {
            agent_id: &task.agent_id,
            prompt,
            schema,
            pages,
        };
        let model = &self.model;
        let attempted = self
            .settings
            .retry
            .run("model_call", self.settings.call_timeout, |_| model.call(&request))
            .await;

        ledger.model_calls += attempted.attempts;
        ledger.cost += self.settings.cost.call_cost(page_count) * attempted.attempts as f64;

        attempted.result.map_err(|source| AgentError::Model {
            attempts: attempted.attempts,
            source,
        })
    }
}
