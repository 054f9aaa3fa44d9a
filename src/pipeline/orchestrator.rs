//! PipelineOrchestrator: runs one document through the whole pipeline.
//!
//! Load → Topology → Structure → Routing → Pass 1 → Pass 2 → Link →
//! Validate → Score. Agents inside a pass run concurrently on spawned tasks
//! bounded by a semaphore; Pass 2 starts only after every Pass-1 task has
//! reached a terminal state. Agent failures are recorded, never raised.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::agents::AgentRoster;
use super::cache::{content_fingerprint, CacheLookup, CacheRequest, CacheSource, CacheStats, ExtractionCache};
use super::error::{AgentError, PipelineError};
use super::executor::AgentExecutor;
use super::linker::CrossAgentLinker;
use super::render::RenderTracker;
use super::retry::RetryPolicy;
use super::router::{RoutingPlan, SectionRouter};
use super::scoring::{classify_archetype, score};
use super::structure::{normalize_sections, whole_document_section};
use super::topology::{TopologyClassifier, TopologyReport};
use super::traits::{PageRenderer, PageSampler, StructureDetector, VisionModel};
use super::types::{
    AgentId, Document, DocumentSummary, ExtractionResult, IntegrationMetrics, Pass, PipelineResult, Section,
    Topology,
};
use super::validation::Validator;
use crate::config::PipelineConfig;

/// External collaborators a pipeline is wired to.
pub struct Collaborators {
    pub sampler: Arc<dyn PageSampler>,
    pub renderer: Arc<dyn PageRenderer>,
    pub detector: Arc<dyn StructureDetector>,
    pub model: Arc<dyn VisionModel>,
}

/// Orchestrates extraction runs over a shared cache and executor.
pub struct PipelineOrchestrator {
    roster: Arc<AgentRoster>,
    sampler: Arc<dyn PageSampler>,
    detector: Arc<dyn StructureDetector>,
    executor: Arc<AgentExecutor>,
    cache: Arc<ExtractionCache>,
    router: SectionRouter,
    linker: CrossAgentLinker,
    validator: Validator,
    classifier: TopologyClassifier,
    schema_version: String,
    max_concurrent_agents: usize,
    structure_retry: RetryPolicy,
    structure_timeout: Duration,
}

impl PipelineOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        roster: Arc<AgentRoster>,
        collaborators: Collaborators,
        cache: Arc<ExtractionCache>,
    ) -> Self {
        let executor = AgentExecutor::new(
            collaborators.renderer,
            collaborators.model,
            config.max_in_flight_calls,
            config.executor_settings(),
        );
        Self {
            router: SectionRouter::new(roster.clone(), config.routing.clone()),
            linker: CrossAgentLinker::new(roster.clone(), config.tolerance),
            validator: Validator::new(config.tolerance),
            classifier: TopologyClassifier::new(config.topology_sample_pages),
            roster,
            sampler: collaborators.sampler,
            detector: collaborators.detector,
            executor: Arc::new(executor),
            cache,
            schema_version: config.schema_version.clone(),
            max_concurrent_agents: config.max_concurrent_agents.max(1),
            structure_retry: config.retry.clone(),
            structure_timeout: config.structure_timeout(),
        }
    }

    /// Live and total rendered-page counters of this pipeline's executor.
    pub fn tracker(&self) -> &RenderTracker {
        self.executor.tracker()
    }

    pub fn cache(&self) -> &Arc<ExtractionCache> {
        &self.cache
    }

    pub fn roster(&self) -> &AgentRoster {
        &self.roster
    }

    /// Run the full pipeline for one document.
    ///
    /// Returns a result even when agents fail. Only an unloadable document,
    /// a document without pages, or cancellation is an error.
    pub async fn run(
        &self,
        path: &Path,
        ground_truth: Option<&Value>,
        cancel: CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("pipeline", run_id = %run_id, document = %path.display());
        self.run_inner(run_id, path, ground_truth, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        path: &Path,
        ground_truth: Option<&Value>,
        cancel: CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        let start = Instant::now();
        let stats_before = self.cache.stats();
        let mut metrics = IntegrationMetrics::default();

        // Step 1: Load document and count pages
        let stage = Instant::now();
        let (content_hash, page_count) = match self.load(path).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Document load failed");
                return Err(e);
            }
        };
        metrics.record("document_load", true, elapsed_ms(stage), None);
        if page_count == 0 {
            return Err(PipelineError::StructureDetection {
                reason: format!("{} has no pages", path.display()),
                metrics: Box::new(metrics),
            });
        }

        // Step 2: Classify topology
        let stage = Instant::now();
        let (topology, page_classifications) = match self.classify(path, page_count).await {
            Ok(report) => {
                metrics.record("topology", true, elapsed_ms(stage), Some(report.topology.to_string()));
                (report.topology, report.pages)
            }
            Err(reason) => {
                warn!(reason = %reason, "Topology sampling failed, treating document as scanned");
                metrics.record("topology", false, elapsed_ms(stage), Some(reason));
                (Topology::Scanned, Vec::new())
            }
        };

        let document = Arc::new(Document {
            path: path.to_path_buf(),
            content_hash,
            topology,
            page_count,
            page_classifications,
        });

        // Step 3: Detect structure, falling back to the whole document
        let stage = Instant::now();
        let sections = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            sections = self.detect_sections(&document, &mut metrics) => sections,
        };
        debug!(elapsed_ms = elapsed_ms(stage), sections = sections.len(), "Structure ready");

        // Step 4: Route sections to agents
        let stage = Instant::now();
        let plan = self.router.route(&sections, &self.schema_version);
        metrics.record(
            "routing",
            true,
            elapsed_ms(stage),
            Some(format!("{} tasks", plan.tasks.len())),
        );

        // Step 5: Pass 1 (context-establishing agents)
        let stage = Instant::now();
        let pass1 = self
            .run_pass(Pass::First, &plan, &document, Arc::new(Map::new()), &cancel)
            .await?;
        metrics.record("pass1", true, elapsed_ms(stage), Some(pass_detail(&pass1)));

        // Step 6: Pass 2 reads Pass-1 data as context
        let stage = Instant::now();
        let context = Arc::new(self.pass1_context(&pass1));
        let pass2 = self
            .run_pass(Pass::Second, &plan, &document, context, &cancel)
            .await?;
        metrics.record("pass2", true, elapsed_ms(stage), Some(pass_detail(&pass2)));

        let total_cost: f64 = pass1
            .values()
            .chain(pass2.values())
            .filter(|l| l.source.is_fresh())
            .map(|l| l.result.cost)
            .sum();
        let model_calls: u64 = pass1
            .values()
            .chain(pass2.values())
            .filter(|l| l.source.is_fresh())
            .map(|l| u64::from(l.result.model_calls))
            .sum();
        let pass1_result = into_results(pass1);
        let pass2_result = into_results(pass2);

        // Step 7: Cross-agent linking
        let stage = Instant::now();
        let links = self.linker.link(&pass1_result, &pass2_result);
        metrics.record(
            "linking",
            true,
            elapsed_ms(stage),
            Some(format!("{} linked, {} conflicts", links.linked, links.conflicts)),
        );

        // Step 8: Validation against ground truth, when supplied
        let stage = Instant::now();
        let validation = match ground_truth {
            Some(truth) => {
                let outcomes = self.validator.validate(truth, &links.authoritative);
                metrics.record(
                    "validation",
                    true,
                    elapsed_ms(stage),
                    Some(format!("{} fields compared", outcomes.len())),
                );
                outcomes
            }
            None => Vec::new(),
        };

        // Step 9: Scoring
        let archetype = classify_archetype(page_count, sections.len());
        let quality_metrics = score(
            &self.roster,
            archetype,
            &pass1_result,
            &pass2_result,
            &links,
            &validation,
        );

        let all = || pass1_result.values().chain(pass2_result.values());
        metrics.tally(all());
        metrics.agents_unrouted = self.roster.agents().len().saturating_sub(plan.tasks.len());
        let stats = stats_delta(&stats_before, &self.cache.stats());
        metrics.cache_hits = stats.hits;
        metrics.cache_misses = stats.misses;
        metrics.cache_coalesced = stats.coalesced;
        metrics.model_calls = model_calls;

        let total_time = start.elapsed().as_secs_f64();
        info!(
            model = %self.executor.model_name(),
            topology = %topology,
            pages = page_count,
            sections = sections.len(),
            succeeded = metrics.agents_succeeded,
            failed = metrics.agents_failed,
            skipped = metrics.agents_skipped,
            cache_hits = metrics.cache_hits,
            model_calls,
            coverage = quality_metrics.coverage,
            overall_score = quality_metrics.overall_score,
            elapsed_ms = elapsed_ms(start),
            "Pipeline complete"
        );

        Ok(PipelineResult {
            run_id,
            document: DocumentSummary {
                path: document.path.clone(),
                content_hash: document.content_hash.clone(),
                topology,
                page_count,
                sections,
            },
            routing: plan.decisions,
            pass1_result,
            pass2_result,
            links,
            validation,
            quality_metrics,
            integration_metrics: metrics,
            total_time,
            total_cost,
        })
    }

    /// Fingerprint the file and count its pages.
    async fn load(&self, path: &Path) -> Result<(String, u32), PipelineError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::DocumentLoad(format!("{}: {e}", path.display())))?;
        let sampler = self.sampler.clone();
        let owned = path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let fingerprint = content_fingerprint(&bytes);
            let page_count = sampler
                .page_count(&owned)
                .map_err(|e| PipelineError::DocumentLoad(e.to_string()))?;
            Ok((fingerprint, page_count))
        })
        .await
        .map_err(|e| PipelineError::DocumentLoad(format!("load worker: {e}")))?
    }

    async fn classify(
        &self,
        path: &Path,
        page_count: u32,
    ) -> Result<TopologyReport, String> {
        let sampler = self.sampler.clone();
        let classifier = self.classifier;
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            classifier
                .classify(sampler.as_ref(), &owned, page_count)
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| format!("topology worker: {e}"))?
    }

    async fn detect_sections(&self, document: &Document, metrics: &mut IntegrationMetrics) -> Vec<Section> {
        let stage = Instant::now();
        let attempted = self
            .structure_retry
            .run("structure_detection", self.structure_timeout, |_| {
                self.detector.detect(document)
            })
            .await;

        match attempted.result {
            Ok(raw) => {
                let detected = raw.len();
                let sections = normalize_sections(raw, document.page_count);
                metrics.record(
                    "structure_detection",
                    true,
                    elapsed_ms(stage),
                    Some(format!(
                        "{detected} detected, {} kept after {} attempt(s)",
                        sections.len(),
                        attempted.attempts
                    )),
                );
                sections
            }
            Err(e) => {
                warn!(
                    error = %e,
                    attempts = attempted.attempts,
                    "Structure detection failed, using whole document as one section"
                );
                metrics.record("structure_detection", false, elapsed_ms(stage), Some(e.to_string()));
                vec![whole_document_section(document.page_count)]
            }
        }
    }

    /// Run every task of one pass to a terminal state.
    async fn run_pass(
        &self,
        pass: Pass,
        plan: &RoutingPlan,
        document: &Arc<Document>,
        context: Arc<Map<String, Value>>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<AgentId, CacheLookup>, PipelineError> {
        let permits = Arc::new(Semaphore::new(self.max_concurrent_agents));
        let mut handles = Vec::new();
        let mut skipped = Vec::new();

        for task in &plan.tasks {
            let Some(spec) = self.roster.get(&task.agent_id).filter(|a| a.pass == pass).cloned() else {
                continue;
            };
            if task.pages.is_empty() {
                debug!(agent_id = %task.agent_id, "No pages routed, skipping agent");
                skipped.push(ExtractionResult::skipped(task.agent_id.clone(), "no pages routed".to_string()));
                continue;
            }
            let task = task.clone();
            let executor = self.executor.clone();
            let cache = self.cache.clone();
            let document = document.clone();
            let context = context.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();

            let agent_id = task.agent_id.clone();
            let handle = tokio::spawn(async move {
                let work = async {
                    let _permit = permits.acquire().await;
                    let request = CacheRequest::for_task(&document, &task);
                    cache
                        .get_or_compute(&request, || executor.execute(&spec, &task, &document, &context))
                        .await
                };
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    lookup = work => Some(lookup),
                }
            });
            handles.push((agent_id, handle));
        }

        debug!(pass = ?pass, agents = handles.len(), "Pass started");

        let mut results: BTreeMap<AgentId, CacheLookup> = skipped
            .into_iter()
            .map(|result| {
                (
                    result.agent_id.clone(),
                    CacheLookup {
                        result,
                        source: CacheSource::Computed,
                    },
                )
            })
            .collect();
        let mut interrupted = false;
        for (agent_id, handle) in handles {
            match handle.await {
                Ok(Some(lookup)) => {
                    results.insert(agent_id, lookup);
                }
                Ok(None) => interrupted = true,
                Err(e) if e.is_cancelled() => interrupted = true,
                Err(e) => {
                    let error = AgentError::Panicked(e.to_string());
                    warn!(agent_id = %agent_id, error = %error, "Agent task aborted");
                    let result = ExtractionResult::failed(
                        agent_id.clone(),
                        Default::default(),
                        format!("[failed] {error}"),
                    );
                    results.insert(
                        agent_id,
                        CacheLookup {
                            result,
                            source: CacheSource::Computed,
                        },
                    );
                }
            }
        }

        if interrupted || cancel.is_cancelled() {
            warn!(pass = ?pass, completed = results.len(), "Pipeline cancelled");
            return Err(PipelineError::Cancelled);
        }
        Ok(results)
    }

    /// Merged Pass-1 data; earlier agents in roster order take precedence.
    fn pass1_context(&self, pass1: &BTreeMap<AgentId, CacheLookup>) -> Map<String, Value> {
        let mut ordered: Vec<&ExtractionResult> = pass1
            .values()
            .map(|l| &l.result)
            .filter(|r| r.is_success())
            .collect();
        ordered.sort_by_key(|r| self.roster.rank(&r.agent_id));

        let mut context = Map::new();
        for result in ordered {
            for (field, value) in &result.data {
                if result.field(field).is_some() && !context.contains_key(field) {
                    context.insert(field.clone(), value.clone());
                }
            }
        }
        context
    }
}

fn into_results(lookups: BTreeMap<AgentId, CacheLookup>) -> BTreeMap<AgentId, ExtractionResult> {
    lookups.into_iter().map(|(id, l)| (id, l.result)).collect()
}

fn pass_detail(lookups: &BTreeMap<AgentId, CacheLookup>) -> String {
    let succeeded = lookups.values().filter(|l| l.result.is_success()).count();
    let cached = lookups.values().filter(|l| !l.source.is_fresh()).count();
    format!("{succeeded}/{} succeeded, {cached} from cache", lookups.len())
}

fn stats_delta(before: &CacheStats, after: &CacheStats) -> CacheStats {
    CacheStats {
        hits: after.hits.saturating_sub(before.hits),
        misses: after.misses.saturating_sub(before.misses),
        coalesced: after.coalesced.saturating_sub(before.coalesced),
        corrupt: after.corrupt.saturating_sub(before.corrupt),
        writes: after.writes.saturating_sub(before.writes),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::ModelError;
    use crate::pipeline::ollama::{MockReply, MockVisionModel};
    use crate::pipeline::render::MockPageRenderer;
    use crate::pipeline::structure::{raw_section, MockStructureDetector, RawSection, WHOLE_DOCUMENT_HEADING};
    use crate::pipeline::types::{AgentTask, ExtractionStatus, MatchTier};
    use serde_json::json;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn write_pdf(dir: &TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"%PDF-1.7\n% test fixture\n%%EOF\n").unwrap();
        path
    }

    fn three_sections() -> Vec<RawSection> {
        vec![
            raw_section("Förvaltningsberättelse", 1, 3),
            raw_section("Fastighetsuppgifter", 4, 5),
            raw_section("Resultaträkning", 6, 10),
        ]
    }

    fn model() -> MockVisionModel {
        MockVisionModel::new()
            .with_data(
                "governance",
                json!({"organization_number": "769600-1234", "association_name": "BRF Solen", "chairman": "Anna Berg"}),
            )
            .with_data(
                "property",
                json!({"property_designation": "Solen 1", "municipality": "Uppsala", "organization_number": "769600-1234"}),
            )
            .with_data(
                "financial",
                json!({"revenue": "1 200 000", "net_result": -50000, "total_assets": 1000}),
            )
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            retry: RetryPolicy::none(),
            ..PipelineConfig::default()
        }
    }

    fn pipeline(
        config: &PipelineConfig,
        renderer: Arc<MockPageRenderer>,
        detector: Arc<MockStructureDetector>,
        model: Arc<MockVisionModel>,
        cache: Arc<ExtractionCache>,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            config,
            Arc::new(AgentRoster::annual_report()),
            Collaborators {
                sampler: renderer.clone(),
                renderer,
                detector,
                model,
            },
            cache,
        )
    }

    fn pages(range: std::ops::RangeInclusive<u32>) -> BTreeSet<u32> {
        range.collect()
    }

    #[tokio::test]
    async fn scanned_document_with_three_sections() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let model = Arc::new(model());
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(10)),
            Arc::new(MockStructureDetector::new(three_sections())),
            model.clone(),
            Arc::new(ExtractionCache::in_memory()),
        );

        let result = orchestrator.run(&pdf, None, CancellationToken::new()).await.unwrap();

        assert_eq!(result.document.topology, Topology::Scanned);
        assert_eq!(result.document.page_count, 10);
        assert_eq!(result.document.sections.len(), 3);

        let pass1: Vec<&str> = result.pass1_result.keys().map(AgentId::as_str).collect();
        let pass2: Vec<&str> = result.pass2_result.keys().map(AgentId::as_str).collect();
        assert_eq!(pass1, vec!["governance", "property"]);
        assert_eq!(pass2, vec!["financial"]);

        for (agent, range) in [("governance", 1..=3), ("property", 4..=5), ("financial", 6..=10)] {
            let r = result.result(agent).unwrap();
            assert_eq!(r.status, ExtractionStatus::Success, "{agent}: {:?}", r.error);
            assert!(!r.evidence_pages.is_empty());
            assert!(r.evidence_pages.is_subset(&pages(range.clone())));
            assert!(r.evidence_pages.is_subset(&r.pages_rendered));
            assert!(r.evidence_verified);
        }

        // Every reported agent belongs to the roster.
        for r in result.all_results() {
            assert!(orchestrator.roster().contains(&r.agent_id));
        }

        let q = &result.quality_metrics;
        assert!((0.0..=1.0).contains(&q.coverage));
        assert!((0.0..=1.0).contains(&q.overall_score));
        assert_eq!(q.evidence_ratio, 1.0);

        let m = &result.integration_metrics;
        assert_eq!(m.agents_succeeded, 3);
        assert_eq!(m.agents_failed, 0);
        assert_eq!(m.agents_unrouted, 3);
        assert_eq!(m.model_calls, 3);
        assert!(m.components["structure_detection"].success);
        assert!(result.total_cost > 0.0);
        assert_eq!(orchestrator.tracker().live(), 0);
        assert_eq!(orchestrator.tracker().rendered_total(), 10);
        assert!(!result.run_id.is_empty());
    }

    #[tokio::test]
    async fn pass2_receives_pass1_context() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let model = Arc::new(model());
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(10)),
            Arc::new(MockStructureDetector::new(three_sections())),
            model.clone(),
            Arc::new(ExtractionCache::in_memory()),
        );

        orchestrator.run(&pdf, None, CancellationToken::new()).await.unwrap();

        let financial = model.prompts_for("financial");
        assert_eq!(financial.len(), 1);
        assert!(financial[0].contains("BRF Solen"));
        assert!(financial[0].contains("Solen 1"));
        assert!(!model.prompts_for("governance")[0].contains("BRF Solen"));
    }

    #[tokio::test]
    async fn failing_agent_leaves_siblings_intact() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let model = Arc::new(model().with_reply(
            "financial",
            MockReply::Fail(ModelError::Api {
                status: 400,
                body: "bad request".into(),
            }),
        ));
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(10)),
            Arc::new(MockStructureDetector::new(three_sections())),
            model.clone(),
            Arc::new(ExtractionCache::in_memory()),
        );

        let result = orchestrator.run(&pdf, None, CancellationToken::new()).await.unwrap();

        let financial = result.result("financial").unwrap();
        assert_eq!(financial.status, ExtractionStatus::Failed);
        assert!(financial.error.as_deref().unwrap().starts_with("[calling_model]"));
        assert!(result.result("governance").unwrap().is_success());
        assert!(result.result("property").unwrap().is_success());
        assert_eq!(result.integration_metrics.agents_failed, 1);
        assert_eq!(result.integration_metrics.agents_succeeded, 2);
        assert_eq!(orchestrator.tracker().live(), 0);
    }

    #[tokio::test]
    async fn second_run_reads_from_persisted_cache() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let cache_dir = dir.path().join("cache");
        let model = Arc::new(model());
        let config = test_config();

        let first = pipeline(
            &config,
            Arc::new(MockPageRenderer::scanned(10)),
            Arc::new(MockStructureDetector::new(three_sections())),
            model.clone(),
            Arc::new(ExtractionCache::new(cache_dir.clone())),
        )
        .run(&pdf, None, CancellationToken::new())
        .await
        .unwrap();

        // A fresh process-level cache over the same directory.
        let second = pipeline(
            &config,
            Arc::new(MockPageRenderer::scanned(10)),
            Arc::new(MockStructureDetector::new(three_sections())),
            model.clone(),
            Arc::new(ExtractionCache::new(cache_dir)),
        )
        .run(&pdf, None, CancellationToken::new())
        .await
        .unwrap();

        for agent in ["governance", "property", "financial"] {
            assert_eq!(model.calls_for(agent), 1, "{agent}");
            let a = serde_json::to_vec(&first.result(agent).unwrap().data).unwrap();
            let b = serde_json::to_vec(&second.result(agent).unwrap().data).unwrap();
            assert_eq!(a, b);
        }
        assert_eq!(second.integration_metrics.cache_hits, 3);
        assert_eq!(second.integration_metrics.cache_misses, 0);
        assert_eq!(second.integration_metrics.model_calls, 0);
        assert_eq!(second.total_cost, 0.0);
    }

    #[tokio::test]
    async fn schema_version_change_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let cache = Arc::new(ExtractionCache::new(dir.path().join("cache")));
        let model = Arc::new(model());

        for version in ["v1", "v2"] {
            let config = PipelineConfig {
                schema_version: version.to_string(),
                ..test_config()
            };
            pipeline(
                &config,
                Arc::new(MockPageRenderer::scanned(10)),
                Arc::new(MockStructureDetector::new(three_sections())),
                model.clone(),
                cache.clone(),
            )
            .run(&pdf, None, CancellationToken::new())
            .await
            .unwrap();
        }

        assert_eq!(model.calls_for("governance"), 2);
        assert!(dir.path().join("cache/brf_solen_2023/governance__v1.json").exists());
        assert!(dir.path().join("cache/brf_solen_2023/governance__v2.json").exists());
    }

    #[tokio::test]
    async fn concurrent_runs_share_one_model_call_per_agent() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let model = Arc::new(model().with_delay(Duration::from_millis(20)));
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(10)),
            Arc::new(MockStructureDetector::new(three_sections())),
            model.clone(),
            Arc::new(ExtractionCache::in_memory()),
        );

        let (a, b) = tokio::join!(
            orchestrator.run(&pdf, None, CancellationToken::new()),
            orchestrator.run(&pdf, None, CancellationToken::new()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(model.total_calls(), 3);
        assert_eq!(a.result("financial").unwrap().data, b.result("financial").unwrap().data);
        // Each agent is paid for once, by whichever run computed it.
        let once: f64 = a.all_results().map(|r| r.cost).sum();
        assert!((a.total_cost + b.total_cost - once).abs() < 1e-9);
    }

    #[tokio::test]
    async fn model_calls_respect_in_flight_limit() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let model = Arc::new(MockVisionModel::new().with_delay(Duration::from_millis(20)));
        let config = PipelineConfig {
            max_concurrent_agents: 4,
            max_in_flight_calls: 1,
            ..test_config()
        };
        let orchestrator = pipeline(
            &config,
            Arc::new(MockPageRenderer::scanned(8)),
            Arc::new(MockStructureDetector::new(vec![
                raw_section("Resultaträkning", 1, 3),
                raw_section("Skulder till kreditinstitut", 4, 5),
                raw_section("Driftkostnader", 6, 8),
            ])),
            model.clone(),
            Arc::new(ExtractionCache::in_memory()),
        );

        let result = orchestrator.run(&pdf, None, CancellationToken::new()).await.unwrap();

        let pass2: Vec<&str> = result.pass2_result.keys().map(AgentId::as_str).collect();
        assert_eq!(pass2, vec!["financial", "loans", "operating_costs"]);
        assert!(result.pass1_result.is_empty());
        assert!(result.all_results().all(ExtractionResult::is_success));
        assert_eq!(model.total_calls(), 3);
        assert_eq!(model.peak_in_flight(), 1);
    }

    #[tokio::test]
    async fn note_sections_route_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::text_native(12)),
            Arc::new(MockStructureDetector::new(vec![
                raw_section("Resultaträkning", 1, 2),
                raw_section("Not 4 Driftkostnader", 9, 9),
                raw_section("Noter", 10, 12),
            ])),
            Arc::new(MockVisionModel::new()),
            Arc::new(ExtractionCache::in_memory()),
        );

        let result = orchestrator.run(&pdf, None, CancellationToken::new()).await.unwrap();

        assert_eq!(result.document.topology, Topology::TextNative);
        let costs = result.result("operating_costs").unwrap();
        assert_eq!(costs.pages_rendered, [9, 10, 11, 12].into_iter().collect());
        let loans = result.result("loans").unwrap();
        assert_eq!(loans.pages_rendered, pages(10..=12));
        let decision = result
            .routing
            .iter()
            .find(|d| d.heading == "Not 4 Driftkostnader")
            .unwrap();
        assert_eq!(decision.assigned[0].0.as_str(), "operating_costs");
        assert!(decision.assigned[0].1 > 0.5);
    }

    #[tokio::test]
    async fn structure_failure_falls_back_to_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(4)),
            Arc::new(MockStructureDetector::broken()),
            Arc::new(MockVisionModel::new()),
            Arc::new(ExtractionCache::in_memory()),
        );

        let result = orchestrator.run(&pdf, None, CancellationToken::new()).await.unwrap();

        assert_eq!(result.document.sections.len(), 1);
        assert_eq!(result.document.sections[0].heading, WHOLE_DOCUMENT_HEADING);
        assert!(result.routing[0].fallback);
        let general = result.result("general").unwrap();
        assert_eq!(general.pages_rendered, pages(1..=4));
        assert!(!result.integration_metrics.components["structure_detection"].success);
    }

    #[tokio::test]
    async fn transient_structure_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let detector = Arc::new(MockStructureDetector::flaky(three_sections(), 2));
        let config = PipelineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
            },
            ..PipelineConfig::default()
        };
        let orchestrator = pipeline(
            &config,
            Arc::new(MockPageRenderer::scanned(10)),
            detector.clone(),
            Arc::new(model()),
            Arc::new(ExtractionCache::in_memory()),
        );

        let result = orchestrator.run(&pdf, None, CancellationToken::new()).await.unwrap();

        assert_eq!(detector.calls(), 3);
        assert_eq!(result.document.sections.len(), 3);
        assert!(result.integration_metrics.components["structure_detection"].success);
    }

    #[tokio::test]
    async fn ground_truth_feeds_validation_pass_rate() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(10)),
            Arc::new(MockStructureDetector::new(three_sections())),
            Arc::new(model()),
            Arc::new(ExtractionCache::in_memory()),
        );
        let truth = json!({
            "association_name": "Brf Solen",
            "revenue": 1_200_400,
            "total_assets": 1000,
            "net_result": -60000,
        });

        let result = orchestrator
            .run(&pdf, Some(&truth), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.validation.len(), 4);
        let tier = |path: &str| result.validation.iter().find(|o| o.field_path == path).unwrap().tier;
        assert_eq!(tier("association_name"), MatchTier::Exact);
        assert_eq!(tier("total_assets"), MatchTier::Exact);
        assert_eq!(tier("revenue"), MatchTier::Tolerant);
        assert_eq!(tier("net_result"), MatchTier::Mismatch);
        assert_eq!(result.quality_metrics.validation_pass_rate, 0.75);
        assert!(result.integration_metrics.components.contains_key("validation"));
    }

    #[tokio::test]
    async fn cancellation_releases_rendered_pages() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "brf_solen_2023.pdf");
        let model = Arc::new(model().with_reply("governance", MockReply::Hang));
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(10)),
            Arc::new(MockStructureDetector::new(three_sections())),
            model.clone(),
            Arc::new(ExtractionCache::in_memory()),
        );

        let cancel = CancellationToken::new();
        let tracker = orchestrator.tracker().clone();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            while tracker.live() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            // Let the non-hanging sibling finish.
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = orchestrator.run(&pdf, None, cancel).await;

        assert!(matches!(outcome, Err(PipelineError::Cancelled)));
        assert_eq!(orchestrator.tracker().live(), 0);
        assert!(orchestrator.tracker().rendered_total() > 0);
        assert_eq!(model.calls_for("financial"), 0);
    }

    #[tokio::test]
    async fn document_without_pages_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = write_pdf(&dir, "empty.pdf");
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(0)),
            Arc::new(MockStructureDetector::new(three_sections())),
            Arc::new(MockVisionModel::new()),
            Arc::new(ExtractionCache::in_memory()),
        );

        let outcome = orchestrator.run(&pdf, None, CancellationToken::new()).await;
        match outcome {
            Err(PipelineError::StructureDetection { reason, metrics }) => {
                assert!(reason.contains("no pages"));
                assert!(metrics.components["document_load"].success);
                assert!(!metrics.components.contains_key("routing"));
            }
            other => panic!("expected structure detection failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_without_pages_is_skipped_not_failed() {
        let model = Arc::new(model());
        let cache = Arc::new(ExtractionCache::in_memory());
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(10)),
            Arc::new(MockStructureDetector::new(three_sections())),
            model.clone(),
            cache.clone(),
        );
        let document = Arc::new(Document {
            path: std::path::PathBuf::from("brf_solen_2023.pdf"),
            content_hash: "h1".into(),
            topology: Topology::Scanned,
            page_count: 10,
            page_classifications: Vec::new(),
        });
        let plan = RoutingPlan {
            tasks: vec![
                AgentTask {
                    agent_id: "governance".into(),
                    section_headings: vec!["Förvaltningsberättelse".into()],
                    pages: pages(1..=3),
                    schema_version: "v1".into(),
                },
                AgentTask {
                    agent_id: "property".into(),
                    section_headings: Vec::new(),
                    pages: BTreeSet::new(),
                    schema_version: "v1".into(),
                },
            ],
            decisions: Vec::new(),
        };

        let results = orchestrator
            .run_pass(Pass::First, &plan, &document, Arc::new(Map::new()), &CancellationToken::new())
            .await
            .unwrap();

        let property = &results[&AgentId::from("property")].result;
        assert_eq!(property.status, ExtractionStatus::Skipped);
        assert!(results[&AgentId::from("governance")].result.is_success());
        assert_eq!(model.calls_for("property"), 0);
        assert_eq!(cache.stats().misses, 1);

        let mut metrics = IntegrationMetrics::default();
        metrics.tally(results.values().map(|l| &l.result));
        assert_eq!(metrics.agents_succeeded, 1);
        assert_eq!(metrics.agents_skipped, 1);
        assert_eq!(metrics.agents_failed, 0);
    }

    #[tokio::test]
    async fn missing_file_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = pipeline(
            &test_config(),
            Arc::new(MockPageRenderer::scanned(3)),
            Arc::new(MockStructureDetector::new(Vec::new())),
            Arc::new(MockVisionModel::new()),
            Arc::new(ExtractionCache::in_memory()),
        );

        let outcome = orchestrator
            .run(&dir.path().join("absent.pdf"), None, CancellationToken::new())
            .await;
        assert!(matches!(outcome, Err(PipelineError::DocumentLoad(_))));
    }
}
