//! report-extract: extract structured records from one annual report PDF.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use report_extract::config::{PipelineConfig, APP_VERSION};
use report_extract::pipeline::agents::AgentRoster;
use report_extract::pipeline::cache::ExtractionCache;
use report_extract::pipeline::ollama::OllamaVisionModel;
use report_extract::pipeline::render::PdfiumRenderer;
use report_extract::pipeline::structure::LayoutFileDetector;
use report_extract::pipeline::{Collaborators, PipelineError, PipelineOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "report-extract")]
#[command(version = APP_VERSION)]
#[command(about = "Extract evidence-traced structured records from annual reports", long_about = None)]
struct Args {
    /// Annual report PDF
    pdf: PathBuf,

    /// Layout engine output (defaults to <pdf>.layout.json)
    #[arg(long)]
    layout: Option<PathBuf>,

    /// Configuration file path (overrides defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Expected values to validate against
    #[arg(long)]
    ground_truth: Option<PathBuf>,

    /// Where to write the result JSON (stdout when omitted)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Schema/prompt version used in cache keys
    #[arg(long)]
    schema_version: Option<String>,

    /// Ignore persisted cache entries for this run
    #[arg(long)]
    cache_bust: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    report_extract::init_tracing();

    let mut config = match PipelineConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::from(2);
        }
    };
    if let Some(version) = args.schema_version {
        config.schema_version = version;
    }
    config.cache_bust |= args.cache_bust;

    let ground_truth = match args.ground_truth.as_deref().map(read_json).transpose() {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "Failed to read ground truth");
            return ExitCode::from(2);
        }
    };

    let renderer = match PdfiumRenderer::new() {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!(error = %e, "PDFium is not available");
            return ExitCode::from(2);
        }
    };
    let model = match OllamaVisionModel::new(&config.ollama_url, &config.model_name, config.call_timeout_secs) {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "Failed to create model client");
            return ExitCode::from(2);
        }
    };
    match model.is_model_available().await {
        Ok(true) => {}
        Ok(false) => warn!(model = %config.model_name, "Model is not pulled on the Ollama instance"),
        Err(e) => warn!(error = %e, "Could not reach Ollama, agent calls will fail"),
    }

    let cache_dir = config.cache_dir();
    let cache = Arc::new(ExtractionCache::new(cache_dir.clone()).with_bust(config.cache_bust));
    let orchestrator = PipelineOrchestrator::new(
        &config,
        Arc::new(AgentRoster::annual_report()),
        Collaborators {
            sampler: renderer.clone(),
            renderer,
            detector: Arc::new(LayoutFileDetector::new(args.layout)),
            model: Arc::new(model),
        },
        cache,
    );

    info!(
        version = APP_VERSION,
        document = %args.pdf.display(),
        schema_version = %config.schema_version,
        cache_dir = %cache_dir.display(),
        "Starting extraction"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pipeline");
            on_signal.cancel();
        }
    });

    let result = match orchestrator.run(&args.pdf, ground_truth.as_ref(), cancel).await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Pipeline failed");
            if let PipelineError::StructureDetection { metrics, .. } = &e {
                if let Ok(json) = serde_json::to_string(metrics) {
                    info!(metrics = %json, "Partial metrics");
                }
            }
            return ExitCode::FAILURE;
        }
    };

    let written = match &args.output {
        Some(path) => result.write_json(path).map(|_| info!(path = %path.display(), "Result written")),
        None => serde_json::to_string_pretty(&result)
            .map(|json| println!("{json}"))
            .map_err(Into::into),
    };
    if let Err(e) = written {
        error!(error = %e, "Failed to write result");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn read_json(path: &std::path::Path) -> Result<serde_json::Value, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}
