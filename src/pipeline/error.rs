//! Error types for the extraction pipeline.
//!
//! Only `PipelineError` ever leaves `PipelineOrchestrator::run`. Everything
//! scoped to a single agent is captured as an `AgentError` and recorded on
//! that agent's `ExtractionResult`.

use thiserror::Error;

use super::render::RenderError;
use super::types::IntegrationMetrics;

/// Pipeline-fatal errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Carries the stage metrics collected before the abort.
    #[error("Structure detection failed: {reason}")]
    StructureDetection {
        reason: String,
        metrics: Box<IntegrationMetrics>,
    },

    #[error("Document could not be loaded: {0}")]
    DocumentLoad(String),

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the external vision-model call.
#[derive(Error, Debug, Clone)]
pub enum ModelError {
    #[error("Model endpoint unreachable at {0}")]
    Connection(String),

    #[error("Model call timed out after {0}s")]
    Timeout(u64),

    #[error("Model endpoint is rate limiting requests")]
    RateLimited,

    #[error("Model returned error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Invalid model response envelope: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::RateLimited | Self::Http(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Model output that could not be read as structured data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("No JSON object found in model response")]
    NoJson,

    #[error("JSON parsing error: {0}")]
    Json(String),

    #[error("Model response is not a JSON object")]
    NotAnObject,
}

/// Failure of a single agent task. Never propagated past the task boundary.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Rendering failed: {0}")]
    Render(#[from] RenderError),

    #[error("Model call failed after {attempts} attempt(s): {source}")]
    Model {
        attempts: u32,
        #[source]
        source: ModelError,
    },

    #[error("Malformed response after {attempts} attempt(s): {last}")]
    Malformed { attempts: u32, last: ParseError },

    #[error("Agent task panicked: {0}")]
    Panicked(String),

    #[error("Agent task cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ModelError::Timeout(30).is_transient());
        assert!(ModelError::RateLimited.is_transient());
        assert!(ModelError::Connection("http://localhost".into()).is_transient());
        assert!(ModelError::Api { status: 503, body: String::new() }.is_transient());
        assert!(!ModelError::Api { status: 400, body: String::new() }.is_transient());
        assert!(!ModelError::InvalidResponse("x".into()).is_transient());
    }

    #[test]
    fn agent_error_messages_name_attempts() {
        let err = AgentError::Malformed {
            attempts: 3,
            last: ParseError::NoJson,
        };
        assert_eq!(
            err.to_string(),
            "Malformed response after 3 attempt(s): No JSON object found in model response"
        );
    }
}
