pub mod agents;
pub mod cache; // Content-addressed result cache with in-flight coalescing
pub mod error;
pub mod executor; // Per-agent state machine
pub mod linker;
pub mod ollama;
pub mod orchestrator; // Two-pass pipeline driver
pub mod parser;
pub mod render;
pub mod retry;
pub mod router;
pub mod schema;
pub mod scoring;
pub mod structure;
pub mod topology;
pub mod traits;
pub mod types;
pub mod validation;

pub use error::PipelineError;
pub use orchestrator::{Collaborators, PipelineOrchestrator};
pub use types::PipelineResult;
