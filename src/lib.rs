// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod analyze;
pub mod api;
pub mod config;
pub mod document;
pub mod error;
pub mod ingest;
pub mod memory;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod retrieval;
pub mod telemetry;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::config::{RetrievalMode, RunConfig};
pub use crate::document::{Document, DocumentId, Metadata, SourceKind};
pub use crate::error::{ErrorKind, PipelineError, Warning};
pub use crate::pipeline::{CancelFlag, Collaborators, Pipeline, RunState, Stage};
pub use crate::report::Report;

/// Load config, build collaborators from the environment, run once.
pub async fn run_from_env() -> Result<RunState, PipelineError> {
    let cfg = RunConfig::load()?;
    let collab = Collaborators::from_config(&cfg)
        .map_err(|e| PipelineError::config(format!("{e:#}")))?;
    pipeline::run(cfg, collab).await
}
