// src/error.rs
use serde::{Deserialize, Serialize};

use crate::pipeline::Stage;

/// Discriminant of [`PipelineError`], stable across serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    IngestionPartialFailure,
    RetrievalUnavailable,
    AnalyzerDegraded,
    ConfigurationError,
    ReportAssemblyError,
    Cancelled,
    SnapshotIncompatible,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("ingestion failed: {0}")]
    IngestionPartialFailure(String),
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("analyzer degraded: {0}")]
    AnalyzerDegraded(String),
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),
    #[error("report assembly failed: {0}")]
    ReportAssemblyError(String),
    #[error("run cancelled before {0}")]
    Cancelled(Stage),
    #[error("snapshot incompatible: {0}")]
    SnapshotIncompatible(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::IngestionPartialFailure(_) => ErrorKind::IngestionPartialFailure,
            PipelineError::RetrievalUnavailable(_) => ErrorKind::RetrievalUnavailable,
            PipelineError::AnalyzerDegraded(_) => ErrorKind::AnalyzerDegraded,
            PipelineError::ConfigurationError(_) => ErrorKind::ConfigurationError,
            PipelineError::ReportAssemblyError(_) => ErrorKind::ReportAssemblyError,
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
            PipelineError::SnapshotIncompatible(_) => ErrorKind::SnapshotIncompatible,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        PipelineError::ConfigurationError(msg.into())
    }

    pub fn retrieval(err: impl std::fmt::Display) -> Self {
        PipelineError::RetrievalUnavailable(err.to_string())
    }
}

/// A recoverable condition absorbed by a step and kept for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

impl Warning {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let e = PipelineError::config("top_k must be >= 1");
        assert_eq!(e.kind(), ErrorKind::ConfigurationError);
        assert_eq!(e.to_string(), "invalid configuration: top_k must be >= 1");
        assert_eq!(
            PipelineError::Cancelled(Stage::Analyze).to_string(),
            "run cancelled before ANALYZE"
        );
    }
}
