// src/pipeline/state.rs
//! Per-run state threaded through the steps.
//!
//! Each step output is a newtype that only this module can build, and the
//! orchestrator hands a step the previous step's output by reference. A
//! retrieve step therefore cannot be invoked without an `Ingested` value.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::analyze::Finding;
use crate::config::RunConfig;
use crate::document::Document;
use crate::error::{ErrorKind, PipelineError, Warning};
use crate::report::Report;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Ingest,
    Retrieve,
    Analyze,
    Report,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "INGEST",
            Stage::Retrieve => "RETRIEVE",
            Stage::Analyze => "ANALYZE",
            Stage::Report => "REPORT",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of INGEST.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ingested(Vec<Document>);

/// Output of RETRIEVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Retrieved(Vec<Document>);

/// Output of ANALYZE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Analyzed(Vec<Finding>);

impl Ingested {
    pub(crate) fn new(docs: Vec<Document>) -> Self {
        Self(docs)
    }
    pub fn documents(&self) -> &[Document] {
        &self.0
    }
}

impl Retrieved {
    pub(crate) fn new(docs: Vec<Document>) -> Self {
        Self(docs)
    }
    pub fn documents(&self) -> &[Document] {
        &self.0
    }
}

impl Analyzed {
    pub(crate) fn new(findings: Vec<Finding>) -> Self {
        Self(findings)
    }
    pub fn findings(&self) -> &[Finding] {
        &self.0
    }
}

/// Why a run ended in FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    /// Stage that was executing.
    pub stage: Stage,
    pub kind: ErrorKind,
    /// One-sentence cause.
    pub cause: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    run_id: String,
    config: RunConfig,
    stage: Stage,
    #[serde(default)]
    ingested: Option<Ingested>,
    #[serde(default)]
    retrieved: Option<Retrieved>,
    #[serde(default)]
    analyzed: Option<Analyzed>,
    #[serde(default)]
    report: Option<Report>,
    #[serde(default)]
    warnings: Vec<Warning>,
    #[serde(default)]
    failure: Option<Failure>,
}

impl RunState {
    pub(crate) fn new(run_id: String, config: RunConfig) -> Self {
        Self {
            run_id,
            config,
            stage: Stage::Ingest,
            ingested: None,
            retrieved: None,
            analyzed: None,
            report: None,
            warnings: Vec::new(),
            failure: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn ingested_docs(&self) -> Option<&[Document]> {
        self.ingested.as_ref().map(Ingested::documents)
    }

    pub fn retrieved_docs(&self) -> Option<&[Document]> {
        self.retrieved.as_ref().map(Retrieved::documents)
    }

    pub fn findings(&self) -> Option<&[Finding]> {
        self.analyzed.as_ref().map(Analyzed::findings)
    }

    pub fn report(&self) -> Option<&Report> {
        self.report.as_ref()
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub(crate) fn ingested(&self) -> Option<&Ingested> {
        self.ingested.as_ref()
    }

    pub(crate) fn retrieved(&self) -> Option<&Retrieved> {
        self.retrieved.as_ref()
    }

    pub(crate) fn analyzed(&self) -> Option<&Analyzed> {
        self.analyzed.as_ref()
    }

    pub(crate) fn warn(&mut self, w: Warning) {
        self.warnings.push(w);
    }

    pub(crate) fn complete_ingest(&mut self, out: Ingested) {
        self.ingested = Some(out);
        self.stage = Stage::Retrieve;
    }

    pub(crate) fn complete_retrieve(&mut self, out: Retrieved) {
        self.retrieved = Some(out);
        self.stage = Stage::Analyze;
    }

    pub(crate) fn complete_analyze(&mut self, out: Analyzed) {
        self.analyzed = Some(out);
        self.stage = Stage::Report;
    }

    pub(crate) fn complete_report(&mut self, out: Report) {
        self.report = Some(out);
        self.stage = Stage::Done;
    }

    pub(crate) fn fail(&mut self, err: &PipelineError) {
        self.failure = Some(Failure {
            stage: self.stage,
            kind: err.kind(),
            cause: err.to_string(),
        });
        self.stage = Stage::Failed;
    }

    /// First step whose output is absent. Clears a previous failure so the
    /// run can be re-entered there.
    pub(crate) fn rewind_to_first_missing(&mut self) {
        self.failure = None;
        self.stage = if self.ingested.is_none() {
            Stage::Ingest
        } else if self.retrieved.is_none() {
            Stage::Retrieve
        } else if self.analyzed.is_none() {
            Stage::Analyze
        } else if self.report.is_none() {
            Stage::Report
        } else {
            Stage::Done
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RunState {
        RunState::new("run-t".into(), RunConfig::default())
    }

    #[test]
    fn fresh_state_starts_at_ingest_with_nothing_written() {
        let s = state();
        assert_eq!(s.stage(), Stage::Ingest);
        assert!(s.ingested_docs().is_none());
        assert!(s.retrieved_docs().is_none());
        assert!(s.findings().is_none());
        assert!(s.report().is_none());
    }

    #[test]
    fn rewind_finds_first_missing_output() {
        let mut s = state();
        s.complete_ingest(Ingested::new(vec![]));
        s.fail(&PipelineError::RetrievalUnavailable("down".into()));
        assert_eq!(s.stage(), Stage::Failed);
        assert_eq!(s.failure().map(|f| f.stage), Some(Stage::Retrieve));

        s.rewind_to_first_missing();
        assert_eq!(s.stage(), Stage::Retrieve);
        assert!(s.failure().is_none());
    }

    #[test]
    fn stage_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Stage::Analyze).unwrap(), "\"ANALYZE\"");
    }
}
