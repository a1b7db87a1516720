// src/pipeline/mod.rs
//! Run orchestrator: INGEST -> RETRIEVE -> ANALYZE -> REPORT -> DONE, with
//! FAILED reachable from any step.
//!
//! One `Pipeline` is built per run from a frozen [`RunConfig`] and a set of
//! injected [`Collaborators`]. Steps run strictly in order; each step only
//! receives the output of the step before it.

pub mod checkpoint;
pub mod state;

pub use checkpoint::{CheckpointStore, Snapshot, SNAPSHOT_SCHEMA_VERSION};
pub use state::{Analyzed, Failure, Ingested, Retrieved, RunState, Stage};

use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::analyze::reasoner::{build_reasoner, DisabledReasoner};
use crate::analyze::{DealAnalyzer, DynReasoner};
use crate::config::RunConfig;
use crate::error::{ErrorKind, PipelineError, Warning};
use crate::ingest::ingest_entities;
use crate::ingest::providers::MarketSource;
use crate::ingest::types::IngestionSource;
use crate::memory::ShortTermMemory;
use crate::report::{Report, ReportAssembler};
use crate::retrieval::embed::{build_embedder, Embedder, HashingEmbedder};
use crate::retrieval::vector::VectorStore;
use crate::retrieval::{Query, RetrievalStrategy};

/// Memory key for ingest notes.
pub const INGEST_MEMORY_KEY: &str = "ingest";

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_runs_total", "Pipeline runs by outcome.");
        describe_histogram!("pipeline_step_ms", "Step duration in milliseconds.");
        describe_counter!(
            "retrieval_documents_total",
            "Documents returned by retrieval queries."
        );
        describe_counter!("analyzer_findings_total", "Findings produced.");
        describe_counter!("analyzer_dealish_total", "Findings labelled deal-ish.");
        describe_counter!(
            "analyzer_escalations_total",
            "Findings that used a generative verdict."
        );
        describe_counter!(
            "analyzer_degraded_total",
            "Escalations that fell back to the heuristic score."
        );
    });
}

/// External collaborators injected into each run.
#[derive(Clone)]
pub struct Collaborators {
    pub ingestion: Arc<dyn IngestionSource>,
    pub embedder: Arc<dyn Embedder>,
    pub reasoner: DynReasoner,
    pub memory: Arc<ShortTermMemory>,
    /// Pre-opened vector corpus. When unset, runs resolve the process-wide
    /// handle for the configured `index_dir`.
    pub vector_store: Option<Arc<VectorStore>>,
}

impl Collaborators {
    /// Offline defaults: hashing embedder, disabled reasoner, fresh memory.
    pub fn new(ingestion: Arc<dyn IngestionSource>) -> Self {
        Self {
            ingestion,
            embedder: Arc::new(HashingEmbedder::default()),
            reasoner: Arc::new(DisabledReasoner),
            memory: Arc::new(ShortTermMemory::default()),
            vector_store: None,
        }
    }

    /// Market feed (+ filings), configured embedder and reasoner.
    pub fn from_config(cfg: &RunConfig) -> anyhow::Result<Self> {
        Ok(Self {
            ingestion: Arc::new(MarketSource::from_env()?),
            embedder: build_embedder(&cfg.vector)?,
            reasoner: build_reasoner(&cfg.ai),
            memory: Arc::new(ShortTermMemory::with_capacity(cfg.memory.max_entries)),
            vector_store: None,
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_reasoner(mut self, reasoner: DynReasoner) -> Self {
        self.reasoner = reasoner;
        self
    }

    pub fn with_memory(mut self, memory: Arc<ShortTermMemory>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_vector_store(mut self, store: Arc<VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }
}

/// Cooperative cancellation, checked between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// `run-20250603T140000Z-1a2b3c4d`
pub fn new_run_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let now = chrono::Utc::now();
    let mut h = Sha256::new();
    h.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    h.update(SEQ.fetch_add(1, Ordering::SeqCst).to_le_bytes());
    h.update(std::process::id().to_le_bytes());
    let d = h.finalize();
    format!(
        "run-{}-{:02x}{:02x}{:02x}{:02x}",
        now.format("%Y%m%dT%H%M%SZ"),
        d[0],
        d[1],
        d[2],
        d[3]
    )
}

/// Run ids double as file names: ASCII alphanumerics, '-' and '_' only.
pub fn is_valid_run_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

enum StepOutput {
    Ingested(Ingested),
    Retrieved(Retrieved),
    Analyzed(Analyzed),
    Report(Report),
}

pub struct Pipeline {
    config: RunConfig,
    collab: Collaborators,
    retrieval: RetrievalStrategy,
    analyzer: DealAnalyzer,
    reporter: ReportAssembler,
    checkpoints: Option<CheckpointStore>,
    cancel: CancelFlag,
}

impl Pipeline {
    /// Validates `config`; a `ConfigurationError` here means no step ran.
    pub fn new(config: RunConfig, collab: Collaborators) -> Result<Self, PipelineError> {
        ensure_metrics_described();
        let config = config.finalize()?;
        let retrieval = RetrievalStrategy::from_config(
            &config,
            Arc::clone(&collab.embedder),
            collab.vector_store.clone(),
        );
        let analyzer = DealAnalyzer::from_config(&config, Arc::clone(&collab.reasoner))?
            .with_memory(Arc::clone(&collab.memory));
        let reporter = ReportAssembler::new(&config.output.report_dir);
        let checkpoints = config
            .checkpoint
            .then(|| CheckpointStore::new(&config.output.checkpoint_dir));
        Ok(Self {
            config,
            collab,
            retrieval,
            analyzer,
            reporter,
            checkpoints,
            cancel: CancelFlag::default(),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Handle to cancel this run from another task.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn run(self) -> RunState {
        let id = new_run_id();
        let state = RunState::new(id, self.config.clone());
        self.execute(state).await
    }

    /// Run under a caller-chosen id (e.g. to make snapshots addressable).
    pub async fn run_with_id(self, run_id: &str) -> Result<RunState, PipelineError> {
        if !is_valid_run_id(run_id) {
            return Err(PipelineError::config(format!("invalid run id '{run_id}'")));
        }
        let state = RunState::new(run_id.to_string(), self.config.clone());
        Ok(self.execute(state).await)
    }

    /// Continue a checkpointed run at the first step whose output is absent.
    /// Completed steps are not re-run; the snapshot's own config is used.
    pub async fn resume(
        run_id: &str,
        checkpoint_dir: impl Into<PathBuf>,
        collab: Collaborators,
    ) -> Result<RunState, PipelineError> {
        let store = CheckpointStore::new(checkpoint_dir);
        let mut state = store.load(run_id).await?;
        state.rewind_to_first_missing();
        tracing::info!(target: "pipeline", run_id, stage = %state.stage(), "resuming run");
        if state.is_terminal() {
            return Ok(state);
        }
        let mut pipeline = Pipeline::new(state.config().clone(), collab)?;
        pipeline.checkpoints = Some(store);
        Ok(pipeline.execute(state).await)
    }

    async fn execute(mut self, mut state: RunState) -> RunState {
        let run_id = state.run_id().to_string();
        tracing::info!(
            target: "pipeline",
            run_id = %run_id,
            stage = %state.stage(),
            mode = %self.retrieval.mode(),
            entities = self.config.entities.len(),
            "run started"
        );

        while !state.is_terminal() {
            let stage = state.stage();
            if self.cancel.is_cancelled() {
                let err = PipelineError::Cancelled(stage);
                tracing::warn!(target: "pipeline", run_id = %run_id, stage = %stage, "run cancelled");
                state.warn(Warning::new(ErrorKind::Cancelled, stage, err.to_string()));
                self.checkpoint(&mut state).await;
                counter!("pipeline_runs_total", "outcome" => "cancelled").increment(1);
                return state;
            }

            let t0 = Instant::now();
            let mut warnings = Vec::new();
            let result = self.step(&state, &mut warnings).await;
            histogram!("pipeline_step_ms", "step" => stage.as_str())
                .record(t0.elapsed().as_secs_f64() * 1_000.0);

            for w in warnings {
                state.warn(w);
            }
            match result {
                Ok(out) => {
                    match out {
                        StepOutput::Ingested(o) => state.complete_ingest(o),
                        StepOutput::Retrieved(o) => state.complete_retrieve(o),
                        StepOutput::Analyzed(o) => state.complete_analyze(o),
                        StepOutput::Report(o) => state.complete_report(o),
                    }
                    tracing::info!(target: "pipeline", run_id = %run_id, step = %stage, next = %state.stage(), "step completed");
                }
                Err(e) => {
                    tracing::error!(target: "pipeline", run_id = %run_id, step = %stage, error = %e, "step failed");
                    state.fail(&e);
                }
            }
            self.checkpoint(&mut state).await;
        }

        let outcome = if state.stage() == Stage::Done {
            "done"
        } else {
            "failed"
        };
        counter!("pipeline_runs_total", "outcome" => outcome).increment(1);
        tracing::info!(
            target: "pipeline",
            run_id = %run_id,
            outcome,
            warnings = state.warnings().len(),
            "run finished"
        );
        state
    }

    async fn checkpoint(&self, state: &mut RunState) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        if let Err(e) = store.save(state).await {
            tracing::error!(target: "pipeline", run_id = %state.run_id(), error = %format!("{e:#}"), "checkpoint not saved");
            let stage = state.stage();
            state.warn(Warning::new(
                ErrorKind::SnapshotIncompatible,
                stage,
                format!("checkpoint not saved: {e:#}"),
            ));
        }
    }

    async fn step(
        &mut self,
        state: &RunState,
        warnings: &mut Vec<Warning>,
    ) -> Result<StepOutput, PipelineError> {
        match state.stage() {
            Stage::Ingest => self.ingest(warnings).await.map(StepOutput::Ingested),
            Stage::Retrieve => {
                let ingested = state.ingested().ok_or_else(|| missing(Stage::Ingest))?;
                self.retrieve(ingested, warnings)
                    .await
                    .map(StepOutput::Retrieved)
            }
            Stage::Analyze => {
                let retrieved = state.retrieved().ok_or_else(|| missing(Stage::Retrieve))?;
                Ok(StepOutput::Analyzed(self.analyze(retrieved, warnings).await))
            }
            Stage::Report => {
                let ingested = state.ingested().ok_or_else(|| missing(Stage::Ingest))?;
                let retrieved = state.retrieved().ok_or_else(|| missing(Stage::Retrieve))?;
                let analyzed = state.analyzed().ok_or_else(|| missing(Stage::Analyze))?;
                let report = ReportAssembler::assemble(
                    state.run_id(),
                    &self.config,
                    ingested.documents().len(),
                    retrieved.documents(),
                    analyzed.findings(),
                    state.warnings(),
                );
                let path = self.reporter.persist(&report).await?;
                tracing::info!(target: "report", run_id = %state.run_id(), path = %path.display(), dealish = report.stats.dealish, "report written");
                Ok(StepOutput::Report(report))
            }
            Stage::Done | Stage::Failed => Err(PipelineError::SnapshotIncompatible(format!(
                "no step to run in terminal stage {}",
                state.stage()
            ))),
        }
    }

    async fn ingest(&self, warnings: &mut Vec<Warning>) -> Result<Ingested, PipelineError> {
        let cfg = &self.config;
        let outcome = ingest_entities(
            Arc::clone(&self.collab.ingestion),
            &cfg.entities,
            cfg.news_limit,
            cfg.use_secondary_source,
            Duration::from_secs(cfg.timeouts.fetch_secs),
        )
        .await;

        for f in &outcome.failures {
            warnings.push(Warning::new(
                ErrorKind::IngestionPartialFailure,
                Stage::Ingest,
                format!("{}: {}", f.entity_id, f.cause),
            ));
        }
        if outcome.documents.is_empty() {
            let n = cfg.entities.len();
            let cause = if outcome.failures.len() == n {
                format!("all {n} entities failed to fetch")
            } else {
                format!("no documents ingested for any of {n} entities")
            };
            return Err(PipelineError::IngestionPartialFailure(cause));
        }

        self.collab.memory.note(
            INGEST_MEMORY_KEY,
            format!(
                "Ingested {} docs for {} entities",
                outcome.documents.len(),
                cfg.entities.len()
            ),
        );
        tracing::info!(
            target: "ingest",
            documents = outcome.documents.len(),
            failed_entities = outcome.failures.len(),
            duplicates = outcome.duplicates,
            "ingest finished"
        );
        Ok(Ingested::new(outcome.documents))
    }

    async fn retrieve(
        &mut self,
        ingested: &Ingested,
        warnings: &mut Vec<Warning>,
    ) -> Result<Retrieved, PipelineError> {
        let indexed = self.retrieval.index(ingested.documents()).await?;
        for (id, cause) in &indexed.skipped {
            warnings.push(Warning::new(
                ErrorKind::RetrievalUnavailable,
                Stage::Retrieve,
                format!("document {id} not indexed: {cause}"),
            ));
        }

        let mut seen = HashSet::new();
        let mut docs = Vec::new();
        for entity in &self.config.entities {
            let hits = self
                .retrieval
                .query(&Query::for_entity(entity), self.config.top_k)
                .await?;
            docs.extend(hits.into_iter().filter(|d| seen.insert(d.id().clone())));
        }
        tracing::info!(
            target: "retrieval",
            mode = %self.retrieval.mode(),
            indexed = indexed.indexed,
            corpus = indexed.corpus_size,
            retrieved = docs.len(),
            "retrieval finished"
        );
        Ok(Retrieved::new(docs))
    }

    async fn analyze(&self, retrieved: &Retrieved, warnings: &mut Vec<Warning>) -> Analyzed {
        let analysis = self.analyzer.analyze(retrieved.documents()).await;
        for (id, cause) in &analysis.degraded {
            warnings.push(Warning::new(
                ErrorKind::AnalyzerDegraded,
                Stage::Analyze,
                format!("document {id}: {cause}"),
            ));
        }
        tracing::info!(
            target: "analyze",
            findings = analysis.findings.len(),
            dealish = analysis.dealish().count(),
            escalated = analysis.escalated,
            degraded = analysis.degraded.len(),
            "analysis finished"
        );
        Analyzed::new(analysis.findings)
    }
}

/// Only reachable from a hand-edited or foreign snapshot.
fn missing(stage: Stage) -> PipelineError {
    PipelineError::SnapshotIncompatible(format!("state has no {stage} output"))
}

/// Build and run one pipeline.
pub async fn run(config: RunConfig, collab: Collaborators) -> Result<RunState, PipelineError> {
    Ok(Pipeline::new(config, collab)?.run().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_file_safe() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert!(is_valid_run_id(&a), "{a}");
        assert!(a.starts_with("run-"));
    }

    #[test]
    fn run_id_validation_rejects_paths() {
        assert!(!is_valid_run_id(""));
        assert!(!is_valid_run_id("../etc/passwd"));
        assert!(!is_valid_run_id("a b"));
        assert!(is_valid_run_id("nightly_2025-06-03"));
    }

    #[test]
    fn cancel_flag_is_shared() {
        let f = CancelFlag::default();
        let g = f.clone();
        g.cancel();
        assert!(f.is_cancelled());
    }
}
