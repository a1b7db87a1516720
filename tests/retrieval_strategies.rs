// tests/retrieval_strategies.rs
//
// Both retrieval strategies through the public contract: determinism,
// idempotent vector upserts, persistence across runs, embedder failures.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use deal_intel::ingest::providers::StaticSource;
use deal_intel::pipeline::{Collaborators, Pipeline};
use deal_intel::retrieval::embed::{Embedder, HashingEmbedder};
use deal_intel::retrieval::{Query, RetrievalStrategy};
use deal_intel::{Document, ErrorKind, RetrievalMode, RunConfig, Stage};

fn vector_config(dir: &Path) -> RunConfig {
    let mut cfg = RunConfig::default();
    cfg.entities = vec!["ACME".into()];
    cfg.retrieval_mode = RetrievalMode::Vector;
    cfg.vector.index_dir = dir.join("vector").display().to_string();
    cfg.output.report_dir = dir.join("outputs").display().to_string();
    cfg
}

fn docs() -> Vec<Document> {
    vec![
        Document::news("ACME", "ACME weighs takeover bid for Widget").unwrap(),
        Document::news("ACME", "ACME dividend unchanged").unwrap(),
        Document::news("OTHER", "OTHER completes merger with Gadget").unwrap(),
    ]
}

fn lexical() -> RetrievalStrategy {
    RetrievalStrategy::from_config(
        &RunConfig::default(),
        Arc::new(HashingEmbedder::default()),
        None,
    )
}

#[tokio::test]
async fn lexical_results_are_repeatable() {
    let q = Query::for_entity("ACME");
    let mut a = lexical();
    let mut b = lexical();
    a.index(&docs()).await.unwrap();
    b.index(&docs()).await.unwrap();

    let ra = a.query(&q, 5).await.unwrap();
    let rb = b.query(&q, 5).await.unwrap();
    assert_eq!(ra, rb);
    assert!(ra.iter().all(|d| d.entity_id() == "ACME"));
    assert_eq!(ra[0].content(), "ACME weighs takeover bid for Widget");
}

#[tokio::test]
async fn lexical_ties_keep_ingestion_order() {
    let mut s = lexical();
    let twins = vec![
        Document::news("ACME", "ACME merger talk one").unwrap(),
        Document::news("ACME", "ACME merger talk two").unwrap(),
    ];
    s.index(&twins).await.unwrap();
    let out = s.query(&Query::new("merger", None), 2).await.unwrap();
    assert_eq!(out, twins);
}

#[tokio::test]
async fn vector_upserts_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = vector_config(dir.path());
    let mut s =
        RetrievalStrategy::from_config(&cfg, Arc::new(HashingEmbedder::default()), None);

    let first = s.index(&docs()).await.unwrap();
    let second = s.index(&docs()).await.unwrap();
    assert_eq!(first.corpus_size, 3);
    assert_eq!(second.corpus_size, 3);
    assert!(second.skipped.is_empty());

    let hits = s.query(&Query::for_entity("ACME"), 10).await.unwrap();
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn vector_corpus_outlives_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = vector_config(dir.path());

    let mut first =
        RetrievalStrategy::from_config(&cfg, Arc::new(HashingEmbedder::default()), None);
    first.index(&docs()[..1]).await.unwrap();

    let mut second =
        RetrievalStrategy::from_config(&cfg, Arc::new(HashingEmbedder::default()), None);
    let out = second.index(&docs()[1..2]).await.unwrap();
    assert_eq!(out.corpus_size, 2);
    let hits = second.query(&Query::for_entity("ACME"), 10).await.unwrap();
    assert_eq!(hits.len(), 2);
}

#[tokio::test]
async fn corpus_from_another_model_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = vector_config(dir.path());

    let mut s = RetrievalStrategy::from_config(&cfg, Arc::new(HashingEmbedder::new(64)), None);
    s.index(&docs()).await.unwrap();

    let mut other =
        RetrievalStrategy::from_config(&cfg, Arc::new(HashingEmbedder::new(128)), None);
    let err = other.index(&docs()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetrievalUnavailable);

    // Same mismatch inside a run ends in FAILED at RETRIEVE.
    let collab = Collaborators::new(Arc::new(StaticSource::from_documents(docs())))
        .with_embedder(Arc::new(HashingEmbedder::new(128)));
    let state = Pipeline::new(cfg, collab).unwrap().run().await;
    assert_eq!(state.stage(), Stage::Failed);
    let f = state.failure().unwrap();
    assert_eq!(f.stage, Stage::Retrieve);
    assert_eq!(f.kind, ErrorKind::RetrievalUnavailable);
}

/// Fails for any text mentioning "dividend".
struct Flaky(HashingEmbedder);

#[async_trait]
impl Embedder for Flaky {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        if text.contains("dividend") {
            anyhow::bail!("embedding endpoint returned 429");
        }
        self.0.embed(text).await
    }
    fn dimension(&self) -> usize {
        self.0.dimension()
    }
    fn model_id(&self) -> String {
        self.0.model_id()
    }
}

#[tokio::test]
async fn failed_embeddings_are_skipped_with_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = vector_config(dir.path());
    let collab = Collaborators::new(Arc::new(StaticSource::from_documents(docs())))
        .with_embedder(Arc::new(Flaky(HashingEmbedder::default())));

    let state = Pipeline::new(cfg, collab).unwrap().run().await;

    assert_eq!(state.stage(), Stage::Done);
    let retrieved = state.retrieved_docs().unwrap();
    assert_eq!(retrieved.len(), 1);
    assert!(retrieved[0].content().contains("takeover"));
    let w: Vec<_> = state
        .warnings()
        .iter()
        .filter(|w| w.kind == ErrorKind::RetrievalUnavailable)
        .collect();
    assert_eq!(w.len(), 1);
    assert_eq!(w[0].stage, Stage::Retrieve);
}

#[tokio::test]
async fn overlapping_vector_runs_share_one_corpus() {
    let dir = tempfile::tempdir().unwrap();
    let batch = |entity: &str| -> Vec<Document> {
        (0..20)
            .map(|i| Document::news(entity, &format!("{entity} filing note number {i}")).unwrap())
            .collect()
    };
    let mut acme = vector_config(dir.path());
    acme.entities = vec!["ACME".into()];
    acme.news_limit = 50;
    let mut widg = acme.clone();
    widg.entities = vec!["WIDG".into()];

    let run_acme = Pipeline::new(
        acme,
        Collaborators::new(Arc::new(StaticSource::from_documents(batch("ACME")))),
    )
    .unwrap()
    .run();
    let run_widg = Pipeline::new(
        widg,
        Collaborators::new(Arc::new(StaticSource::from_documents(batch("WIDG")))),
    )
    .unwrap()
    .run();
    let (a, w) = tokio::join!(run_acme, run_widg);
    assert_eq!(a.stage(), Stage::Done);
    assert_eq!(w.stage(), Stage::Done);

    let raw = std::fs::read(dir.path().join("vector").join("corpus.json")).unwrap();
    let corpus: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(corpus["entries"].as_object().map(|m| m.len()), Some(40));
}
