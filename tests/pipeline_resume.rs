// tests/pipeline_resume.rs
//
// Partial failures, timeouts, checkpoints, resume and cancellation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use deal_intel::ingest::providers::StaticSource;
use deal_intel::pipeline::{CheckpointStore, Collaborators, Pipeline};
use deal_intel::{Document, ErrorKind, RunConfig, Stage};

fn config(dir: &Path, entities: &[&str]) -> RunConfig {
    let mut cfg = RunConfig::default();
    cfg.entities = entities.iter().map(|e| e.to_string()).collect();
    cfg.output.report_dir = dir.join("outputs").display().to_string();
    cfg.output.checkpoint_dir = dir.join("checkpoints").display().to_string();
    cfg
}

fn deal_doc() -> Document {
    Document::news("ACME", "ACME agrees to acquire Widget Corp in all-stock merger").unwrap()
}

#[tokio::test]
async fn one_failing_entity_is_a_warning_not_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let source = StaticSource::from_documents(vec![deal_doc()]).with_failure("WIDGET", "HTTP 503");
    let collab = Collaborators::new(Arc::new(source));

    let state = Pipeline::new(config(dir.path(), &["ACME", "WIDGET"]), collab)
        .unwrap()
        .run()
        .await;

    assert_eq!(state.stage(), Stage::Done);
    assert_eq!(state.ingested_docs().unwrap().len(), 1);
    let w = &state.warnings()[0];
    assert_eq!(w.kind, ErrorKind::IngestionPartialFailure);
    assert_eq!(w.stage, Stage::Ingest);
    assert!(w.message.starts_with("WIDGET: "));
    assert!(w.message.contains("HTTP 503"));
}

#[tokio::test]
async fn slow_entity_times_out_without_blocking_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), &["ACME", "SLOW"]);
    cfg.timeouts.fetch_secs = 1;
    let source = StaticSource::from_documents(vec![deal_doc()])
        .with_delay("SLOW", Duration::from_secs(5));

    let started = std::time::Instant::now();
    let state = Pipeline::new(cfg, Collaborators::new(Arc::new(source)))
        .unwrap()
        .run()
        .await;

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(state.stage(), Stage::Done);
    assert!(state
        .warnings()
        .iter()
        .any(|w| w.kind == ErrorKind::IngestionPartialFailure && w.message.contains("timed out")));
}

#[tokio::test]
async fn resume_reenters_at_first_missing_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), &["ACME"]);
    cfg.checkpoint = true;

    // A regular file where the report directory should be makes REPORT fail.
    let blocker = dir.path().join("outputs");
    std::fs::write(&blocker, "not a directory").unwrap();

    let collab = Collaborators::new(Arc::new(StaticSource::from_documents(vec![deal_doc()])));
    let first = Pipeline::new(cfg.clone(), collab)
        .unwrap()
        .run_with_id("run-resume-1")
        .await
        .unwrap();
    assert_eq!(first.stage(), Stage::Failed);
    let failure = first.failure().unwrap();
    assert_eq!(failure.stage, Stage::Report);
    assert_eq!(failure.kind, ErrorKind::ReportAssemblyError);
    assert!(first.findings().is_some());

    std::fs::remove_file(&blocker).unwrap();

    // Ingest must not run again: this source fails every entity.
    let collab = Collaborators::new(Arc::new(StaticSource::new().with_failure("ACME", "offline")));
    let resumed = Pipeline::resume("run-resume-1", &cfg.output.checkpoint_dir, collab)
        .await
        .unwrap();

    assert_eq!(resumed.stage(), Stage::Done, "failure: {:?}", resumed.failure());
    assert_eq!(resumed.findings(), first.findings());
    assert_eq!(resumed.ingested_docs(), first.ingested_docs());
    assert!(resumed.report().is_some());
    assert!(dir.path().join("outputs/run-resume-1.json").exists());

    let snap = CheckpointStore::new(&cfg.output.checkpoint_dir)
        .load("run-resume-1")
        .await
        .unwrap();
    assert_eq!(snap.stage(), Stage::Done);
}

#[tokio::test]
async fn cancelled_run_stops_at_step_boundary_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), &["ACME"]);
    cfg.checkpoint = true;

    let collab = Collaborators::new(Arc::new(StaticSource::from_documents(vec![deal_doc()])));
    let pipeline = Pipeline::new(cfg.clone(), collab.clone()).unwrap();
    pipeline.cancel_flag().cancel();
    let state = pipeline.run_with_id("run-cancel-1").await.unwrap();

    assert_eq!(state.stage(), Stage::Ingest);
    assert!(!state.is_terminal());
    assert_eq!(state.warnings()[0].kind, ErrorKind::Cancelled);
    assert!(state.report().is_none());

    let resumed = Pipeline::resume("run-cancel-1", &cfg.output.checkpoint_dir, collab)
        .await
        .unwrap();
    assert_eq!(resumed.stage(), Stage::Done);
    assert!(resumed.report().is_some());
}

#[tokio::test]
async fn incompatible_snapshot_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("checkpoints");
    std::fs::create_dir_all(&ckpt).unwrap();
    std::fs::write(
        ckpt.join("run-old.json"),
        r#"{"schema_version": 0, "run_id": "run-old", "saved_at": "2025-01-01T00:00:00Z", "state": {}}"#,
    )
    .unwrap();

    let collab = Collaborators::new(Arc::new(StaticSource::new()));
    let err = Pipeline::resume("run-old", &ckpt, collab).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SnapshotIncompatible);
}

#[tokio::test]
async fn invalid_run_id_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let collab = Collaborators::new(Arc::new(StaticSource::new()));
    let err = Pipeline::new(config(dir.path(), &["ACME"]), collab)
        .unwrap()
        .run_with_id("../escape")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigurationError);
}
