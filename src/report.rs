// src/report.rs
//! Folds findings into a structured report plus narrative, and persists it
//! as `{report_dir}/{run_id}.json`, `{run_id}.txt` and `latest.json`.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::analyze::Finding;
use crate::config::{RetrievalMode, RunConfig};
use crate::document::{Document, DocumentId};
use crate::error::{ErrorKind, PipelineError, Warning};
use crate::pipeline::is_valid_run_id;

pub const NO_DEALS_TEXT: &str = "No M&A or deal-related events detected today.";
pub const LATEST_FILE: &str = "latest.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStats {
    pub entities: usize,
    pub ingested: usize,
    pub retrieved: usize,
    pub findings: usize,
    pub dealish: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub retrieval_mode: RetrievalMode,
    pub entities: Vec<String>,
    /// Narrative.
    pub text: String,
    /// One-line digest.
    pub summary: String,
    pub findings: Vec<Finding>,
    /// Fallback paths taken during the run.
    #[serde(default)]
    pub degraded: Vec<Warning>,
    pub stats: ReportStats,
}

#[derive(Debug, Clone)]
pub struct ReportAssembler {
    report_dir: PathBuf,
}

impl ReportAssembler {
    pub fn new(report_dir: impl Into<PathBuf>) -> Self {
        Self {
            report_dir: report_dir.into(),
        }
    }

    pub fn report_dir(&self) -> &Path {
        &self.report_dir
    }

    /// Pure: no I/O, no clock other than `generated_at`.
    pub fn assemble(
        run_id: &str,
        config: &RunConfig,
        ingested: usize,
        retrieved: &[Document],
        findings: &[Finding],
        warnings: &[Warning],
    ) -> Report {
        let docs: HashMap<&DocumentId, &Document> = retrieved.iter().map(|d| (d.id(), d)).collect();
        let dealish: Vec<&Finding> = findings.iter().filter(|f| f.is_dealish).collect();

        let mut text = narrative(&dealish, &docs);
        let reasoner_fallbacks = warnings
            .iter()
            .filter(|w| w.kind == ErrorKind::AnalyzerDegraded)
            .count();
        if reasoner_fallbacks > 0 {
            text.push_str(&format!(
                "\n\nNote: generative reasoning unavailable for {reasoner_fallbacks} document(s); heuristic scores used."
            ));
        }
        let other_warnings = warnings.len() - reasoner_fallbacks;
        if other_warnings > 0 {
            text.push_str(&format!(
                "\nNote: {other_warnings} other warning(s) recorded during the run."
            ));
        }

        let stats = ReportStats {
            entities: config.entities.len(),
            ingested,
            retrieved: retrieved.len(),
            findings: findings.len(),
            dealish: dealish.len(),
        };
        let summary = format!(
            "{} deal-ish of {} findings across {} entities ({} retrieval{})",
            stats.dealish,
            stats.findings,
            stats.entities,
            config.retrieval_mode,
            if warnings.is_empty() { "" } else { ", degraded" }
        );

        Report {
            run_id: run_id.to_string(),
            generated_at: Utc::now(),
            retrieval_mode: config.retrieval_mode,
            entities: config.entities.clone(),
            text,
            summary,
            findings: findings.to_vec(),
            degraded: warnings.to_vec(),
            stats,
        }
    }

    /// Write `{run_id}.json`, `{run_id}.txt`, then overwrite `latest.json`.
    pub async fn persist(&self, report: &Report) -> Result<PathBuf, PipelineError> {
        if !is_valid_run_id(&report.run_id) {
            return Err(PipelineError::ReportAssemblyError(format!(
                "invalid run id '{}'",
                report.run_id
            )));
        }
        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| PipelineError::ReportAssemblyError(format!("serializing report: {e}")))?;

        let write = async {
            tokio::fs::create_dir_all(&self.report_dir)
                .await
                .with_context(|| format!("creating {}", self.report_dir.display()))?;
            let json_path = self.report_dir.join(format!("{}.json", report.run_id));
            write_atomic(&json_path, &json).await?;
            write_atomic(
                &self.report_dir.join(format!("{}.txt", report.run_id)),
                report.text.as_bytes(),
            )
            .await?;
            write_atomic(&self.report_dir.join(LATEST_FILE), &json).await?;
            anyhow::Ok(json_path)
        };
        write
            .await
            .map_err(|e| PipelineError::ReportAssemblyError(format!("{e:#}")))
    }

    /// `Ok(None)` when no report exists for `run_id`.
    pub async fn load(&self, run_id: &str) -> anyhow::Result<Option<Report>> {
        if !is_valid_run_id(run_id) {
            anyhow::bail!("invalid run id '{run_id}'");
        }
        let path = self.report_dir.join(format!("{run_id}.json"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }
}

fn narrative(dealish: &[&Finding], docs: &HashMap<&DocumentId, &Document>) -> String {
    if dealish.is_empty() {
        return NO_DEALS_TEXT.to_string();
    }
    let mut lines = vec!["Daily Deal Report:".to_string()];
    for f in dealish {
        let doc = docs.get(&f.document_ref);
        let headline = doc
            .map(|d| d.excerpt(160))
            .unwrap_or_else(|| format!("document {}", f.document_ref));
        let signals = if f.matched_signals.is_empty() {
            "none".to_string()
        } else {
            f.matched_signals.iter().cloned().collect::<Vec<_>>().join(", ")
        };
        let mut line = format!(
            "- {}: {} (score {:.2}, {} via {})",
            f.entity_id,
            headline,
            f.score,
            signals,
            f.reasoning_source.as_str()
        );
        if let Some(link) = doc.and_then(|d| d.metadata().link.as_deref()) {
            line.push_str(&format!(" [{link}]"));
        }
        lines.push(line);
    }
    lines.join("\n")
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::ReasoningSource;
    use crate::pipeline::Stage;
    use std::collections::BTreeSet;

    fn finding(doc: &Document, score: f64, dealish: bool) -> Finding {
        Finding {
            document_ref: doc.id().clone(),
            entity_id: doc.entity_id().to_string(),
            score,
            matched_signals: BTreeSet::from(["acquisition_vocabulary".to_string()]),
            reasoning_source: ReasoningSource::Heuristic,
            is_dealish: dealish,
            explanation: None,
        }
    }

    #[test]
    fn empty_findings_use_no_deal_sentence() {
        let r = ReportAssembler::assemble("run-1", &RunConfig::default(), 0, &[], &[], &[]);
        assert_eq!(r.text, NO_DEALS_TEXT);
        assert_eq!(r.stats.findings, 0);
        assert!(r.summary.starts_with("0 deal-ish of 0 findings"));
    }

    #[test]
    fn narrative_lists_dealish_only_and_notes_fallbacks() {
        let a = Document::news("ACME", "ACME to acquire Widget").unwrap();
        let b = Document::news("ACME", "ACME results").unwrap();
        let findings = vec![finding(&a, 0.6, true), finding(&b, 0.0, false)];
        let warnings = vec![Warning::new(
            ErrorKind::AnalyzerDegraded,
            Stage::Analyze,
            "timeout",
        )];
        let r = ReportAssembler::assemble(
            "run-2",
            &RunConfig::default(),
            2,
            &[a, b],
            &findings,
            &warnings,
        );
        assert!(r.text.starts_with("Daily Deal Report:\n- ACME: ACME to acquire Widget (score 0.60"));
        assert!(!r.text.contains("ACME results"));
        assert!(r.text.contains("heuristic scores used"));
        assert_eq!(r.degraded.len(), 1);
        assert_eq!(r.stats.dealish, 1);
    }

    #[tokio::test]
    async fn persist_writes_json_text_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let asm = ReportAssembler::new(dir.path().join("out"));
        let r = ReportAssembler::assemble("run-3", &RunConfig::default(), 0, &[], &[], &[]);
        asm.persist(&r).await.unwrap();
        assert!(dir.path().join("out/run-3.json").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/run-3.txt")).unwrap(),
            NO_DEALS_TEXT
        );
        assert!(dir.path().join("out").join(LATEST_FILE).exists());
        assert_eq!(asm.load("run-3").await.unwrap(), Some(r));
        assert_eq!(asm.load("run-missing").await.unwrap(), None);
        assert!(asm.load("../etc").await.is_err());
    }
}
