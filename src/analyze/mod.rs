// src/analyze/mod.rs
//! Deal-signal analysis: heuristic rules first, optional generative escalation
//! for ambiguous scores, then a threshold decision.
//!
//! Decision table (per document):
//!
//! | heuristic score | reasoner             | score used                 | source       |
//! |-----------------|----------------------|----------------------------|--------------|
//! | outside band    | any                  | heuristic                  | `heuristic`  |
//! | inside band     | disabled             | heuristic                  | `heuristic`  |
//! | inside band     | failed / timed out   | heuristic (+ degraded)     | `heuristic`  |
//! | inside band     | verdict, `blend`     | `(1-w)*h + w*v`            | `hybrid`     |
//! | inside band     | verdict, `replace`   | `v`                        | `generative` |
//!
//! `is_dealish = score >= threshold`.

pub mod reasoner;
pub mod rules;

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AnalyzerConfig, BlendStrategy, RunConfig};
use crate::document::{Document, DocumentId};
use crate::error::PipelineError;
use crate::memory::ShortTermMemory;
pub use reasoner::{DynReasoner, Reasoner, ReasoningContext, Verdict};
pub use rules::{Heuristic, RuleSet};

/// Memory key for analyzer notes.
pub const MEMORY_KEY: &str = "analyze";
/// Notes handed to the reasoner as context.
const CONTEXT_NOTES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningSource {
    Heuristic,
    Generative,
    Hybrid,
}

impl ReasoningSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningSource::Heuristic => "heuristic",
            ReasoningSource::Generative => "generative",
            ReasoningSource::Hybrid => "hybrid",
        }
    }
}

/// One analyzer verdict, keyed by the document it judges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub document_ref: DocumentId,
    pub entity_id: String,
    pub score: f64,
    pub matched_signals: BTreeSet<String>,
    pub reasoning_source: ReasoningSource,
    pub is_dealish: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Result of consulting (or not) the generative collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum Escalation {
    /// Heuristic score outside the ambiguous band.
    NotNeeded,
    Disabled,
    Unavailable(String),
    Verdict(Verdict),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionPolicy {
    pub threshold: f64,
    pub band_min: f64,
    pub band_max: f64,
    pub blend_weight: f64,
    pub strategy: BlendStrategy,
}

impl From<&AnalyzerConfig> for DecisionPolicy {
    fn from(c: &AnalyzerConfig) -> Self {
        Self {
            threshold: c.threshold,
            band_min: c.band_min,
            band_max: c.band_max,
            blend_weight: c.blend_weight,
            strategy: c.strategy,
        }
    }
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::from(&AnalyzerConfig::default())
    }
}

impl DecisionPolicy {
    /// Inclusive on both ends.
    pub fn in_band(&self, score: f64) -> bool {
        score >= self.band_min && score <= self.band_max
    }

    pub fn is_dealish(&self, score: f64) -> bool {
        score >= self.threshold
    }

    /// Final score and its source for one heuristic result and escalation.
    pub fn combine(&self, heuristic: f64, esc: &Escalation) -> (f64, ReasoningSource) {
        match esc {
            Escalation::NotNeeded | Escalation::Disabled | Escalation::Unavailable(_) => {
                (heuristic, ReasoningSource::Heuristic)
            }
            Escalation::Verdict(v) => match self.strategy {
                BlendStrategy::Blend => {
                    let w = self.blend_weight;
                    (
                        ((1.0 - w) * heuristic + w * v.score).clamp(0.0, 1.0),
                        ReasoningSource::Hybrid,
                    )
                }
                BlendStrategy::Replace => (v.score.clamp(0.0, 1.0), ReasoningSource::Generative),
            },
        }
    }
}

/// Findings in input order plus what happened on the generative path.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub findings: Vec<Finding>,
    pub escalated: usize,
    pub degraded: Vec<(DocumentId, String)>,
}

impl Analysis {
    pub fn dealish(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_dealish)
    }
}

pub struct DealAnalyzer {
    rules: RuleSet,
    policy: DecisionPolicy,
    reasoner: DynReasoner,
    reason_timeout: Duration,
    memory: Option<Arc<ShortTermMemory>>,
}

impl DealAnalyzer {
    pub fn new(
        rules: RuleSet,
        policy: DecisionPolicy,
        reasoner: DynReasoner,
        reason_timeout: Duration,
    ) -> Self {
        Self {
            rules,
            policy,
            reasoner,
            reason_timeout,
            memory: None,
        }
    }

    /// Built-in rules unless `analyzer.rules_path` names a rule file.
    pub fn from_config(cfg: &RunConfig, reasoner: DynReasoner) -> Result<Self, PipelineError> {
        let rules = match cfg.analyzer.rules_path.as_deref() {
            Some(p) if !p.trim().is_empty() => rules::load_rules_file(Path::new(p.trim()))
                .map_err(|e| PipelineError::config(format!("rules file {p}: {e}")))?,
            _ => RuleSet::builtin(),
        };
        Ok(Self::new(
            rules,
            DecisionPolicy::from(&cfg.analyzer),
            reasoner,
            Duration::from_secs(cfg.timeouts.reason_secs),
        ))
    }

    pub fn with_memory(mut self, memory: Arc<ShortTermMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn heuristic(&self, doc: &Document) -> Heuristic {
        self.rules.evaluate(doc)
    }

    async fn escalate(&self, doc: &Document, h: &Heuristic, notes: &[String]) -> Escalation {
        if !self.policy.in_band(h.score) {
            return Escalation::NotNeeded;
        }
        if !self.reasoner.is_enabled() {
            return Escalation::Disabled;
        }
        let ctx = ReasoningContext {
            heuristic_score: h.score,
            matched_signals: h.matched.iter().cloned().collect(),
            recent_notes: notes.to_vec(),
        };
        match tokio::time::timeout(self.reason_timeout, self.reasoner.reason(doc, &ctx)).await {
            Ok(Ok(v)) if v.score.is_finite() => Escalation::Verdict(v),
            Ok(Ok(_)) => Escalation::Unavailable("reasoner returned a non-finite score".into()),
            Ok(Err(e)) => Escalation::Unavailable(format!("{e:#}")),
            Err(_) => Escalation::Unavailable(format!(
                "reasoner timed out after {}s",
                self.reason_timeout.as_secs_f64()
            )),
        }
    }

    /// Score every document. Never fails; generative problems end up in
    /// `Analysis::degraded`.
    pub async fn analyze(&self, docs: &[Document]) -> Analysis {
        let notes: Vec<String> = self
            .memory
            .as_ref()
            .map(|m| {
                m.recent(MEMORY_KEY, CONTEXT_NOTES)
                    .into_iter()
                    .map(|n| n.note)
                    .collect()
            })
            .unwrap_or_default();

        let mut out = Analysis::default();
        for doc in docs {
            let h = self.heuristic(doc);
            let esc = self.escalate(doc, &h, &notes).await;
            let (score, source) = self.policy.combine(h.score, &esc);

            let explanation = match &esc {
                Escalation::Verdict(v) => {
                    out.escalated += 1;
                    Some(v.explanation.clone()).filter(|e| !e.is_empty())
                }
                Escalation::Unavailable(cause) => {
                    tracing::warn!(
                        target: "analyze",
                        doc = %doc.id(),
                        provider = self.reasoner.provider_name(),
                        error = %cause,
                        "reasoner unavailable, using heuristic score"
                    );
                    out.degraded.push((doc.id().clone(), cause.clone()));
                    None
                }
                Escalation::NotNeeded | Escalation::Disabled => None,
            };

            out.findings.push(Finding {
                document_ref: doc.id().clone(),
                entity_id: doc.entity_id().to_string(),
                score,
                matched_signals: h.matched,
                reasoning_source: source,
                is_dealish: self.policy.is_dealish(score),
                explanation,
            });
        }

        let dealish = out.dealish().count();
        counter!("analyzer_findings_total").increment(out.findings.len() as u64);
        counter!("analyzer_dealish_total").increment(dealish as u64);
        counter!("analyzer_escalations_total").increment(out.escalated as u64);
        counter!("analyzer_degraded_total").increment(out.degraded.len() as u64);

        if let Some(m) = &self.memory {
            m.note(
                MEMORY_KEY,
                format!(
                    "Scored {} docs: {} deal-ish, {} escalated, {} degraded",
                    out.findings.len(),
                    dealish,
                    out.escalated,
                    out.degraded.len()
                ),
            );
        }
        out
    }
}
