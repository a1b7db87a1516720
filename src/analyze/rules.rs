//! Heuristic deal-signal rules.
//!
//! Minimal JSON DSL, all text matching case-insensitive on word boundaries:
//! - `any_contains`: match if ANY of phrases appears
//! - `all_contains`: match if ALL of phrases appear
//! - `not_contains`: match if NONE of phrases appear
//! - `min_len`:      match if content length >= min_len (chars)
//! - `source`:       "news" | "filing"
//! - `form_in`:      filing form is one of the listed forms
//! - `min_abs_change`:   |change_5d| >= value
//! - `min_volume_shock`: volume_shock >= value
//!
//! A matching rule contributes its `weight`; weights combine as a noisy-OR,
//! `1 - Π(1 - w)`, evaluated in rule order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::{fs, io, path::Path};

use crate::document::{keys, Document, SourceKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub weight: f64,
    #[serde(default)]
    pub when: When,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct When {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any_contains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all_contains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_contains: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_len: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_in: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_abs_change: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_volume_shock: Option<f64>,
}

impl When {
    fn is_empty(&self) -> bool {
        self == &When::default()
    }
}

/// Heuristic verdict for one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Heuristic {
    pub score: f64,
    pub matched: BTreeSet<String>,
}

pub const ACQUISITION_VOCABULARY: &str = "acquisition_vocabulary";
pub const DEAL_PROCESS_LANGUAGE: &str = "deal_process_language";
pub const RESTRUCTURING_VOCABULARY: &str = "restructuring_vocabulary";
pub const DEAL_FILING_FORM: &str = "deal_filing_form";
pub const MATERIAL_AGREEMENT_8K: &str = "material_agreement_8k";
pub const RUMOR_LANGUAGE: &str = "rumor_language";
pub const PRICE_ANOMALY: &str = "price_anomaly";
pub const VOLUME_SHOCK: &str = "volume_shock";

fn phrases(list: &[&str]) -> Option<Vec<String>> {
    Some(list.iter().map(|s| s.to_string()).collect())
}

impl RuleSet {
    pub fn builtin() -> Self {
        let rule = |name: &str, weight: f64, when: When| Rule {
            name: name.to_string(),
            weight,
            when,
        };
        RuleSet {
            rules: vec![
                rule(
                    ACQUISITION_VOCABULARY,
                    0.6,
                    When {
                        any_contains: phrases(&[
                            "merger",
                            "mergers",
                            "merge",
                            "merges",
                            "merging",
                            "acquisition",
                            "acquisitions",
                            "acquire",
                            "acquires",
                            "acquired",
                            "acquiring",
                            "takeover",
                            "takeovers",
                            "buyout",
                            "buy-out",
                            "business combination",
                        ]),
                        ..When::default()
                    },
                ),
                rule(
                    DEAL_PROCESS_LANGUAGE,
                    0.35,
                    When {
                        any_contains: phrases(&[
                            "definitive agreement",
                            "tender offer",
                            "strategic alternatives",
                            "strategic review",
                            "in talks",
                            "bid for",
                            "offer for",
                            "to buy",
                            "agreed to buy",
                        ]),
                        ..When::default()
                    },
                ),
                rule(
                    RESTRUCTURING_VOCABULARY,
                    0.4,
                    When {
                        any_contains: phrases(&[
                            "spac",
                            "special purpose acquisition",
                            "spin-off",
                            "spinoff",
                            "divestiture",
                            "divest",
                            "carve-out",
                        ]),
                        ..When::default()
                    },
                ),
                rule(
                    DEAL_FILING_FORM,
                    0.7,
                    When {
                        source: Some(SourceKind::Filing),
                        form_in: phrases(&[
                            "425", "S-4", "F-4", "DEFM14A", "SC TO-T", "SC 13D", "SC 13D/A",
                        ]),
                        ..When::default()
                    },
                ),
                rule(
                    MATERIAL_AGREEMENT_8K,
                    0.6,
                    When {
                        source: Some(SourceKind::Filing),
                        form_in: phrases(&["8-K"]),
                        any_contains: phrases(&["material definitive agreement"]),
                        ..When::default()
                    },
                ),
                rule(
                    RUMOR_LANGUAGE,
                    0.15,
                    When {
                        any_contains: phrases(&[
                            "rumor",
                            "rumors",
                            "rumour",
                            "reportedly",
                            "people familiar",
                            "explore sale",
                            "exploring a sale",
                        ]),
                        ..When::default()
                    },
                ),
                rule(
                    PRICE_ANOMALY,
                    0.15,
                    When {
                        min_abs_change: Some(0.10),
                        ..When::default()
                    },
                ),
                rule(
                    VOLUME_SHOCK,
                    0.2,
                    When {
                        min_volume_shock: Some(3.0),
                        ..When::default()
                    },
                ),
            ],
        }
    }

    /// Rules must be named, unique, weighted in [0, 1] and carry a condition.
    pub fn validate(&self) -> Result<(), String> {
        let mut names = BTreeSet::new();
        for r in &self.rules {
            if r.name.trim().is_empty() {
                return Err("rule without a name".to_string());
            }
            if !names.insert(r.name.as_str()) {
                return Err(format!("duplicate rule name '{}'", r.name));
            }
            if !(r.weight.is_finite() && (0.0..=1.0).contains(&r.weight)) {
                return Err(format!("rule '{}' weight {} outside [0, 1]", r.name, r.weight));
            }
            if r.when.is_empty() {
                return Err(format!("rule '{}' has no conditions", r.name));
            }
        }
        Ok(())
    }

    /// Noisy-OR over matching rules. Pure function of document and rules.
    pub fn evaluate(&self, doc: &Document) -> Heuristic {
        let text = normalize(doc.content());
        let mut keep = 1.0f64;
        let mut matched = BTreeSet::new();
        for rule in &self.rules {
            if matches_when(&text, doc, &rule.when) {
                keep *= 1.0 - rule.weight;
                matched.insert(rule.name.clone());
            }
        }
        Heuristic {
            score: (1.0 - keep).clamp(0.0, 1.0),
            matched,
        }
    }
}

pub fn load_rules_file(path: &Path) -> io::Result<RuleSet> {
    let bytes = fs::read(path)?;
    let rules: RuleSet = serde_json::from_slice(&bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    rules
        .validate()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(rules)
}

// --- internals ---

fn matches_when(text: &str, doc: &Document, w: &When) -> bool {
    let md = doc.metadata();
    if let Some(src) = w.source {
        if md.source != src {
            return false;
        }
    }
    if let Some(forms) = &w.form_in {
        let Some(form) = md.form() else { return false };
        if !forms.iter().any(|f| f.trim().eq_ignore_ascii_case(form.trim())) {
            return false;
        }
    }
    if let Some(min) = w.min_abs_change {
        match md.number(keys::CHANGE_5D) {
            Some(c) if c.abs() >= min => {}
            _ => return false,
        }
    }
    if let Some(min) = w.min_volume_shock {
        match md.number(keys::VOLUME_SHOCK) {
            Some(v) if v >= min => {}
            _ => return false,
        }
    }
    if let Some(min) = w.min_len {
        if doc.content().chars().count() < min {
            return false;
        }
    }
    if let Some(v) = &w.any_contains {
        if !v.iter().any(|p| contains(text, p)) {
            return false;
        }
    }
    if let Some(v) = &w.all_contains {
        if !v.iter().all(|p| contains(text, p)) {
            return false;
        }
    }
    if let Some(v) = &w.not_contains {
        if v.iter().any(|p| contains(text, p)) {
            return false;
        }
    }
    true
}

/// Whole-word phrase match: both sides normalized and space padded.
fn contains(text: &str, pat: &str) -> bool {
    let p = normalize(pat);
    if p.is_empty() {
        return true;
    }
    format!(" {text} ").contains(&format!(" {p} "))
}

/// Lowercase; anything but alphanumerics and '-' becomes a single space.
fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = true;
    for ch in input.chars() {
        if ch.is_alphanumeric() || ch == '-' {
            out.extend(ch.to_lowercase());
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Metadata;

    fn filing(form: &str, text: &str) -> Document {
        Document::new(
            text,
            Metadata::new(SourceKind::Filing, "ACME").with(keys::FORM, form),
        )
        .unwrap()
    }

    #[test]
    fn builtin_rules_validate() {
        RuleSet::builtin().validate().unwrap();
    }

    #[test]
    fn acquisition_headline_hits_vocabulary() {
        let d = Document::news("ACME", "ACME announces acquisition of Widget Co in merger deal")
            .unwrap();
        let h = RuleSet::builtin().evaluate(&d);
        assert!(h.matched.contains(ACQUISITION_VOCABULARY));
        assert!((h.score - 0.6).abs() < 1e-12);
    }

    #[test]
    fn word_boundaries_prevent_partial_hits() {
        let d = Document::news("ACME", "Emerging markets rally; spacious offices").unwrap();
        let h = RuleSet::builtin().evaluate(&d);
        assert!(h.matched.is_empty(), "{:?}", h.matched);
        assert_eq!(h.score, 0.0);
    }

    #[test]
    fn filing_rules_need_form_and_source() {
        let rules = RuleSet::builtin();
        let h = rules.evaluate(&filing("425", "ACME filed 425: communication"));
        assert!(h.matched.contains(DEAL_FILING_FORM));

        let h = rules.evaluate(&filing(
            "8-K",
            "Item 1.01 Entry into a Material Definitive Agreement",
        ));
        assert!(h.matched.contains(MATERIAL_AGREEMENT_8K));
        assert!(h.matched.contains(DEAL_PROCESS_LANGUAGE));

        let news = Document::news("ACME", "Material definitive agreement signed").unwrap();
        assert!(!rules.evaluate(&news).matched.contains(MATERIAL_AGREEMENT_8K));
    }

    #[test]
    fn market_anomalies_read_metadata() {
        let d = Document::new(
            "ACME shares move",
            Metadata::new(SourceKind::News, "ACME")
                .with(keys::CHANGE_5D, -0.12)
                .with(keys::VOLUME_SHOCK, 3.5),
        )
        .unwrap();
        let h = RuleSet::builtin().evaluate(&d);
        assert!(h.matched.contains(PRICE_ANOMALY));
        assert!(h.matched.contains(VOLUME_SHOCK));
        let expected = 1.0 - (1.0 - 0.15) * (1.0 - 0.2);
        assert!((h.score - expected).abs() < 1e-12);
    }

    #[test]
    fn validate_rejects_bad_rules() {
        let bad = RuleSet {
            rules: vec![Rule {
                name: "catch-all".into(),
                weight: 0.3,
                when: When::default(),
            }],
        };
        assert!(bad.validate().is_err());

        let heavy = RuleSet {
            rules: vec![Rule {
                name: "heavy".into(),
                weight: 1.3,
                when: When {
                    any_contains: Some(vec!["x".into()]),
                    ..When::default()
                },
            }],
        };
        assert!(heavy.validate().is_err());
    }

    #[test]
    fn rules_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("rules.json");
        std::fs::write(
            &p,
            r#"{"rules":[{"name":"tender","weight":0.5,"when":{"any_contains":["Tender Offer"]}}]}"#,
        )
        .unwrap();
        let rs = load_rules_file(&p).unwrap();
        let d = Document::news("ACME", "Rival launches tender   offer").unwrap();
        let h = rs.evaluate(&d);
        assert_eq!(h.score, 0.5);
        assert!(h.matched.contains("tender"));

        std::fs::write(&p, "{not json").unwrap();
        assert!(load_rules_file(&p).is_err());
    }
}
