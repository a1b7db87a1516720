// src/retrieval/lexical.rs
//! In-memory BM25 over the documents of the current run.
//!
//! Scoring: `idf(t) * tf * (k1 + 1) / (tf + k1 * (1 - b + b * len / avgdl))`
//! with `idf(t) = ln(1 + (N - df + 0.5) / (df + 0.5))`. Only documents that
//! share a query term are returned; ties keep ingestion order.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::Query;
use crate::document::{Document, DocumentId};

pub const K1: f64 = 1.2;
pub const B: f64 = 0.75;

/// Lowercase alphanumeric runs; hyphenated words stay joined ("spin-off").
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .map(|t| t.trim_matches('-'))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[derive(Debug, Clone)]
struct Posting {
    doc: Document,
    tf: HashMap<String, u32>,
    len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LexicalIndex {
    postings: Vec<Posting>,
    ids: HashSet<DocumentId>,
    df: HashMap<String, usize>,
    total_len: usize,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.postings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.postings.is_empty()
    }

    /// Append documents in order. Already indexed identities are skipped.
    /// Returns how many were added.
    pub fn index(&mut self, docs: &[Document]) -> usize {
        let mut added = 0;
        for doc in docs {
            if !self.ids.insert(doc.id().clone()) {
                continue;
            }
            let mut tf: HashMap<String, u32> = HashMap::new();
            let mut len = 0usize;
            for tok in tokenize(doc.content()) {
                *tf.entry(tok).or_insert(0) += 1;
                len += 1;
            }
            for term in tf.keys() {
                *self.df.entry(term.clone()).or_insert(0) += 1;
            }
            self.total_len += len;
            self.postings.push(Posting {
                doc: doc.clone(),
                tf,
                len,
            });
            added += 1;
        }
        added
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.postings.len() as f64;
        let df = self.df.get(term).copied().unwrap_or(0) as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn score(&self, terms: &[String], p: &Posting, avgdl: f64) -> f64 {
        let mut s = 0.0;
        for t in terms {
            let Some(&tf) = p.tf.get(t) else { continue };
            let tf = tf as f64;
            let norm = 1.0 - B + B * (p.len as f64) / avgdl;
            s += self.idf(t) * tf * (K1 + 1.0) / (tf + K1 * norm);
        }
        s
    }

    /// Top `k` documents for `query`, best first.
    pub fn query(&self, query: &Query, k: usize) -> Vec<Document> {
        if k == 0 || self.postings.is_empty() {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        let terms: Vec<String> = tokenize(&query.text)
            .filter(|t| seen.insert(t.clone()))
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }
        let avgdl = (self.total_len as f64 / self.postings.len() as f64).max(1.0);

        let mut scored: Vec<(f64, usize)> = self
            .postings
            .iter()
            .enumerate()
            .filter(|(_, p)| query.admits(&p.doc))
            .map(|(i, p)| (self.score(&terms, p, avgdl), i))
            .filter(|(s, _)| *s > 0.0)
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(_, i)| self.postings[i].doc.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(entity: &str, text: &str) -> Document {
        Document::news(entity, text).unwrap()
    }

    #[test]
    fn tokenize_keeps_hyphenated_words() {
        let toks: Vec<_> = tokenize("ACME's spin-off -- $2B deal!").collect();
        assert_eq!(toks, vec!["acme", "s", "spin-off", "2b", "deal"]);
    }

    #[test]
    fn reindexing_same_identity_is_noop() {
        let mut idx = LexicalIndex::new();
        let d = doc("ACME", "acme merger");
        assert_eq!(idx.index(&[d.clone(), d.clone()]), 1);
        assert_eq!(idx.index(&[d]), 0);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn ranks_by_term_weight_and_filters_entity() {
        let mut idx = LexicalIndex::new();
        idx.index(&[
            doc("ACME", "acme quarterly results"),
            doc("ACME", "acme merger merger talks"),
            doc("WIDG", "widget merger"),
        ]);
        let got = idx.query(&Query::new("merger", Some("acme")), 5);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].content(), "acme merger merger talks");
    }

    #[test]
    fn ties_keep_ingestion_order() {
        let mut idx = LexicalIndex::new();
        idx.index(&[
            doc("ACME", "deal one"),
            doc("ACME", "deal two"),
            doc("ACME", "deal six"),
        ]);
        let got = idx.query(&Query::new("deal", None), 2);
        let texts: Vec<_> = got.iter().map(|d| d.content()).collect();
        assert_eq!(texts, vec!["deal one", "deal two"]);
    }

    #[test]
    fn k_zero_and_unknown_terms_return_nothing() {
        let mut idx = LexicalIndex::new();
        idx.index(&[doc("ACME", "merger")]);
        assert!(idx.query(&Query::new("merger", None), 0).is_empty());
        assert!(idx.query(&Query::new("dividend", None), 3).is_empty());
    }
}
