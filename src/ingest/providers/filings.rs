// src/ingest/providers/filings.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use crate::document::{keys, Document, Metadata, SourceKind};
use crate::ingest::normalize_text;
use crate::ingest::types::IngestionSource;

pub const SUBMISSIONS_URL: &str = "https://data.sec.gov/submissions/CIK{cik}.json";

/// Forms that typically accompany M&A activity.
pub const DEAL_FORMS: &[&str] = &[
    "8-K", "425", "DEFM14A", "SC TO-T", "F-4", "S-4", "SC 13D", "SC 13D/A",
];

#[derive(Debug, Deserialize, Default)]
struct Submissions {
    #[serde(default)]
    filings: Filings,
}

#[derive(Debug, Deserialize, Default)]
struct Filings {
    #[serde(default)]
    recent: Recent,
}

/// Column-oriented arrays, one index per filing.
#[derive(Debug, Deserialize, Default)]
struct Recent {
    #[serde(default)]
    form: Vec<String>,
    #[serde(default, rename = "filingDate")]
    filing_date: Vec<String>,
    #[serde(default, rename = "accessionNumber")]
    accession_number: Vec<String>,
    #[serde(default, rename = "primaryDocDescription")]
    primary_doc_description: Vec<String>,
    #[serde(default)]
    items: Vec<String>,
}

enum Mode {
    Fixture(HashMap<String, String>),
    Http { client: reqwest::Client },
}

/// SEC EDGAR submissions per entity (entity id -> CIK).
pub struct FilingsSource {
    ciks: HashMap<String, String>,
    mode: Mode,
}

/// "ACME=320193, widget=0000789019" -> {ACME: 0000320193, WIDGET: 0000789019}
pub fn parse_cik_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim().to_ascii_uppercase();
            let v = v.trim();
            if k.is_empty() || v.is_empty() || !v.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            Some((k, format!("{v:0>10}")))
        })
        .collect()
}

impl FilingsSource {
    /// `user_agent` is required by SEC fair-access rules ("Name email@host").
    pub fn new(ciks: HashMap<String, String>, user_agent: &str) -> Result<Self> {
        if user_agent.trim().is_empty() {
            anyhow::bail!("SEC_USER_AGENT must be set for filings ingestion");
        }
        let client = reqwest::Client::builder()
            .user_agent(user_agent.trim())
            .build()
            .context("building sec http client")?;
        Ok(Self {
            ciks: normalize_keys(ciks),
            mode: Mode::Http { client },
        })
    }

    /// Serve submissions JSON from memory, keyed by entity id.
    pub fn from_fixtures<I, K, V>(ciks: HashMap<String, String>, fixtures: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let map = fixtures
            .into_iter()
            .map(|(k, v)| (k.as_ref().trim().to_ascii_uppercase(), v.into()))
            .collect();
        Self {
            ciks: normalize_keys(ciks),
            mode: Mode::Fixture(map),
        }
    }

    pub fn knows(&self, entity: &str) -> bool {
        self.ciks.contains_key(&entity.trim().to_ascii_uppercase())
    }

    /// Keep only deal-relevant forms; newest first as delivered by EDGAR.
    pub fn parse_submissions(
        entity: &str,
        cik: &str,
        json: &str,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let subs: Submissions = serde_json::from_str(json).context("parsing sec submissions")?;
        let r = subs.filings.recent;
        let mut out = Vec::new();

        for (i, form) in r.form.iter().enumerate() {
            if out.len() >= limit {
                break;
            }
            let form = form.trim();
            if !DEAL_FORMS.iter().any(|f| f.eq_ignore_ascii_case(form)) {
                continue;
            }
            let date = r.filing_date.get(i).map(|s| s.trim()).unwrap_or_default();
            let desc = r
                .primary_doc_description
                .get(i)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .unwrap_or(form);
            let items = r.items.get(i).map(|s| s.trim()).unwrap_or_default();

            let mut text = format!("{entity} filed {form} on {date}: {desc}");
            if form.eq_ignore_ascii_case("8-K") && items.split(',').any(|it| it.trim() == "1.01") {
                text.push_str(". Item 1.01 Entry into a Material Definitive Agreement");
            }

            let mut md = Metadata::new(SourceKind::Filing, entity).with(keys::FORM, form);
            if let Some(ts) = NaiveDate::parse_from_str(date, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
            {
                md = md.published_at(Utc.from_utc_datetime(&ts));
            }
            if let Some(acc) = r.accession_number.get(i).filter(|a| !a.trim().is_empty()) {
                let cik_num = cik.trim_start_matches('0');
                md = md.link(format!(
                    "https://www.sec.gov/Archives/edgar/data/{cik_num}/{}/",
                    acc.trim().replace('-', "")
                ));
            }
            out.push(Document::new(normalize_text(&text), md)?);
        }
        Ok(out)
    }
}

fn normalize_keys(ciks: HashMap<String, String>) -> HashMap<String, String> {
    ciks.into_iter()
        .map(|(k, v)| (k.trim().to_ascii_uppercase(), format!("{:0>10}", v.trim())))
        .collect()
}

#[async_trait]
impl IngestionSource for FilingsSource {
    async fn fetch(
        &self,
        entity_id: &str,
        limit: usize,
        _use_secondary_source: bool,
    ) -> Result<Vec<Document>> {
        let key = entity_id.trim().to_ascii_uppercase();
        let Some(cik) = self.ciks.get(&key) else {
            tracing::debug!(target: "ingest", entity = %key, "no CIK mapping, skipping filings");
            return Ok(Vec::new());
        };
        let json = match &self.mode {
            Mode::Fixture(map) => map.get(&key).cloned().unwrap_or_else(|| "{}".to_string()),
            Mode::Http { client } => {
                let url = SUBMISSIONS_URL.replace("{cik}", cik);
                client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("sec http get {url}"))?
                    .error_for_status()
                    .context("sec http status")?
                    .text()
                    .await
                    .context("sec http .text()")?
            }
        };
        Self::parse_submissions(&key, cik, &json, limit)
    }

    fn name(&self) -> &'static str {
        "sec"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON: &str = r#"{
      "cik": "320193",
      "filings": {"recent": {
        "form": ["10-Q", "8-K", "425", "4"],
        "filingDate": ["2025-05-01", "2025-06-02", "2025-06-03", "2025-06-04"],
        "accessionNumber": ["0000-25-1", "0000320193-25-000071", "0000320193-25-000072", ""],
        "primaryDocDescription": ["10-Q", "", "Merger communication", "4"],
        "items": ["", "1.01,9.01", "", ""]
      }}
    }"#;

    #[test]
    fn keeps_deal_forms_only() {
        let docs = FilingsSource::parse_submissions("ACME", "0000320193", JSON, 10).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].metadata().form(), Some("8-K"));
        assert!(docs[0]
            .content()
            .contains("Entry into a Material Definitive Agreement"));
        assert_eq!(
            docs[0].metadata().link.as_deref(),
            Some("https://www.sec.gov/Archives/edgar/data/320193/000032019325000071/")
        );
        assert_eq!(docs[1].metadata().form(), Some("425"));
        assert_eq!(docs[1].metadata().source, SourceKind::Filing);
    }

    #[test]
    fn cik_map_pads_and_skips_garbage() {
        let m = parse_cik_map("acme=320193, bad=x1, =5, widget = 789019");
        assert_eq!(m.get("ACME").map(String::as_str), Some("0000320193"));
        assert_eq!(m.get("WIDGET").map(String::as_str), Some("0000789019"));
        assert_eq!(m.len(), 2);
    }

    #[tokio::test]
    async fn unmapped_entity_yields_nothing() {
        let src = FilingsSource::from_fixtures(HashMap::new(), [("ACME", JSON)]);
        assert!(src.fetch("ACME", 5, true).await.unwrap().is_empty());
    }
}
