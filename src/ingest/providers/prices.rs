// src/ingest/providers/prices.rs
//! Daily price/volume snapshot per entity, attached to that entity's
//! documents as `last_close`, `change_5d` and `volume_shock`.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

use crate::document::{keys, Document};

/// Yahoo Finance chart endpoint, one month of daily bars.
pub const DEFAULT_PRICE_URL: &str =
    "https://query1.finance.yahoo.com/v8/finance/chart/{entity}?range=1mo&interval=1d";

/// Sessions looked back for the relative change.
const CHANGE_WINDOW: usize = 5;
/// Trailing sessions averaged for the volume shock.
const VOLUME_WINDOW: usize = 20;

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSnapshot {
    pub last_close: f64,
    /// Relative change over the last five sessions (0.12 == +12%).
    pub change_5d: f64,
    /// Latest volume over the trailing 20-session mean. `None` with too
    /// little history.
    pub volume_shock: Option<f64>,
}

impl PriceSnapshot {
    /// Derive the snapshot from daily series, oldest first. Gaps are skipped.
    pub fn from_series(closes: &[Option<f64>], volumes: &[Option<f64>]) -> Option<Self> {
        let closes: Vec<f64> = closes
            .iter()
            .flatten()
            .copied()
            .filter(|c| c.is_finite() && *c > 0.0)
            .collect();
        let last_close = *closes.last()?;
        let base = closes[closes.len().saturating_sub(CHANGE_WINDOW + 1)];
        let change_5d = last_close / base - 1.0;

        let volumes: Vec<f64> = volumes
            .iter()
            .flatten()
            .copied()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .collect();
        let volume_shock = if volumes.len() < VOLUME_WINDOW {
            None
        } else {
            let tail = &volumes[volumes.len() - VOLUME_WINDOW..];
            let mean = tail.iter().sum::<f64>() / VOLUME_WINDOW as f64;
            (mean > 0.0).then(|| tail[VOLUME_WINDOW - 1] / mean)
        };

        Some(Self {
            last_close,
            change_5d,
            volume_shock,
        })
    }

    /// Parse a chart JSON body. `Ok(None)` when it carries no usable bars.
    pub fn parse_chart(body: &str) -> Result<Option<Self>> {
        let resp: ChartResponse = serde_json::from_str(body).context("parsing chart json")?;
        if let Some(err) = resp.chart.error.filter(|e| !e.is_null()) {
            anyhow::bail!("chart error: {err}");
        }
        let quote = resp
            .chart
            .result
            .and_then(|r| r.into_iter().next())
            .and_then(|r| r.indicators.quote.into_iter().next())
            .unwrap_or_default();
        Ok(Self::from_series(&quote.close, &quote.volume))
    }

    /// Copy the snapshot onto every document.
    pub fn annotate(&self, docs: Vec<Document>) -> Vec<Document> {
        docs.into_iter()
            .map(|d| {
                let d = d
                    .with_extra(keys::LAST_CLOSE, self.last_close)
                    .with_extra(keys::CHANGE_5D, self.change_5d);
                match self.volume_shock {
                    Some(v) => d.with_extra(keys::VOLUME_SHOCK, v),
                    None => d,
                }
            })
            .collect()
    }
}

enum Mode {
    Fixture(HashMap<String, String>),
    Http {
        url_template: String,
        client: reqwest::Client,
    },
}

/// Market snapshot lookup per entity.
pub struct PriceSource {
    mode: Mode,
}

impl PriceSource {
    /// `url_template` must contain `{entity}`.
    pub fn from_url_template(url_template: impl Into<String>) -> Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains("{entity}") {
            anyhow::bail!("price url template must contain {{entity}}: {url_template}");
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("deal-intel/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building price http client")?;
        Ok(Self {
            mode: Mode::Http {
                url_template,
                client,
            },
        })
    }

    /// Serve chart JSON from memory, keyed by entity id (case-insensitive).
    pub fn from_fixtures<I, K, V>(fixtures: I) -> Self
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
            mode: Mode::Fixture(map),
        }
    }

    pub async fn snapshot(&self, entity: &str) -> Result<Option<PriceSnapshot>> {
        let body = match &self.mode {
            Mode::Fixture(map) => match map.get(&entity.trim().to_ascii_uppercase()) {
                Some(b) => b.clone(),
                None => return Ok(None),
            },
            Mode::Http {
                url_template,
                client,
            } => {
                let url = url_template.replace("{entity}", entity.trim());
                client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("price http get {url}"))?
                    .error_for_status()
                    .context("price http status")?
                    .text()
                    .await
                    .context("price http .text()")?
            }
        };
        PriceSnapshot::parse_chart(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart(closes: &[f64], volumes: &[f64]) -> String {
        serde_json::json!({
            "chart": {
                "result": [{ "indicators": { "quote": [{ "close": closes, "volume": volumes }] } }],
                "error": null
            }
        })
        .to_string()
    }

    #[test]
    fn change_uses_five_sessions_back() {
        let closes = [90.0, 100.0, 101.0, 102.0, 103.0, 104.0, 112.0];
        let snap = PriceSnapshot::from_series(
            &closes.iter().copied().map(Some).collect::<Vec<_>>(),
            &[],
        )
        .unwrap();
        assert_eq!(snap.last_close, 112.0);
        assert!((snap.change_5d - 0.12).abs() < 1e-9);
        assert_eq!(snap.volume_shock, None);
    }

    #[test]
    fn volume_shock_against_trailing_mean() {
        let mut vols = vec![Some(1_000.0); 19];
        vols.insert(3, None);
        vols.push(Some(4_800.0));
        let snap = PriceSnapshot::from_series(&[Some(10.0)], &vols).unwrap();
        // (19 * 1000 + 4800) / 20 = 1190
        assert!((snap.volume_shock.unwrap() - 4_800.0 / 1_190.0).abs() < 1e-9);
        assert_eq!(snap.change_5d, 0.0);
    }

    #[test]
    fn empty_or_errored_charts() {
        assert_eq!(PriceSnapshot::parse_chart(&chart(&[], &[])).unwrap(), None);
        let err = r#"{"chart":{"result":null,"error":{"code":"Not Found"}}}"#;
        assert!(PriceSnapshot::parse_chart(err).is_err());
        assert!(PriceSnapshot::parse_chart("<html>").is_err());
    }

    #[tokio::test]
    async fn fixtures_annotate_documents() {
        let src = PriceSource::from_fixtures([("acme", chart(&[100.0, 100.0, 88.0], &[]))]);
        let snap = src.snapshot("ACME").await.unwrap().unwrap();
        assert!(src.snapshot("OTHER").await.unwrap().is_none());

        let docs = snap.annotate(vec![Document::news("ACME", "ACME slides").unwrap()]);
        let md = docs[0].metadata();
        assert_eq!(md.number(keys::LAST_CLOSE), Some(88.0));
        assert!((md.number(keys::CHANGE_5D).unwrap() + 0.12).abs() < 1e-9);
        assert_eq!(md.number(keys::VOLUME_SHOCK), None);
    }

    #[test]
    fn url_template_requires_placeholder() {
        assert!(PriceSource::from_url_template("https://x.test/chart").is_err());
    }
}
