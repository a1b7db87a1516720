// src/ingest/providers/mod.rs
pub mod feed;
pub mod filings;
pub mod fixed;
pub mod prices;

pub use feed::FeedSource;
pub use filings::FilingsSource;
pub use fixed::StaticSource;
pub use prices::{PriceSnapshot, PriceSource};

use anyhow::Result;
use async_trait::async_trait;
use std::env;

use crate::document::Document;
use crate::ingest::types::IngestionSource;

/// News feed plus optional SEC filings, as one ingestion source. When a
/// price source is attached, every document of an entity carries that
/// entity's market snapshot.
pub struct MarketSource {
    news: FeedSource,
    filings: Option<FilingsSource>,
    prices: Option<PriceSource>,
}

impl MarketSource {
    pub fn new(news: FeedSource, filings: Option<FilingsSource>) -> Self {
        Self {
            news,
            filings,
            prices: None,
        }
    }

    pub fn with_prices(mut self, prices: PriceSource) -> Self {
        self.prices = Some(prices);
        self
    }

    async fn annotate(&self, entity_id: &str, docs: Vec<Document>) -> Vec<Document> {
        let Some(prices) = &self.prices else {
            return docs;
        };
        if docs.is_empty() {
            return docs;
        }
        match prices.snapshot(entity_id).await {
            Ok(Some(snap)) => snap.annotate(docs),
            Ok(None) => docs,
            Err(e) => {
                tracing::warn!(
                    target: "ingest",
                    entity = %entity_id,
                    error = %format!("{e:#}"),
                    "price snapshot unavailable"
                );
                docs
            }
        }
    }

    /// `FEED_URL_TEMPLATE` (default Yahoo headlines); filings are wired only
    /// when both `SEC_CIKS` and `SEC_USER_AGENT` are set. Price snapshots
    /// come from `PRICE_URL_TEMPLATE` unless `USE_PRICES=false`.
    pub fn from_env() -> Result<Self> {
        let template = env::var("FEED_URL_TEMPLATE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| feed::DEFAULT_FEED_URL.to_string());
        let news = FeedSource::from_url_template(template)?;

        let ciks = env::var("SEC_CIKS")
            .map(|s| filings::parse_cik_map(&s))
            .unwrap_or_default();
        let ua = env::var("SEC_USER_AGENT").unwrap_or_default();
        let filings = if ciks.is_empty() {
            None
        } else if ua.trim().is_empty() {
            tracing::warn!(target: "ingest", "SEC_CIKS set without SEC_USER_AGENT; filings disabled");
            None
        } else {
            Some(FilingsSource::new(ciks, &ua)?)
        };

        let use_prices = env::var("USE_PRICES")
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);
        let mut source = Self::new(news, filings);
        if use_prices {
            let template = env::var("PRICE_URL_TEMPLATE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| prices::DEFAULT_PRICE_URL.to_string());
            source = source.with_prices(PriceSource::from_url_template(template)?);
        }
        Ok(source)
    }
}

#[async_trait]
impl IngestionSource for MarketSource {
    /// News first, then filings. Fails only when every consulted part failed.
    async fn fetch(
        &self,
        entity_id: &str,
        limit: usize,
        use_secondary_source: bool,
    ) -> Result<Vec<Document>> {
        let news = self.news.fetch(entity_id, limit, false).await;
        let filings = match (&self.filings, use_secondary_source) {
            (Some(f), true) => Some(f.fetch(entity_id, limit, true).await),
            _ => None,
        };

        let docs = match (news, filings) {
            (Ok(n), None) => n,
            (Err(e), None) => return Err(e),
            (Err(ne), Some(Err(fe))) => {
                return Err(ne.context(format!("filings also failed: {fe:#}")))
            }
            (n, Some(f)) => {
                let mut out = Vec::new();
                for part in [n, f] {
                    match part {
                        Ok(mut docs) => out.append(&mut docs),
                        Err(e) => tracing::warn!(
                            target: "ingest",
                            entity = %entity_id,
                            error = %format!("{e:#}"),
                            "partial source failure"
                        ),
                    }
                }
                out
            }
        };
        Ok(self.annotate(entity_id, docs).await)
    }

    fn name(&self) -> &'static str {
        "market"
    }
}
