// src/ingest/providers/feed.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use std::collections::HashMap;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::document::{keys, Document, Metadata, SourceKind};
use crate::ingest::normalize_text;
use crate::ingest::types::IngestionSource;

/// Yahoo Finance per-ticker headline feed.
pub const DEFAULT_FEED_URL: &str =
    "https://feeds.finance.yahoo.com/rss/2.0/headline?s={entity}&region=US&lang=en-US";

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    source: Option<String>,
}

pub(crate) fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.unix_timestamp(), 0))
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

enum Mode {
    Fixture(HashMap<String, String>),
    Http {
        url_template: String,
        client: reqwest::Client,
    },
}

/// News headlines per entity from an RSS 2.0 feed.
pub struct FeedSource {
    mode: Mode,
}

impl FeedSource {
    /// `url_template` must contain `{entity}`.
    pub fn from_url_template(url_template: impl Into<String>) -> Result<Self> {
        let url_template = url_template.into();
        if !url_template.contains("{entity}") {
            anyhow::bail!("feed url template must contain {{entity}}: {url_template}");
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("deal-intel/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building feed http client")?;
        Ok(Self {
            mode: Mode::Http {
                url_template,
                client,
            },
        })
    }

    /// Serve XML from memory, keyed by entity id (case-insensitive).
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

    /// Parse one RSS document into normalized news documents for `entity`.
    pub fn parse_feed(entity: &str, xml: &str, limit: usize) -> Result<Vec<Document>> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(xml);
        let rss: Rss = from_str(&xml_clean).context("parsing rss xml")?;

        let mut out = Vec::with_capacity(rss.channel.item.len().min(limit));
        for it in rss.channel.item {
            if out.len() >= limit {
                break;
            }
            let text_raw = format!(
                "{}. {}",
                it.title.as_deref().unwrap_or_default(),
                it.description.as_deref().unwrap_or_default()
            );
            let text = normalize_text(&text_raw);
            if text.is_empty() {
                continue;
            }
            let mut md = Metadata::new(SourceKind::News, entity);
            if let Some(ts) = it.pub_date.as_deref().and_then(parse_rfc2822) {
                md = md.published_at(ts);
            }
            if let Some(link) = it.link {
                md = md.link(link);
            }
            if let Some(publisher) = it.source.filter(|s| !s.trim().is_empty()) {
                md = md.with(keys::PUBLISHER, publisher.trim());
            }
            out.push(Document::new(text, md)?);
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("ingest_parse_ms").record(ms);
        Ok(out)
    }

    async fn load_xml(&self, entity: &str) -> Result<String> {
        match &self.mode {
            Mode::Fixture(map) => Ok(map
                .get(&entity.trim().to_ascii_uppercase())
                .cloned()
                .unwrap_or_else(|| "<rss><channel></channel></rss>".to_string())),
            Mode::Http {
                url_template,
                client,
            } => {
                let url = url_template.replace("{entity}", entity.trim());
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .with_context(|| format!("feed http get {url}"))?
                    .error_for_status()
                    .context("feed http status")?;
                resp.text().await.context("feed http .text()")
            }
        }
    }
}

#[async_trait]
impl IngestionSource for FeedSource {
    async fn fetch(
        &self,
        entity_id: &str,
        limit: usize,
        _use_secondary_source: bool,
    ) -> Result<Vec<Document>> {
        let xml = self.load_xml(entity_id).await?;
        Self::parse_feed(entity_id, &xml, limit)
    }

    fn name(&self) -> &'static str {
        "feed"
    }
}
