// src/ingest/providers/fixed.rs
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::document::Document;
use crate::ingest::types::IngestionSource;

/// Fixed documents per entity. Used for replays, demos and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    docs: HashMap<String, Vec<Document>>,
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group documents by their own entity id.
    pub fn from_documents(docs: impl IntoIterator<Item = Document>) -> Self {
        let mut me = Self::new();
        for d in docs {
            me.docs
                .entry(key(d.entity_id()))
                .or_default()
                .push(d);
        }
        me
    }

    pub fn with_documents(mut self, entity: &str, docs: Vec<Document>) -> Self {
        self.docs.entry(key(entity)).or_default().extend(docs);
        self
    }

    /// Make `fetch` fail for `entity`.
    pub fn with_failure(mut self, entity: &str, cause: &str) -> Self {
        self.failures.insert(key(entity), cause.to_string());
        self
    }

    /// Delay `fetch` for `entity` (timeout tests).
    pub fn with_delay(mut self, entity: &str, delay: Duration) -> Self {
        self.delays.insert(key(entity), delay);
        self
    }
}

fn key(entity: &str) -> String {
    entity.trim().to_ascii_uppercase()
}

#[async_trait]
impl IngestionSource for StaticSource {
    async fn fetch(
        &self,
        entity_id: &str,
        limit: usize,
        _use_secondary_source: bool,
    ) -> Result<Vec<Document>> {
        let k = key(entity_id);
        if let Some(d) = self.delays.get(&k) {
            tokio::time::sleep(*d).await;
        }
        if let Some(cause) = self.failures.get(&k) {
            anyhow::bail!("{cause}");
        }
        Ok(self
            .docs
            .get(&k)
            .map(|v| v.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}
