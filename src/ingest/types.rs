// src/ingest/types.rs
use anyhow::Result;

use crate::document::Document;

/// Fetch-and-normalize adapter feeding the pipeline.
///
/// Implementations return already normalized documents for one entity.
/// An `Err` only affects that entity; other entities are still fetched.
#[async_trait::async_trait]
pub trait IngestionSource: Send + Sync {
    async fn fetch(
        &self,
        entity_id: &str,
        limit: usize,
        use_secondary_source: bool,
    ) -> Result<Vec<Document>>;

    fn name(&self) -> &'static str;
}

/// Per-entity fetch outcome, in configured entity order.
#[derive(Debug, Clone)]
pub struct EntityFailure {
    pub entity_id: String,
    pub cause: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub documents: Vec<Document>,
    pub failures: Vec<EntityFailure>,
    /// Documents dropped because their identity was already seen.
    pub duplicates: usize,
}
