// src/retrieval/mod.rs
//! One retrieval contract, two strategies selected once per run.

pub mod embed;
pub mod lexical;
pub mod vector;

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore};

use crate::config::{RetrievalMode, RunConfig};
use crate::document::{Document, DocumentId};
use crate::error::PipelineError;
use embed::Embedder;
use lexical::LexicalIndex;
use vector::VectorStore;

/// Vocabulary appended to per-entity queries.
pub const DEAL_QUERY_TERMS: &str =
    "merger acquisition acquire takeover buyout deal tender offer definitive agreement spin-off";

/// Concurrent embedding calls per index operation.
const EMBED_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub text: String,
    /// Restrict results to one entity (case-insensitive).
    pub entity: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>, entity: Option<&str>) -> Self {
        Self {
            text: text.into(),
            entity: entity.map(|e| e.trim().to_string()),
        }
    }

    /// Entity id plus deal vocabulary, scoped to that entity.
    pub fn for_entity(entity: &str) -> Self {
        Self::new(format!("{entity} {DEAL_QUERY_TERMS}"), Some(entity))
    }

    pub fn admits(&self, doc: &Document) -> bool {
        self.entity
            .as_deref()
            .map_or(true, |e| doc.metadata().is_entity(e))
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexOutcome {
    /// Documents newly added or replaced.
    pub indexed: usize,
    /// Documents left out because embedding failed or timed out.
    pub skipped: Vec<(DocumentId, String)>,
    pub corpus_size: usize,
}

pub enum RetrievalStrategy {
    Lexical(LexicalIndex),
    Vector(VectorRetriever),
}

impl RetrievalStrategy {
    /// `shared_store` lets several runs in one process reuse an open corpus.
    pub fn from_config(
        cfg: &RunConfig,
        embedder: Arc<dyn Embedder>,
        shared_store: Option<Arc<VectorStore>>,
    ) -> Self {
        match cfg.retrieval_mode {
            RetrievalMode::Lexical => RetrievalStrategy::Lexical(LexicalIndex::new()),
            RetrievalMode::Vector => RetrievalStrategy::Vector(VectorRetriever {
                index_dir: cfg.vector.index_dir.clone().into(),
                embedder,
                store: OnceCell::new_with(shared_store),
                embed_timeout: Duration::from_secs(cfg.timeouts.embed_secs),
                io_timeout: Duration::from_secs(cfg.timeouts.index_io_secs),
            }),
        }
    }

    pub fn mode(&self) -> RetrievalMode {
        match self {
            RetrievalStrategy::Lexical(_) => RetrievalMode::Lexical,
            RetrievalStrategy::Vector(_) => RetrievalMode::Vector,
        }
    }

    pub async fn index(&mut self, docs: &[Document]) -> Result<IndexOutcome, PipelineError> {
        match self {
            RetrievalStrategy::Lexical(idx) => {
                let indexed = idx.index(docs);
                Ok(IndexOutcome {
                    indexed,
                    skipped: Vec::new(),
                    corpus_size: idx.len(),
                })
            }
            RetrievalStrategy::Vector(v) => v.index(docs).await,
        }
    }

    /// At most `k` documents, best first.
    pub async fn query(&self, q: &Query, k: usize) -> Result<Vec<Document>, PipelineError> {
        let out = match self {
            RetrievalStrategy::Lexical(idx) => idx.query(q, k),
            RetrievalStrategy::Vector(v) => v.query(q, k).await?,
        };
        counter!("retrieval_documents_total", "mode" => self.mode().as_str())
            .increment(out.len() as u64);
        Ok(out)
    }
}

/// Vector strategy: lazily opened store plus the embedding collaborator.
pub struct VectorRetriever {
    index_dir: std::path::PathBuf,
    embedder: Arc<dyn Embedder>,
    store: OnceCell<Arc<VectorStore>>,
    embed_timeout: Duration,
    io_timeout: Duration,
}

impl VectorRetriever {
    async fn store(&self) -> Result<&Arc<VectorStore>, PipelineError> {
        self.store
            .get_or_try_init(|| async {
                let model_id = self.embedder.model_id();
                let open = VectorStore::shared(
                    self.index_dir.clone(),
                    &model_id,
                    self.embedder.dimension(),
                );
                match tokio::time::timeout(self.io_timeout, open).await {
                    Ok(Ok(s)) => Ok(s),
                    Ok(Err(e)) => Err(PipelineError::retrieval(format!("{e:#}"))),
                    Err(_) => Err(PipelineError::retrieval("opening vector corpus timed out")),
                }
            })
            .await
    }

    async fn index(&self, docs: &[Document]) -> Result<IndexOutcome, PipelineError> {
        let store = self.store().await?;
        if store.model_id() != self.embedder.model_id()
            || store.dimension() != self.embedder.dimension()
        {
            return Err(PipelineError::retrieval(format!(
                "shared corpus uses {} but embedder is {}",
                store.model_id(),
                self.embedder.model_id()
            )));
        }

        let gate = Arc::new(Semaphore::new(EMBED_CONCURRENCY));
        let handles: Vec<_> = docs
            .iter()
            .map(|doc| {
                let embedder = Arc::clone(&self.embedder);
                let gate = Arc::clone(&gate);
                let text = doc.content().to_string();
                let timeout = self.embed_timeout;
                tokio::spawn(async move {
                    let _permit = gate.acquire_owned().await.map_err(|e| e.to_string())?;
                    match tokio::time::timeout(timeout, embedder.embed(&text)).await {
                        Ok(Ok(v)) => Ok(v),
                        Ok(Err(e)) => Err(format!("{e:#}")),
                        Err(_) => Err("embedding timed out".to_string()),
                    }
                })
            })
            .collect();

        let mut entries = Vec::with_capacity(docs.len());
        let mut skipped = Vec::new();
        for (doc, handle) in docs.iter().zip(handles) {
            match handle.await {
                Ok(Ok(v)) => entries.push((doc.clone(), v)),
                Ok(Err(cause)) => skipped.push((doc.id().clone(), cause)),
                Err(e) => skipped.push((doc.id().clone(), format!("embedding task aborted: {e}"))),
            }
        }
        for (id, cause) in &skipped {
            tracing::warn!(target: "retrieval", doc = %id, error = %cause, "embedding failed, document skipped");
        }

        let indexed = entries.len();
        let corpus_size = if entries.is_empty() {
            store.len().await
        } else {
            match tokio::time::timeout(self.io_timeout, store.upsert(entries)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(PipelineError::retrieval(format!("{e:#}"))),
                Err(_) => return Err(PipelineError::retrieval("corpus upsert timed out")),
            }
        };

        Ok(IndexOutcome {
            indexed,
            skipped,
            corpus_size,
        })
    }

    async fn query(&self, q: &Query, k: usize) -> Result<Vec<Document>, PipelineError> {
        let store = self.store().await?;
        let qv = match tokio::time::timeout(self.embed_timeout, self.embedder.embed(&q.text)).await
        {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                return Err(PipelineError::retrieval(format!("query embedding failed: {e:#}")))
            }
            Err(_) => return Err(PipelineError::retrieval("query embedding timed out")),
        };
        Ok(store.nearest(&qv, q.entity.as_deref(), k).await)
    }
}
