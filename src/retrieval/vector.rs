// src/retrieval/vector.rs
//! Persistent vector corpus shared across runs.
//!
//! Layout: `{index_dir}/corpus.json` holding schema version, embedding
//! model id, dimension and entries keyed by document identity. Upserts are
//! serialized through a write lock and persisted with temp file + rename,
//! so readers never observe a partially written corpus.
//!
//! Runs in one process share a single [`VectorStore`] per directory via
//! [`VectorStore::shared`]. Each upsert folds in whatever is on disk first,
//! so a second handle on the same directory does not erase entries.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};

use super::embed::cosine;
use crate::document::{Document, DocumentId};

pub const CORPUS_SCHEMA_VERSION: u32 = 1;
pub const CORPUS_FILE: &str = "corpus.json";

/// Open corpora by canonical directory.
static OPEN_STORES: Lazy<Mutex<HashMap<PathBuf, Weak<VectorStore>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorpusEntry {
    document: Document,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CorpusFile {
    schema_version: u32,
    model_id: String,
    dimension: usize,
    entries: BTreeMap<DocumentId, CorpusEntry>,
}

#[derive(Debug)]
pub struct VectorStore {
    dir: PathBuf,
    model_id: String,
    dimension: usize,
    corpus: RwLock<CorpusFile>,
}

impl VectorStore {
    /// Open the corpus in `dir`, bootstrapping an empty one if none exists.
    pub async fn open(dir: impl Into<PathBuf>, model_id: &str, dimension: usize) -> Result<Self> {
        let dir = dir.into();
        let corpus = match read_corpus(&dir).await? {
            Some(c) => {
                check_compatible(&c, model_id, dimension)?;
                c
            }
            None => {
                let c = CorpusFile {
                    schema_version: CORPUS_SCHEMA_VERSION,
                    model_id: model_id.to_string(),
                    dimension,
                    entries: BTreeMap::new(),
                };
                persist(&dir, &c).await?;
                tracing::info!(target: "retrieval", dir = %dir.display(), "bootstrapped empty vector corpus");
                c
            }
        };

        Ok(Self {
            dir,
            model_id: model_id.to_string(),
            dimension,
            corpus: RwLock::new(corpus),
        })
    }

    /// Process-wide handle on the corpus in `dir`. Every caller naming the
    /// same directory gets the same instance while any handle is alive.
    pub async fn shared(
        dir: impl Into<PathBuf>,
        model_id: &str,
        dimension: usize,
    ) -> Result<Arc<Self>> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let key = tokio::fs::canonicalize(&dir)
            .await
            .with_context(|| format!("resolving {}", dir.display()))?;

        let mut open = OPEN_STORES.lock().await;
        open.retain(|_, w| w.strong_count() > 0);
        if let Some(store) = open.get(&key).and_then(Weak::upgrade) {
            if store.model_id != model_id || store.dimension != dimension {
                anyhow::bail!(
                    "corpus built with {} ({} dims), embedder is {} ({} dims)",
                    store.model_id,
                    store.dimension,
                    model_id,
                    dimension
                );
            }
            return Ok(store);
        }
        let store = Arc::new(Self::open(key.clone(), model_id, dimension).await?);
        open.insert(key, Arc::downgrade(&store));
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn len(&self) -> usize {
        self.corpus.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, id: &DocumentId) -> bool {
        self.corpus.read().await.entries.contains_key(id)
    }

    /// Insert or replace by identity. Returns the corpus size afterwards.
    ///
    /// The write lock is held across persistence; the in-memory corpus is
    /// only swapped once the file is durably written.
    pub async fn upsert(&self, entries: Vec<(Document, Vec<f32>)>) -> Result<usize> {
        for (doc, v) in &entries {
            if v.len() != self.dimension {
                anyhow::bail!(
                    "vector for {} has {} dims, corpus expects {}",
                    doc.id(),
                    v.len(),
                    self.dimension
                );
            }
        }
        let mut guard = self.corpus.write().await;
        let mut next = guard.clone();
        if let Some(on_disk) = read_corpus(&self.dir).await? {
            check_compatible(&on_disk, &self.model_id, self.dimension)?;
            next.entries.extend(on_disk.entries);
        }
        for (document, vector) in entries {
            next.entries
                .insert(document.id().clone(), CorpusEntry { document, vector });
        }
        persist(&self.dir, &next).await?;
        *guard = next;
        Ok(guard.entries.len())
    }

    /// `k` nearest by cosine similarity, ties by identity order.
    pub async fn nearest(&self, query: &[f32], entity: Option<&str>, k: usize) -> Vec<Document> {
        if k == 0 {
            return Vec::new();
        }
        let guard = self.corpus.read().await;
        // BTreeMap iteration is identity-ordered, so a stable sort keeps ties that way.
        let mut scored: Vec<(f32, &CorpusEntry)> = guard
            .entries
            .values()
            .filter(|e| entity.map_or(true, |ent| e.document.metadata().is_entity(ent)))
            .map(|e| (cosine(query, &e.vector), e))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored
            .into_iter()
            .take(k)
            .map(|(_, e)| e.document.clone())
            .collect()
    }
}

async fn read_corpus(dir: &Path) -> Result<Option<CorpusFile>> {
    let path = dir.join(CORPUS_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("parsing {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn check_compatible(c: &CorpusFile, model_id: &str, dimension: usize) -> Result<()> {
    if c.schema_version != CORPUS_SCHEMA_VERSION {
        anyhow::bail!(
            "corpus schema {} unsupported (expected {})",
            c.schema_version,
            CORPUS_SCHEMA_VERSION
        );
    }
    if c.model_id != model_id || c.dimension != dimension {
        anyhow::bail!(
            "corpus built with {} ({} dims), embedder is {} ({} dims)",
            c.model_id,
            c.dimension,
            model_id,
            dimension
        );
    }
    Ok(())
}

async fn persist(dir: &Path, corpus: &CorpusFile) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let bytes = serde_json::to_vec(corpus).context("serializing corpus")?;
    // Unique per writer so concurrent persists never share a temp file.
    let tmp = dir.join(format!(
        "{CORPUS_FILE}.{}.{}.tmp",
        std::process::id(),
        TMP_SEQ.fetch_add(1, AtomicOrdering::Relaxed)
    ));
    tokio::fs::write(&tmp, &bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, dir.join(CORPUS_FILE))
        .await
        .context("renaming corpus into place")?;
    Ok(())
}
