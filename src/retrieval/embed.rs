// src/retrieval/embed.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::env;
use std::sync::Arc;

use super::lexical::tokenize;
use crate::config::{EmbedderKind, VectorConfig};

/// text -> fixed-length vector, deterministic for a pinned model.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
    /// Identifies model and version; persisted next to the vectors.
    fn model_id(&self) -> String;
}

/// Offline signed feature hashing over lowercase tokens.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for tok in tokenize(text) {
            let h = Sha256::digest(tok.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&h[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dim as u64) as usize;
            let sign = if h[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        l2_normalize(&mut v);
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> String {
        format!("hashing-v1-{}", self.dim)
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dim: usize,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String, dim: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            dim,
        }
    }

    /// `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_EMBED_MODEL`.
    pub fn from_env(cfg: &VectorConfig) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").context("Missing OPENAI_API_KEY env var")?;
        let base_url = env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let model = env::var("OPENAI_EMBED_MODEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| cfg.model.clone());
        Ok(Self::new(api_key, base_url, model, cfg.dimension))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dim,
        });
        let resp = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("embeddings http post")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("embeddings http {status}: {}", text.chars().take(200).collect::<String>());
        }
        let parsed: EmbeddingsResponse = resp.json().await.context("embeddings json")?;
        let mut v = parsed
            .data
            .into_iter()
            .next()
            .map(|r| r.embedding)
            .context("embeddings response has no data")?;
        if v.len() != self.dim {
            anyhow::bail!("embedding has {} dims, expected {}", v.len(), self.dim);
        }
        l2_normalize(&mut v);
        Ok(v)
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> String {
        format!("openai:{}:{}", self.model, self.dim)
    }
}

pub fn build_embedder(cfg: &VectorConfig) -> Result<Arc<dyn Embedder>> {
    Ok(match cfg.embedder {
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::new(cfg.dimension)),
        EmbedderKind::OpenAi => Arc::new(OpenAiEmbedder::from_env(cfg)?),
    })
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; 0 when either side is the zero vector or sizes differ.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0f32;
    let mut na = 0f32;
    let mut nb = 0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.embed_sync("Acme agrees merger with Widget");
        let b = e.embed_sync("Acme agrees merger with Widget");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_texts_score_higher() {
        let e = HashingEmbedder::new(256);
        let q = e.embed_sync("acme merger acquisition");
        let near = e.embed_sync("Acme announces merger and acquisition");
        let far = e.embed_sync("quarterly dividend unchanged");
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(16);
        let v = e.embed_sync("  ");
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine(&v, &v), 0.0);
    }
}
