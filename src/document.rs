//! # Document Model
//! One ingested text unit (headline, filing line) plus typed metadata.
//!
//! Documents are immutable once built. Identity is derived from
//! `(source, link)` when a link exists, otherwise from `(source, content)`,
//! so re-ingesting the same item always yields the same [`DocumentId`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known keys of the extension map.
pub mod keys {
    /// SEC form type of a filing (e.g. "8-K", "425").
    pub const FORM: &str = "form";
    /// News publisher name.
    pub const PUBLISHER: &str = "publisher";
    /// Five-day relative price change (0.12 == +12%).
    pub const CHANGE_5D: &str = "change_5d";
    /// Latest volume divided by trailing average volume.
    pub const VOLUME_SHOCK: &str = "volume_shock";
    /// Most recent daily close.
    pub const LAST_CLOSE: &str = "last_close";
}

/// Origin of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    News,
    Filing,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::News => "news",
            SourceKind::Filing => "filing",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar value for source-specific attributes without a dedicated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for MetaValue {
    fn from(v: &str) -> Self {
        MetaValue::Text(v.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(v: String) -> Self {
        MetaValue::Text(v)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Number(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Flag(v)
    }
}

/// Closed set of recognized fields plus an explicit extension map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub source: SourceKind,
    /// Ticker or other identifier of the tracked entity.
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, MetaValue>,
}

impl Metadata {
    pub fn new(source: SourceKind, entity_id: impl Into<String>) -> Self {
        Self {
            source,
            entity_id: entity_id.into(),
            published_at: None,
            link: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn published_at(mut self, ts: DateTime<Utc>) -> Self {
        self.published_at = Some(ts);
        self
    }

    pub fn link(mut self, link: impl Into<String>) -> Self {
        let link = link.into();
        if !link.trim().is_empty() {
            self.link = Some(link.trim().to_string());
        }
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.extra.get(key) {
            Some(MetaValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        match self.extra.get(key) {
            Some(MetaValue::Number(n)) if n.is_finite() => Some(*n),
            _ => None,
        }
    }

    /// Filing form type, if this is a filing document.
    pub fn form(&self) -> Option<&str> {
        self.text(keys::FORM)
    }

    pub fn is_entity(&self, entity: &str) -> bool {
        self.entity_id.trim().eq_ignore_ascii_case(entity.trim())
    }
}

/// Stable identity of a document (hex prefix of a SHA-256 digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Identity of `(source, link)` when a link exists, else `(source, content)`.
    pub fn derive(source: SourceKind, link: Option<&str>, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update([0u8]);
        match link.map(str::trim).filter(|l| !l.is_empty()) {
            Some(l) => {
                hasher.update(b"link:");
                hasher.update(l.as_bytes());
            }
            None => {
                hasher.update(b"content:");
                hasher.update(content.as_bytes());
            }
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(32);
        for b in digest.iter().take(16) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("document content is empty")]
    EmptyContent,
    #[error("document has no entity id")]
    MissingEntity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    content: String,
    metadata: Metadata,
}

impl Document {
    pub fn new(content: impl Into<String>, metadata: Metadata) -> Result<Self, DocumentError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(DocumentError::EmptyContent);
        }
        if metadata.entity_id.trim().is_empty() {
            return Err(DocumentError::MissingEntity);
        }
        let id = DocumentId::derive(metadata.source, metadata.link.as_deref(), &content);
        Ok(Self {
            id,
            content,
            metadata,
        })
    }

    /// Shorthand for a news headline without a link.
    pub fn news(entity_id: &str, content: &str) -> Result<Self, DocumentError> {
        Self::new(content, Metadata::new(SourceKind::News, entity_id))
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn entity_id(&self) -> &str {
        &self.metadata.entity_id
    }

    /// Same document with one more extension value. Identity is unchanged.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata = self.metadata.with(key, value);
        self
    }

    /// First `max` chars of the content, for narratives and prompts.
    pub fn excerpt(&self, max: usize) -> String {
        if self.content.chars().count() <= max {
            return self.content.clone();
        }
        let mut s: String = self.content.chars().take(max).collect();
        s.push_str("...");
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_prefers_link_over_content() {
        let a = Document::new(
            "Acme agrees to buy Widget",
            Metadata::new(SourceKind::News, "ACME").link("https://x.test/1"),
        )
        .unwrap();
        let b = Document::new(
            "Acme agrees to buy Widget (updated)",
            Metadata::new(SourceKind::News, "ACME").link("https://x.test/1"),
        )
        .unwrap();
        assert_eq!(a.id(), b.id());

        let c = Document::new(
            "Acme agrees to buy Widget",
            Metadata::new(SourceKind::Filing, "ACME").link("https://x.test/1"),
        )
        .unwrap();
        assert_ne!(a.id(), c.id(), "source is part of identity");
    }

    #[test]
    fn identity_falls_back_to_content() {
        let a = Document::news("ACME", "Same text").unwrap();
        let b = Document::news("ACME", "Same text").unwrap();
        let c = Document::news("ACME", "Other text").unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().as_str().len(), 32);
    }

    #[test]
    fn empty_content_is_rejected() {
        assert_eq!(
            Document::news("ACME", "   ").unwrap_err(),
            DocumentError::EmptyContent
        );
        assert_eq!(
            Document::news(" ", "text").unwrap_err(),
            DocumentError::MissingEntity
        );
    }

    #[test]
    fn extension_map_roundtrips_typed_values() {
        let md = Metadata::new(SourceKind::Filing, "ACME")
            .with(keys::FORM, "8-K")
            .with(keys::CHANGE_5D, 0.12);
        let v = serde_json::to_value(&md).unwrap();
        assert_eq!(v["extra"]["form"], serde_json::json!("8-K"));
        let back: Metadata = serde_json::from_value(v).unwrap();
        assert_eq!(back.form(), Some("8-K"));
        assert_eq!(back.number(keys::CHANGE_5D), Some(0.12));
    }
}
