// src/config/run.rs
//! Frozen per-run configuration: TOML file, then env overrides, then validation.

use serde::{Deserialize, Serialize};
use std::{env, fmt, fs, path::Path, str::FromStr};

use super::ai::{AiConfig, PROVIDERS};
use crate::error::PipelineError;

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";
pub const ENV_CONFIG_PATH: &str = "DEAL_CONFIG_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Lexical,
    Vector,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Lexical => "lexical",
            RetrievalMode::Vector => "vector",
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lexical" | "bm25" => Ok(RetrievalMode::Lexical),
            "vector" | "faiss" => Ok(RetrievalMode::Vector),
            other => Err(PipelineError::config(format!(
                "unknown retrieval mode '{other}' (expected lexical|vector)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendStrategy {
    /// `(1 - w) * heuristic + w * verdict`
    #[default]
    Blend,
    /// Verdict score replaces the heuristic score.
    Replace,
}

fn default_entities() -> Vec<String> {
    vec!["AAPL".into(), "MSFT".into(), "NVDA".into()]
}
fn default_top_k() -> usize {
    8
}
fn default_news_limit() -> usize {
    25
}
fn default_threshold() -> f64 {
    0.5
}
fn default_band_min() -> f64 {
    0.40
}
fn default_band_max() -> f64 {
    0.60
}
fn default_blend_weight() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// `is_dealish = score >= threshold`
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Ambiguous band that triggers escalation (inclusive).
    #[serde(default = "default_band_min")]
    pub band_min: f64,
    #[serde(default = "default_band_max")]
    pub band_max: f64,
    #[serde(default = "default_blend_weight")]
    pub blend_weight: f64,
    #[serde(default)]
    pub strategy: BlendStrategy,
    /// JSON rule file replacing the built-in rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            band_min: default_band_min(),
            band_max: default_band_max(),
            blend_weight: default_blend_weight(),
            strategy: BlendStrategy::default(),
            rules_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    #[default]
    Hashing,
    OpenAi,
}

fn default_index_dir() -> String {
    "data/vector_index".to_string()
}
fn default_dimension() -> usize {
    256
}
fn default_embed_model() -> String {
    "text-embedding-3-small".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default = "default_index_dir")]
    pub index_dir: String,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default)]
    pub embedder: EmbedderKind,
    /// Model name for the remote embedder.
    #[serde(default = "default_embed_model")]
    pub model: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            index_dir: default_index_dir(),
            dimension: default_dimension(),
            embedder: EmbedderKind::default(),
            model: default_embed_model(),
        }
    }
}

fn default_fetch_secs() -> u64 {
    15
}
fn default_embed_secs() -> u64 {
    10
}
fn default_reason_secs() -> u64 {
    20
}
fn default_index_io_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_fetch_secs")]
    pub fetch_secs: u64,
    #[serde(default = "default_embed_secs")]
    pub embed_secs: u64,
    #[serde(default = "default_reason_secs")]
    pub reason_secs: u64,
    #[serde(default = "default_index_io_secs")]
    pub index_io_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_secs: default_fetch_secs(),
            embed_secs: default_embed_secs(),
            reason_secs: default_reason_secs(),
            index_io_secs: default_index_io_secs(),
        }
    }
}

fn default_report_dir() -> String {
    "data/outputs".to_string()
}
fn default_checkpoint_dir() -> String {
    "data/checkpoints".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_report_dir")]
    pub report_dir: String,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            report_dir: default_report_dir(),
            checkpoint_dir: default_checkpoint_dir(),
        }
    }
}

fn default_max_entries() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_entities")]
    pub entities: Vec<String>,
    #[serde(default)]
    pub retrieval_mode: RetrievalMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub checkpoint: bool,
    /// Also fetch filings (secondary source).
    #[serde(default)]
    pub use_secondary_source: bool,
    #[serde(default = "default_news_limit")]
    pub news_limit: usize,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            entities: default_entities(),
            retrieval_mode: RetrievalMode::default(),
            top_k: default_top_k(),
            checkpoint: false,
            use_secondary_source: false,
            news_limit: default_news_limit(),
            analyzer: AnalyzerConfig::default(),
            ai: AiConfig::default(),
            vector: VectorConfig::default(),
            timeouts: TimeoutConfig::default(),
            output: OutputConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&data)
            .map_err(|e| PipelineError::config(format!("cannot parse {}: {e}", path.display())))
    }

    /// `DEAL_CONFIG_PATH` (or `config/pipeline.toml`), env overrides, validation.
    /// A missing default file falls back to built-in defaults; a missing
    /// explicitly named file is an error.
    pub fn load() -> Result<Self, PipelineError> {
        let cfg = match env::var(ENV_CONFIG_PATH) {
            Ok(p) if !p.trim().is_empty() => Self::load_from_file(p.trim())?,
            _ if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load_from_file(DEFAULT_CONFIG_PATH)?
            }
            _ => {
                tracing::info!(target: "pipeline", "no config file, using defaults");
                Self::default()
            }
        };
        cfg.with_env_overrides()?.finalize()
    }

    /// Apply `TICKERS`, `TOP_K`, `RETRIEVAL_MODE`, `USE_SEC`, `NEWS_LIMIT`,
    /// `CHECKPOINT` and `DEAL_THRESHOLD` from the process environment.
    pub fn with_env_overrides(mut self) -> Result<Self, PipelineError> {
        if let Some(v) = env_value("TICKERS") {
            self.entities = split_entities(&v);
        }
        if let Some(v) = env_value("RETRIEVAL_MODE") {
            self.retrieval_mode = v.parse()?;
        }
        if let Some(v) = env_parse::<usize>("TOP_K")? {
            self.top_k = v;
        }
        if let Some(v) = env_parse::<usize>("NEWS_LIMIT")? {
            self.news_limit = v;
        }
        if let Some(v) = env_flag("USE_SEC")? {
            self.use_secondary_source = v;
        }
        if let Some(v) = env_flag("CHECKPOINT")? {
            self.checkpoint = v;
        }
        if let Some(v) = env_parse::<f64>("DEAL_THRESHOLD")? {
            self.analyzer.threshold = v;
        }
        Ok(self)
    }

    /// Normalize entity ids and validate. The result is the frozen run config.
    pub fn finalize(mut self) -> Result<Self, PipelineError> {
        let mut seen = std::collections::HashSet::new();
        self.entities = self
            .entities
            .iter()
            .map(|e| e.trim().to_ascii_uppercase())
            .filter(|e| !e.is_empty())
            .filter(|e| seen.insert(e.clone()))
            .collect();
        self.ai.provider = self.ai.provider.trim().to_ascii_lowercase();
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.entities.is_empty() {
            return Err(PipelineError::config("at least one entity is required"));
        }
        if let Some(bad) = self.entities.iter().find(|e| e.trim().is_empty()) {
            return Err(PipelineError::config(format!("empty entity id '{bad}'")));
        }
        if self.top_k == 0 {
            return Err(PipelineError::config("top_k must be >= 1"));
        }
        if self.news_limit == 0 {
            return Err(PipelineError::config("news_limit must be >= 1"));
        }

        let a = &self.analyzer;
        unit_interval("analyzer.threshold", a.threshold)?;
        unit_interval("analyzer.band_min", a.band_min)?;
        unit_interval("analyzer.band_max", a.band_max)?;
        unit_interval("analyzer.blend_weight", a.blend_weight)?;
        if a.band_min > a.band_max {
            return Err(PipelineError::config(format!(
                "analyzer band is empty: band_min {} > band_max {}",
                a.band_min, a.band_max
            )));
        }

        if self.ai.enabled && !PROVIDERS.contains(&self.ai.provider.as_str()) {
            return Err(PipelineError::config(format!(
                "unsupported ai.provider '{}'",
                self.ai.provider
            )));
        }

        if self.retrieval_mode == RetrievalMode::Vector {
            if self.vector.index_dir.trim().is_empty() {
                return Err(PipelineError::config("vector.index_dir is required"));
            }
            if self.vector.dimension < 8 {
                return Err(PipelineError::config("vector.dimension must be >= 8"));
            }
        }

        let t = &self.timeouts;
        if [t.fetch_secs, t.embed_secs, t.reason_secs, t.index_io_secs].contains(&0) {
            return Err(PipelineError::config("timeouts must be > 0 seconds"));
        }
        if self.memory.max_entries == 0 {
            return Err(PipelineError::config("memory.max_entries must be >= 1"));
        }
        if self.output.report_dir.trim().is_empty() {
            return Err(PipelineError::config("output.report_dir is required"));
        }
        if self.checkpoint && self.output.checkpoint_dir.trim().is_empty() {
            return Err(PipelineError::config(
                "output.checkpoint_dir is required when checkpoint is on",
            ));
        }
        Ok(())
    }
}

/// "acme, Widget ,," -> ["ACME", "WIDGET"]
pub fn split_entities(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn unit_interval(name: &str, v: f64) -> Result<(), PipelineError> {
    if v.is_finite() && (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(PipelineError::config(format!("{name} must be within [0, 1], got {v}")))
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, PipelineError>
where
    T::Err: fmt::Display,
{
    match env_value(key) {
        None => Ok(None),
        Some(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PipelineError::config(format!("{key}='{v}': {e}"))),
    }
}

fn env_flag(key: &str) -> Result<Option<bool>, PipelineError> {
    match env_value(key) {
        None => Ok(None),
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(PipelineError::config(format!(
                "{key}='{other}' is not a boolean"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg: RunConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, RunConfig::default());
        assert_eq!(cfg.analyzer.threshold, 0.5);
        assert_eq!(cfg.retrieval_mode, RetrievalMode::Lexical);
    }

    #[test]
    fn sections_parse() {
        let cfg: RunConfig = toml::from_str(
            r#"
            entities = ["acme", "ACME", " widget "]
            retrieval_mode = "vector"
            top_k = 2

            [analyzer]
            threshold = 0.6
            strategy = "replace"

            [vector]
            index_dir = "/tmp/idx"
            embedder = "openai"
            "#,
        )
        .unwrap();
        let cfg = cfg.finalize().unwrap();
        assert_eq!(cfg.entities, vec!["ACME", "WIDGET"]);
        assert_eq!(cfg.retrieval_mode, RetrievalMode::Vector);
        assert_eq!(cfg.analyzer.strategy, BlendStrategy::Replace);
        assert_eq!(cfg.vector.embedder, EmbedderKind::OpenAi);
        assert_eq!(cfg.vector.dimension, 256);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        let cases: Vec<RunConfig> = vec![
            RunConfig {
                entities: vec![" ".into()],
                ..RunConfig::default()
            },
            RunConfig {
                top_k: 0,
                ..RunConfig::default()
            },
            RunConfig {
                analyzer: AnalyzerConfig {
                    threshold: 1.5,
                    ..AnalyzerConfig::default()
                },
                ..RunConfig::default()
            },
            RunConfig {
                analyzer: AnalyzerConfig {
                    band_min: 0.7,
                    band_max: 0.3,
                    ..AnalyzerConfig::default()
                },
                ..RunConfig::default()
            },
            RunConfig {
                timeouts: TimeoutConfig {
                    fetch_secs: 0,
                    ..TimeoutConfig::default()
                },
                ..RunConfig::default()
            },
        ];
        for cfg in cases {
            let err = cfg.finalize().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConfigurationError, "{err}");
        }
    }

    #[test]
    fn retrieval_mode_parses_aliases() {
        assert_eq!("BM25".parse::<RetrievalMode>().unwrap(), RetrievalMode::Lexical);
        assert_eq!("faiss".parse::<RetrievalMode>().unwrap(), RetrievalMode::Vector);
        assert!("graph".parse::<RetrievalMode>().is_err());
    }

    #[test]
    fn split_entities_trims_and_uppercases() {
        assert_eq!(split_entities("acme, Widget ,,"), vec!["ACME", "WIDGET"]);
    }
}
