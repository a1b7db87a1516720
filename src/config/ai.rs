// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path};

pub const PROVIDERS: &[&str] = &["openai", "mock"];

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_daily_limit() -> u32 {
    20
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_cache_dir() -> String {
    "data/ai_cache".to_string()
}

/// Generative collaborator settings (`[ai]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "openai" | "mock" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// OpenAI-compatible base URL; `None` means `OPENAI_BASE_URL` or api.openai.com.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    /// "ENV" means: read from OPENAI_API_KEY. Never written to snapshots.
    #[serde(default = "default_api_key", skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            daily_limit: default_daily_limit(),
            api_key: default_api_key(),
            cache_dir: default_cache_dir(),
        }
    }
}

impl AiConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut cfg: AiConfig = toml::from_str(&data)?;
        cfg.provider = cfg.provider.trim().to_lowercase();
        Ok(cfg)
    }

    /// Resolve the API key, reading the provider's env var when set to "ENV".
    pub fn resolve_api_key(&self) -> anyhow::Result<String> {
        if !self.api_key.trim().eq_ignore_ascii_case("env") {
            return Ok(self.api_key.trim().to_string());
        }
        match self.provider.as_str() {
            "openai" => env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("Missing OPENAI_API_KEY env var")),
            "mock" => Ok(String::new()),
            other => anyhow::bail!("Unsupported provider in config: {other}"),
        }
    }

    pub fn resolve_base_url(&self) -> String {
        self.base_url
            .clone()
            .or_else(|| env::var("OPENAI_BASE_URL").ok())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_disabled_with_env_key() {
        let cfg: AiConfig = toml::from_str("").unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.provider, "openai");
        assert_eq!(cfg.daily_limit, 20);
        assert_eq!(cfg.api_key, "ENV");
    }

    #[test]
    fn api_key_is_not_serialized() {
        let cfg = AiConfig {
            api_key: "sk-secret".into(),
            ..AiConfig::default()
        };
        let s = serde_json::to_string(&cfg).unwrap();
        assert!(!s.contains("sk-secret"));
    }

    #[test]
    fn explicit_key_wins_over_env() {
        let cfg = AiConfig {
            api_key: " sk-inline ".into(),
            ..AiConfig::default()
        };
        assert_eq!(cfg.resolve_api_key().unwrap(), "sk-inline");
    }
}
