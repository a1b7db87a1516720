//! Generative-reasoning collaborator: provider abstraction + file cache + daily limit.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::AiConfig;
use crate::document::{Document, DocumentId};

/// Verdict returned by a reasoner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Deal likelihood in [0, 1].
    pub score: f64,
    pub explanation: String,
}

/// What the heuristic pass already knows about a document.
#[derive(Debug, Clone, Default)]
pub struct ReasoningContext {
    pub heuristic_score: f64,
    pub matched_signals: Vec<String>,
    /// Recent analyzer notes from short-term memory, oldest first.
    pub recent_notes: Vec<String>,
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(&self, doc: &Document, ctx: &ReasoningContext) -> Result<Verdict>;

    /// A disabled reasoner is never called by the analyzer.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

pub type DynReasoner = Arc<dyn Reasoner>;

/// Factory: build a reasoner according to config and environment variables.
///
/// * If `AI_TEST_MODE=mock`, returns a scripted neutral reasoner.
/// * Else if `config.enabled == false`, returns a disabled reasoner.
/// * Else builds the real provider (OpenAI) wrapped with caching + daily limit.
pub fn build_reasoner(config: &AiConfig) -> DynReasoner {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Arc::new(ScriptedReasoner::constant(Verdict {
            score: 0.5,
            explanation: "Neutral verdict (mock)".to_string(),
        }));
    }

    if !config.enabled {
        return Arc::new(DisabledReasoner);
    }

    match config.provider.as_str() {
        "openai" => match OpenAiReasoner::from_config(config) {
            Ok(provider) => Arc::new(CachingReasoner::new(
                provider,
                PathBuf::from(&config.cache_dir),
                config.daily_limit,
            )),
            Err(e) => {
                tracing::warn!(target: "analyze", error = %format!("{e:#}"), "openai reasoner unavailable, disabling");
                Arc::new(DisabledReasoner)
            }
        },
        "mock" => Arc::new(ScriptedReasoner::constant(Verdict {
            score: 0.5,
            explanation: "Neutral verdict (mock)".to_string(),
        })),
        other => {
            tracing::warn!(target: "analyze", provider = other, "unknown ai provider, disabling");
            Arc::new(DisabledReasoner)
        }
    }
}

// ------------------------------------------------------------
// Concrete reasoners
// ------------------------------------------------------------

/// Never called; the analyzer stays on the heuristic path.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledReasoner;

#[async_trait]
impl Reasoner for DisabledReasoner {
    async fn reason(&self, _doc: &Document, _ctx: &ReasoningContext) -> Result<Verdict> {
        anyhow::bail!("generative reasoning is disabled")
    }
    fn is_enabled(&self) -> bool {
        false
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Fixed verdicts, optionally per document; counts calls.
#[derive(Debug, Default)]
pub struct ScriptedReasoner {
    default: Option<Verdict>,
    by_doc: HashMap<DocumentId, Verdict>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedReasoner {
    pub fn constant(v: Verdict) -> Self {
        Self {
            default: Some(v),
            ..Self::default()
        }
    }

    pub fn failing(cause: &str) -> Self {
        Self {
            failure: Some(cause.to_string()),
            ..Self::default()
        }
    }

    pub fn with_verdict(mut self, id: DocumentId, v: Verdict) -> Self {
        self.by_doc.insert(id, v);
        self
    }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn reason(&self, doc: &Document, _ctx: &ReasoningContext) -> Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if let Some(cause) = &self.failure {
            anyhow::bail!("{cause}");
        }
        self.by_doc
            .get(doc.id())
            .or(self.default.as_ref())
            .cloned()
            .context("no scripted verdict for document")
    }
    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

/// OpenAI-compatible chat completions.
pub struct OpenAiReasoner {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiReasoner {
    pub fn from_config(cfg: &AiConfig) -> Result<Self> {
        let api_key = cfg.resolve_api_key()?;
        if api_key.is_empty() {
            anyhow::bail!("empty api key");
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("deal-intel/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(30))
            .build()
            .context("building reasoner http client")?;
        Ok(Self {
            http,
            api_key,
            base_url: cfg.resolve_base_url(),
            model: std::env::var("OPENAI_MODEL")
                .ok()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| cfg.model.clone()),
        })
    }

    fn prompt(doc: &Document, ctx: &ReasoningContext) -> String {
        let md = doc.metadata();
        let mut p = format!(
            "Entity: {}\nSource: {}{}\nHeuristic score: {:.2}\nTriggered signals: {}\n",
            md.entity_id,
            md.source,
            md.form().map(|f| format!(" (form {f})")).unwrap_or_default(),
            ctx.heuristic_score,
            if ctx.matched_signals.is_empty() {
                "none".to_string()
            } else {
                ctx.matched_signals.join(", ")
            }
        );
        if !ctx.recent_notes.is_empty() {
            p.push_str("Recent analyst notes:\n");
            for n in &ctx.recent_notes {
                p.push_str("- ");
                p.push_str(n);
                p.push('\n');
            }
        }
        p.push_str("Text:\n");
        p.push_str(&doc.excerpt(1200));
        p
    }
}

#[async_trait]
impl Reasoner for OpenAiReasoner {
    async fn reason(&self, doc: &Document, ctx: &ReasoningContext) -> Result<Verdict> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let sys = "You are an M&A analyst. Decide whether the text signals a merger, acquisition or similar corporate deal. \
                   Reply with JSON only: {\"score\": <0..1>, \"explanation\": \"<one short sentence>\"}.";
        let user = Self::prompt(doc, ctx);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: sys,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.0,
            max_tokens: 120,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("chat completions http post")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("chat completions http {status}");
        }
        let body: Resp = resp.json().await.context("chat completions json")?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        parse_verdict(content).with_context(|| {
            format!(
                "unparseable verdict: {}",
                sanitize_explanation(content)
            )
        })
    }
    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

/// Tolerant verdict parsing: strips code fences and a leading `json` tag,
/// then reads the first `{...}` object. Scores are clamped to [0, 1].
pub fn parse_verdict(raw: &str) -> Option<Verdict> {
    #[derive(Deserialize)]
    struct Raw {
        score: f64,
        #[serde(default)]
        explanation: String,
    }
    let mut s = raw.trim();
    s = s.trim_start_matches("```").trim_end_matches("```").trim();
    if s.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("json")) {
        s = s[4..].trim_start();
    }
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end < start {
        return None;
    }
    let r: Raw = serde_json::from_str(&s[start..=end]).ok()?;
    if !r.score.is_finite() {
        return None;
    }
    Some(Verdict {
        score: r.score.clamp(0.0, 1.0),
        explanation: sanitize_explanation(&r.explanation),
    })
}

// ------------------------------------------------------------
// Caching wrapper (file cache + daily limit)
// ------------------------------------------------------------

/// Wraps a reasoner with a per-content file cache and a daily call limit.
pub struct CachingReasoner<R: Reasoner> {
    inner: R,
    cache_dir: PathBuf,
    daily_limit_max: u32,
    counter: Mutex<DailyCounter>,
}

impl<R: Reasoner> CachingReasoner<R> {
    pub fn new(inner: R, cache_dir: PathBuf, daily_limit_max: u32) -> Self {
        if let Err(e) = fs::create_dir_all(&cache_dir) {
            tracing::warn!(target: "analyze", error = %e, dir = %cache_dir.display(), "cannot create reasoner cache dir");
        }
        let counter = Mutex::new(load_daily_counter(&cache_dir).unwrap_or_default());
        Self {
            inner,
            cache_dir,
            daily_limit_max,
            counter,
        }
    }

    pub fn calls_today(&self) -> u32 {
        self.counter.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    fn cache_key(&self, doc: &Document) -> String {
        let mut h = Sha256::new();
        h.update(self.inner.provider_name().as_bytes());
        h.update([0u8]);
        h.update(doc.content().as_bytes());
        let digest = h.finalize();
        digest.iter().take(12).map(|b| format!("{b:02x}")).collect()
    }
}

#[async_trait]
impl<R: Reasoner> Reasoner for CachingReasoner<R> {
    async fn reason(&self, doc: &Document, ctx: &ReasoningContext) -> Result<Verdict> {
        // 1) Cache lookup; hits do not count against the limit.
        let key = self.cache_key(doc);
        if let Some(hit) = read_cache_file(&self.cache_dir, &key) {
            return Ok(hit);
        }

        // 2) Daily limit (only real calls increment).
        {
            let mut g = self.counter.lock().unwrap_or_else(|e| e.into_inner());
            if g.is_expired() {
                g.reset_to_today();
                let _ = save_daily_counter(&self.cache_dir, &g);
            }
            if g.count >= self.daily_limit_max {
                anyhow::bail!("daily limit of {} calls reached", self.daily_limit_max);
            }
        }

        // 3) Real call.
        let mut fresh = self.inner.reason(doc, ctx).await?;
        fresh.explanation = sanitize_explanation(&fresh.explanation);
        if let Err(e) = write_cache_file(&self.cache_dir, &key, &fresh) {
            tracing::debug!(target: "analyze", error = %e, "reasoner cache write failed");
        }
        let mut g = self.counter.lock().unwrap_or_else(|e| e.into_inner());
        g.count = g.count.saturating_add(1);
        let _ = save_daily_counter(&self.cache_dir, &g);
        Ok(fresh)
    }

    fn is_enabled(&self) -> bool {
        self.inner.is_enabled()
    }

    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }
}

fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{key}.json"))
}

fn read_cache_file(dir: &Path, key: &str) -> Option<Verdict> {
    let s = fs::read_to_string(cache_path(dir, key)).ok()?;
    serde_json::from_str(&s).ok()
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = fs::File::create(&tmp)?;
    f.write_all(bytes)?;
    fs::rename(tmp, path)
}

fn write_cache_file(dir: &Path, key: &str, value: &Verdict) -> io::Result<()> {
    let json = serde_json::to_vec(value).map_err(io::Error::other)?;
    write_atomic(&cache_path(dir, key), &json)
}

// ------------------------------------------------------------
// Daily counter helpers
// ------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyCounter {
    date: String,
    count: u32,
}

impl Default for DailyCounter {
    fn default() -> Self {
        Self {
            date: today(),
            count: 0,
        }
    }
}

impl DailyCounter {
    fn is_expired(&self) -> bool {
        self.date != today()
    }
    fn reset_to_today(&mut self) {
        self.date = today();
        self.count = 0;
    }
}

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

fn counter_path(dir: &Path) -> PathBuf {
    dir.join("daily_count.json")
}

fn load_daily_counter(dir: &Path) -> io::Result<DailyCounter> {
    let s = fs::read_to_string(counter_path(dir))?;
    serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn save_daily_counter(dir: &Path, dc: &DailyCounter) -> io::Result<()> {
    let json = serde_json::to_vec(dc).map_err(io::Error::other)?;
    write_atomic(&counter_path(dir), &json)
}

// ------------------------------------------------------------
// Sanitization
// ------------------------------------------------------------

/// Ensure ASCII-only, single line, and <=160 chars. Collapses whitespace.
pub fn sanitize_explanation(input: &str) -> String {
    let mut out = String::with_capacity(160);
    let mut prev_space = false;
    for ch in input.chars() {
        let c = match ch {
            '\r' | '\n' | '\t' => ' ',
            c if c.is_ascii() => c,
            _ => ' ',
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
        if out.len() >= 160 {
            break;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::news("ACME", "Acme explores options").unwrap()
    }

    #[test]
    fn parse_verdict_tolerates_fences() {
        let v = parse_verdict("```json\n{\"score\": 0.8, \"explanation\": \"Likely deal\"}\n```")
            .unwrap();
        assert_eq!(v.score, 0.8);
        assert_eq!(v.explanation, "Likely deal");
        assert_eq!(parse_verdict("{\"score\": 7}").unwrap().score, 1.0);
        assert!(parse_verdict("no json here").is_none());
    }

    #[test]
    fn sanitize_is_ascii_single_line_and_capped() {
        let s = sanitize_explanation("Line one\nline two \u{2014} done");
        assert_eq!(s, "Line one line two done");
        assert!(sanitize_explanation(&"x".repeat(400)).len() <= 160);
    }

    #[tokio::test]
    async fn disabled_reasoner_reports_disabled() {
        let r = DisabledReasoner;
        assert!(!r.is_enabled());
        assert!(r.reason(&doc(), &ReasoningContext::default()).await.is_err());
    }

    #[tokio::test]
    async fn caching_reasoner_hits_cache_and_enforces_limit() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = ScriptedReasoner::constant(Verdict {
            score: 0.7,
            explanation: "ok".into(),
        });
        let r = CachingReasoner::new(scripted, dir.path().to_path_buf(), 1);
        let ctx = ReasoningContext::default();

        assert_eq!(r.reason(&doc(), &ctx).await.unwrap().score, 0.7);
        assert_eq!(r.calls_today(), 1);
        // cache hit, no new call
        assert_eq!(r.reason(&doc(), &ctx).await.unwrap().score, 0.7);
        assert_eq!(r.calls_today(), 1);
        // different content needs a real call but the limit is spent
        let other = Document::news("ACME", "Different text").unwrap();
        assert!(r.reason(&other, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn scripted_reasoner_prefers_per_document_verdict() {
        let d = doc();
        let r = ScriptedReasoner::constant(Verdict {
            score: 0.1,
            explanation: "default".into(),
        })
        .with_verdict(
            d.id().clone(),
            Verdict {
                score: 0.9,
                explanation: "specific".into(),
            },
        );
        let v = r.reason(&d, &ReasoningContext::default()).await.unwrap();
        assert_eq!(v.score, 0.9);
        assert_eq!(r.calls(), 1);
    }
}
