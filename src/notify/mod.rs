// src/notify/mod.rs
//! Report delivery. Delivery is best effort: failures are logged under the
//! `notify` target and never change the outcome of a run.

pub mod email;
pub mod slack;

use async_trait::async_trait;
use std::sync::Arc;

use crate::report::Report;
pub use email::EmailNotifier;
pub use slack::SlackNotifier;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, report: &Report) -> anyhow::Result<()>;
    fn channel(&self) -> &'static str;
}

/// Subject line shared by every channel.
pub fn subject(report: &Report) -> String {
    format!(
        "Deal report {} ({} deal-ish)",
        report.generated_at.format("%Y-%m-%d"),
        report.stats.dealish
    )
}

/// Fan-out to every configured channel.
#[derive(Clone, Default)]
pub struct NotifierMux {
    channels: Vec<Arc<dyn Notifier>>,
}

fn env_true(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl NotifierMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// `SEND_SLACK=true` + `SLACK_WEBHOOK_URL`, `SEND_EMAIL=true` + `SMTP_*`.
    /// A channel that is switched on but misconfigured is logged and skipped.
    pub fn from_env() -> Self {
        let mut mux = Self::new();
        if env_true("SEND_SLACK") {
            match SlackNotifier::from_env() {
                Ok(s) => mux = mux.with(Arc::new(s)),
                Err(e) => tracing::warn!(target: "notify", error = %format!("{e:#}"), "slack disabled"),
            }
        }
        if env_true("SEND_EMAIL") {
            match EmailNotifier::from_env() {
                Ok(s) => mux = mux.with(Arc::new(s)),
                Err(e) => tracing::warn!(target: "notify", error = %format!("{e:#}"), "email disabled"),
            }
        }
        mux
    }

    pub fn with(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Returns how many channels accepted the report.
    pub async fn deliver(&self, report: &Report) -> usize {
        let mut ok = 0;
        for ch in &self.channels {
            match ch.send(report).await {
                Ok(()) => {
                    ok += 1;
                    tracing::info!(target: "notify", run_id = %report.run_id, channel = ch.channel(), "report delivered");
                }
                Err(e) => {
                    tracing::warn!(
                        target: "notify",
                        run_id = %report.run_id,
                        channel = ch.channel(),
                        error = %format!("{e:#}"),
                        "delivery failed"
                    );
                }
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::report::ReportAssembler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize, bool);

    #[async_trait]
    impl Notifier for Counting {
        async fn send(&self, _report: &Report) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.1 {
                Ok(())
            } else {
                anyhow::bail!("webhook returned 500")
            }
        }
        fn channel(&self) -> &'static str {
            "test"
        }
    }

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let good = Arc::new(Counting(AtomicUsize::new(0), true));
        let bad = Arc::new(Counting(AtomicUsize::new(0), false));
        let mux = NotifierMux::new().with(bad.clone()).with(good.clone());
        let r = ReportAssembler::assemble("run-n", &RunConfig::default(), 0, &[], &[], &[]);

        assert_eq!(mux.deliver(&r).await, 1);
        assert_eq!(bad.0.load(Ordering::SeqCst), 1);
        assert_eq!(good.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subject_carries_dealish_count() {
        let r = ReportAssembler::assemble("run-s", &RunConfig::default(), 0, &[], &[], &[]);
        assert!(subject(&r).ends_with("(0 deal-ish)"));
    }
}
