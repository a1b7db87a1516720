use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use std::time::Duration;

use super::{subject, Notifier};
use crate::report::Report;

/// Slack caps message text well above this; keep posts readable.
const MAX_TEXT_CHARS: usize = 3500;

#[derive(Clone)]
pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn from_env() -> Result<Self> {
        let url = std::env::var("SLACK_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .context("SLACK_WEBHOOK_URL missing")?;
        Ok(Self::new(url))
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }
}

pub(crate) fn message_text(report: &Report) -> String {
    let mut body: String = report.text.chars().take(MAX_TEXT_CHARS).collect();
    if body.len() < report.text.len() {
        body.push_str("\n...");
    }
    format!("*{}*\n{}\n_{}_", subject(report), body, report.summary)
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, report: &Report) -> Result<()> {
        let payload = serde_json::json!({ "text": message_text(report) });

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook_url)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    Err(e) => anyhow!("slack webhook HTTP error: {e}"),
                },
                Err(e) => anyhow!("slack webhook request failed: {e}"),
            };
            if attempt >= self.max_retries {
                return Err(err);
            }
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }

    fn channel(&self) -> &'static str {
        "slack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::report::{ReportAssembler, NO_DEALS_TEXT};

    #[test]
    fn message_has_subject_body_and_summary() {
        let r = ReportAssembler::assemble("run-x", &RunConfig::default(), 0, &[], &[], &[]);
        let text = message_text(&r);
        assert!(text.starts_with("*Deal report "));
        assert!(text.contains(NO_DEALS_TEXT));
        assert!(text.ends_with(&format!("_{}_", r.summary)));
    }
}
