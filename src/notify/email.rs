use anyhow::{Context, Result};
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::{subject, Notifier};
use crate::report::Report;

pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

fn required(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("{key} missing"))
}

impl EmailNotifier {
    /// `SMTP_HOST`, `SMTP_USER`, `SMTP_PASS`, `NOTIFY_EMAIL_FROM`, `NOTIFY_EMAIL_TO`.
    pub fn from_env() -> Result<Self> {
        let host = required("SMTP_HOST")?;
        let creds = Credentials::new(required("SMTP_USER")?, required("SMTP_PASS")?);
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)
            .with_context(|| format!("invalid SMTP_HOST '{host}'"))?
            .credentials(creds)
            .build();

        let from = required("NOTIFY_EMAIL_FROM")?
            .parse()
            .context("invalid NOTIFY_EMAIL_FROM")?;
        let to = required("NOTIFY_EMAIL_TO")?
            .parse()
            .context("invalid NOTIFY_EMAIL_TO")?;

        Ok(Self { mailer, from, to })
    }
}

pub(crate) fn build_message(from: Mailbox, to: Mailbox, report: &Report) -> Result<Message> {
    let body = format!(
        "{}\n\n{}\nRun: {}\nGenerated (UTC): {}\n",
        report.text,
        report.summary,
        report.run_id,
        report.generated_at.to_rfc3339()
    );
    Message::builder()
        .from(from)
        .to(to)
        .subject(subject(report))
        .header(header::ContentType::TEXT_PLAIN)
        .body(body)
        .context("build email")
}

#[async_trait::async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, report: &Report) -> Result<()> {
        let msg = build_message(self.from.clone(), self.to.clone(), report)?;
        self.mailer.send(msg).await.context("send email")?;
        Ok(())
    }

    fn channel(&self) -> &'static str {
        "email"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::report::ReportAssembler;

    #[test]
    fn message_builds_from_report() {
        let r = ReportAssembler::assemble("run-e", &RunConfig::default(), 0, &[], &[], &[]);
        let msg = build_message(
            "bot@example.com".parse().unwrap(),
            "desk@example.com".parse().unwrap(),
            &r,
        )
        .unwrap();
        let raw = String::from_utf8(msg.formatted()).unwrap();
        assert!(raw.contains("Subject: Deal report"));
        assert!(raw.contains("Run: run-e"));
    }
}
