use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, Mailboxes};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::debug;

use super::{EmailSettings, HealthchecksSettings};

const SMTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Where notifications actually go out.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn ping(&self, settings: &HealthchecksSettings, body: String) -> Result<()>;

    async fn send_email(&self, settings: &EmailSettings, subject: String, body: String) -> Result<()>;
}

/// HTTP pings through reqwest and mail through an SMTP relay.
#[derive(Debug, Clone, Default)]
pub struct NetworkTransport {
    http: reqwest::Client,
}

impl NetworkTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationTransport for NetworkTransport {
    async fn ping(&self, settings: &HealthchecksSettings, body: String) -> Result<()> {
        let url = settings.url.trim();
        let response = self
            .http
            .post(url)
            .timeout(Duration::from_secs(settings.timeout_secs.max(1)))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Healthchecks ping to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Healthchecks rejected ping to {}", url))?;
        debug!(url, status = %response.status(), "Healthchecks ping delivered");
        Ok(())
    }

    async fn send_email(&self, settings: &EmailSettings, subject: String, body: String) -> Result<()> {
        let from: Mailbox = settings
            .from
            .trim()
            .parse()
            .with_context(|| format!("Invalid sender address {:?}", settings.from))?;
        let to: Mailboxes = settings
            .to
            .parse()
            .with_context(|| format!("Invalid recipient list {:?}", settings.to))?;

        let mut builder = Message::builder().from(from).subject(subject).header(ContentType::TEXT_PLAIN);
        for mailbox in to {
            builder = builder.to(mailbox);
        }
        let message = builder.body(body).context("Failed to build notification email")?;

        let host = settings.smtp_host.trim();
        let relay = if settings.smtp_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .with_context(|| format!("Invalid SMTP host {}", host))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        let mut relay = relay.port(settings.smtp_port).timeout(Some(SMTP_TIMEOUT));
        if !settings.smtp_username.trim().is_empty() {
            relay = relay.credentials(Credentials::new(
                settings.smtp_username.trim().to_string(),
                settings.smtp_password.clone(),
            ));
        }

        relay
            .build()
            .send(message)
            .await
            .with_context(|| format!("SMTP delivery through {} failed", host))?;
        debug!(host, to = %settings.to, "Notification email delivered");
        Ok(())
    }
}
