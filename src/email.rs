use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info};

use crate::{auth::services::redact, config::EmailConfig};

const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to send email: {0}")]
    Send(String),
    #[error("email provider returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Delivers a magic link to its owner. Best effort: callers never wait on it.
#[async_trait]
pub trait MagicLinkSender: Send + Sync {
    async fn send(&self, email: &str, magic_link_url: &str) -> Result<(), DeliveryError>;
}

/// Prints the link to the log instead of mailing it. The token is shortened
/// unless `reveal_link` is set, which only development turns on.
#[derive(Debug, Default, Clone)]
pub struct LogSender {
    reveal_link: bool,
}

impl LogSender {
    pub fn new(reveal_link: bool) -> Self {
        Self { reveal_link }
    }

    fn loggable(&self, magic_link_url: &str) -> String {
        if self.reveal_link {
            magic_link_url.to_string()
        } else {
            redact_link(magic_link_url)
        }
    }
}

#[async_trait]
impl MagicLinkSender for LogSender {
    async fn send(&self, email: &str, magic_link_url: &str) -> Result<(), DeliveryError> {
        info!(%email, link = %self.loggable(magic_link_url), "magic link (not emailed)");
        Ok(())
    }
}

fn redact_link(magic_link_url: &str) -> String {
    match magic_link_url.split_once("token=") {
        Some((base, token)) => format!("{base}token={}...", redact(token)),
        None => magic_link_url.to_string(),
    }
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: &'a str,
    html: String,
}

/// Sends through the Resend HTTP API.
#[derive(Clone)]
pub struct ResendSender {
    client: Client,
    api_key: String,
    from: String,
    ttl_minutes: i64,
}

impl ResendSender {
    pub fn new(api_key: String, from: String, ttl_minutes: i64) -> Self {
        Self {
            client: Client::new(),
            api_key,
            from,
            ttl_minutes,
        }
    }

    fn body(&self, magic_link_url: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; color: #333; max-width: 560px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #1a1a1a;">Sign in to FocusFlow</h2>
    <p>Click the button below to sign in. This link expires in {ttl} minutes and can only be used once.</p>
    <p style="text-align: center; margin: 28px 0;">
        <a href="{link}" style="background-color: #6366f1; color: white; text-decoration: none; padding: 12px 24px; border-radius: 6px;">Sign in</a>
    </p>
    <p style="color: #666; font-size: 14px;">If the button doesn't work, paste this link into your browser:</p>
    <p style="word-break: break-all; font-size: 14px;"><a href="{link}">{link}</a></p>
    <p style="color: #999; font-size: 12px;">If you didn't ask for this email you can ignore it.</p>
</body>
</html>"#,
            ttl = self.ttl_minutes,
            link = magic_link_url,
        )
    }
}

#[async_trait]
impl MagicLinkSender for ResendSender {
    async fn send(&self, email: &str, magic_link_url: &str) -> Result<(), DeliveryError> {
        let request = ResendRequest {
            from: &self.from,
            to: vec![email],
            subject: "Your FocusFlow sign-in link",
            html: self.body(magic_link_url),
        };

        let resp = self
            .client
            .post(RESEND_ENDPOINT)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| DeliveryError::Send(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            error!(status, %body, "resend api error");
            return Err(DeliveryError::Rejected { status, body });
        }

        info!(%email, "magic link email sent");
        Ok(())
    }
}

/// Picks the Resend sender when an API key is configured, the log sender otherwise.
pub fn sender_from_config(
    cfg: &EmailConfig,
    ttl_minutes: i64,
    reveal_logged_links: bool,
) -> Arc<dyn MagicLinkSender> {
    match &cfg.resend_api_key {
        Some(key) => {
            info!("email delivery via Resend");
            Arc::new(ResendSender::new(key.clone(), cfg.from.clone(), ttl_minutes))
        }
        None => {
            info!("email delivery not configured; magic links go to the log");
            Arc::new(LogSender::new(reveal_logged_links))
        }
    }
}
