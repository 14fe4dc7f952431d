//! HTTP gateway channel for email and SMS providers.
//!
//! Both providers are reached through a webhook that accepts a small JSON
//! document (`to`, `subject`, `body`). The provider owns the actual transport.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::{Channel, Message};
use crate::NotifyChannel;

/// Environment variable for the email gateway webhook URL.
const ENV_EMAIL_WEBHOOK_URL: &str = "NOTIFY_EMAIL_WEBHOOK_URL";

/// Environment variable for the SMS gateway webhook URL.
const ENV_SMS_WEBHOOK_URL: &str = "NOTIFY_SMS_WEBHOOK_URL";

/// Fallback when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Webhook-backed gateway channel.
pub struct WebhookChannel {
    channel: Channel,
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Email gateway configured from `NOTIFY_EMAIL_WEBHOOK_URL`.
    #[must_use]
    pub fn email_from_env() -> Self {
        Self::from_env_var(Channel::Email, ENV_EMAIL_WEBHOOK_URL)
    }

    /// SMS gateway configured from `NOTIFY_SMS_WEBHOOK_URL`.
    #[must_use]
    pub fn sms_from_env() -> Self {
        Self::from_env_var(Channel::Sms, ENV_SMS_WEBHOOK_URL)
    }

    fn from_env_var(channel: Channel, var: &str) -> Self {
        let webhook_url = std::env::var(var).ok().filter(|v| !v.trim().is_empty());

        if webhook_url.is_some() {
            debug!(channel = %channel, "Gateway notifications enabled");
        } else {
            debug!(channel = %channel, "Gateway notifications disabled ({var} not set)");
        }

        Self {
            channel,
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a gateway channel with a specific webhook URL.
    #[must_use]
    pub fn new(channel: Channel, webhook_url: impl Into<String>) -> Self {
        Self {
            channel,
            webhook_url: Some(webhook_url.into()),
            client: reqwest::Client::new(),
        }
    }

    fn format_payload<'a>(&self, message: &'a Message) -> GatewayPayload<'a> {
        GatewayPayload {
            channel: self.channel.as_str(),
            to: &message.recipient,
            subject: (self.channel != Channel::Sms).then_some(message.subject.as_str()),
            body: &message.body,
            created_at: message.created_at.to_rfc3339(),
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        match self.channel {
            Channel::Email => "email-gateway",
            Channel::Sms => "sms-gateway",
            Channel::InApp => "in-app-gateway",
        }
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(self.channel.to_string()))?;

        let payload = self.format_payload(message);

        debug!(channel = %self.channel, recipient = %message.recipient, "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(channel = %self.channel, "Notification sent successfully");
            return Ok(());
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();

        warn!(
            channel = %self.channel,
            status = %status,
            body = %body,
            "Gateway webhook request failed"
        );

        Err(ChannelError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

// =============================================================================
// Gateway API types
// =============================================================================

#[derive(Debug, Serialize)]
struct GatewayPayload<'a> {
    channel: &'static str,
    to: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<&'a str>,
    body: &'a str,
    created_at: String,
}
