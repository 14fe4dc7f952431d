//! Outbound notification channels for KPI alerts.
//!
//! This crate owns the last hop of alert delivery: putting a rendered
//! message in front of a person on the in-app dashboard, by email, or by SMS.
//! It knows nothing about alerts themselves.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use notify::{Channel, Message, Notifier};
//!
//! # async fn run() -> Result<(), notify::ChannelError> {
//! let notifier = Notifier::from_env();
//! let message = Message::new("pm@example.com", "Facture en retard", "INV-01");
//! notifier
//!     .send(Channel::Email, &message, Duration::from_secs(10))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! - `NOTIFY_EMAIL_WEBHOOK_URL`: email gateway webhook (enables email)
//! - `NOTIFY_SMS_WEBHOOK_URL`: SMS gateway webhook (enables SMS)
//! - `NOTIFY_DISABLED`: set to "true" to disable all outbound channels
//!
//! The in-app channel is always present, even when `NOTIFY_DISABLED` is set,
//! since it only writes to the dashboard inbox.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::in_app::{InAppChannel, InAppMessage};
pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{Channel, Message};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Routes messages to the sender registered for each [`Channel`].
pub struct Notifier {
    channels: HashMap<Channel, Arc<dyn NotifyChannel>>,
    in_app: Option<Arc<InAppChannel>>,
    disabled: bool,
}

impl Notifier {
    /// Create a notifier from environment variables.
    ///
    /// Gateways are enabled when their webhook URL is set.
    #[must_use]
    pub fn from_env() -> Self {
        let in_app = Arc::new(InAppChannel::new());
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Outbound notifications disabled via NOTIFY_DISABLED");
            let mut notifier = Self::with_channels(vec![in_app.clone()]);
            notifier.in_app = Some(in_app);
            notifier.disabled = true;
            return notifier;
        }

        let mut senders: Vec<Arc<dyn NotifyChannel>> = vec![in_app.clone()];
        for gateway in [WebhookChannel::email_from_env(), WebhookChannel::sms_from_env()] {
            if gateway.enabled() {
                info!(channel = %gateway.channel(), "Gateway notifications enabled");
                senders.push(Arc::new(gateway));
            }
        }

        if senders.len() == 1 {
            warn!("No email or SMS gateway configured, only in-app delivery is available");
        }

        let mut notifier = Self::with_channels(senders);
        notifier.in_app = Some(in_app);
        notifier
    }

    /// Create a notifier with specific channels.
    ///
    /// A later entry for the same [`Channel`] replaces an earlier one.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        let channels = channels.into_iter().map(|c| (c.channel(), c)).collect();
        Self {
            channels,
            in_app: None,
            disabled: false,
        }
    }

    /// Attach the inbox handle so callers can read in-app messages back.
    #[must_use]
    pub fn with_in_app(mut self, in_app: Arc<InAppChannel>) -> Self {
        self.channels.insert(Channel::InApp, in_app.clone());
        self.in_app = Some(in_app);
        self
    }

    /// Create a notifier where every outbound channel is off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            channels: HashMap::new(),
            in_app: None,
            disabled: true,
        }
    }

    /// The in-app inbox, when one is registered.
    #[must_use]
    pub fn in_app(&self) -> Option<&Arc<InAppChannel>> {
        self.in_app.as_ref()
    }

    /// Whether messages on `channel` can currently be delivered.
    #[must_use]
    pub fn is_enabled(&self, channel: Channel) -> bool {
        if self.disabled && channel != Channel::InApp {
            return false;
        }
        self.channels.get(&channel).is_some_and(|c| c.enabled())
    }

    /// Channels that are currently deliverable.
    #[must_use]
    pub fn enabled_channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.is_enabled(*c))
            .collect()
    }

    /// Send one message on one channel, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConfigured`] when the channel is not
    /// enabled, [`ChannelError::Timeout`] when the send exceeds `timeout`,
    /// or the sender's own error.
    pub async fn send(
        &self,
        channel: Channel,
        message: &Message,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        if !self.is_enabled(channel) {
            debug!(channel = %channel, "Channel disabled, skipping message");
            return Err(ChannelError::NotConfigured(channel.to_string()));
        }
        let sender = self
            .channels
            .get(&channel)
            .ok_or_else(|| ChannelError::NotConfigured(channel.to_string()))?;

        match tokio::time::timeout(timeout, sender.send(message)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    channel = sender.name(),
                    recipient = %message.recipient,
                    "Notification send timed out"
                );
                Err(ChannelError::Timeout {
                    secs: timeout.as_secs(),
                })
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serial_test::serial;

    struct SlowChannel;

    #[async_trait]
    impl NotifyChannel for SlowChannel {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn channel(&self) -> Channel {
            Channel::Sms
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, _message: &Message) -> Result<(), ChannelError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[test]
    fn test_disabled_notifier() {
        let notifier = Notifier::disabled();
        assert!(notifier.enabled_channels().is_empty());
        assert!(notifier.in_app().is_none());
    }

    #[tokio::test]
    async fn test_send_to_unregistered_channel() {
        let notifier = Notifier::with_channels(vec![Arc::new(InAppChannel::new())]);
        let err = notifier
            .send(
                Channel::Email,
                &Message::new("a@b.c", "s", "b"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConfigured(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out() {
        let notifier = Notifier::with_channels(vec![Arc::new(SlowChannel)]);
        let err = notifier
            .send(
                Channel::Sms,
                &Message::new("+216", "s", "b"),
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { secs: 5 }));
    }

    #[tokio::test]
    async fn test_in_app_roundtrip_through_notifier() {
        let inbox = Arc::new(InAppChannel::new());
        let notifier = Notifier::with_channels(vec![]).with_in_app(inbox.clone());
        notifier
            .send(
                Channel::InApp,
                &Message::new("u-1", "s", "b"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(inbox.inbox("u-1").len(), 1);
    }

    #[test]
    #[serial]
    fn test_from_env_disabled_keeps_in_app() {
        std::env::set_var("NOTIFY_DISABLED", "true");
        std::env::set_var("NOTIFY_EMAIL_WEBHOOK_URL", "http://localhost:1/email");
        let notifier = Notifier::from_env();
        std::env::remove_var("NOTIFY_DISABLED");
        std::env::remove_var("NOTIFY_EMAIL_WEBHOOK_URL");

        assert_eq!(notifier.enabled_channels(), vec![Channel::InApp]);
        assert!(notifier.in_app().is_some());
    }

    #[test]
    #[serial]
    fn test_from_env_gateways() {
        std::env::remove_var("NOTIFY_DISABLED");
        std::env::set_var("NOTIFY_EMAIL_WEBHOOK_URL", "http://localhost:1/email");
        std::env::remove_var("NOTIFY_SMS_WEBHOOK_URL");
        let notifier = Notifier::from_env();
        std::env::remove_var("NOTIFY_EMAIL_WEBHOOK_URL");

        assert_eq!(
            notifier.enabled_channels(),
            vec![Channel::InApp, Channel::Email]
        );
    }
}
