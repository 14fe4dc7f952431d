//! Notification channel implementations.

pub mod in_app;
pub mod webhook;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::{Channel, Message};

/// Trait for notification channels (in-app inbox, email and SMS gateways).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// The delivery channel this sender serves.
    fn channel(&self) -> Channel;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Send a message to this channel.
    async fn send(&self, message: &Message) -> Result<(), ChannelError>;
}
