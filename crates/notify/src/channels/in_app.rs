//! In-app (dashboard) delivery.
//!
//! Messages land in a per-user inbox and are pushed to any live subscriber
//! over a broadcast channel. Delivery never fails: a user with no open
//! dashboard simply finds the message in their inbox later.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ChannelError;
use crate::events::{Channel, Message};
use crate::NotifyChannel;

/// Capacity of the live broadcast buffer.
const BROADCAST_CAPACITY: usize = 256;

/// A message stored in a user's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InAppMessage {
    /// Position in the user's inbox
    pub seq: u64,
    pub user_id: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

/// Inbox-backed in-app channel.
pub struct InAppChannel {
    inboxes: RwLock<HashMap<String, Vec<InAppMessage>>>,
    live: broadcast::Sender<InAppMessage>,
}

impl InAppChannel {
    #[must_use]
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inboxes: RwLock::new(HashMap::new()),
            live,
        }
    }

    /// Subscribe to messages as they are delivered.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InAppMessage> {
        self.live.subscribe()
    }

    /// All messages delivered to a user, oldest first.
    #[must_use]
    pub fn inbox(&self, user_id: &str) -> Vec<InAppMessage> {
        self.inboxes
            .read()
            .map(|boxes| boxes.get(user_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Number of unread messages for a user.
    #[must_use]
    pub fn unread_count(&self, user_id: &str) -> usize {
        self.inboxes
            .read()
            .map(|boxes| {
                boxes
                    .get(user_id)
                    .map_or(0, |msgs| msgs.iter().filter(|m| !m.read).count())
            })
            .unwrap_or(0)
    }

    /// Mark one inbox entry as read. Returns `false` if it does not exist.
    pub fn mark_read(&self, user_id: &str, seq: u64) -> bool {
        let Ok(mut boxes) = self.inboxes.write() else {
            return false;
        };
        boxes
            .get_mut(user_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.seq == seq))
            .map(|m| m.read = true)
            .is_some()
    }
}

impl Default for InAppChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotifyChannel for InAppChannel {
    fn name(&self) -> &'static str {
        "in-app"
    }

    fn channel(&self) -> Channel {
        Channel::InApp
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let entry = {
            let mut boxes = self
                .inboxes
                .write()
                .map_err(|e| ChannelError::Other(format!("inbox lock poisoned: {e}")))?;
            let inbox = boxes.entry(message.recipient.clone()).or_default();
            let entry = InAppMessage {
                seq: inbox.len() as u64,
                user_id: message.recipient.clone(),
                subject: message.subject.clone(),
                body: message.body.clone(),
                created_at: message.created_at,
                read: false,
            };
            inbox.push(entry.clone());
            entry
        };

        // No subscribers is fine, the inbox keeps the message.
        let _ = self.live.send(entry);
        debug!(user_id = %message.recipient, "In-app message stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_stores_in_inbox() {
        let channel = InAppChannel::new();
        channel
            .send(&Message::new("u-1", "Alerte", "Taux de retard"))
            .await
            .unwrap();
        channel
            .send(&Message::new("u-1", "Alerte 2", "Taux de paiement"))
            .await
            .unwrap();

        let inbox = channel.inbox("u-1");
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[1].seq, 1);
        assert_eq!(channel.unread_count("u-1"), 2);
        assert!(channel.inbox("u-2").is_empty());
    }

    #[tokio::test]
    async fn test_mark_read() {
        let channel = InAppChannel::new();
        channel.send(&Message::new("u-1", "s", "b")).await.unwrap();
        assert!(channel.mark_read("u-1", 0));
        assert!(!channel.mark_read("u-1", 7));
        assert_eq!(channel.unread_count("u-1"), 0);
    }

    #[tokio::test]
    async fn test_live_subscriber_receives() {
        let channel = InAppChannel::new();
        let mut rx = channel.subscribe();
        channel.send(&Message::new("u-9", "s", "b")).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.user_id, "u-9");
    }
}
