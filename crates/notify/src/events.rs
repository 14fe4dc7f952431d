//! Outbound message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delivery channels a recipient can be reached on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    /// Dashboard / in-app inbox
    InApp,
    /// Email through the configured gateway
    Email,
    /// SMS through the configured gateway
    Sms,
}

impl Channel {
    /// All channels, in the order they are attempted.
    pub const ALL: [Self; 3] = [Self::InApp, Self::Email, Self::Sms];

    /// Get display name for this channel.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InApp => "IN_APP",
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IN_APP" | "INAPP" | "DASHBOARD" | "WEBSOCKET" => Ok(Self::InApp),
            "EMAIL" => Ok(Self::Email),
            "SMS" => Ok(Self::Sms),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// A message addressed to one recipient on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Address on the channel: user id for in-app, email address, phone number
    pub recipient: String,
    /// Subject line (ignored by SMS gateways)
    pub subject: String,
    /// Message body
    pub body: String,
    /// When the message was produced
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current time.
    #[must_use]
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_parse() {
        assert_eq!("email".parse::<Channel>().unwrap(), Channel::Email);
        assert_eq!("DASHBOARD".parse::<Channel>().unwrap(), Channel::InApp);
        assert_eq!("sms".parse::<Channel>().unwrap(), Channel::Sms);
        assert!("pigeon".parse::<Channel>().is_err());
    }

    #[test]
    fn test_channel_serde_names() {
        let json = serde_json::to_string(&Channel::InApp).unwrap();
        assert_eq!(json, "\"IN_APP\"");
        let back: Channel = serde_json::from_str("\"SMS\"").unwrap();
        assert_eq!(back, Channel::Sms);
    }
}
