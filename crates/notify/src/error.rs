//! Error types for the notification system.

use thiserror::Error;

/// Errors that can occur when sending notifications.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Channel is not configured
    #[error("Channel not configured: {0}")]
    NotConfigured(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rate limited by the service
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Provider answered but refused the message
    #[error("Provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Send did not complete within the bounded time
    #[error("Send timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ChannelError {
    /// Whether retrying the same send on a later cycle can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::NotConfigured(_) | Self::Serialization(_) | Self::Other(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ChannelError::Timeout { secs: 5 }.is_transient());
        assert!(ChannelError::RateLimited {
            retry_after_secs: 30
        }
        .is_transient());
        assert!(ChannelError::Rejected {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!ChannelError::Rejected {
            status: 400,
            body: "bad number".to_string()
        }
        .is_transient());
        assert!(!ChannelError::NotConfigured("sms".to_string()).is_transient());
    }
}
