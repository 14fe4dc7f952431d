//! Error types for the alert engine.

use thiserror::Error;

use crate::model::{AlertId, DelegationId, DelegationStatus, LifecycleState};

/// Errors raised by an [`AlertStore`](crate::store::AlertStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional write lost against a concurrent writer
    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    /// Conditional writes kept losing for the same key
    #[error("gave up after {attempts} concurrent update attempts")]
    Contention { attempts: u32 },

    /// Store cannot be reached; aborts the running cycle
    #[error("alert store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by metric, entity and directory collaborators.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Source answered with data that cannot be used
    #[error("invalid source data: {0}")]
    Invalid(String),
}

/// Errors returned by lifecycle and engine operations.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert not found: {0}")]
    NotFound(AlertId),

    #[error("cannot {action} alert {id} in state {from}")]
    InvalidTransition {
        id: AlertId,
        from: LifecycleState,
        action: &'static str,
    },

    #[error("delegation not found: {0}")]
    DelegationNotFound(DelegationId),

    #[error("alert {alert_id} already has open delegation {existing}")]
    DelegationConflict {
        alert_id: AlertId,
        existing: DelegationId,
    },

    #[error("user {user_id} is not the delegate of {delegation_id}")]
    NotDelegate {
        delegation_id: DelegationId,
        user_id: String,
    },

    #[error("delegation {id} is already {status}")]
    DelegationClosed {
        id: DelegationId,
        status: DelegationStatus,
    },

    #[error("template error: {0}")]
    Template(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

impl AlertError {
    /// Whether this error must abort the running cycle rather than one item.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(StoreError::Unavailable(_)))
    }
}

/// Failure of one scheduled or forced cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Engine(#[from] AlertError),

    /// The cycle task panicked; the scheduler keeps running
    #[error("cycle panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_store_is_fatal() {
        assert!(AlertError::Store(StoreError::Unavailable("down".into())).is_fatal());
        assert!(!AlertError::Store(StoreError::Contention { attempts: 5 }).is_fatal());
        assert!(!AlertError::Source(SourceError::Timeout { secs: 3 }).is_fatal());
    }

    #[test]
    fn test_transition_message() {
        let err = AlertError::InvalidTransition {
            id: AlertId::new("a-1"),
            from: LifecycleState::Archived,
            action: "resolve",
        };
        assert_eq!(err.to_string(), "cannot resolve alert a-1 in state ARCHIVED");
    }
}
