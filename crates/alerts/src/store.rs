//! Alert store: document-style records with conditional writes.
//!
//! The store is the single authority on which alert occupies an identity
//! key. `insert_active` and `compare_and_swap` are its only mutating
//! primitives for alerts; both are atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::StoreError;
use crate::model::{
    Alert, AlertId, Delegation, DelegationId, IdentityKey, LifecycleState, Severity,
};

/// Filter for querying alerts.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub states: Option<Vec<LifecycleState>>,
    pub key: Option<IdentityKey>,
    pub category: Option<String>,
    /// Alerts the user can see (recipient, owner or delegate)
    pub visible_to: Option<String>,
    pub min_severity: Option<Severity>,
    pub resolved_since: Option<DateTime<Utc>>,
    pub resolved_before: Option<DateTime<Utc>>,
}

impl AlertFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// NEW or IN_PROGRESS alerts.
    #[must_use]
    pub fn active() -> Self {
        Self::new().with_states(&[LifecycleState::New, LifecycleState::InProgress])
    }

    #[must_use]
    pub fn with_states(mut self, states: &[LifecycleState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: IdentityKey) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn visible_to(mut self, user_id: impl Into<String>) -> Self {
        self.visible_to = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = Some(severity);
        self
    }

    #[must_use]
    pub fn resolved_between(
        mut self,
        since: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.resolved_since = since;
        self.resolved_before = before;
        self
    }

    #[must_use]
    pub fn matches(&self, alert: &Alert) -> bool {
        if let Some(states) = &self.states {
            if !states.contains(&alert.lifecycle_state) {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if alert.identity_key() != *key {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if &alert.category != category {
                return false;
            }
        }
        if let Some(user) = &self.visible_to {
            if !alert.visible_to(user) {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if alert.severity < min {
                return false;
            }
        }
        if let Some(since) = self.resolved_since {
            if !alert.resolved_at.is_some_and(|r| r >= since) {
                return false;
            }
        }
        if let Some(before) = self.resolved_before {
            if !alert.resolved_at.is_some_and(|r| r < before) {
                return false;
            }
        }
        true
    }
}

/// Persistence for alerts and delegations.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get(&self, id: &AlertId) -> Result<Option<Alert>, StoreError>;

    /// Alerts matching `filter`, oldest first.
    async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError>;

    /// Insert a new active alert at version 1.
    ///
    /// Fails with [`StoreError::Conflict`] when an active alert already
    /// occupies the same identity key.
    async fn insert_active(&self, alert: Alert) -> Result<Alert, StoreError>;

    /// Replace an alert if its stored version is still `expected_version`.
    /// The stored copy gets `expected_version + 1`.
    async fn compare_and_swap(&self, alert: Alert, expected_version: u64)
        -> Result<Alert, StoreError>;

    /// Insert a delegation; fails with [`StoreError::Conflict`] when the
    /// alert already has an open one.
    async fn insert_delegation(&self, delegation: Delegation) -> Result<Delegation, StoreError>;

    async fn get_delegation(&self, id: &DelegationId) -> Result<Option<Delegation>, StoreError>;

    async fn update_delegation(&self, delegation: Delegation) -> Result<Delegation, StoreError>;

    async fn delegations_for(&self, alert_id: &AlertId) -> Result<Vec<Delegation>, StoreError>;
}

/// Serialized form of a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub alerts: Vec<Alert>,
    #[serde(default)]
    pub delegations: Vec<Delegation>,
}

#[derive(Debug, Default)]
struct StoreState {
    alerts: HashMap<AlertId, Alert>,
    delegations: HashMap<DelegationId, Delegation>,
}

/// In-process store guarded by a single lock.
#[derive(Debug, Default)]
pub struct InMemoryAlertStore {
    state: RwLock<StoreState>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("store lock poisoned".to_string())
}

impl InMemoryAlertStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Export every record as JSON.
    pub fn export_json(&self) -> Result<String, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut snapshot = StoreSnapshot {
            alerts: state.alerts.values().cloned().collect(),
            delegations: state.delegations.values().cloned().collect(),
        };
        snapshot.alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshot
            .delegations
            .sort_by(|a, b| a.delegated_at.cmp(&b.delegated_at));
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    /// Load records from JSON, replacing records with the same id.
    ///
    /// Records are taken as they are; duplicate active alerts for one key
    /// are left for the reconciliation sweep.
    pub fn import_json(&self, json: &str) -> Result<usize, StoreError> {
        let snapshot: StoreSnapshot = serde_json::from_str(json)?;
        let count = snapshot.alerts.len();
        self.restore(snapshot)?;
        Ok(count)
    }

    pub fn restore(&self, snapshot: StoreSnapshot) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        for alert in snapshot.alerts {
            state.alerts.insert(alert.id.clone(), alert);
        }
        for delegation in snapshot.delegations {
            state.delegations.insert(delegation.id.clone(), delegation);
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.alerts.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AlertStore for InMemoryAlertStore {
    async fn get(&self, id: &AlertId) -> Result<Option<Alert>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.alerts.get(id).cloned())
    }

    async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut alerts: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(alerts)
    }

    async fn insert_active(&self, mut alert: Alert) -> Result<Alert, StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let key = alert.identity_key();
        if let Some(existing) = state
            .alerts
            .values()
            .find(|a| a.is_active() && a.identity_key() == key)
        {
            return Err(StoreError::Conflict(format!(
                "active alert {} already holds {key}",
                existing.id
            )));
        }
        alert.version = 1;
        state.alerts.insert(alert.id.clone(), alert.clone());
        Ok(alert)
    }

    async fn compare_and_swap(
        &self,
        mut alert: Alert,
        expected_version: u64,
    ) -> Result<Alert, StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        let current = state
            .alerts
            .get(&alert.id)
            .ok_or_else(|| StoreError::NotFound(alert.id.to_string()))?;
        if current.version != expected_version {
            return Err(StoreError::Conflict(format!(
                "alert {} is at version {}, expected {expected_version}",
                alert.id, current.version
            )));
        }
        alert.version = expected_version + 1;
        state.alerts.insert(alert.id.clone(), alert.clone());
        Ok(alert)
    }

    async fn insert_delegation(&self, delegation: Delegation) -> Result<Delegation, StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        if let Some(open) = state
            .delegations
            .values()
            .find(|d| d.alert_id == delegation.alert_id && d.status.is_open())
        {
            return Err(StoreError::Conflict(open.id.to_string()));
        }
        state
            .delegations
            .insert(delegation.id.clone(), delegation.clone());
        Ok(delegation)
    }

    async fn get_delegation(&self, id: &DelegationId) -> Result<Option<Delegation>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.delegations.get(id).cloned())
    }

    async fn update_delegation(&self, delegation: Delegation) -> Result<Delegation, StoreError> {
        let mut state = self.state.write().map_err(poisoned)?;
        if !state.delegations.contains_key(&delegation.id) {
            return Err(StoreError::NotFound(delegation.id.to_string()));
        }
        state
            .delegations
            .insert(delegation.id.clone(), delegation.clone());
        Ok(delegation)
    }

    async fn delegations_for(&self, alert_id: &AlertId) -> Result<Vec<Delegation>, StoreError> {
        let state = self.state.read().map_err(poisoned)?;
        let mut found: Vec<Delegation> = state
            .delegations
            .values()
            .filter(|d| &d.alert_id == alert_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.delegated_at.cmp(&b.delegated_at));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::entity_alert;

    #[tokio::test]
    async fn test_insert_active_rejects_second_for_key() {
        let store = InMemoryAlertStore::new();
        let now = Utc::now();
        let first = store.insert_active(entity_alert("INV-01", now)).await.unwrap();
        assert_eq!(first.version, 1);

        let err = store
            .insert_active(entity_alert("INV-01", now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A different entity is fine.
        store.insert_active(entity_alert("INV-02", now)).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_insert_allowed_once_previous_resolved() {
        let store = InMemoryAlertStore::new();
        let now = Utc::now();
        let mut first = store.insert_active(entity_alert("INV-01", now)).await.unwrap();
        first.lifecycle_state = LifecycleState::Resolved;
        store.compare_and_swap(first, 1).await.unwrap();
        store.insert_active(entity_alert("INV-01", now)).await.unwrap();
    }

    #[tokio::test]
    async fn test_compare_and_swap_detects_stale_version() {
        let store = InMemoryAlertStore::new();
        let alert = store
            .insert_active(entity_alert("INV-01", Utc::now()))
            .await
            .unwrap();

        let updated = store.compare_and_swap(alert.clone(), 1).await.unwrap();
        assert_eq!(updated.version, 2);

        let err = store.compare_and_swap(alert, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_filter_and_export_import() {
        let store = InMemoryAlertStore::new();
        let now = Utc::now();
        let mut high = entity_alert("INV-01", now);
        high.recipients.insert("u-9".into());
        store.insert_active(high).await.unwrap();
        let mut low = entity_alert("INV-02", now);
        low.severity = Severity::Low;
        store.insert_active(low).await.unwrap();

        let found = store
            .list(&AlertFilter::active().with_min_severity(Severity::High))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let visible = store.list(&AlertFilter::new().visible_to("u-9")).await.unwrap();
        assert_eq!(visible.len(), 1);

        let json = store.export_json().unwrap();
        let copy = InMemoryAlertStore::new();
        assert_eq!(copy.import_json(&json).unwrap(), 2);
        assert_eq!(copy.len(), 2);
    }
}
