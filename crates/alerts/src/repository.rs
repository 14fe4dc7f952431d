//! Dedup-aware alert upsert on top of the store's conditional writes.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AlertError, StoreError};
use crate::model::{
    ActionType, Alert, AlertAction, AlertId, IdentityKey, LifecycleState, SYSTEM_ACTOR,
};
use crate::scanners::AnomalyCandidate;
use crate::store::{AlertFilter, AlertStore};
use crate::templates::RenderedMessage;

/// Result of merging one candidate into the store.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub alert: Alert,
    pub is_new: bool,
    /// Severity rose above the previous observation
    pub escalated: bool,
    /// A `(type, referenceDate)` crossing not seen on this alert before
    pub new_crossing: bool,
}

/// Build a NEW alert from a candidate.
fn new_alert(candidate: &AnomalyCandidate, message: &RenderedMessage, now: DateTime<Utc>) -> Alert {
    Alert {
        id: AlertId::generate(),
        category: candidate.category.clone(),
        kpi_name: candidate.key.kpi_name().to_string(),
        dimension: candidate.dimension,
        dimension_value: candidate.dimension_value.clone(),
        related_entity_id: candidate.related_entity_id().map(str::to_string),
        owner_id: candidate.owner_id.clone(),
        current_value: candidate.current_value,
        expected_value: candidate.expected_value,
        breached_bound: candidate.breached_bound,
        status: candidate.status,
        lifecycle_state: LifecycleState::New,
        severity: candidate.severity,
        title: message.subject.clone(),
        message: message.body.clone(),
        recipients: BTreeSet::new(),
        notification_sent: false,
        notification_channels: BTreeSet::new(),
        notification_sent_at: None,
        notified_severity: None,
        notification_round: 0,
        deliveries: Vec::new(),
        anomaly_details: vec![candidate.anomaly.clone()],
        action_history: vec![AlertAction {
            action_type: ActionType::Created,
            performed_by: SYSTEM_ACTOR.to_string(),
            performed_at: now,
            comment: Some(candidate.anomaly.description.clone()),
            previous_state: None,
            new_state: LifecycleState::New,
        }],
        created_at: now,
        last_refreshed_at: now,
        acknowledged_at: None,
        acknowledged_by: None,
        resolved_at: None,
        resolved_by: None,
        resolution_comment: None,
        archived_at: None,
        archived_by: None,
        delegated_to: None,
        version: 0,
    }
}

/// Fold a fresh observation into an active alert.
///
/// Returns `(escalated, new_crossing)`.
pub fn merge_observation(
    alert: &mut Alert,
    candidate: &AnomalyCandidate,
    message: &RenderedMessage,
    now: DateTime<Utc>,
) -> (bool, bool) {
    let escalated = candidate.severity > alert.severity;
    let new_crossing = !alert.has_crossing(&candidate.anomaly);

    alert.current_value = candidate.current_value;
    alert.expected_value = candidate.expected_value;
    alert.breached_bound = candidate.breached_bound;
    alert.status = candidate.status;
    alert.severity = candidate.severity;
    alert.title.clone_from(&message.subject);
    alert.message.clone_from(&message.body);
    if candidate.owner_id.is_some() {
        alert.owner_id.clone_from(&candidate.owner_id);
    }
    if new_crossing {
        alert.anomaly_details.push(candidate.anomaly.clone());
    }
    alert.last_refreshed_at = now;

    let comment = format!(
        "{:.2} ({}, {})",
        candidate.current_value, candidate.status, candidate.severity
    );
    alert.record(ActionType::Refreshed, SYSTEM_ACTOR, now, Some(comment));
    (escalated, new_crossing)
}

/// Alert repository adapter.
///
/// All writes are retried against fresh reads until the store's conditional
/// write succeeds or the attempt budget runs out.
pub struct AlertRepository {
    store: Arc<dyn AlertStore>,
    max_attempts: u32,
}

impl AlertRepository {
    #[must_use]
    pub fn new(store: Arc<dyn AlertStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.store
    }

    /// Active alerts for a key, oldest first.
    pub async fn find_active(&self, key: &IdentityKey) -> Result<Vec<Alert>, StoreError> {
        self.store
            .list(&AlertFilter::active().with_key(key.clone()))
            .await
    }

    /// Most recently resolved or archived alert for a key.
    pub async fn latest_closed(&self, key: &IdentityKey) -> Result<Option<Alert>, StoreError> {
        let closed = self
            .store
            .list(
                &AlertFilter::new()
                    .with_key(key.clone())
                    .with_states(&[LifecycleState::Resolved, LifecycleState::Archived]),
            )
            .await?;
        Ok(closed.into_iter().max_by_key(|a| a.resolved_at))
    }

    /// Create or refresh the single active alert for the candidate's key.
    pub async fn upsert_active(
        &self,
        candidate: &AnomalyCandidate,
        message: &RenderedMessage,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        for attempt in 1..=self.max_attempts {
            let active = self.find_active(&candidate.key).await?;
            if active.len() > 1 {
                warn!(
                    key = %candidate.key,
                    count = active.len(),
                    "Multiple active alerts for one key, merging into the oldest"
                );
            }

            let result = match active.into_iter().next() {
                Some(existing) => {
                    let expected = existing.version;
                    let mut merged = existing;
                    let (escalated, new_crossing) =
                        merge_observation(&mut merged, candidate, message, now);
                    self.store
                        .compare_and_swap(merged, expected)
                        .await
                        .map(|alert| UpsertOutcome {
                            alert,
                            is_new: false,
                            escalated,
                            new_crossing,
                        })
                }
                None => self
                    .store
                    .insert_active(new_alert(candidate, message, now))
                    .await
                    .map(|alert| UpsertOutcome {
                        alert,
                        is_new: true,
                        escalated: false,
                        new_crossing: true,
                    }),
            };

            match result {
                Err(StoreError::Conflict(reason)) => {
                    debug!(key = %candidate.key, attempt, %reason, "Upsert lost a race, retrying");
                }
                other => return other,
            }
        }
        Err(StoreError::Contention {
            attempts: self.max_attempts,
        })
    }

    /// Read-modify-write one alert.
    ///
    /// `change` returns `Ok(false)` to leave the alert untouched.
    pub async fn update_with<F>(&self, id: &AlertId, mut change: F) -> Result<Alert, AlertError>
    where
        F: FnMut(&mut Alert) -> Result<bool, AlertError> + Send,
    {
        for _ in 0..self.max_attempts {
            let current = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| AlertError::NotFound(id.clone()))?;
            let expected = current.version;
            let mut updated = current.clone();
            if !change(&mut updated)? {
                return Ok(current);
            }
            match self.store.compare_and_swap(updated, expected).await {
                Ok(alert) => return Ok(alert),
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Contention {
            attempts: self.max_attempts,
        }
        .into())
    }

    /// Resolve every active alert but the oldest for each identity key.
    pub async fn reconcile_duplicates(&self, now: DateTime<Utc>) -> Result<Vec<AlertId>, AlertError> {
        let active = self.store.list(&AlertFilter::active()).await?;
        let mut by_key: HashMap<IdentityKey, Vec<Alert>> = HashMap::new();
        for alert in active {
            by_key.entry(alert.identity_key()).or_default().push(alert);
        }

        let mut resolved = Vec::new();
        for (key, alerts) in by_key {
            if alerts.len() < 2 {
                continue;
            }
            // `list` returns oldest first.
            let keeper = alerts[0].id.clone();
            for duplicate in &alerts[1..] {
                warn!(
                    key = %key,
                    kept = %keeper,
                    duplicate = %duplicate.id,
                    "Duplicate active alert detected, resolving the newer one"
                );
                let comment = format!("doublon de l'alerte {keeper}");
                self.update_with(&duplicate.id, |alert| {
                    if !alert.is_active() {
                        return Ok(false);
                    }
                    alert.resolved_at = Some(now);
                    alert.resolved_by = Some(SYSTEM_ACTOR.to_string());
                    alert.resolution_comment = Some(comment.clone());
                    alert.transition(
                        LifecycleState::Resolved,
                        ActionType::DuplicateResolved,
                        SYSTEM_ACTOR,
                        now,
                        Some(comment.clone()),
                    );
                    Ok(true)
                })
                .await?;
                resolved.push(duplicate.id.clone());
            }
        }
        Ok(resolved)
    }
}
