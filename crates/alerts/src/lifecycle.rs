//! Alert lifecycle manager.
//!
//! Owns the state machine NEW -> IN_PROGRESS -> RESOLVED -> ARCHIVED, the
//! audit trail and the delegation sub-flow. Every mutation goes through the
//! repository's conditional writes and appends exactly one history entry.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::category::CategoryRegistry;
use crate::config::LifecycleConfig;
use crate::error::{AlertError, StoreError};
use crate::model::{
    ActionType, Alert, AlertAction, AlertId, AlertStatistics, Delegation, DelegationId,
    DelegationStatus, IdentityKey, LifecycleState, SYSTEM_ACTOR,
};
use crate::repository::AlertRepository;
use crate::scanners::{AnomalyCandidate, ScanReport};
use crate::store::AlertFilter;
use crate::templates::MessageRenderer;

/// What one report did to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub created: Vec<AlertId>,
    pub refreshed: Vec<AlertId>,
    pub escalated: Vec<AlertId>,
    pub auto_resolved: Vec<AlertId>,
    /// Candidates matching a crossing a person already resolved
    pub suppressed: usize,
    /// Per-candidate failures; the pass continued
    pub errors: Vec<String>,
}

impl ApplyOutcome {
    pub fn absorb(&mut self, other: Self) {
        self.created.extend(other.created);
        self.refreshed.extend(other.refreshed);
        self.escalated.extend(other.escalated);
        self.auto_resolved.extend(other.auto_resolved);
        self.suppressed += other.suppressed;
        self.errors.extend(other.errors);
    }
}

/// Versions of the active alerts, taken before a source is read.
///
/// A report may only auto-resolve an alert nobody has written since its
/// baseline; anything newer was observed by a fresher read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveBaseline {
    versions: HashMap<AlertId, u64>,
}

impl ActiveBaseline {
    #[must_use]
    pub fn from_alerts(alerts: &[Alert]) -> Self {
        Self {
            versions: alerts
                .iter()
                .filter(|a| a.is_active())
                .map(|a| (a.id.clone(), a.version))
                .collect(),
        }
    }

    /// Version of `id` at baseline time, if it was active then.
    #[must_use]
    pub fn version_of(&self, id: &AlertId) -> Option<u64> {
        self.versions.get(id).copied()
    }
}

/// `now` minus `days`, or `None` when that leaves chrono's range.
fn days_before(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|d| now.checked_sub_signed(d))
}

pub struct AlertManager {
    repo: Arc<AlertRepository>,
    registry: Arc<CategoryRegistry>,
    renderer: Arc<MessageRenderer>,
    config: LifecycleConfig,
}

impl AlertManager {
    #[must_use]
    pub fn new(
        repo: Arc<AlertRepository>,
        registry: Arc<CategoryRegistry>,
        renderer: Arc<MessageRenderer>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            repo,
            registry,
            renderer,
            config,
        }
    }

    #[must_use]
    pub fn repository(&self) -> &Arc<AlertRepository> {
        &self.repo
    }

    // =========================================================================
    // Evaluation results
    // =========================================================================

    /// Snapshot active alert versions. Take it before reading the sources a
    /// report is built from.
    pub async fn baseline(&self) -> Result<ActiveBaseline, AlertError> {
        let active = self.repo.store().list(&AlertFilter::active()).await?;
        Ok(ActiveBaseline::from_alerts(&active))
    }

    /// Upsert every candidate, then resolve covered keys that went quiet.
    ///
    /// Quiet alerts written after `baseline` are left alone; another cycle
    /// saw them with newer data. Only an unavailable store aborts the pass.
    pub async fn apply_report(
        &self,
        report: &ScanReport,
        baseline: &ActiveBaseline,
        now: DateTime<Utc>,
    ) -> Result<ApplyOutcome, AlertError> {
        let mut outcome = ApplyOutcome::default();

        for candidate in &report.candidates {
            match self.apply_candidate(candidate, now, &mut outcome).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(key = %candidate.key, error = %e, "Failed to apply candidate");
                    outcome.errors.push(format!("{}: {e}", candidate.key));
                }
            }
        }

        let reported = report.reported_keys();
        let quiet: Vec<(AlertId, u64)> = self
            .repo
            .store()
            .list(&AlertFilter::active())
            .await?
            .into_iter()
            .filter(|a| {
                let key = a.identity_key();
                report.scope.covers(&key) && !reported.contains(&key)
            })
            .filter_map(|a| match baseline.version_of(&a.id) {
                Some(v) if v == a.version => Some((a.id, v)),
                _ => {
                    debug!(alert_id = %a.id, "Alert changed since the source was read, not resolving");
                    None
                }
            })
            .collect();

        for (id, version) in quiet {
            match self.auto_resolve(&id, version, now).await {
                Ok(Some(_)) => outcome.auto_resolved.push(id),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(alert_id = %id, error = %e, "Failed to auto-resolve alert");
                    outcome.errors.push(format!("{id}: {e}"));
                }
            }
        }

        Ok(outcome)
    }

    async fn apply_candidate(
        &self,
        candidate: &AnomalyCandidate,
        now: DateTime<Utc>,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), AlertError> {
        if self.is_suppressed(candidate).await? {
            debug!(key = %candidate.key, "Crossing already resolved by a user, not reopening");
            outcome.suppressed += 1;
            return Ok(());
        }

        let description = self
            .registry
            .get(&candidate.category)
            .map_or(candidate.category.as_str(), |s| s.description.as_str());
        let message = self.renderer.render_candidate(candidate, description)?;

        let upsert = self.repo.upsert_active(candidate, &message, now).await?;
        let id = upsert.alert.id.clone();
        if upsert.is_new {
            info!(
                alert_id = %id,
                key = %candidate.key,
                severity = %candidate.severity,
                "Alert created"
            );
            outcome.created.push(id);
        } else {
            if upsert.escalated {
                info!(alert_id = %id, severity = %candidate.severity, "Alert escalated");
                outcome.escalated.push(id.clone());
            }
            outcome.refreshed.push(id);
        }
        Ok(())
    }

    /// An entity crossing a person resolved stays closed unless it worsens.
    async fn is_suppressed(&self, candidate: &AnomalyCandidate) -> Result<bool, AlertError> {
        if !self.config.manual_resolution_suppresses_same_crossing
            || !matches!(candidate.key, IdentityKey::Entity { .. })
            || candidate.anomaly.reference_date.is_none()
        {
            return Ok(false);
        }
        if !self.repo.find_active(&candidate.key).await?.is_empty() {
            return Ok(false);
        }
        let Some(closed) = self.repo.latest_closed(&candidate.key).await? else {
            return Ok(false);
        };
        Ok(closed.manually_resolved()
            && closed.has_crossing(&candidate.anomaly)
            && candidate.severity <= closed.severity)
    }

    async fn auto_resolve(
        &self,
        id: &AlertId,
        seen_version: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, AlertError> {
        let mut changed = false;
        let alert = self
            .repo
            .update_with(id, |alert| {
                changed = alert.is_active() && alert.version == seen_version;
                if !changed {
                    return Ok(false);
                }
                alert.resolved_at = Some(now);
                alert.resolved_by = Some(SYSTEM_ACTOR.to_string());
                alert.resolution_comment = Some("condition levée".to_string());
                alert.transition(
                    LifecycleState::Resolved,
                    ActionType::AutoResolved,
                    SYSTEM_ACTOR,
                    now,
                    Some("condition levée".to_string()),
                );
                Ok(true)
            })
            .await?;
        if changed {
            info!(alert_id = %id, "Alert auto-resolved, condition cleared");
            Ok(Some(alert))
        } else {
            Ok(None)
        }
    }

    // =========================================================================
    // Human actions
    // =========================================================================

    pub async fn get(&self, id: &AlertId) -> Result<Alert, AlertError> {
        self.repo
            .store()
            .get(id)
            .await?
            .ok_or_else(|| AlertError::NotFound(id.clone()))
    }

    /// Take ownership of an alert.
    ///
    /// From NEW this moves to IN_PROGRESS. An alert already moved by the
    /// notification dispatcher records the human acknowledgement without a
    /// state change. Repeating it is a no-op.
    pub async fn acknowledge(
        &self,
        id: &AlertId,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Alert, AlertError> {
        self.repo
            .update_with(id, |alert| match alert.lifecycle_state {
                LifecycleState::New => {
                    alert.acknowledged_at = Some(now);
                    alert.acknowledged_by = Some(user_id.to_string());
                    alert.transition(
                        LifecycleState::InProgress,
                        ActionType::Acknowledged,
                        user_id,
                        now,
                        None,
                    );
                    Ok(true)
                }
                LifecycleState::InProgress => {
                    let by_person = alert
                        .acknowledged_by
                        .as_deref()
                        .is_some_and(|by| by != SYSTEM_ACTOR);
                    if by_person {
                        return Ok(false);
                    }
                    alert.acknowledged_at = Some(now);
                    alert.acknowledged_by = Some(user_id.to_string());
                    alert.record(ActionType::Acknowledged, user_id, now, None);
                    Ok(true)
                }
                from => Err(AlertError::InvalidTransition {
                    id: alert.id.clone(),
                    from,
                    action: "acknowledge",
                }),
            })
            .await
    }

    /// Resolve an active alert by hand.
    pub async fn resolve(
        &self,
        id: &AlertId,
        user_id: &str,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Alert, AlertError> {
        let alert = self
            .repo
            .update_with(id, |alert| {
                if !alert.is_active() {
                    return Err(AlertError::InvalidTransition {
                        id: alert.id.clone(),
                        from: alert.lifecycle_state,
                        action: "resolve",
                    });
                }
                alert.resolved_at = Some(now);
                alert.resolved_by = Some(user_id.to_string());
                alert.resolution_comment.clone_from(&comment);
                alert.transition(
                    LifecycleState::Resolved,
                    ActionType::Resolved,
                    user_id,
                    now,
                    comment.clone(),
                );
                Ok(true)
            })
            .await?;
        info!(alert_id = %id, user_id, "Alert resolved");
        self.close_open_delegation(id, user_id, comment, now).await?;
        Ok(alert)
    }

    /// Archive a resolved alert.
    pub async fn archive(
        &self,
        id: &AlertId,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Alert, AlertError> {
        self.repo
            .update_with(id, |alert| {
                if alert.lifecycle_state != LifecycleState::Resolved {
                    return Err(AlertError::InvalidTransition {
                        id: alert.id.clone(),
                        from: alert.lifecycle_state,
                        action: "archive",
                    });
                }
                alert.archived_at = Some(now);
                alert.archived_by = Some(user_id.to_string());
                alert.transition(
                    LifecycleState::Archived,
                    ActionType::Archived,
                    user_id,
                    now,
                    None,
                );
                Ok(true)
            })
            .await
    }

    pub async fn comment(
        &self,
        id: &AlertId,
        user_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Alert, AlertError> {
        self.repo
            .update_with(id, |alert| {
                alert.record(ActionType::Commented, user_id, now, Some(text.to_string()));
                Ok(true)
            })
            .await
    }

    pub async fn history(&self, id: &AlertId) -> Result<Vec<AlertAction>, AlertError> {
        Ok(self.get(id).await?.action_history)
    }

    // =========================================================================
    // Delegation
    // =========================================================================

    /// Hand an active alert to `to_user`.
    pub async fn delegate(
        &self,
        alert_id: &AlertId,
        from_user: &str,
        to_user: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Delegation, Alert), AlertError> {
        let alert = self.get(alert_id).await?;
        if !alert.is_active() {
            return Err(AlertError::InvalidTransition {
                id: alert.id,
                from: alert.lifecycle_state,
                action: "delegate",
            });
        }

        let delegation = Delegation {
            id: DelegationId::generate(),
            alert_id: alert_id.clone(),
            delegated_by: from_user.to_string(),
            delegated_to: to_user.to_string(),
            delegated_at: now,
            note: note.clone(),
            status: DelegationStatus::Pending,
            started_at: None,
            resolution: None,
            resolved_at: None,
            resolved_by: None,
        };
        let delegation = match self.repo.store().insert_delegation(delegation).await {
            Ok(d) => d,
            Err(StoreError::Conflict(existing)) => {
                return Err(AlertError::DelegationConflict {
                    alert_id: alert_id.clone(),
                    existing: DelegationId::new(existing),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let comment = match &note {
            Some(n) => format!("délégué à {to_user} : {n}"),
            None => format!("délégué à {to_user}"),
        };
        let alert = self
            .repo
            .update_with(alert_id, |alert| {
                alert.delegated_to = Some(to_user.to_string());
                alert.recipients.insert(to_user.to_string());
                alert.record(ActionType::Delegated, from_user, now, Some(comment.clone()));
                Ok(true)
            })
            .await?;
        info!(alert_id = %alert_id, from_user, to_user, "Alert delegated");
        Ok((delegation, alert))
    }

    async fn open_delegation_for_delegate(
        &self,
        id: &DelegationId,
        user_id: &str,
    ) -> Result<Delegation, AlertError> {
        let delegation = self
            .repo
            .store()
            .get_delegation(id)
            .await?
            .ok_or_else(|| AlertError::DelegationNotFound(id.clone()))?;
        if delegation.delegated_to != user_id {
            return Err(AlertError::NotDelegate {
                delegation_id: id.clone(),
                user_id: user_id.to_string(),
            });
        }
        if !delegation.status.is_open() {
            return Err(AlertError::DelegationClosed {
                id: id.clone(),
                status: delegation.status,
            });
        }
        Ok(delegation)
    }

    async fn note_delegation(
        &self,
        alert_id: &AlertId,
        user_id: &str,
        comment: String,
        now: DateTime<Utc>,
        clear_delegate: bool,
    ) -> Result<Alert, AlertError> {
        self.repo
            .update_with(alert_id, |alert| {
                if clear_delegate {
                    alert.delegated_to = None;
                }
                alert.record(
                    ActionType::DelegationUpdated,
                    user_id,
                    now,
                    Some(comment.clone()),
                );
                Ok(true)
            })
            .await
    }

    /// The delegate starts working on it.
    pub async fn start_delegation(
        &self,
        id: &DelegationId,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Delegation, AlertError> {
        let mut delegation = self.open_delegation_for_delegate(id, user_id).await?;
        if delegation.status == DelegationStatus::InProgress {
            return Ok(delegation);
        }
        delegation.status = DelegationStatus::InProgress;
        delegation.started_at = Some(now);
        let delegation = self.repo.store().update_delegation(delegation).await?;
        self.note_delegation(
            &delegation.alert_id,
            user_id,
            "délégation prise en charge".to_string(),
            now,
            false,
        )
        .await?;
        Ok(delegation)
    }

    /// Close the delegation and optionally resolve the alert with it.
    pub async fn resolve_delegation(
        &self,
        id: &DelegationId,
        user_id: &str,
        resolution: &str,
        resolve_alert: bool,
        now: DateTime<Utc>,
    ) -> Result<(Delegation, Alert), AlertError> {
        let mut delegation = self.open_delegation_for_delegate(id, user_id).await?;
        delegation.status = DelegationStatus::Resolved;
        delegation.resolution = Some(resolution.to_string());
        delegation.resolved_at = Some(now);
        delegation.resolved_by = Some(user_id.to_string());
        let delegation = self.repo.store().update_delegation(delegation).await?;

        let mut alert = self
            .note_delegation(
                &delegation.alert_id,
                user_id,
                format!("délégation résolue : {resolution}"),
                now,
                false,
            )
            .await?;
        if resolve_alert && alert.is_active() {
            alert = self
                .resolve(
                    &delegation.alert_id,
                    user_id,
                    Some(resolution.to_string()),
                    now,
                )
                .await?;
        }
        Ok((delegation, alert))
    }

    /// The delegate hands the alert back.
    pub async fn reject_delegation(
        &self,
        id: &DelegationId,
        user_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Delegation, Alert), AlertError> {
        let mut delegation = self.open_delegation_for_delegate(id, user_id).await?;
        delegation.status = DelegationStatus::Rejected;
        delegation.resolution = Some(reason.to_string());
        delegation.resolved_at = Some(now);
        delegation.resolved_by = Some(user_id.to_string());
        let delegation = self.repo.store().update_delegation(delegation).await?;
        let alert = self
            .note_delegation(
                &delegation.alert_id,
                user_id,
                format!("délégation refusée : {reason}"),
                now,
                true,
            )
            .await?;
        Ok((delegation, alert))
    }

    pub async fn delegations(&self, alert_id: &AlertId) -> Result<Vec<Delegation>, AlertError> {
        Ok(self.repo.store().delegations_for(alert_id).await?)
    }

    async fn close_open_delegation(
        &self,
        alert_id: &AlertId,
        user_id: &str,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), AlertError> {
        let open = self
            .repo
            .store()
            .delegations_for(alert_id)
            .await?
            .into_iter()
            .filter(|d| d.status.is_open());
        for mut delegation in open {
            delegation.status = DelegationStatus::Resolved;
            delegation.resolution = comment
                .clone()
                .or_else(|| Some("alerte résolue".to_string()));
            delegation.resolved_at = Some(now);
            delegation.resolved_by = Some(user_id.to_string());
            self.repo.store().update_delegation(delegation).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Sweeps
    // =========================================================================

    /// Archive RESOLVED alerts past the retention window.
    pub async fn retention_sweep(&self, now: DateTime<Utc>) -> Result<Vec<AlertId>, AlertError> {
        let Some(cutoff) = days_before(now, self.config.retention_days) else {
            warn!(
                retention_days = self.config.retention_days,
                "Retention window out of range, nothing archived"
            );
            return Ok(Vec::new());
        };
        let expired = self
            .repo
            .store()
            .list(
                &AlertFilter::new()
                    .with_states(&[LifecycleState::Resolved])
                    .resolved_between(None, Some(cutoff)),
            )
            .await?;

        let mut archived = Vec::new();
        for alert in expired {
            let result = self
                .repo
                .update_with(&alert.id, |a| {
                    if a.lifecycle_state != LifecycleState::Resolved {
                        return Ok(false);
                    }
                    a.archived_at = Some(now);
                    a.archived_by = Some(SYSTEM_ACTOR.to_string());
                    a.transition(
                        LifecycleState::Archived,
                        ActionType::Archived,
                        SYSTEM_ACTOR,
                        now,
                        Some("rétention dépassée".to_string()),
                    );
                    Ok(true)
                })
                .await;
            match result {
                Ok(_) => archived.push(alert.id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(alert_id = %alert.id, error = %e, "Failed to archive alert"),
            }
        }
        if !archived.is_empty() {
            info!(count = archived.len(), "Archived alerts past retention");
        }
        Ok(archived)
    }

    pub async fn reconcile_duplicates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlertId>, AlertError> {
        self.repo.reconcile_duplicates(now).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn scoped(filter: AlertFilter, user_id: Option<&str>) -> AlertFilter {
        match user_id {
            Some(user) => filter.visible_to(user),
            None => filter,
        }
    }

    pub async fn list(&self, filter: &AlertFilter) -> Result<Vec<Alert>, AlertError> {
        Ok(self.repo.store().list(filter).await?)
    }

    pub async fn active(&self, user_id: Option<&str>) -> Result<Vec<Alert>, AlertError> {
        self.list(&Self::scoped(AlertFilter::active(), user_id)).await
    }

    pub async fn recently_resolved(
        &self,
        user_id: Option<&str>,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>, AlertError> {
        // A window reaching past the representable range covers everything.
        let filter = AlertFilter::new()
            .with_states(&[LifecycleState::Resolved])
            .resolved_between(days_before(now, days.max(0)), None);
        self.list(&Self::scoped(filter, user_id)).await
    }

    pub async fn archived(&self, user_id: Option<&str>) -> Result<Vec<Alert>, AlertError> {
        let filter = AlertFilter::new().with_states(&[LifecycleState::Archived]);
        self.list(&Self::scoped(filter, user_id)).await
    }

    pub async fn statistics(&self, user_id: Option<&str>) -> Result<AlertStatistics, AlertError> {
        let alerts = self.list(&Self::scoped(AlertFilter::new(), user_id)).await?;
        Ok(AlertStatistics::from_alerts(&alerts))
    }

    /// Active identity keys at or above HIGH severity.
    pub async fn high_severity_keys(&self) -> Result<HashSet<IdentityKey>, AlertError> {
        let alerts = self
            .list(&AlertFilter::active().with_min_severity(crate::model::Severity::High))
            .await?;
        Ok(alerts.iter().map(Alert::identity_key).collect())
    }
}
