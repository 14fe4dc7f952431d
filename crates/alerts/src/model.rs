//! Alert, delegation and audit-trail models.

use chrono::{DateTime, NaiveDate, Utc};
use notify::Channel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Actor recorded for automatic transitions.
pub const SYSTEM_ACTOR: &str = "system";

/// Identifies an alert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlertId(pub String);

impl AlertId {
    /// Create a new alert ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random alert ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AlertId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AlertId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifies a delegation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegationId(pub String);

impl DelegationId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for DelegationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DelegationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Scope at which a KPI is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    Global,
    Region,
    Entity,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Global => "GLOBAL",
            Self::Region => "REGION",
            Self::Entity => "ENTITY",
        })
    }
}

/// Breach classification of one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationStatus {
    Sane,
    Watch,
    Anomalous,
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sane => "SANE",
            Self::Watch => "WATCH",
            Self::Anomalous => "ANOMALOUS",
        })
    }
}

/// Workflow status of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    New,
    InProgress,
    Resolved,
    Archived,
}

impl LifecycleState {
    pub const ALL: [Self; 4] = [Self::New, Self::InProgress, Self::Resolved, Self::Archived];

    /// NEW and IN_PROGRESS alerts occupy their identity key.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::New | Self::InProgress)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InProgress => "IN_PROGRESS",
            Self::Resolved => "RESOLVED",
            Self::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Configured importance of a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Deduplication slot of an alert.
///
/// Entity-scoped alerts are always keyed by entity id plus category, never
/// by KPI name alone, so they can never collide with aggregate alerts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityKey {
    Aggregate {
        kpi_name: String,
        dimension: Dimension,
        dimension_value: Option<String>,
    },
    Entity {
        entity_id: String,
        kpi_name: String,
    },
}

impl IdentityKey {
    #[must_use]
    pub fn aggregate(
        kpi_name: impl Into<String>,
        dimension: Dimension,
        dimension_value: Option<String>,
    ) -> Self {
        Self::Aggregate {
            kpi_name: kpi_name.into(),
            dimension,
            dimension_value,
        }
    }

    #[must_use]
    pub fn entity(entity_id: impl Into<String>, kpi_name: impl Into<String>) -> Self {
        Self::Entity {
            entity_id: entity_id.into(),
            kpi_name: kpi_name.into(),
        }
    }

    #[must_use]
    pub fn kpi_name(&self) -> &str {
        match self {
            Self::Aggregate { kpi_name, .. } | Self::Entity { kpi_name, .. } => kpi_name,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aggregate {
                kpi_name,
                dimension,
                dimension_value,
            } => write!(
                f,
                "{kpi_name}/{dimension}/{}",
                dimension_value.as_deref().unwrap_or("*")
            ),
            Self::Entity {
                entity_id,
                kpi_name,
            } => write!(f, "{kpi_name}@{entity_id}"),
        }
    }
}

/// One observed anomaly attached to an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyDetail {
    #[serde(rename = "type")]
    pub anomaly_type: String,
    pub description: String,
    pub amount: Option<f64>,
    pub days_overdue: Option<i64>,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    /// Due date or end date the anomaly is anchored on
    pub reference_date: Option<NaiveDate>,
}

impl AnomalyDetail {
    /// Two details describe the same crossing when type and anchor date match.
    #[must_use]
    pub fn same_crossing(&self, other: &Self) -> bool {
        self.anomaly_type == other.anomaly_type && self.reference_date == other.reference_date
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Created,
    Refreshed,
    Acknowledged,
    Notified,
    Resolved,
    AutoResolved,
    DuplicateResolved,
    Archived,
    Commented,
    Delegated,
    DelegationUpdated,
}

/// One audit-trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertAction {
    pub action_type: ActionType,
    pub performed_by: String,
    pub performed_at: DateTime<Utc>,
    pub comment: Option<String>,
    /// None only for the CREATED entry
    pub previous_state: Option<LifecycleState>,
    pub new_state: LifecycleState,
}

/// Outcome of one send to one recipient on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub round: u32,
    pub channel: Channel,
    pub recipient: String,
    pub delivered: bool,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Alert read model and stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: AlertId,
    pub category: String,
    pub kpi_name: String,
    pub dimension: Dimension,
    pub dimension_value: Option<String>,
    pub related_entity_id: Option<String>,
    pub owner_id: Option<String>,
    pub current_value: f64,
    pub expected_value: Option<f64>,
    pub breached_bound: Option<f64>,
    pub status: EvaluationStatus,
    pub lifecycle_state: LifecycleState,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub recipients: BTreeSet<String>,
    #[serde(default)]
    pub notification_sent: bool,
    #[serde(default)]
    pub notification_channels: BTreeSet<Channel>,
    pub notification_sent_at: Option<DateTime<Utc>>,
    pub notified_severity: Option<Severity>,
    #[serde(default)]
    pub notification_round: u32,
    #[serde(default)]
    pub deliveries: Vec<DeliveryRecord>,
    #[serde(default)]
    pub anomaly_details: Vec<AnomalyDetail>,
    #[serde(default)]
    pub action_history: Vec<AlertAction>,
    pub created_at: DateTime<Utc>,
    pub last_refreshed_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_comment: Option<String>,
    pub archived_at: Option<DateTime<Utc>>,
    pub archived_by: Option<String>,
    pub delegated_to: Option<String>,
    /// Store-managed revision used for compare-and-swap
    #[serde(default)]
    pub version: u64,
}

impl Alert {
    #[must_use]
    pub fn identity_key(&self) -> IdentityKey {
        match &self.related_entity_id {
            Some(entity_id) => IdentityKey::entity(entity_id.clone(), self.kpi_name.clone()),
            None => IdentityKey::aggregate(
                self.kpi_name.clone(),
                self.dimension,
                self.dimension_value.clone(),
            ),
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.lifecycle_state.is_active()
    }

    /// Move to `to` and append the matching history entry.
    pub fn transition(
        &mut self,
        to: LifecycleState,
        action_type: ActionType,
        actor: &str,
        at: DateTime<Utc>,
        comment: Option<String>,
    ) {
        let previous = self.lifecycle_state;
        self.lifecycle_state = to;
        self.action_history.push(AlertAction {
            action_type,
            performed_by: actor.to_string(),
            performed_at: at,
            comment,
            previous_state: Some(previous),
            new_state: to,
        });
    }

    /// Append a history entry that leaves the state unchanged.
    pub fn record(
        &mut self,
        action_type: ActionType,
        actor: &str,
        at: DateTime<Utc>,
        comment: Option<String>,
    ) {
        let state = self.lifecycle_state;
        self.transition(state, action_type, actor, at, comment);
    }

    /// Whether the alert carries this crossing already.
    #[must_use]
    pub fn has_crossing(&self, detail: &AnomalyDetail) -> bool {
        self.anomaly_details.iter().any(|d| d.same_crossing(detail))
    }

    /// Resolved by a person rather than by the engine.
    #[must_use]
    pub fn manually_resolved(&self) -> bool {
        self.action_history
            .iter()
            .rev()
            .find(|a| {
                matches!(
                    a.action_type,
                    ActionType::Resolved | ActionType::AutoResolved | ActionType::DuplicateResolved
                )
            })
            .is_some_and(|a| a.action_type == ActionType::Resolved)
    }

    /// Whether a notification round is owed for the current content.
    ///
    /// An unfinished round is continued; a finished one re-arms on a
    /// severity rise above the notified severity or on a newer crossing.
    #[must_use]
    pub fn notification_due(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.notification_round == 0 || !self.notification_sent {
            return true;
        }
        if !self.notified_severity.is_some_and(|s| self.severity <= s) {
            return true;
        }
        self.notification_sent_at
            .is_some_and(|sent| self.anomaly_details.iter().any(|d| d.detected_at > sent))
    }

    /// Whether `user_id` should see this alert on their dashboard.
    #[must_use]
    pub fn visible_to(&self, user_id: &str) -> bool {
        self.recipients.contains(user_id)
            || self.delegated_to.as_deref() == Some(user_id)
            || self.owner_id.as_deref() == Some(user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegationStatus {
    Pending,
    InProgress,
    Resolved,
    Rejected,
}

impl DelegationStatus {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Resolved => "RESOLVED",
            Self::Rejected => "REJECTED",
        })
    }
}

/// Hand-off of an active alert to an operational user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delegation {
    pub id: DelegationId,
    pub alert_id: AlertId,
    pub delegated_by: String,
    pub delegated_to: String,
    pub delegated_at: DateTime<Utc>,
    pub note: Option<String>,
    pub status: DelegationStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

/// Counts per lifecycle state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertStatistics {
    pub new: usize,
    pub in_progress: usize,
    pub resolved: usize,
    pub archived: usize,
    pub active: usize,
    pub total: usize,
}

impl AlertStatistics {
    #[must_use]
    pub fn from_alerts<'a>(alerts: impl IntoIterator<Item = &'a Alert>) -> Self {
        let mut stats = Self::default();
        for alert in alerts {
            match alert.lifecycle_state {
                LifecycleState::New => stats.new += 1,
                LifecycleState::InProgress => stats.in_progress += 1,
                LifecycleState::Resolved => stats.resolved += 1,
                LifecycleState::Archived => stats.archived += 1,
            }
            stats.total += 1;
        }
        stats.active = stats.new + stats.in_progress;
        stats
    }
}
