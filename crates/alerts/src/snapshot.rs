//! File-backed collaborators for the command-line binary.
//!
//! A snapshot is one JSON document holding metric readings, invoices,
//! conventions and users. It implements every source trait the engine
//! needs, so the binary can run without external systems.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

use crate::category::Role;
use crate::error::SourceError;
use crate::model::Dimension;
use crate::sources::{
    Convention, EntitySource, Invoice, InvoiceStatus, MetricKey, MetricSource, Recipient,
    RoleDirectory,
};
use notify::Channel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricReading {
    pub kpi_name: String,
    #[serde(default = "global_dimension")]
    pub dimension: Dimension,
    #[serde(default)]
    pub dimension_value: Option<String>,
    pub value: f64,
}

const fn global_dimension() -> Dimension {
    Dimension::Global
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUser {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub channel_prefs: BTreeSet<Channel>,
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Categories this user covers; empty means all
    #[serde(default)]
    pub categories: Vec<String>,
}

impl SnapshotUser {
    fn recipient(&self) -> Recipient {
        let mut channel_prefs = self.channel_prefs.clone();
        channel_prefs.insert(Channel::InApp);
        Recipient {
            user_id: self.user_id.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            channel_prefs,
        }
    }

    fn covers(&self, category: &str) -> bool {
        self.categories.is_empty() || self.categories.iter().any(|c| c == category)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSource {
    pub metrics: Vec<MetricReading>,
    pub invoices: Vec<Invoice>,
    pub conventions: Vec<Convention>,
    pub users: Vec<SnapshotUser>,
}

impl SnapshotSource {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read data snapshot: {}", path.display()))?;
        let snapshot: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse data snapshot: {}", path.display()))?;
        info!(
            path = %path.display(),
            metrics = snapshot.metrics.len(),
            invoices = snapshot.invoices.len(),
            conventions = snapshot.conventions.len(),
            users = snapshot.users.len(),
            "Loaded data snapshot"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl MetricSource for SnapshotSource {
    async fn current_value(
        &self,
        key: &MetricKey,
        _as_of: DateTime<Utc>,
    ) -> Result<Option<f64>, SourceError> {
        Ok(self
            .metrics
            .iter()
            .find(|m| {
                m.kpi_name == key.kpi_name
                    && m.dimension == key.dimension
                    && m.dimension_value == key.dimension_value
            })
            .map(|m| m.value))
    }
}

#[async_trait]
impl EntitySource for SnapshotSource {
    async fn list_overdue_invoices(&self, as_of: NaiveDate) -> Result<Vec<Invoice>, SourceError> {
        // Undated pending invoices are passed through so the scanner can
        // report them as skipped.
        Ok(self
            .invoices
            .iter()
            .filter(|i| i.status == InvoiceStatus::Pending)
            .filter(|i| i.due_date.map_or(true, |due| due < as_of))
            .cloned()
            .collect())
    }

    async fn list_active_conventions(&self) -> Result<Vec<Convention>, SourceError> {
        Ok(self.conventions.clone())
    }
}

#[async_trait]
impl RoleDirectory for SnapshotSource {
    async fn recipients_for(
        &self,
        category: &str,
        roles: &[Role],
        owner_id: Option<String>,
    ) -> Result<Vec<Recipient>, SourceError> {
        let wants_owner = roles.contains(&Role::Owner);
        Ok(self
            .users
            .iter()
            .filter(|u| {
                let is_owner = wants_owner && owner_id.as_deref() == Some(u.user_id.as_str());
                let has_role = u.covers(category)
                    && u.roles.iter().any(|r| *r != Role::Owner && roles.contains(r));
                is_owner || has_role
            })
            .map(SnapshotUser::recipient)
            .collect())
    }

    async fn lookup(&self, user_id: &str) -> Result<Option<Recipient>, SourceError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.user_id == user_id)
            .map(SnapshotUser::recipient))
    }
}
