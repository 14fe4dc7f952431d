//! Collaborator interfaces the engine reads from.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use notify::Channel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::category::Role;
use crate::error::SourceError;
use crate::model::Dimension;

/// Scope of one metric reading.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricKey {
    pub kpi_name: String,
    pub dimension: Dimension,
    #[serde(default)]
    pub dimension_value: Option<String>,
}

impl MetricKey {
    #[must_use]
    pub fn global(kpi_name: impl Into<String>) -> Self {
        Self {
            kpi_name: kpi_name.into(),
            dimension: Dimension::Global,
            dimension_value: None,
        }
    }
}

/// Supplies current KPI values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Current value of a KPI, or `None` when there is no data for the scope.
    async fn current_value(
        &self,
        key: &MetricKey,
        as_of: DateTime<Utc>,
    ) -> Result<Option<f64>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub reference: String,
    pub due_date: Option<NaiveDate>,
    pub amount: f64,
    pub owner_id: Option<String>,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Convention {
    pub id: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub title: String,
    pub end_date: Option<NaiveDate>,
    pub owner_id: Option<String>,
}

/// Supplies business entities to scan.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Invoices that may be overdue as of `as_of`.
    async fn list_overdue_invoices(&self, as_of: NaiveDate) -> Result<Vec<Invoice>, SourceError>;

    async fn list_active_conventions(&self) -> Result<Vec<Convention>, SourceError>;
}

/// A person who can be notified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub channel_prefs: BTreeSet<Channel>,
}

impl Recipient {
    /// A recipient known only by id, reachable in-app.
    #[must_use]
    pub fn in_app_only(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            phone: None,
            channel_prefs: BTreeSet::from([Channel::InApp]),
        }
    }

    /// Address to use on `channel`, if the recipient has one.
    #[must_use]
    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::InApp => Some(self.user_id.as_str()),
            Channel::Email => self.email.as_deref().filter(|e| !e.is_empty()),
            Channel::Sms => self.phone.as_deref().filter(|p| !p.is_empty()),
        }
    }
}

/// Resolves roles to people.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// Users holding `roles` for an alert of `category`; `Role::Owner`
    /// resolves to `owner_id`.
    async fn recipients_for(
        &self,
        category: &str,
        roles: &[Role],
        owner_id: Option<String>,
    ) -> Result<Vec<Recipient>, SourceError>;

    async fn lookup(&self, user_id: &str) -> Result<Option<Recipient>, SourceError>;
}
