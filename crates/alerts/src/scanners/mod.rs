//! Anomaly candidates and the scanners that produce them.
//!
//! Scanners are read-only. They turn collaborator data into candidates and
//! say which identity keys they covered, so that keys they stopped reporting
//! can be resolved.

pub mod conventions;
pub mod invoices;

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::model::{AnomalyDetail, Dimension, EvaluationStatus, IdentityKey, Severity};

pub use conventions::ConventionExpiryScanner;
pub use invoices::OverdueInvoiceScanner;

/// One observation that warrants an alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyCandidate {
    pub key: IdentityKey,
    pub category: String,
    pub dimension: Dimension,
    pub dimension_value: Option<String>,
    pub status: EvaluationStatus,
    pub severity: Severity,
    pub current_value: f64,
    pub expected_value: Option<f64>,
    pub breached_bound: Option<f64>,
    pub owner_id: Option<String>,
    pub anomaly: AnomalyDetail,
    /// Extra template variables
    pub context: Map<String, Value>,
}

impl AnomalyCandidate {
    #[must_use]
    pub fn related_entity_id(&self) -> Option<&str> {
        match &self.key {
            IdentityKey::Entity { entity_id, .. } => Some(entity_id),
            IdentityKey::Aggregate { .. } => None,
        }
    }
}

/// Identity keys a report speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScope {
    /// Every entity alert of one category, except entities that were skipped
    Category {
        kpi_name: String,
        skipped: HashSet<String>,
    },
    /// Exactly these keys
    Keys(HashSet<IdentityKey>),
}

impl ScanScope {
    #[must_use]
    pub fn covers(&self, key: &IdentityKey) -> bool {
        match self {
            Self::Category { kpi_name, skipped } => match key {
                IdentityKey::Entity {
                    entity_id,
                    kpi_name: k,
                } => k == kpi_name && !skipped.contains(entity_id),
                IdentityKey::Aggregate { .. } => false,
            },
            Self::Keys(keys) => keys.contains(key),
        }
    }

    /// Narrow this scope to `keys`.
    #[must_use]
    pub fn restrict(&self, keys: &HashSet<IdentityKey>) -> Self {
        Self::Keys(keys.iter().filter(|k| self.covers(k)).cloned().collect())
    }
}

/// An entity left out of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntity {
    pub id: String,
    pub reason: String,
}

/// Output of one scanner or evaluator pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub source: &'static str,
    pub scope: ScanScope,
    pub candidates: Vec<AnomalyCandidate>,
    pub skipped: Vec<SkippedEntity>,
}

impl ScanReport {
    /// Keep only candidates and scope for `keys`.
    #[must_use]
    pub fn restricted_to(self, keys: &HashSet<IdentityKey>) -> Self {
        Self {
            source: self.source,
            scope: self.scope.restrict(keys),
            candidates: self
                .candidates
                .into_iter()
                .filter(|c| keys.contains(&c.key))
                .collect(),
            skipped: self.skipped,
        }
    }

    /// Keys reported as anomalous in this pass.
    #[must_use]
    pub fn reported_keys(&self) -> HashSet<IdentityKey> {
        self.candidates.iter().map(|c| c.key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_scope_excludes_skipped_and_other_categories() {
        let scope = ScanScope::Category {
            kpi_name: "INVOICE_OVERDUE".to_string(),
            skipped: HashSet::from(["INV-2".to_string()]),
        };
        assert!(scope.covers(&IdentityKey::entity("INV-1", "INVOICE_OVERDUE")));
        assert!(!scope.covers(&IdentityKey::entity("INV-2", "INVOICE_OVERDUE")));
        assert!(!scope.covers(&IdentityKey::entity("CONV-1", "CONVENTION_EXPIRY")));
        assert!(!scope.covers(&IdentityKey::aggregate(
            "INVOICE_OVERDUE",
            Dimension::Global,
            None
        )));
    }

    #[test]
    fn test_restrict() {
        let scope = ScanScope::Category {
            kpi_name: "INVOICE_OVERDUE".to_string(),
            skipped: HashSet::new(),
        };
        let keys = HashSet::from([
            IdentityKey::entity("INV-1", "INVOICE_OVERDUE"),
            IdentityKey::entity("CONV-1", "CONVENTION_EXPIRY"),
        ]);
        let narrowed = scope.restrict(&keys);
        assert!(narrowed.covers(&IdentityKey::entity("INV-1", "INVOICE_OVERDUE")));
        assert!(!narrowed.covers(&IdentityKey::entity("INV-3", "INVOICE_OVERDUE")));
        assert!(!narrowed.covers(&IdentityKey::entity("CONV-1", "CONVENTION_EXPIRY")));
    }
}
