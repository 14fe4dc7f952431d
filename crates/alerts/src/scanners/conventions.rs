//! Convention-expiry scanner.
//!
//! A convention falls in the bracket of the smallest enabled threshold that
//! is at least its remaining days. Each bracket is its own crossing, anchored
//! on the end date, so it fires at most once per convention and end date.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::debug;

use super::{AnomalyCandidate, ScanReport, ScanScope, SkippedEntity};
use crate::category::CONVENTION_EXPIRY;
use crate::model::{AnomalyDetail, Dimension, EvaluationStatus, IdentityKey, Severity};
use crate::sources::Convention;

#[derive(Debug, Clone)]
pub struct ConventionExpiryScanner {
    /// Enabled thresholds in days, ascending
    thresholds: Vec<i64>,
}

impl ConventionExpiryScanner {
    #[must_use]
    pub fn new(mut thresholds: Vec<i64>) -> Self {
        thresholds.sort_unstable();
        thresholds.dedup();
        Self { thresholds }
    }

    /// Bracket for `days_left`, if any threshold applies.
    #[must_use]
    pub fn bracket(&self, days_left: i64) -> Option<i64> {
        let days = days_left.max(0);
        self.thresholds.iter().copied().find(|t| days <= *t)
    }

    #[must_use]
    pub const fn severity(days_left: i64) -> Severity {
        match days_left {
            i64::MIN..=1 => Severity::Critical,
            2..=7 => Severity::High,
            8..=15 => Severity::Medium,
            _ => Severity::Low,
        }
    }

    /// Human wording of the remaining time.
    #[must_use]
    pub fn expiry_label(days_left: i64) -> String {
        match days_left {
            d if d < 0 => format!("a expiré depuis {} jours", -d),
            0 => "expire AUJOURD'HUI".to_string(),
            1 => "expire demain (1 jour)".to_string(),
            d => format!("expire dans {d} jours"),
        }
    }

    pub fn scan(&self, conventions: &[Convention], now: DateTime<Utc>) -> ScanReport {
        let today = now.date_naive();
        let mut candidates = Vec::new();
        let mut skipped = Vec::new();

        for convention in conventions {
            let Some(end_date) = convention.end_date else {
                debug!(convention = %convention.id, "Convention has no end date, skipping");
                skipped.push(SkippedEntity {
                    id: convention.id.clone(),
                    reason: "missing end date".to_string(),
                });
                continue;
            };
            let days_left = (end_date - today).num_days();
            let Some(bracket) = self.bracket(days_left) else {
                continue;
            };

            let severity = Self::severity(days_left);
            let status = if days_left <= 7 {
                EvaluationStatus::Anomalous
            } else {
                EvaluationStatus::Watch
            };
            let reference = if convention.reference.is_empty() {
                convention.id.clone()
            } else {
                convention.reference.clone()
            };
            let label = Self::expiry_label(days_left);

            let mut context = Map::new();
            context.insert("reference".into(), Value::String(reference.clone()));
            context.insert("title".into(), Value::String(convention.title.clone()));
            context.insert("days".into(), json!(days_left));
            context.insert("expiry".into(), Value::String(label.clone()));
            context.insert("end_date".into(), Value::String(end_date.to_string()));

            candidates.push(AnomalyCandidate {
                key: IdentityKey::entity(convention.id.clone(), CONVENTION_EXPIRY),
                category: CONVENTION_EXPIRY.to_string(),
                dimension: Dimension::Entity,
                dimension_value: Some(convention.id.clone()),
                status,
                severity,
                current_value: days_left as f64,
                expected_value: None,
                breached_bound: Some(bracket as f64),
                owner_id: convention.owner_id.clone(),
                anomaly: AnomalyDetail {
                    anomaly_type: format!("EXPIRY_{bracket}D"),
                    description: format!("Convention {reference} {label}"),
                    amount: None,
                    days_overdue: (days_left < 0).then_some(-days_left),
                    severity,
                    detected_at: now,
                    reference_date: Some(end_date),
                },
                context,
            });
        }

        ScanReport {
            source: "convention-expiry",
            scope: ScanScope::Category {
                kpi_name: CONVENTION_EXPIRY.to_string(),
                skipped: skipped.iter().map(|s| s.id.clone()).collect::<HashSet<_>>(),
            },
            candidates,
            skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
    }

    fn convention(id: &str, ends_in: Option<i64>) -> Convention {
        Convention {
            id: id.to_string(),
            reference: id.to_string(),
            title: "Maintenance".to_string(),
            end_date: ends_in.map(|d| now().date_naive() + Duration::days(d)),
            owner_id: Some("u-pm".to_string()),
        }
    }

    fn scanner() -> ConventionExpiryScanner {
        ConventionExpiryScanner::new(vec![30, 15, 7, 1, 0])
    }

    #[test]
    fn test_brackets() {
        let s = scanner();
        assert_eq!(s.bracket(40), None);
        assert_eq!(s.bracket(30), Some(30));
        assert_eq!(s.bracket(16), Some(30));
        assert_eq!(s.bracket(10), Some(15));
        assert_eq!(s.bracket(7), Some(7));
        assert_eq!(s.bracket(1), Some(1));
        assert_eq!(s.bracket(0), Some(0));
        assert_eq!(s.bracket(-4), Some(0));
    }

    #[test]
    fn test_seven_days_is_high_with_wording() {
        let report = scanner().scan(&[convention("CONV-02", Some(7))], now());
        let c = &report.candidates[0];
        assert_eq!(c.severity, Severity::High);
        assert_eq!(c.anomaly.anomaly_type, "EXPIRY_7D");
        assert!(c.anomaly.description.contains("7 jours"));
        assert_eq!(c.context["expiry"], "expire dans 7 jours");
    }

    #[test]
    fn test_renewed_convention_not_reported() {
        let report = scanner().scan(&[convention("CONV-02", Some(40))], now());
        assert!(report.candidates.is_empty());
        assert!(report
            .scope
            .covers(&IdentityKey::entity("CONV-02", CONVENTION_EXPIRY)));
    }

    #[test]
    fn test_disabled_thresholds_change_bracket() {
        let s = ConventionExpiryScanner::new(vec![30, 1, 0]);
        let report = s.scan(&[convention("CONV-03", Some(7))], now());
        assert_eq!(report.candidates[0].anomaly.anomaly_type, "EXPIRY_30D");
    }

    #[test]
    fn test_expired_and_missing_date() {
        let report = scanner().scan(
            &[convention("CONV-04", Some(-2)), convention("CONV-05", None)],
            now(),
        );
        assert_eq!(report.candidates.len(), 1);
        let c = &report.candidates[0];
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.anomaly.anomaly_type, "EXPIRY_0D");
        assert_eq!(report.skipped[0].id, "CONV-05");
    }

    #[test]
    fn test_labels() {
        assert_eq!(
            ConventionExpiryScanner::expiry_label(0),
            "expire AUJOURD'HUI"
        );
        assert_eq!(
            ConventionExpiryScanner::expiry_label(15),
            "expire dans 15 jours"
        );
    }
}
