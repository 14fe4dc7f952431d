//! Overdue-invoice scanner.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use tracing::debug;

use super::{AnomalyCandidate, ScanReport, ScanScope, SkippedEntity};
use crate::category::INVOICE_OVERDUE;
use crate::config::InvoiceConfig;
use crate::model::{AnomalyDetail, Dimension, EvaluationStatus, IdentityKey, Severity};
use crate::sources::{Invoice, InvoiceStatus};

/// Anomaly type recorded for late payment.
pub const RETARD: &str = "RETARD";

/// Flags PENDING invoices whose due date is in the past.
#[derive(Debug, Clone)]
pub struct OverdueInvoiceScanner {
    config: InvoiceConfig,
}

impl OverdueInvoiceScanner {
    #[must_use]
    pub const fn new(config: InvoiceConfig) -> Self {
        Self { config }
    }

    /// Severity from lateness, bumped to HIGH for large amounts.
    #[must_use]
    pub fn severity(&self, days_overdue: i64, amount: f64) -> Severity {
        let by_age = if days_overdue > self.config.critical_after_days {
            Severity::Critical
        } else if days_overdue > self.config.high_after_days {
            Severity::High
        } else {
            Severity::Medium
        };
        if amount > self.config.high_amount {
            by_age.max(Severity::High)
        } else {
            by_age
        }
    }

    pub fn scan(&self, invoices: &[Invoice], now: DateTime<Utc>) -> ScanReport {
        let today = now.date_naive();
        let mut candidates = Vec::new();
        let mut skipped = Vec::new();

        for invoice in invoices {
            if invoice.status != InvoiceStatus::Pending {
                continue;
            }
            let Some(due_date) = invoice.due_date else {
                debug!(invoice = %invoice.id, "Invoice has no due date, skipping");
                skipped.push(SkippedEntity {
                    id: invoice.id.clone(),
                    reason: "missing due date".to_string(),
                });
                continue;
            };
            let days_overdue = (today - due_date).num_days();
            if days_overdue <= 0 {
                continue;
            }

            let severity = self.severity(days_overdue, invoice.amount);
            let status = if severity >= Severity::High {
                EvaluationStatus::Anomalous
            } else {
                EvaluationStatus::Watch
            };
            let reference = if invoice.reference.is_empty() {
                invoice.id.clone()
            } else {
                invoice.reference.clone()
            };

            let mut context = Map::new();
            context.insert("reference".into(), Value::String(reference.clone()));
            context.insert("days".into(), json!(days_overdue));
            context.insert("amount".into(), json!(invoice.amount));
            context.insert("due_date".into(), Value::String(due_date.to_string()));

            candidates.push(AnomalyCandidate {
                key: IdentityKey::entity(invoice.id.clone(), INVOICE_OVERDUE),
                category: INVOICE_OVERDUE.to_string(),
                dimension: Dimension::Entity,
                dimension_value: Some(invoice.id.clone()),
                status,
                severity,
                current_value: days_overdue as f64,
                expected_value: Some(0.0),
                breached_bound: Some(0.0),
                owner_id: invoice.owner_id.clone(),
                anomaly: AnomalyDetail {
                    anomaly_type: RETARD.to_string(),
                    description: format!("Facture {reference} en retard de {days_overdue} jours"),
                    amount: Some(invoice.amount),
                    days_overdue: Some(days_overdue),
                    severity,
                    detected_at: now,
                    reference_date: Some(due_date),
                },
                context,
            });
        }

        ScanReport {
            source: "overdue-invoices",
            scope: ScanScope::Category {
                kpi_name: INVOICE_OVERDUE.to_string(),
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

    fn invoice(id: &str, due_in_days: Option<i64>, amount: f64, now: DateTime<Utc>) -> Invoice {
        Invoice {
            id: id.to_string(),
            reference: format!("REF-{id}"),
            due_date: due_in_days.map(|d| now.date_naive() + Duration::days(d)),
            amount,
            owner_id: Some("u-owner".to_string()),
            status: InvoiceStatus::Pending,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_ten_days_overdue_is_high() {
        let scanner = OverdueInvoiceScanner::new(InvoiceConfig::default());
        let report = scanner.scan(&[invoice("INV-01", Some(-10), 1200.0, now())], now());

        assert_eq!(report.candidates.len(), 1);
        let c = &report.candidates[0];
        assert_eq!(c.key, IdentityKey::entity("INV-01", INVOICE_OVERDUE));
        assert_eq!(c.severity, Severity::High);
        assert_eq!(c.status, EvaluationStatus::Anomalous);
        assert_eq!(c.anomaly.anomaly_type, RETARD);
        assert_eq!(c.anomaly.days_overdue, Some(10));
        assert_eq!(c.owner_id.as_deref(), Some("u-owner"));
    }

    #[test]
    fn test_severity_table() {
        let scanner = OverdueInvoiceScanner::new(InvoiceConfig::default());
        let cases = [
            (1, 100.0, Severity::Medium),
            (7, 100.0, Severity::Medium),
            (8, 100.0, Severity::High),
            (60, 100.0, Severity::High),
            (61, 100.0, Severity::Critical),
            (2, 80_000.0, Severity::High),
            (90, 80_000.0, Severity::Critical),
        ];
        for (days, amount, expected) in cases {
            assert_eq!(scanner.severity(days, amount), expected, "days={days}");
        }
    }

    #[test]
    fn test_skips_missing_dates_without_failing_batch() {
        let scanner = OverdueInvoiceScanner::new(InvoiceConfig::default());
        let report = scanner.scan(
            &[
                invoice("INV-01", None, 10.0, now()),
                invoice("INV-02", Some(-3), 10.0, now()),
            ],
            now(),
        );
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(!report
            .scope
            .covers(&IdentityKey::entity("INV-01", INVOICE_OVERDUE)));
        assert!(report
            .scope
            .covers(&IdentityKey::entity("INV-99", INVOICE_OVERDUE)));
    }

    #[test]
    fn test_ignores_paid_and_not_yet_due() {
        let scanner = OverdueInvoiceScanner::new(InvoiceConfig::default());
        let mut paid = invoice("INV-01", Some(-10), 10.0, now());
        paid.status = InvoiceStatus::Paid;
        let due_today = invoice("INV-02", Some(0), 10.0, now());
        let report = scanner.scan(&[paid, due_today], now());
        assert!(report.candidates.is_empty());
    }
}
