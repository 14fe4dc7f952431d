//! KPI classification and the aggregate evaluation pass.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::category::{CategoryRegistry, Direction};
use crate::model::{AnomalyDetail, EvaluationStatus, IdentityKey, Priority, Severity};
use crate::scanners::{AnomalyCandidate, ScanReport, ScanScope, SkippedEntity};
use crate::sources::{MetricKey, MetricSource};
use crate::thresholds::{Threshold, ThresholdStore};

/// Result of classifying one value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub status: EvaluationStatus,
    pub severity: Severity,
    /// Bound that was crossed, if any
    pub breached_bound: Option<f64>,
}

/// Whether `value` sits within the tolerance band around the normal value.
fn within_tolerance(value: f64, threshold: &Threshold) -> bool {
    threshold.normal_value.is_some_and(|normal| {
        let band = (normal * threshold.tolerance_percent / 100.0).abs();
        (value - normal).abs() <= band
    })
}

/// Severity from classification and threshold priority.
#[must_use]
pub const fn severity_for(status: EvaluationStatus, priority: Priority) -> Severity {
    match (status, priority) {
        (EvaluationStatus::Anomalous, Priority::High) => Severity::Critical,
        (EvaluationStatus::Anomalous, Priority::Medium) => Severity::High,
        (EvaluationStatus::Anomalous, Priority::Low) => Severity::Medium,
        (EvaluationStatus::Watch, Priority::High) => Severity::Medium,
        (EvaluationStatus::Watch, _) | (EvaluationStatus::Sane, _) => Severity::Low,
    }
}

/// Classify `value` against `threshold`.
///
/// The hard bound always wins. A soft-bound crossing inside the tolerance
/// band around the normal value is treated as noise.
#[must_use]
pub fn evaluate(value: f64, threshold: &Threshold, direction: Direction) -> Evaluation {
    let (status, breached_bound) = if direction.crosses(value, threshold.high_bound) {
        (EvaluationStatus::Anomalous, Some(threshold.high_bound))
    } else if direction.crosses(value, threshold.low_bound) && !within_tolerance(value, threshold)
    {
        (EvaluationStatus::Watch, Some(threshold.low_bound))
    } else {
        (EvaluationStatus::Sane, None)
    };
    Evaluation {
        status,
        severity: severity_for(status, threshold.priority),
        breached_bound,
    }
}

/// Evaluates every enabled threshold scope against the metric source.
pub struct KpiEvaluator {
    metrics: Arc<dyn MetricSource>,
    thresholds: Arc<ThresholdStore>,
    registry: Arc<CategoryRegistry>,
}

impl KpiEvaluator {
    #[must_use]
    pub fn new(
        metrics: Arc<dyn MetricSource>,
        thresholds: Arc<ThresholdStore>,
        registry: Arc<CategoryRegistry>,
    ) -> Self {
        Self {
            metrics,
            thresholds,
            registry,
        }
    }

    /// One pass over all configured KPI scopes; metric reads run concurrently.
    ///
    /// Scopes whose metric could not be read are left out of the report
    /// scope so their alerts are neither refreshed nor resolved.
    pub async fn run(&self, now: DateTime<Utc>) -> ScanReport {
        let mut candidates = Vec::new();
        let mut skipped = Vec::new();
        let mut observed = HashSet::new();

        let targets = self.thresholds.enabled();
        for kpi in self.registry.aggregate_kpis() {
            if !targets.iter().any(|t| t.kpi_name == kpi) {
                debug!(kpi, "KPI has no threshold configured, skipping");
                skipped.push(SkippedEntity {
                    id: kpi.to_string(),
                    reason: "no threshold configured".to_string(),
                });
            }
        }

        let mut reads = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(direction) = self.registry.direction(&target.kpi_name) else {
                warn!(kpi = %target.kpi_name, "Threshold for unknown KPI, skipping");
                skipped.push(SkippedEntity {
                    id: target.kpi_name.clone(),
                    reason: "unknown KPI".to_string(),
                });
                continue;
            };
            let key = MetricKey {
                kpi_name: target.kpi_name.clone(),
                dimension: target.dimension,
                dimension_value: target.dimension_value.clone(),
            };
            reads.push((target, key, direction));
        }

        let values = join_all(
            reads
                .iter()
                .map(|(_, key, _)| self.metrics.current_value(key, now)),
        )
        .await;

        for ((target, key, direction), value) in reads.into_iter().zip(values) {
            let value = match value {
                Ok(Some(value)) => value,
                Ok(None) => {
                    debug!(kpi = %key.kpi_name, "No metric data for scope");
                    skipped.push(SkippedEntity {
                        id: key.kpi_name.clone(),
                        reason: "no data".to_string(),
                    });
                    continue;
                }
                Err(e) => {
                    warn!(kpi = %key.kpi_name, error = %e, "Metric source failed");
                    skipped.push(SkippedEntity {
                        id: key.kpi_name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            // A regional target may resolve to a more specific threshold
            // than the one it was listed under.
            let threshold = self
                .thresholds
                .get(&key.kpi_name, key.dimension, key.dimension_value.as_deref())
                .unwrap_or(target);

            let identity =
                IdentityKey::aggregate(key.kpi_name.clone(), key.dimension, key.dimension_value.clone());
            observed.insert(identity.clone());

            let evaluation = evaluate(value, &threshold, direction);
            debug!(
                kpi = %key.kpi_name,
                value,
                status = %evaluation.status,
                "KPI evaluated"
            );
            if evaluation.status == EvaluationStatus::Sane {
                continue;
            }

            candidates.push(self.candidate(identity, &key, &threshold, value, evaluation, now));
        }

        ScanReport {
            source: "kpi-analysis",
            scope: ScanScope::Keys(observed),
            candidates,
            skipped,
        }
    }

    fn candidate(
        &self,
        identity: IdentityKey,
        key: &MetricKey,
        threshold: &Threshold,
        value: f64,
        evaluation: Evaluation,
        now: DateTime<Utc>,
    ) -> AnomalyCandidate {
        let description = self
            .registry
            .get(&key.kpi_name)
            .map_or_else(|| key.kpi_name.clone(), |s| s.description.clone());

        let mut context = Map::new();
        context.insert("unit".into(), Value::String(threshold.unit.clone()));

        AnomalyCandidate {
            key: identity,
            category: key.kpi_name.clone(),
            dimension: key.dimension,
            dimension_value: key.dimension_value.clone(),
            status: evaluation.status,
            severity: evaluation.severity,
            current_value: value,
            expected_value: threshold.normal_value,
            breached_bound: evaluation.breached_bound,
            owner_id: None,
            anomaly: AnomalyDetail {
                anomaly_type: evaluation.status.to_string(),
                description: format!("{description} : {value:.2} {}", threshold.unit),
                amount: None,
                days_overdue: None,
                severity: evaluation.severity,
                detected_at: now,
                reference_date: None,
            },
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::model::Dimension;
    use crate::sources::MockMetricSource;
    use crate::thresholds::default_thresholds;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn threshold(kpi: &str) -> Threshold {
        default_thresholds()
            .into_iter()
            .find(|t| t.kpi_name == kpi)
            .unwrap()
    }

    #[test]
    fn test_higher_is_worse_table() {
        let t = threshold("TAUX_RETARD"); // low 5, high 10, HIGH priority
        let cases = [
            (2.0, EvaluationStatus::Sane, Severity::Low),
            (5.0, EvaluationStatus::Watch, Severity::Medium),
            (9.99, EvaluationStatus::Watch, Severity::Medium),
            (10.0, EvaluationStatus::Anomalous, Severity::Critical),
            (40.0, EvaluationStatus::Anomalous, Severity::Critical),
        ];
        for (value, status, severity) in cases {
            let e = evaluate(value, &t, Direction::HigherIsWorse);
            assert_eq!((e.status, e.severity), (status, severity), "value={value}");
        }
    }

    #[test]
    fn test_lower_is_worse_table() {
        let t = threshold("TAUX_CONVERSION"); // low 60, high 50, MEDIUM priority
        let cases = [
            (75.0, EvaluationStatus::Sane, Severity::Low),
            (60.0, EvaluationStatus::Watch, Severity::Low),
            (55.0, EvaluationStatus::Watch, Severity::Low),
            (50.0, EvaluationStatus::Anomalous, Severity::High),
            (10.0, EvaluationStatus::Anomalous, Severity::High),
        ];
        for (value, status, severity) in cases {
            let e = evaluate(value, &t, Direction::LowerIsWorse);
            assert_eq!((e.status, e.severity), (status, severity), "value={value}");
        }
    }

    #[test]
    fn test_tolerance_band_forces_sane_on_soft_bound() {
        let mut t = threshold("TAUX_RETARD");
        t.normal_value = Some(5.0);
        t.tolerance_percent = 10.0; // band 4.5..=5.5
        let e = evaluate(5.4, &t, Direction::HigherIsWorse);
        assert_eq!(e.status, EvaluationStatus::Sane);
        let e = evaluate(5.6, &t, Direction::HigherIsWorse);
        assert_eq!(e.status, EvaluationStatus::Watch);
    }

    #[test]
    fn test_tolerance_never_masks_hard_bound() {
        let mut t = threshold("TAUX_RETARD");
        t.normal_value = Some(10.0);
        t.tolerance_percent = 50.0;
        let e = evaluate(11.0, &t, Direction::HigherIsWorse);
        assert_eq!(e.status, EvaluationStatus::Anomalous);
        assert_eq!(e.breached_bound, Some(10.0));
    }

    #[test]
    fn test_severity_priority_table() {
        use EvaluationStatus::{Anomalous, Sane, Watch};
        assert_eq!(severity_for(Anomalous, Priority::High), Severity::Critical);
        assert_eq!(severity_for(Anomalous, Priority::Medium), Severity::High);
        assert_eq!(severity_for(Anomalous, Priority::Low), Severity::Medium);
        for p in [Priority::High, Priority::Medium, Priority::Low] {
            assert!(severity_for(Watch, p) <= Severity::Medium);
            assert_eq!(severity_for(Sane, p), Severity::Low);
        }
    }

    fn evaluator(metrics: MockMetricSource) -> KpiEvaluator {
        KpiEvaluator::new(
            Arc::new(metrics),
            Arc::new(ThresholdStore::from_thresholds(default_thresholds()).unwrap()),
            Arc::new(CategoryRegistry::builtin()),
        )
    }

    #[tokio::test]
    async fn test_run_reports_anomalies_and_scope() {
        let mut metrics = MockMetricSource::new();
        metrics
            .expect_current_value()
            .returning(|key, _| match key.kpi_name.as_str() {
                "TAUX_RETARD" => Ok(Some(12.0)),
                "TAUX_PAIEMENT" => Ok(Some(95.0)),
                _ => Ok(None),
            });

        let report = evaluator(metrics).run(Utc::now()).await;

        assert_eq!(report.candidates.len(), 1);
        let c = &report.candidates[0];
        assert_eq!(
            c.key,
            IdentityKey::aggregate("TAUX_RETARD", Dimension::Global, None)
        );
        assert_eq!(c.severity, Severity::Critical);
        assert!(c.related_entity_id().is_none());

        // Sane TAUX_PAIEMENT was observed, so its alert may be resolved.
        assert!(report.scope.covers(&IdentityKey::aggregate(
            "TAUX_PAIEMENT",
            Dimension::Global,
            None
        )));
        // No data: not observed.
        assert!(!report.scope.covers(&IdentityKey::aggregate(
            "TAUX_CONVERSION",
            Dimension::Global,
            None
        )));
    }

    /// Counts how many reads are in flight at once.
    #[derive(Default)]
    struct SlowMetrics {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl MetricSource for SlowMetrics {
        async fn current_value(
            &self,
            _key: &MetricKey,
            _as_of: DateTime<Utc>,
        ) -> Result<Option<f64>, SourceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(1.0))
        }
    }

    #[tokio::test]
    async fn test_metric_reads_overlap() {
        let metrics = Arc::new(SlowMetrics::default());
        let evaluator = KpiEvaluator::new(
            metrics.clone(),
            Arc::new(ThresholdStore::from_thresholds(default_thresholds()).unwrap()),
            Arc::new(CategoryRegistry::builtin()),
        );
        let report = evaluator.run(Utc::now()).await;
        assert!(report.skipped.is_empty());
        assert_eq!(metrics.peak.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_source_failure_is_not_observed() {
        let mut metrics = MockMetricSource::new();
        metrics
            .expect_current_value()
            .returning(|_, _| Err(SourceError::Unavailable("metrics down".into())));

        let report = evaluator(metrics).run(Utc::now()).await;
        assert!(report.candidates.is_empty());
        assert_eq!(report.skipped.len(), 5);
        assert!(!report.scope.covers(&IdentityKey::aggregate(
            "TAUX_RETARD",
            Dimension::Global,
            None
        )));
    }
}
