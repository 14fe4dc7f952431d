//! The alert engine: wires sources, evaluation, lifecycle and dispatch.
//!
//! Every cadence funnels through [`AlertEngine::run_cycle`], so a forced run
//! and a scheduled run execute the same code.

use chrono::{DateTime, Duration, Utc};
use notify::Notifier;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::category::{CategoryRegistry, CategorySpec, Role};
use crate::config::EngineConfig;
use crate::dispatch::{DispatchResult, NotificationDispatcher};
use crate::error::AlertError;
use crate::kpi::KpiEvaluator;
use crate::lifecycle::{AlertManager, ApplyOutcome};
use crate::model::{
    Alert, AlertAction, AlertId, AlertStatistics, Delegation, DelegationId, Severity,
};
use crate::repository::AlertRepository;
use crate::scanners::{ConventionExpiryScanner, OverdueInvoiceScanner, ScanReport};
use crate::scheduler::Cadence;
use crate::sources::{EntitySource, MetricSource, RoleDirectory};
use crate::store::{AlertStore, InMemoryAlertStore};
use crate::templates::MessageRenderer;
use crate::thresholds::ThresholdStore;

/// Source of "now" for the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.write() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

/// External systems the engine depends on.
pub struct Collaborators {
    pub metrics: Arc<dyn MetricSource>,
    pub entities: Arc<dyn EntitySource>,
    pub directory: Arc<dyn RoleDirectory>,
    pub notifier: Arc<Notifier>,
    pub store: Arc<dyn AlertStore>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-memory store and the system clock by default.
    #[must_use]
    pub fn new(
        metrics: Arc<dyn MetricSource>,
        entities: Arc<dyn EntitySource>,
        directory: Arc<dyn RoleDirectory>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            metrics,
            entities,
            directory,
            notifier,
            store: Arc::new(InMemoryAlertStore::new()),
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn AlertStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cadence: String,
    pub created: usize,
    pub refreshed: usize,
    pub escalated: usize,
    pub auto_resolved: usize,
    pub suppressed: usize,
    pub duplicates_resolved: usize,
    pub archived: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
    pub skipped_sources: Vec<String>,
    pub errors: Vec<String>,
}

impl CycleReport {
    fn new(cadence: Cadence) -> Self {
        Self {
            cadence: cadence.to_string(),
            ..Self::default()
        }
    }

    fn absorb_apply(&mut self, outcome: &ApplyOutcome) {
        self.created += outcome.created.len();
        self.refreshed += outcome.refreshed.len();
        self.escalated += outcome.escalated.len();
        self.auto_resolved += outcome.auto_resolved.len();
        self.suppressed += outcome.suppressed;
        self.errors.extend(outcome.errors.iter().cloned());
    }

    fn absorb_dispatch(&mut self, results: &[DispatchResult]) {
        for r in results {
            self.notifications_sent += r.delivered;
            self.notifications_failed += r.failed;
        }
    }

    /// Alerts touched by evaluation in this cycle.
    #[must_use]
    pub const fn alerts_refreshed(&self) -> usize {
        self.created + self.refreshed + self.auto_resolved
    }
}

fn build_registry(config: &EngineConfig) -> CategoryRegistry {
    let mut registry = CategoryRegistry::builtin();
    for kpi in &config.kpis {
        registry.register(CategorySpec::kpi(
            &kpi.name,
            &kpi.description,
            &kpi.unit,
            kpi.direction,
            vec![Role::DecisionMaker, Role::Admin],
        ));
    }
    for o in &config.categories {
        if !registry.apply_override(o) {
            warn!(category = %o.key, "Override for unknown category ignored");
        }
    }
    registry
}

pub struct AlertEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    entities: Arc<dyn EntitySource>,
    thresholds: Arc<ThresholdStore>,
    registry: Arc<CategoryRegistry>,
    evaluator: KpiEvaluator,
    invoices: OverdueInvoiceScanner,
    conventions: ConventionExpiryScanner,
    manager: AlertManager,
    dispatcher: NotificationDispatcher,
}

impl AlertEngine {
    /// Build the engine from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the threshold set is inconsistent or a category
    /// template does not parse.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self, AlertError> {
        let registry = Arc::new(build_registry(&config));
        let renderer = Arc::new(MessageRenderer::new(&registry)?);
        let thresholds = Arc::new(ThresholdStore::from_thresholds(config.thresholds.clone())?);
        let repo = Arc::new(AlertRepository::new(
            collaborators.store,
            config.lifecycle.max_upsert_attempts,
        ));

        let evaluator = KpiEvaluator::new(
            collaborators.metrics,
            thresholds.clone(),
            registry.clone(),
        );
        let manager = AlertManager::new(
            repo.clone(),
            registry.clone(),
            renderer.clone(),
            config.lifecycle.clone(),
        );
        let dispatcher = NotificationDispatcher::new(
            collaborators.notifier,
            collaborators.directory,
            registry.clone(),
            renderer,
            config.channels.clone(),
            repo,
        );

        Ok(Self {
            invoices: OverdueInvoiceScanner::new(config.invoices.clone()),
            conventions: ConventionExpiryScanner::new(config.expiry_days()),
            clock: collaborators.clock,
            entities: collaborators.entities,
            thresholds,
            registry,
            evaluator,
            manager,
            dispatcher,
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn thresholds(&self) -> &Arc<ThresholdStore> {
        &self.thresholds
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CategoryRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // =========================================================================
    // Cycles
    // =========================================================================

    /// Run one cycle of `cadence` to completion.
    pub async fn run_cycle(&self, cadence: Cadence) -> Result<CycleReport, AlertError> {
        let now = self.clock.now();
        let mut report = CycleReport::new(cadence);
        match cadence {
            Cadence::EntityScan => {
                let baseline = self.manager.baseline().await?;
                for scan in self.entity_reports(now, &mut report).await {
                    let applied = self.manager.apply_report(&scan, &baseline, now).await?;
                    report.absorb_apply(&applied);
                }
                report.absorb_dispatch(&self.dispatcher.dispatch_pending(now).await?);
            }
            Cadence::DailyAnalysis => {
                let baseline = self.manager.baseline().await?;
                let scan = self.evaluator.run(now).await;
                report
                    .skipped_sources
                    .extend(scan.skipped.iter().map(|s| format!("{}: {}", s.id, s.reason)));
                report.absorb_apply(&self.manager.apply_report(&scan, &baseline, now).await?);
                report.absorb_dispatch(&self.dispatcher.dispatch_pending(now).await?);
            }
            Cadence::SeveritySweep => {
                let baseline = self.manager.baseline().await?;
                let mut keys = self.manager.high_severity_keys().await?;
                let mut scans = self.entity_reports(now, &mut report).await;
                scans.push(self.evaluator.run(now).await);
                keys.extend(scans.iter().flat_map(|scan| {
                    scan.candidates
                        .iter()
                        .filter(|c| c.severity >= Severity::High)
                        .map(|c| c.key.clone())
                }));
                debug!(keys = keys.len(), "Severity sweep scope");
                for scan in scans {
                    let scan = scan.restricted_to(&keys);
                    report.absorb_apply(&self.manager.apply_report(&scan, &baseline, now).await?);
                }
                report.absorb_dispatch(&self.dispatcher.dispatch_pending(now).await?);
            }
            Cadence::Maintenance => {
                report.duplicates_resolved = self.manager.reconcile_duplicates(now).await?.len();
                report.archived = self.manager.retention_sweep(now).await?.len();
                report.absorb_dispatch(&self.dispatcher.dispatch_pending(now).await?);
            }
        }
        info!(
            cadence = %cadence,
            created = report.created,
            refreshed = report.refreshed,
            auto_resolved = report.auto_resolved,
            notifications_sent = report.notifications_sent,
            "Cycle completed"
        );
        Ok(report)
    }

    /// Entity scans and KPI analysis back to back, then dispatch.
    pub async fn force_evaluation_cycle(&self) -> Result<CycleReport, AlertError> {
        let mut report = self.run_cycle(Cadence::EntityScan).await?;
        let daily = self.run_cycle(Cadence::DailyAnalysis).await?;
        report.cadence = "forced".to_string();
        report.created += daily.created;
        report.refreshed += daily.refreshed;
        report.escalated += daily.escalated;
        report.auto_resolved += daily.auto_resolved;
        report.suppressed += daily.suppressed;
        report.notifications_sent += daily.notifications_sent;
        report.notifications_failed += daily.notifications_failed;
        report.skipped_sources.extend(daily.skipped_sources);
        report.errors.extend(daily.errors);
        Ok(report)
    }

    /// Invoice and convention reports; a failing source drops its scanner
    /// for this cycle so none of its alerts are touched.
    async fn entity_reports(&self, now: DateTime<Utc>, report: &mut CycleReport) -> Vec<ScanReport> {
        let mut scans = Vec::with_capacity(2);
        match self.entities.list_overdue_invoices(now.date_naive()).await {
            Ok(invoices) => scans.push(self.invoices.scan(&invoices, now)),
            Err(e) => {
                warn!(error = %e, "Invoice source failed, skipping overdue scan");
                report.skipped_sources.push(format!("invoices: {e}"));
            }
        }
        match self.entities.list_active_conventions().await {
            Ok(conventions) => scans.push(self.conventions.scan(&conventions, now)),
            Err(e) => {
                warn!(error = %e, "Convention source failed, skipping expiry scan");
                report.skipped_sources.push(format!("conventions: {e}"));
            }
        }
        for scan in &scans {
            report
                .skipped_sources
                .extend(scan.skipped.iter().map(|s| format!("{}: {}", s.id, s.reason)));
        }
        scans
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    pub async fn get(&self, id: &AlertId) -> Result<Alert, AlertError> {
        self.manager.get(id).await
    }

    pub async fn acknowledge(&self, id: &AlertId, user_id: &str) -> Result<Alert, AlertError> {
        self.manager.acknowledge(id, user_id, self.clock.now()).await
    }

    pub async fn resolve(
        &self,
        id: &AlertId,
        user_id: &str,
        comment: Option<String>,
    ) -> Result<Alert, AlertError> {
        self.manager.resolve(id, user_id, comment, self.clock.now()).await
    }

    pub async fn archive(&self, id: &AlertId, user_id: &str) -> Result<Alert, AlertError> {
        self.manager.archive(id, user_id, self.clock.now()).await
    }

    pub async fn comment(&self, id: &AlertId, user_id: &str, text: &str) -> Result<Alert, AlertError> {
        self.manager.comment(id, user_id, text, self.clock.now()).await
    }

    pub async fn history(&self, id: &AlertId) -> Result<Vec<AlertAction>, AlertError> {
        self.manager.history(id).await
    }

    /// Delegate and notify the delegate.
    ///
    /// A failed notice is logged; the delegation stands.
    pub async fn delegate(
        &self,
        id: &AlertId,
        from_user: &str,
        to_user: &str,
        note: Option<String>,
    ) -> Result<Delegation, AlertError> {
        let now = self.clock.now();
        let (delegation, alert) = self.manager.delegate(id, from_user, to_user, note, now).await?;
        if let Err(e) = self.dispatcher.notify_delegation(&delegation, &alert, now).await {
            warn!(delegation_id = %delegation.id, error = %e, "Failed to notify delegate");
        }
        Ok(delegation)
    }

    pub async fn start_delegation(
        &self,
        id: &DelegationId,
        user_id: &str,
    ) -> Result<Delegation, AlertError> {
        self.manager.start_delegation(id, user_id, self.clock.now()).await
    }

    pub async fn resolve_delegation(
        &self,
        id: &DelegationId,
        user_id: &str,
        resolution: &str,
        resolve_alert: bool,
    ) -> Result<(Delegation, Alert), AlertError> {
        self.manager
            .resolve_delegation(id, user_id, resolution, resolve_alert, self.clock.now())
            .await
    }

    pub async fn reject_delegation(
        &self,
        id: &DelegationId,
        user_id: &str,
        reason: &str,
    ) -> Result<(Delegation, Alert), AlertError> {
        self.manager
            .reject_delegation(id, user_id, reason, self.clock.now())
            .await
    }

    pub async fn delegations(&self, id: &AlertId) -> Result<Vec<Delegation>, AlertError> {
        self.manager.delegations(id).await
    }

    pub async fn active(&self, user_id: Option<&str>) -> Result<Vec<Alert>, AlertError> {
        self.manager.active(user_id).await
    }

    pub async fn recently_resolved(
        &self,
        user_id: Option<&str>,
        days: i64,
    ) -> Result<Vec<Alert>, AlertError> {
        self.manager
            .recently_resolved(user_id, days, self.clock.now())
            .await
    }

    pub async fn archived(&self, user_id: Option<&str>) -> Result<Vec<Alert>, AlertError> {
        self.manager.archived(user_id).await
    }

    pub async fn all(&self) -> Result<Vec<Alert>, AlertError> {
        self.manager.list(&crate::store::AlertFilter::new()).await
    }

    pub async fn statistics(&self, user_id: Option<&str>) -> Result<AlertStatistics, AlertError> {
        self.manager.statistics(user_id).await
    }
}
