//! Named cadences driving the engine.
//!
//! Each cadence has its own loop, so cadences overlap freely while a single
//! cadence never overlaps itself. Every cycle runs in a spawned task; a
//! panic is recorded against the cadence and the loop carries on.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::engine::{AlertEngine, CycleReport};
use crate::error::CycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cadence {
    EntityScan,
    DailyAnalysis,
    SeveritySweep,
    Maintenance,
}

impl Cadence {
    pub const ALL: [Self; 4] = [
        Self::EntityScan,
        Self::DailyAnalysis,
        Self::SeveritySweep,
        Self::Maintenance,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EntityScan => "entity-scan",
            Self::DailyAnalysis => "daily-analysis",
            Self::SeveritySweep => "severity-sweep",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown cadence '{s}', expected one of: entity-scan, daily-analysis, \
                     severity-sweep, maintenance"
                )
            })
    }
}

/// Health of one cadence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleStatus {
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub runs: u64,
    pub failures: u64,
    /// Alerts touched by the last successful cycle
    pub alerts_refreshed: usize,
}

/// Next UTC occurrence of `hour:minute` strictly after `after`.
#[must_use]
pub fn next_daily_run(after: DateTime<Utc>, hour: u32, minute: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    let today = after.date_naive().and_time(at).and_utc();
    if today > after {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

pub struct Scheduler {
    engine: Arc<AlertEngine>,
    config: ScheduleConfig,
    status: RwLock<HashMap<Cadence, CycleStatus>>,
    cancel: CancellationToken,
}

impl Scheduler {
    #[must_use]
    pub fn new(engine: Arc<AlertEngine>, config: ScheduleConfig) -> Self {
        Self {
            engine,
            config,
            status: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling the token stops every loop after its current cycle.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn status(&self) -> HashMap<Cadence, CycleStatus> {
        self.status.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn update_status(&self, cadence: Cadence, f: impl FnOnce(&mut CycleStatus)) {
        if let Ok(mut status) = self.status.write() {
            f(status.entry(cadence).or_default());
        }
    }

    /// Run one cycle in its own task and record the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CycleError::Engine`] when the cycle failed and
    /// [`CycleError::Panicked`] when it panicked.
    pub async fn force_run(&self, cadence: Cadence) -> Result<CycleReport, CycleError> {
        let started = self.engine.now();
        self.update_status(cadence, |s| {
            s.last_started_at = Some(started);
            s.runs += 1;
        });

        let engine = self.engine.clone();
        let outcome = match tokio::spawn(async move { engine.run_cycle(cadence).await }).await {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(e)) => Err(CycleError::Engine(e)),
            Err(join) => Err(CycleError::Panicked(join.to_string())),
        };

        match &outcome {
            Ok(report) => {
                let completed = self.engine.now();
                self.update_status(cadence, |s| {
                    s.last_completed_at = Some(completed);
                    s.last_error = None;
                    s.alerts_refreshed = report.alerts_refreshed();
                });
            }
            Err(e) => {
                error!(cadence = %cadence, error = %e, "Cycle failed");
                let message = e.to_string();
                self.update_status(cadence, |s| {
                    s.failures += 1;
                    s.last_error = Some(message);
                });
            }
        }
        outcome
    }

    /// Run every cadence until cancelled.
    pub async fn run(self: Arc<Self>) {
        info!(
            entity_scan_secs = self.config.entity_scan_interval_secs,
            sweep_secs = self.config.severity_sweep_interval_secs,
            daily_hour = self.config.daily_analysis_hour,
            daily_minute = self.config.daily_analysis_minute,
            "Scheduler started"
        );

        let loops = Cadence::ALL.map(|cadence| {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.cadence_loop(cadence).await })
        });
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cadence loop exited abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    async fn cadence_loop(&self, cadence: Cadence) {
        if cadence == Cadence::DailyAnalysis {
            self.daily_loop().await;
            return;
        }

        let (period_secs, delay_secs) = match cadence {
            Cadence::EntityScan => (
                self.config.entity_scan_interval_secs,
                self.config.entity_scan_initial_delay_secs,
            ),
            Cadence::SeveritySweep => (self.config.severity_sweep_interval_secs, 0),
            _ => (self.config.maintenance_interval_secs, 0),
        };
        let period = Duration::from_secs(period_secs.max(1));
        let mut ticker = interval_at(Instant::now() + Duration::from_secs(delay_secs), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Errors are recorded in the status map.
                    let _ = self.force_run(cadence).await;
                }
            }
        }
    }

    async fn daily_loop(&self) {
        loop {
            let now = Utc::now();
            let next = next_daily_run(
                now,
                self.config.daily_analysis_hour,
                self.config.daily_analysis_minute,
            );
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(cadence = %Cadence::DailyAnalysis, next = %next, "Next daily analysis scheduled");

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {
                    let _ = self.force_run(Cadence::DailyAnalysis).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cadence_names_round_trip() {
        for cadence in Cadence::ALL {
            assert_eq!(cadence.as_str().parse::<Cadence>().unwrap(), cadence);
        }
        assert!("hourly".parse::<Cadence>().is_err());
    }

    #[test]
    fn test_next_daily_run() {
        let before = Utc.with_ymd_and_hms(2026, 3, 2, 7, 30, 0).unwrap();
        assert_eq!(
            next_daily_run(before, 8, 0),
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
        );
        let exactly = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        assert_eq!(
            next_daily_run(exactly, 8, 0),
            Utc.with_ymd_and_hms(2026, 3, 3, 8, 0, 0).unwrap()
        );
    }
}
