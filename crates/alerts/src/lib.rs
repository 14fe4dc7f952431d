//! KPI and entity alerting engine.
//!
//! Watches business metrics and entities (overdue invoices, expiring
//! conventions), raises one alert per identity key while a condition holds,
//! tracks each alert through NEW, IN_PROGRESS, RESOLVED and ARCHIVED, and
//! notifies the right people through the `notify` crate.
//!
//! ## Pipeline
//!
//! - [`kpi::KpiEvaluator`] and the [`scanners`] produce a [`scanners::ScanReport`]
//! - [`lifecycle::AlertManager`] folds reports into the store through the
//!   compare-and-swap [`repository::AlertRepository`], auto-resolving keys
//!   that went quiet
//! - [`dispatch::NotificationDispatcher`] sends notification rounds
//! - [`scheduler::Scheduler`] drives the named cadences
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kpi_alerts::{AlertEngine, Cadence, Collaborators, EngineConfig, SnapshotSource};
//! use notify::Notifier;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load(None)?;
//!     let data = Arc::new(SnapshotSource::load("data.json".as_ref())?);
//!     let engine = AlertEngine::new(
//!         config,
//!         Collaborators::new(data.clone(), data.clone(), data, Arc::new(Notifier::from_env())),
//!     )?;
//!
//!     let report = engine.run_cycle(Cadence::EntityScan).await?;
//!     println!("{} alerts created", report.created);
//!     Ok(())
//! }
//! ```

pub mod category;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod kpi;
pub mod lifecycle;
pub mod model;
pub mod repository;
pub mod scanners;
pub mod scheduler;
pub mod snapshot;
pub mod sources;
pub mod store;
pub mod templates;
pub mod thresholds;

pub use config::EngineConfig;
pub use engine::{AlertEngine, Clock, Collaborators, CycleReport, ManualClock, SystemClock};
pub use error::{AlertError, CycleError, SourceError, StoreError};
pub use model::{Alert, AlertId, Delegation, DelegationId, LifecycleState, Severity};
pub use scheduler::{Cadence, CycleStatus, Scheduler};
pub use snapshot::SnapshotSource;
pub use store::{AlertFilter, AlertStore, InMemoryAlertStore};
