//! Engine configuration.
//!
//! Loaded from an optional JSON file, then adjusted from the environment.
//! Every field has a default, so an empty document is a valid config.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::category::{CategoryOverride, Direction};
use crate::model::Severity;
use crate::thresholds::{default_thresholds, Threshold, ThresholdStore};

const ENV_SMS_DISABLED: &str = "KPI_ALERTS_SMS_DISABLED";
const ENV_EMAIL_DISABLED: &str = "KPI_ALERTS_EMAIL_DISABLED";
const ENV_SEND_TIMEOUT_SECS: &str = "KPI_ALERTS_SEND_TIMEOUT_SECS";
const ENV_RETENTION_DAYS: &str = "KPI_ALERTS_RETENTION_DAYS";

/// Upper bound for `retention_days` (about a century).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub entity_scan_interval_secs: u64,
    pub entity_scan_initial_delay_secs: u64,
    /// UTC hour of the daily KPI analysis
    pub daily_analysis_hour: u32,
    pub daily_analysis_minute: u32,
    pub severity_sweep_interval_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            entity_scan_interval_secs: 300,
            entity_scan_initial_delay_secs: 30,
            daily_analysis_hour: 8,
            daily_analysis_minute: 0,
            severity_sweep_interval_secs: 6 * 3600,
            maintenance_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub email_enabled: bool,
    pub sms_enabled: bool,
    /// In-app delivery is always attempted; kept for config symmetry
    pub in_app_enabled: bool,
    pub sms_min_severity: Severity,
    pub send_timeout_secs: u64,
    pub max_delivery_attempts: u32,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            email_enabled: true,
            sms_enabled: true,
            in_app_enabled: true,
            sms_min_severity: Severity::High,
            send_timeout_secs: 10,
            max_delivery_attempts: 3,
        }
    }
}

impl ChannelsConfig {
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceConfig {
    /// Overdue longer than this is at least HIGH
    pub high_after_days: i64,
    /// Overdue longer than this is CRITICAL
    pub critical_after_days: i64,
    /// Amounts above this are at least HIGH
    pub high_amount: f64,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            high_after_days: 7,
            critical_after_days: 60,
            high_amount: 50_000.0,
        }
    }
}

/// One convention-expiry threshold in days before the end date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryThreshold {
    pub days: i64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

const fn enabled_by_default() -> bool {
    true
}

#[must_use]
pub fn default_expiry_thresholds() -> Vec<ExpiryThreshold> {
    [30, 15, 7, 1, 0]
        .into_iter()
        .map(|days| ExpiryThreshold {
            days,
            enabled: true,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// RESOLVED alerts older than this are archived
    pub retention_days: i64,
    pub max_upsert_attempts: u32,
    pub manual_resolution_suppresses_same_crossing: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_upsert_attempts: 5,
            manual_resolution_suppresses_same_crossing: true,
        }
    }
}

/// Additional aggregate KPI known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub schedule: ScheduleConfig,
    pub channels: ChannelsConfig,
    pub invoices: InvoiceConfig,
    pub conventions: Vec<ExpiryThreshold>,
    pub lifecycle: LifecycleConfig,
    pub thresholds: Vec<Threshold>,
    pub kpis: Vec<KpiDefinition>,
    pub categories: Vec<CategoryOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            channels: ChannelsConfig::default(),
            invoices: InvoiceConfig::default(),
            conventions: default_expiry_thresholds(),
            lifecycle: LifecycleConfig::default(),
            thresholds: default_thresholds(),
            kpis: Vec::new(),
            categories: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load from `path` (defaults when `None`), apply environment overrides
    /// and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config: {}", path.display()))?;
                let config: Self = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse config: {}", path.display()))?;
                info!(path = %path.display(), "Loaded engine configuration");
                config
            }
            None => {
                debug!("No config file given, using defaults");
                Self::default()
            }
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KPI_ALERTS_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if env_flag(ENV_SMS_DISABLED) {
            info!("SMS channel disabled via {ENV_SMS_DISABLED}");
            self.channels.sms_enabled = false;
        }
        if env_flag(ENV_EMAIL_DISABLED) {
            info!("Email channel disabled via {ENV_EMAIL_DISABLED}");
            self.channels.email_enabled = false;
        }
        if let Ok(raw) = std::env::var(ENV_SEND_TIMEOUT_SECS) {
            self.channels.send_timeout_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_SEND_TIMEOUT_SECS}: {raw}"))?;
        }
        if let Ok(raw) = std::env::var(ENV_RETENTION_DAYS) {
            self.lifecycle.retention_days = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_RETENTION_DAYS}: {raw}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.schedule;
        if s.entity_scan_interval_secs == 0
            || s.severity_sweep_interval_secs == 0
            || s.maintenance_interval_secs == 0
        {
            bail!("Schedule intervals must be greater than zero");
        }
        if s.daily_analysis_hour > 23 || s.daily_analysis_minute > 59 {
            bail!(
                "Invalid daily analysis time {:02}:{:02}",
                s.daily_analysis_hour,
                s.daily_analysis_minute
            );
        }
        if self.channels.send_timeout_secs == 0 {
            bail!("send_timeout_secs must be greater than zero");
        }
        if self.channels.max_delivery_attempts == 0 {
            bail!("max_delivery_attempts must be greater than zero");
        }
        if self.lifecycle.max_upsert_attempts == 0 {
            bail!("max_upsert_attempts must be greater than zero");
        }
        if !(0..=MAX_RETENTION_DAYS).contains(&self.lifecycle.retention_days) {
            bail!(
                "retention_days must be between 0 and {MAX_RETENTION_DAYS}, got {}",
                self.lifecycle.retention_days
            );
        }

        let mut seen = HashSet::new();
        for t in &self.conventions {
            if t.days < 0 {
                bail!("Convention expiry threshold cannot be negative: {}", t.days);
            }
            if !seen.insert(t.days) {
                bail!("Duplicate convention expiry threshold: {} days", t.days);
            }
        }

        ThresholdStore::from_thresholds(self.thresholds.clone())
            .context("Invalid threshold configuration")?;
        Ok(())
    }

    /// Enabled convention thresholds, ascending.
    #[must_use]
    pub fn expiry_days(&self) -> Vec<i64> {
        let mut days: Vec<i64> = self
            .conventions
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.days)
            .collect();
        days.sort_unstable();
        days.dedup();
        days
    }
}

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_document_is_default() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.thresholds.len(), 5);
        assert_eq!(config.expiry_days(), vec![0, 1, 7, 15, 30]);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_section() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"channels": {"sms_min_severity": "CRITICAL"}}"#).unwrap();
        assert_eq!(config.channels.sms_min_severity, Severity::Critical);
        assert_eq!(config.channels.send_timeout_secs, 10);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut config = EngineConfig::default();
        config.schedule.maintenance_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_retention_out_of_range() {
        let mut config = EngineConfig::default();
        config.lifecycle.retention_days = MAX_RETENTION_DAYS + 1;
        assert!(config.validate().unwrap_err().to_string().contains("retention_days"));
        config.lifecycle.retention_days = -1;
        assert!(config.validate().is_err());
        config.lifecycle.retention_days = MAX_RETENTION_DAYS;
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_env_retention_is_validated_on_load() {
        std::env::set_var("KPI_ALERTS_RETENTION_DAYS", "9223372036854775807");
        let result = EngineConfig::load(None);
        std::env::remove_var("KPI_ALERTS_RETENTION_DAYS");
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_duplicate_enabled_threshold() {
        let mut config = EngineConfig::default();
        let dup = config.thresholds[0].clone();
        config.thresholds.push(dup);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_disabled_expiry_threshold_excluded() {
        let mut config = EngineConfig::default();
        config.conventions[0].enabled = false;
        assert_eq!(config.expiry_days(), vec![0, 1, 7, 15]);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("KPI_ALERTS_SMS_DISABLED", "true");
        std::env::set_var("KPI_ALERTS_SEND_TIMEOUT_SECS", "3");
        let mut config = EngineConfig::default();
        let result = config.apply_env();
        std::env::remove_var("KPI_ALERTS_SMS_DISABLED");
        std::env::remove_var("KPI_ALERTS_SEND_TIMEOUT_SECS");

        result.unwrap();
        assert!(!config.channels.sms_enabled);
        assert!(config.channels.email_enabled);
        assert_eq!(config.channels.send_timeout_secs, 3);
    }

    #[test]
    #[serial]
    fn test_env_invalid_number() {
        std::env::set_var("KPI_ALERTS_RETENTION_DAYS", "thirty");
        let mut config = EngineConfig::default();
        let result = config.apply_env();
        std::env::remove_var("KPI_ALERTS_RETENTION_DAYS");
        assert!(result.is_err());
    }
}
