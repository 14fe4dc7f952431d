//! Threshold store: per-KPI comparison rules.
//!
//! Lookups never fail. A missing threshold means the KPI is not configured
//! for that scope and is skipped by the evaluator.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{Dimension, Priority};

/// Comparison rule for one KPI at one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threshold {
    pub kpi_name: String,
    pub dimension: Dimension,
    #[serde(default)]
    pub dimension_value: Option<String>,
    /// Soft bound; crossing it means WATCH
    pub low_bound: f64,
    /// Hard bound; crossing it means ANOMALOUS
    pub high_bound: f64,
    #[serde(default)]
    pub normal_value: Option<f64>,
    #[serde(default)]
    pub tolerance_percent: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub priority: Priority,
}

const fn default_enabled() -> bool {
    true
}

impl Threshold {
    #[must_use]
    pub fn key(&self) -> ThresholdKey {
        ThresholdKey {
            kpi_name: self.kpi_name.clone(),
            dimension: self.dimension,
            dimension_value: self.dimension_value.clone(),
        }
    }
}

/// Uniqueness key of a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdKey {
    pub kpi_name: String,
    pub dimension: Dimension,
    pub dimension_value: Option<String>,
}

impl ThresholdKey {
    #[must_use]
    pub fn global(kpi_name: impl Into<String>) -> Self {
        Self {
            kpi_name: kpi_name.into(),
            dimension: Dimension::Global,
            dimension_value: None,
        }
    }
}

impl std::fmt::Display for ThresholdKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.kpi_name,
            self.dimension,
            self.dimension_value.as_deref().unwrap_or("*")
        )
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("threshold lock poisoned".to_string())
}

/// Thread-safe keyed threshold store.
///
/// Holds at most one threshold per key, so at most one enabled threshold
/// exists per `(kpiName, dimension, dimensionValue)`.
#[derive(Debug, Default)]
pub struct ThresholdStore {
    entries: RwLock<HashMap<ThresholdKey, Threshold>>,
}

impl ThresholdStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a list; an enabled entry replaces a disabled one for the
    /// same key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when two enabled thresholds share a key.
    pub fn from_thresholds(thresholds: Vec<Threshold>) -> Result<Self, StoreError> {
        let mut entries: HashMap<ThresholdKey, Threshold> = HashMap::new();
        for threshold in thresholds {
            let key = threshold.key();
            match entries.get(&key) {
                Some(existing) if existing.enabled && threshold.enabled => {
                    return Err(StoreError::Conflict(format!(
                        "two enabled thresholds for {key}"
                    )));
                }
                Some(existing) if existing.enabled => {}
                _ => {
                    entries.insert(key, threshold);
                }
            }
        }
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Resolve the threshold for a scope, falling back to the GLOBAL one.
    #[must_use]
    pub fn get(
        &self,
        kpi_name: &str,
        dimension: Dimension,
        dimension_value: Option<&str>,
    ) -> Option<Threshold> {
        let entries = self.entries.read().ok()?;
        let exact = ThresholdKey {
            kpi_name: kpi_name.to_string(),
            dimension,
            dimension_value: dimension_value.map(str::to_string),
        };
        if let Some(t) = entries.get(&exact).filter(|t| t.enabled) {
            return Some(t.clone());
        }
        let found = entries
            .get(&ThresholdKey::global(kpi_name))
            .filter(|t| t.enabled)
            .cloned();
        if found.is_none() {
            debug!(kpi = kpi_name, %dimension, "No threshold configured");
        }
        found
    }

    /// Insert or replace the threshold for its key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the lock is poisoned.
    pub fn upsert(&self, threshold: Threshold) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(threshold.key(), threshold);
        Ok(())
    }

    /// Enable or disable a threshold. Returns `false` if the key is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the lock is poisoned.
    pub fn set_enabled(&self, key: &ThresholdKey, enabled: bool) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        Ok(entries.get_mut(key).map(|t| t.enabled = enabled).is_some())
    }

    /// All thresholds, sorted by key.
    #[must_use]
    pub fn all(&self) -> Vec<Threshold> {
        let mut all: Vec<Threshold> = self
            .entries
            .read()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by_key(Threshold::key);
        all
    }

    /// Enabled thresholds only; each one is an evaluation target.
    #[must_use]
    pub fn enabled(&self) -> Vec<Threshold> {
        self.all().into_iter().filter(|t| t.enabled).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn global(
    kpi_name: &str,
    low: f64,
    high: f64,
    normal: f64,
    tolerance: f64,
    unit: &str,
    priority: Priority,
) -> Threshold {
    Threshold {
        kpi_name: kpi_name.to_string(),
        dimension: Dimension::Global,
        dimension_value: None,
        low_bound: low,
        high_bound: high,
        normal_value: Some(normal),
        tolerance_percent: tolerance,
        unit: unit.to_string(),
        enabled: true,
        priority,
    }
}

/// The five standard KPI thresholds.
#[must_use]
pub fn default_thresholds() -> Vec<Threshold> {
    vec![
        global("TAUX_RETARD", 5.0, 10.0, 3.0, 10.0, "%", Priority::High),
        global("TAUX_PAIEMENT", 85.0, 75.0, 90.0, 10.0, "%", Priority::High),
        global("MONTANT_IMPAYE_PERCENT", 15.0, 25.0, 10.0, 10.0, "%", Priority::High),
        global("DUREE_MOYENNE_PAIEMENT", 30.0, 45.0, 20.0, 15.0, "jours", Priority::Medium),
        global("TAUX_CONVERSION", 60.0, 50.0, 70.0, 10.0, "%", Priority::Medium),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn regional(value: &str, enabled: bool) -> Threshold {
        Threshold {
            dimension: Dimension::Region,
            dimension_value: Some(value.to_string()),
            low_bound: 7.0,
            high_bound: 12.0,
            enabled,
            ..global("TAUX_RETARD", 5.0, 10.0, 3.0, 10.0, "%", Priority::High)
        }
    }

    #[test]
    fn test_exact_match_wins() {
        let mut thresholds = default_thresholds();
        thresholds.push(regional("TUNIS", true));
        let store = ThresholdStore::from_thresholds(thresholds).unwrap();

        let t = store
            .get("TAUX_RETARD", Dimension::Region, Some("TUNIS"))
            .unwrap();
        assert!((t.high_bound - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_falls_back_to_global() {
        let store = ThresholdStore::from_thresholds(default_thresholds()).unwrap();
        let t = store
            .get("TAUX_RETARD", Dimension::Region, Some("SFAX"))
            .unwrap();
        assert_eq!(t.dimension, Dimension::Global);
    }

    #[test]
    fn test_disabled_regional_falls_back() {
        let mut thresholds = default_thresholds();
        thresholds.push(regional("TUNIS", false));
        let store = ThresholdStore::from_thresholds(thresholds).unwrap();
        let t = store
            .get("TAUX_RETARD", Dimension::Region, Some("TUNIS"))
            .unwrap();
        assert_eq!(t.dimension, Dimension::Global);
    }

    #[test]
    fn test_missing_is_none() {
        let store = ThresholdStore::from_thresholds(default_thresholds()).unwrap();
        assert!(store.get("CHIFFRE_AFFAIRES", Dimension::Global, None).is_none());

        let key = ThresholdKey::global("TAUX_CONVERSION");
        assert!(store.set_enabled(&key, false).unwrap());
        assert!(!store
            .set_enabled(&ThresholdKey::global("CHIFFRE_AFFAIRES"), true)
            .unwrap());
        assert!(store.get("TAUX_CONVERSION", Dimension::Global, None).is_none());
        assert_eq!(store.enabled().len(), 4);
    }

    #[test]
    fn test_writes_fail_on_poisoned_lock() {
        let store = Arc::new(ThresholdStore::from_thresholds(default_thresholds()).unwrap());
        let writer = store.clone();
        let _ = std::thread::spawn(move || {
            let _entries = writer.entries.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        assert!(matches!(
            store.upsert(regional("TUNIS", true)),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.set_enabled(&ThresholdKey::global("TAUX_RETARD"), false),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_duplicate_enabled_rejected() {
        let mut thresholds = default_thresholds();
        thresholds.push(regional("TUNIS", true));
        thresholds.push(regional("TUNIS", true));
        assert!(matches!(
            ThresholdStore::from_thresholds(thresholds),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_disabled_duplicate_tolerated() {
        let thresholds = vec![regional("TUNIS", true), regional("TUNIS", false)];
        let store = ThresholdStore::from_thresholds(thresholds).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.all()[0].enabled);
    }
}
