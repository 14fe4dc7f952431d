//! Alert categories: who hears about an alert, in which words, and which
//! way a KPI goes bad.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Category key for overdue invoices.
pub const INVOICE_OVERDUE: &str = "INVOICE_OVERDUE";

/// Category key for conventions approaching their end date.
pub const CONVENTION_EXPIRY: &str = "CONVENTION_EXPIRY";

/// Which side of a bound is bad for a KPI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    HigherIsWorse,
    LowerIsWorse,
}

impl Direction {
    /// Whether `value` is on the bad side of `bound` (inclusive).
    #[must_use]
    pub fn crosses(self, value: f64, bound: f64) -> bool {
        match self {
            Self::HigherIsWorse => value >= bound,
            Self::LowerIsWorse => value <= bound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CategoryKind {
    /// KPI evaluated over a dimension
    Aggregate,
    /// One alert per business entity
    Entity,
}

/// Roles a directory can resolve to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Creator or owner of the related entity
    Owner,
    Commercial,
    ProjectManager,
    DecisionMaker,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySpec {
    pub key: String,
    pub kind: CategoryKind,
    pub description: String,
    #[serde(default)]
    pub unit: String,
    /// Required for aggregate KPIs
    #[serde(default)]
    pub direction: Option<Direction>,
    pub recipient_roles: Vec<Role>,
    pub subject_template: String,
    pub body_template: String,
}

const KPI_SUBJECT: &str = "[{{severity}}] {{description}} : {{fixed value 2}} {{unit}}";

const KPI_BODY: &str = "L'indicateur {{description}} vaut {{fixed value 2}} {{unit}} \
(seuil {{fixed bound 2}} {{unit}}{{#if expected}}, valeur normale {{fixed expected 2}} {{unit}}{{/if}}). \
Statut : {{status}}.";

const INVOICE_SUBJECT: &str = "[{{severity}}] Facture {{reference}} en retard de {{days}} jours";

const INVOICE_BODY: &str = "La facture {{reference}} d'un montant de {{fixed amount 2}} \
est en retard de {{days}} jours (échéance le {{due_date}}).";

const CONVENTION_SUBJECT: &str = "[{{severity}}] Convention {{reference}} : {{expiry}}";

const CONVENTION_BODY: &str = "La convention {{reference}}{{#if title}} ({{title}}){{/if}} \
{{expiry}} (fin le {{end_date}}).";

impl CategorySpec {
    /// An aggregate KPI with the standard wording.
    #[must_use]
    pub fn kpi(
        key: &str,
        description: &str,
        unit: &str,
        direction: Direction,
        recipient_roles: Vec<Role>,
    ) -> Self {
        Self {
            key: key.to_string(),
            kind: CategoryKind::Aggregate,
            description: description.to_string(),
            unit: unit.to_string(),
            direction: Some(direction),
            recipient_roles,
            subject_template: KPI_SUBJECT.to_string(),
            body_template: KPI_BODY.to_string(),
        }
    }
}

/// Per-category overrides applied on top of the built-ins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CategoryOverride {
    pub key: String,
    #[serde(default)]
    pub recipient_roles: Option<Vec<Role>>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Registry of category behavior keyed by category name.
#[derive(Debug, Clone, Default)]
pub struct CategoryRegistry {
    specs: HashMap<String, CategorySpec>,
}

impl CategoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the standard KPIs and entity categories.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let finance = vec![Role::DecisionMaker, Role::Admin];

        registry.register(CategorySpec::kpi(
            "TAUX_RETARD",
            "Taux de factures en retard",
            "%",
            Direction::HigherIsWorse,
            finance.clone(),
        ));
        registry.register(CategorySpec::kpi(
            "TAUX_PAIEMENT",
            "Taux de paiement",
            "%",
            Direction::LowerIsWorse,
            finance.clone(),
        ));
        registry.register(CategorySpec::kpi(
            "MONTANT_IMPAYE_PERCENT",
            "Part du montant impayé",
            "%",
            Direction::HigherIsWorse,
            finance.clone(),
        ));
        registry.register(CategorySpec::kpi(
            "DUREE_MOYENNE_PAIEMENT",
            "Durée moyenne de paiement",
            "jours",
            Direction::HigherIsWorse,
            finance,
        ));
        registry.register(CategorySpec::kpi(
            "TAUX_CONVERSION",
            "Taux de conversion",
            "%",
            Direction::LowerIsWorse,
            vec![Role::Commercial, Role::DecisionMaker],
        ));
        registry.register(CategorySpec {
            key: INVOICE_OVERDUE.to_string(),
            kind: CategoryKind::Entity,
            description: "Facture en retard de paiement".to_string(),
            unit: "jours".to_string(),
            direction: None,
            recipient_roles: vec![Role::Owner, Role::Commercial],
            subject_template: INVOICE_SUBJECT.to_string(),
            body_template: INVOICE_BODY.to_string(),
        });
        registry.register(CategorySpec {
            key: CONVENTION_EXPIRY.to_string(),
            kind: CategoryKind::Entity,
            description: "Convention arrivant à échéance".to_string(),
            unit: "jours".to_string(),
            direction: None,
            recipient_roles: vec![Role::Owner, Role::ProjectManager, Role::Admin],
            subject_template: CONVENTION_SUBJECT.to_string(),
            body_template: CONVENTION_BODY.to_string(),
        });
        registry
    }

    /// Add or replace a category.
    pub fn register(&mut self, spec: CategorySpec) {
        self.specs.insert(spec.key.clone(), spec);
    }

    /// Apply an override; unknown keys are ignored and reported as `false`.
    pub fn apply_override(&mut self, o: &CategoryOverride) -> bool {
        let Some(spec) = self.specs.get_mut(&o.key) else {
            return false;
        };
        if let Some(roles) = &o.recipient_roles {
            spec.recipient_roles.clone_from(roles);
        }
        if let Some(subject) = &o.subject {
            spec.subject_template.clone_from(subject);
        }
        if let Some(body) = &o.body {
            spec.body_template.clone_from(body);
        }
        true
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&CategorySpec> {
        self.specs.get(key)
    }

    /// Direction of an aggregate KPI, if known.
    #[must_use]
    pub fn direction(&self, kpi_name: &str) -> Option<Direction> {
        self.get(kpi_name).and_then(|s| s.direction)
    }

    /// Aggregate KPI keys, sorted.
    #[must_use]
    pub fn aggregate_kpis(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .specs
            .values()
            .filter(|s| s.kind == CategoryKind::Aggregate)
            .map(|s| s.key.as_str())
            .collect();
        keys.sort_unstable();
        keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &CategorySpec> {
        self.specs.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_crosses() {
        assert!(Direction::HigherIsWorse.crosses(10.0, 10.0));
        assert!(!Direction::HigherIsWorse.crosses(9.9, 10.0));
        assert!(Direction::LowerIsWorse.crosses(75.0, 75.0));
        assert!(!Direction::LowerIsWorse.crosses(80.0, 75.0));
    }

    #[test]
    fn test_builtin_directions() {
        let registry = CategoryRegistry::builtin();
        assert_eq!(
            registry.direction("TAUX_RETARD"),
            Some(Direction::HigherIsWorse)
        );
        assert_eq!(
            registry.direction("TAUX_PAIEMENT"),
            Some(Direction::LowerIsWorse)
        );
        assert_eq!(registry.direction(INVOICE_OVERDUE), None);
        assert_eq!(registry.aggregate_kpis().len(), 5);
    }

    #[test]
    fn test_override_roles() {
        let mut registry = CategoryRegistry::builtin();
        let applied = registry.apply_override(&CategoryOverride {
            key: INVOICE_OVERDUE.to_string(),
            recipient_roles: Some(vec![Role::Owner]),
            ..CategoryOverride::default()
        });
        assert!(applied);
        assert_eq!(
            registry.get(INVOICE_OVERDUE).unwrap().recipient_roles,
            vec![Role::Owner]
        );
        assert!(!registry.apply_override(&CategoryOverride {
            key: "UNKNOWN".to_string(),
            ..CategoryOverride::default()
        }));
    }
}
