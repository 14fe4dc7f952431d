//! Message rendering for alert notifications using Handlebars.
//!
//! Each category registers a subject and a body template. Context is the
//! candidate's own variables plus the common alert fields.

use handlebars::{
    Context as HbsContext, Handlebars, Helper, HelperResult, Output, RenderContext,
};
use serde_json::{json, Map, Value};

use crate::category::CategoryRegistry;
use crate::error::AlertError;
use crate::model::{Alert, Delegation};
use crate::scanners::AnomalyCandidate;

const FALLBACK_SUBJECT: &str = "[{{severity}}] Alerte {{kpi_name}}";
const FALLBACK_BODY: &str = "Valeur {{fixed value 2}} pour {{kpi_name}} (statut {{status}}).";

const DELEGATION_SUBJECT: &str = "Alerte déléguée : {{title}}";
const DELEGATION_BODY: &str = "{{delegated_by}} vous a délégué l'alerte « {{title}} ».\
{{#if note}} Note : {{note}}{{/if}}";

/// Format a number with a fixed number of decimals.
/// Usage: `{{fixed value 2}}`
fn fixed_helper(
    h: &Helper,
    _: &Handlebars,
    _: &HbsContext,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let precision = h
        .param(1)
        .and_then(|p| p.value().as_u64())
        .unwrap_or(2) as usize;
    if let Some(param) = h.param(0) {
        match param.value().as_f64() {
            Some(n) => out.write(&format!("{n:.precision$}"))?,
            None => {
                if let Some(s) = param.value().as_str() {
                    out.write(s)?;
                }
            }
        }
    }
    Ok(())
}

/// Rendered subject and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Template engine for alert messages.
pub struct MessageRenderer {
    handlebars: Handlebars<'static>,
}

impl MessageRenderer {
    /// Register every category's templates.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::Template`] when a template does not parse.
    pub fn new(registry: &CategoryRegistry) -> Result<Self, AlertError> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        // Plain-text channels; HTML escaping would mangle apostrophes.
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("fixed", Box::new(fixed_helper));

        let mut register = |name: &str, template: &str| {
            handlebars
                .register_template_string(name, template)
                .map_err(|e| AlertError::Template(format!("{name}: {e}")))
        };
        register("fallback.subject", FALLBACK_SUBJECT)?;
        register("fallback.body", FALLBACK_BODY)?;
        register("delegation.subject", DELEGATION_SUBJECT)?;
        register("delegation.body", DELEGATION_BODY)?;
        for spec in registry.iter() {
            register(&format!("{}.subject", spec.key), &spec.subject_template)?;
            register(&format!("{}.body", spec.key), &spec.body_template)?;
        }

        Ok(Self { handlebars })
    }

    fn render_pair(&self, category: &str, context: &Value) -> Result<RenderedMessage, AlertError> {
        let prefix = if self.handlebars.has_template(&format!("{category}.subject")) {
            category
        } else {
            "fallback"
        };
        let render = |part: &str| {
            self.handlebars
                .render(&format!("{prefix}.{part}"), context)
                .map_err(|e| AlertError::Template(format!("{prefix}.{part}: {e}")))
        };
        Ok(RenderedMessage {
            subject: render("subject")?,
            body: render("body")?,
        })
    }

    /// Render the title and message for a candidate.
    pub fn render_candidate(
        &self,
        candidate: &AnomalyCandidate,
        description: &str,
    ) -> Result<RenderedMessage, AlertError> {
        let mut context: Map<String, Value> = candidate.context.clone();
        context.insert("kpi_name".into(), json!(candidate.key.kpi_name()));
        context.insert("description".into(), json!(description));
        context.insert("value".into(), json!(candidate.current_value));
        context.insert("expected".into(), json!(candidate.expected_value));
        context.insert("bound".into(), json!(candidate.breached_bound));
        context.insert("severity".into(), json!(candidate.severity.as_str()));
        context.insert("status".into(), json!(candidate.status.to_string()));
        context.insert("dimension".into(), json!(candidate.dimension.to_string()));
        context.insert("dimension_value".into(), json!(candidate.dimension_value));
        self.render_pair(&candidate.category, &Value::Object(context))
    }

    /// Render the hand-off message sent to a delegate.
    pub fn render_delegation(
        &self,
        alert: &Alert,
        delegation: &Delegation,
    ) -> Result<RenderedMessage, AlertError> {
        let context = json!({
            "title": alert.title,
            "message": alert.message,
            "severity": alert.severity.as_str(),
            "delegated_by": delegation.delegated_by,
            "note": delegation.note,
        });
        self.render_pair("delegation", &context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{CategorySpec, Direction, Role};
    use crate::config::InvoiceConfig;
    use crate::scanners::{ConventionExpiryScanner, OverdueInvoiceScanner};
    use crate::sources::{Convention, Invoice, InvoiceStatus};
    use chrono::{Duration, Utc};

    fn renderer() -> MessageRenderer {
        MessageRenderer::new(&CategoryRegistry::builtin()).unwrap()
    }

    #[test]
    fn test_invoice_message() {
        let now = Utc::now();
        let report = OverdueInvoiceScanner::new(InvoiceConfig::default()).scan(
            &[Invoice {
                id: "INV-01".into(),
                reference: "FA-2026-001".into(),
                due_date: Some(now.date_naive() - Duration::days(10)),
                amount: 1234.5,
                owner_id: None,
                status: InvoiceStatus::Pending,
            }],
            now,
        );
        let msg = renderer()
            .render_candidate(&report.candidates[0], "Facture en retard")
            .unwrap();
        assert_eq!(msg.subject, "[HIGH] Facture FA-2026-001 en retard de 10 jours");
        assert!(msg.body.contains("1234.50"));
        assert!(msg.body.contains("d'un montant"));
    }

    #[test]
    fn test_convention_message_mentions_days() {
        let now = Utc::now();
        let report = ConventionExpiryScanner::new(vec![30, 15, 7, 1, 0]).scan(
            &[Convention {
                id: "CONV-02".into(),
                reference: "CV-02".into(),
                title: "Hébergement".into(),
                end_date: Some(now.date_naive() + Duration::days(7)),
                owner_id: None,
            }],
            now,
        );
        let msg = renderer()
            .render_candidate(&report.candidates[0], "Convention")
            .unwrap();
        assert!(msg.subject.contains("expire dans 7 jours"));
        assert!(msg.body.contains("(Hébergement)"));
    }

    #[test]
    fn test_unknown_category_uses_fallback() {
        let now = Utc::now();
        let mut report = OverdueInvoiceScanner::new(InvoiceConfig::default()).scan(
            &[Invoice {
                id: "INV-02".into(),
                reference: String::new(),
                due_date: Some(now.date_naive() - Duration::days(2)),
                amount: 10.0,
                owner_id: None,
                status: InvoiceStatus::Pending,
            }],
            now,
        );
        let mut candidate = report.candidates.remove(0);
        candidate.category = "SOMETHING_ELSE".into();
        let msg = renderer().render_candidate(&candidate, "x").unwrap();
        assert_eq!(msg.subject, "[MEDIUM] Alerte INVOICE_OVERDUE");
    }

    #[test]
    fn test_bad_template_is_reported() {
        let mut registry = CategoryRegistry::builtin();
        registry.register(CategorySpec {
            subject_template: "{{#if}}".into(),
            ..CategorySpec::kpi("BROKEN", "x", "%", Direction::HigherIsWorse, vec![Role::Admin])
        });
        assert!(matches!(
            MessageRenderer::new(&registry),
            Err(AlertError::Template(_))
        ));
    }
}
