//! Notification dispatch.
//!
//! A notification round fans one alert out to every recipient on every
//! channel they can be reached on. Each (channel, recipient) pair is tried
//! at most `max_delivery_attempts` times per round; a round completes once
//! every pair was delivered or ran out of attempts. Failures on one channel
//! never hold back another.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use notify::{Channel, Message, Notifier};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::category::CategoryRegistry;
use crate::config::ChannelsConfig;
use crate::error::AlertError;
use crate::model::{
    ActionType, Alert, AlertId, Delegation, DeliveryRecord, LifecycleState, Severity, SYSTEM_ACTOR,
};
use crate::repository::AlertRepository;
use crate::sources::{Recipient, RoleDirectory};
use crate::store::AlertFilter;
use crate::templates::MessageRenderer;

/// Outcome of one dispatch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchResult {
    pub alert_id: AlertId,
    pub round: u32,
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Every pair of the round is settled
    pub completed: bool,
    /// Nothing was owed or another dispatch holds the alert
    pub skipped: bool,
}

/// One planned send.
#[derive(Debug, Clone)]
struct Target {
    channel: Channel,
    user_id: String,
    address: String,
}

/// Removes the alert from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<AlertId>>,
    id: AlertId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

pub struct NotificationDispatcher {
    notifier: Arc<Notifier>,
    directory: Arc<dyn RoleDirectory>,
    registry: Arc<CategoryRegistry>,
    renderer: Arc<MessageRenderer>,
    config: ChannelsConfig,
    repo: Arc<AlertRepository>,
    in_flight: Mutex<HashSet<AlertId>>,
}

impl NotificationDispatcher {
    #[must_use]
    pub fn new(
        notifier: Arc<Notifier>,
        directory: Arc<dyn RoleDirectory>,
        registry: Arc<CategoryRegistry>,
        renderer: Arc<MessageRenderer>,
        config: ChannelsConfig,
        repo: Arc<AlertRepository>,
    ) -> Self {
        Self {
            notifier,
            directory,
            registry,
            renderer,
            config,
            repo,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, id: &AlertId) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(id.clone()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            id: id.clone(),
        })
    }

    /// Whether the engine may use `channel` at `severity`.
    fn channel_allowed(&self, channel: Channel, severity: Severity) -> bool {
        let configured = match channel {
            Channel::InApp => true,
            Channel::Email => self.config.email_enabled,
            Channel::Sms => self.config.sms_enabled && severity >= self.config.sms_min_severity,
        };
        configured && self.notifier.is_enabled(channel)
    }

    fn channels_for(&self, recipient: &Recipient, severity: Severity) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| *c == Channel::InApp || recipient.channel_prefs.contains(c))
            .filter(|c| self.channel_allowed(*c, severity))
            .collect()
    }

    async fn lookup_or_in_app(&self, user_id: &str) -> Recipient {
        match self.directory.lookup(user_id).await {
            Ok(Some(recipient)) => recipient,
            Ok(None) => Recipient::in_app_only(user_id),
            Err(e) => {
                warn!(user_id, error = %e, "Recipient lookup failed, using in-app only");
                Recipient::in_app_only(user_id)
            }
        }
    }

    /// Everyone who should hear about `alert`, one entry per user.
    async fn resolve_recipients(&self, alert: &Alert) -> Result<Vec<Recipient>, AlertError> {
        let roles = self
            .registry
            .get(&alert.category)
            .map(|s| s.recipient_roles.clone())
            .unwrap_or_default();

        let mut by_user: BTreeMap<String, Recipient> = BTreeMap::new();
        for recipient in self
            .directory
            .recipients_for(&alert.category, &roles, alert.owner_id.clone())
            .await?
        {
            by_user.entry(recipient.user_id.clone()).or_insert(recipient);
        }

        let explicit = alert.recipients.iter().chain(alert.delegated_to.iter());
        for user_id in explicit {
            if !by_user.contains_key(user_id) {
                let recipient = self.lookup_or_in_app(user_id).await;
                by_user.insert(user_id.clone(), recipient);
            }
        }
        Ok(by_user.into_values().collect())
    }

    fn plan(&self, alert: &Alert, recipients: &[Recipient]) -> Vec<Target> {
        let mut targets = Vec::new();
        for recipient in recipients {
            for channel in self.channels_for(recipient, alert.severity) {
                match recipient.address_for(channel) {
                    Some(address) => targets.push(Target {
                        channel,
                        user_id: recipient.user_id.clone(),
                        address: address.to_string(),
                    }),
                    None => debug!(
                        user_id = %recipient.user_id,
                        channel = %channel,
                        "No address for channel, skipping"
                    ),
                }
            }
        }
        targets
    }

    /// Send whatever is still owed for `alert` in its current round.
    ///
    /// The alert is re-read from the store; concurrent calls for the same
    /// alert are skipped.
    pub async fn dispatch(
        &self,
        alert_id: &AlertId,
        now: DateTime<Utc>,
    ) -> Result<DispatchResult, AlertError> {
        let skipped = DispatchResult {
            alert_id: alert_id.clone(),
            skipped: true,
            ..DispatchResult::default()
        };
        let Some(_guard) = self.claim(alert_id) else {
            debug!(alert_id = %alert_id, "Dispatch already in flight");
            return Ok(skipped);
        };

        let alert = self
            .repo
            .store()
            .get(alert_id)
            .await?
            .ok_or_else(|| AlertError::NotFound(alert_id.clone()))?;
        if !alert.notification_due() {
            return Ok(skipped);
        }

        let round = if alert.notification_round == 0 || alert.notification_sent {
            alert.notification_round + 1
        } else {
            alert.notification_round
        };
        let sent_severity = alert.severity;

        let recipients = self.resolve_recipients(&alert).await?;
        let targets = self.plan(&alert, &recipients);
        if targets.is_empty() {
            warn!(alert_id = %alert.id, "Alert has no reachable recipient");
        }

        let attempts = |t: &Target, records: &[DeliveryRecord]| {
            records
                .iter()
                .filter(|d| d.round == round && d.channel == t.channel && d.recipient == t.user_id)
                .fold((0_u32, false), |(n, ok), d| (n + 1, ok || d.delivered))
        };
        let max = self.config.max_delivery_attempts;
        let pending: Vec<&Target> = targets
            .iter()
            .filter(|t| {
                let (n, delivered) = attempts(t, &alert.deliveries);
                !delivered && n < max
            })
            .collect();

        let timeout = self.config.send_timeout();
        let sends = pending.iter().map(|t| {
            let message = Message::new(t.address.clone(), alert.title.clone(), alert.message.clone());
            async move {
                let result = self.notifier.send(t.channel, &message, timeout).await;
                DeliveryRecord {
                    round,
                    channel: t.channel,
                    recipient: t.user_id.clone(),
                    delivered: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                    attempted_at: now,
                }
            }
        });
        let records: Vec<DeliveryRecord> = join_all(sends).await;

        for r in records.iter().filter(|r| !r.delivered) {
            warn!(
                alert_id = %alert.id,
                channel = %r.channel,
                recipient = %r.recipient,
                error = r.error.as_deref().unwrap_or_default(),
                "Notification delivery failed"
            );
        }

        let mut all: Vec<DeliveryRecord> = alert.deliveries.clone();
        all.extend(records.iter().cloned());
        let completed = targets.iter().all(|t| {
            let (n, delivered) = attempts(t, &all);
            delivered || n >= max
        });
        let delivered_channels: HashSet<Channel> =
            records.iter().filter(|r| r.delivered).map(|r| r.channel).collect();
        let in_app_delivered = delivered_channels.contains(&Channel::InApp);
        let round_delivered = all.iter().any(|d| d.round == round && d.delivered);
        let planned_users: Vec<String> = recipients.iter().map(|r| r.user_id.clone()).collect();

        self.repo
            .update_with(&alert.id, |a| {
                a.deliveries.extend(records.iter().cloned());
                a.notification_round = round;
                a.notification_channels.extend(delivered_channels.iter().copied());
                a.recipients.extend(planned_users.iter().cloned());
                a.notification_sent = completed;
                if completed {
                    a.notification_sent_at = Some(now);
                    a.notified_severity = Some(sent_severity);
                }

                let channels = a
                    .notification_channels
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                if a.lifecycle_state == LifecycleState::New && in_app_delivered {
                    if a.acknowledged_at.is_none() {
                        a.acknowledged_at = Some(now);
                        a.acknowledged_by = Some(SYSTEM_ACTOR.to_string());
                    }
                    a.transition(
                        LifecycleState::InProgress,
                        ActionType::Notified,
                        SYSTEM_ACTOR,
                        now,
                        Some(format!("tour {round} : {channels}")),
                    );
                } else if completed && round_delivered {
                    a.record(
                        ActionType::Notified,
                        SYSTEM_ACTOR,
                        now,
                        Some(format!("tour {round} : {channels}")),
                    );
                }
                Ok(true)
            })
            .await?;

        let delivered = records.iter().filter(|r| r.delivered).count();
        let result = DispatchResult {
            alert_id: alert.id.clone(),
            round,
            attempted: records.len(),
            delivered,
            failed: records.len() - delivered,
            completed,
            skipped: false,
        };
        info!(
            alert_id = %result.alert_id,
            round,
            delivered = result.delivered,
            failed = result.failed,
            completed,
            "Notification round dispatched"
        );
        Ok(result)
    }

    /// Dispatch every active alert that is owed a notification.
    pub async fn dispatch_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DispatchResult>, AlertError> {
        let due: Vec<Alert> = self
            .repo
            .store()
            .list(&AlertFilter::active())
            .await?
            .into_iter()
            .filter(Alert::notification_due)
            .collect();

        let mut results = Vec::with_capacity(due.len());
        for alert in due {
            match self.dispatch(&alert.id, now).await {
                Ok(result) => results.push(result),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(alert_id = %alert.id, error = %e, "Dispatch failed"),
            }
        }
        Ok(results)
    }

    /// Tell a delegate about their new assignment.
    ///
    /// In-app always; email when preferred; SMS only for CRITICAL alerts.
    pub async fn notify_delegation(
        &self,
        delegation: &Delegation,
        alert: &Alert,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeliveryRecord>, AlertError> {
        let rendered = self.renderer.render_delegation(alert, delegation)?;
        let delegate = self.lookup_or_in_app(&delegation.delegated_to).await;

        let channels = Channel::ALL.into_iter().filter(|c| match c {
            Channel::InApp => true,
            Channel::Email => delegate.channel_prefs.contains(c),
            Channel::Sms => {
                alert.severity == Severity::Critical && delegate.channel_prefs.contains(c)
            }
        });

        let timeout = self.config.send_timeout();
        let mut records = Vec::new();
        for channel in channels {
            if !self.channel_allowed(channel, Severity::Critical) {
                continue;
            }
            let Some(address) = delegate.address_for(channel) else {
                continue;
            };
            let message = Message::new(address, rendered.subject.clone(), rendered.body.clone());
            let result = self.notifier.send(channel, &message, timeout).await;
            if let Err(e) = &result {
                warn!(
                    delegation_id = %delegation.id,
                    channel = %channel,
                    error = %e,
                    "Delegation notice failed"
                );
            }
            records.push(DeliveryRecord {
                round: 0,
                channel,
                recipient: delegate.user_id.clone(),
                delivered: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
                attempted_at: now,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::model::fixtures::entity_alert;
    use crate::sources::MockRoleDirectory;
    use crate::store::{AlertStore, InMemoryAlertStore};
    use async_trait::async_trait;
    use notify::{ChannelError, InAppChannel, NotifyChannel};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel {
        channel: Channel,
        fail: bool,
        calls: AtomicUsize,
    }

    impl CountingChannel {
        fn new(channel: Channel, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                channel,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NotifyChannel for CountingChannel {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn channel(&self) -> Channel {
            self.channel
        }
        fn enabled(&self) -> bool {
            true
        }
        async fn send(&self, _message: &Message) -> Result<(), ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ChannelError::Other("gateway down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn owner() -> Recipient {
        Recipient {
            user_id: "u-owner".into(),
            email: Some("owner@example.com".into()),
            phone: Some("+33600000000".into()),
            channel_prefs: BTreeSet::from([Channel::InApp, Channel::Email, Channel::Sms]),
        }
    }

    fn directory() -> MockRoleDirectory {
        let mut directory = MockRoleDirectory::new();
        directory
            .expect_recipients_for()
            .returning(|_, _, _| Ok(vec![owner()]));
        directory.expect_lookup().returning(|_| Ok(None));
        directory
    }

    struct Fixture {
        dispatcher: NotificationDispatcher,
        store: Arc<InMemoryAlertStore>,
        in_app: Arc<InAppChannel>,
        email: Arc<CountingChannel>,
        sms: Arc<CountingChannel>,
    }

    fn fixture(directory: MockRoleDirectory, email_fails: bool) -> Fixture {
        let in_app = Arc::new(InAppChannel::new());
        let email = CountingChannel::new(Channel::Email, email_fails);
        let sms = CountingChannel::new(Channel::Sms, false);
        let notifier = Notifier::with_channels(vec![email.clone(), sms.clone()])
            .with_in_app(in_app.clone());
        let store = Arc::new(InMemoryAlertStore::new());
        let registry = Arc::new(CategoryRegistry::builtin());
        let renderer = Arc::new(MessageRenderer::new(&registry).unwrap());
        let dispatcher = NotificationDispatcher::new(
            Arc::new(notifier),
            Arc::new(directory),
            registry,
            renderer,
            ChannelsConfig::default(),
            Arc::new(AlertRepository::new(store.clone(), 5)),
        );
        Fixture {
            dispatcher,
            store,
            in_app,
            email,
            sms,
        }
    }

    async fn stored(store: &InMemoryAlertStore, alert: Alert) -> Alert {
        store.insert_active(alert).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_round_moves_new_to_in_progress() {
        let f = fixture(directory(), false);
        let now = Utc::now();
        let alert = stored(&f.store, entity_alert("INV-01", now)).await;

        let result = f.dispatcher.dispatch(&alert.id, now).await.unwrap();
        assert_eq!(result.round, 1);
        assert_eq!(result.delivered, 3);
        assert!(result.completed);

        let alert = f.store.get(&alert.id).await.unwrap().unwrap();
        assert_eq!(alert.lifecycle_state, LifecycleState::InProgress);
        assert_eq!(alert.acknowledged_by.as_deref(), Some(SYSTEM_ACTOR));
        assert!(alert.notification_sent);
        assert_eq!(alert.notified_severity, Some(Severity::High));
        assert_eq!(f.in_app.inbox("u-owner").len(), 1);
        assert_eq!(
            alert.action_history.last().unwrap().action_type,
            ActionType::Notified
        );

        // Nothing owed anymore.
        let again = f.dispatcher.dispatch(&alert.id, now).await.unwrap();
        assert!(again.skipped);
        assert_eq!(f.email.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sms_requires_min_severity() {
        let f = fixture(directory(), false);
        let now = Utc::now();
        let mut alert = entity_alert("INV-01", now);
        alert.severity = Severity::Medium;
        let alert = stored(&f.store, alert).await;

        f.dispatcher.dispatch(&alert.id, now).await.unwrap();
        assert_eq!(f.sms.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.email.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_email_retried_until_limit() {
        let f = fixture(directory(), true);
        let now = Utc::now();
        let alert = stored(&f.store, entity_alert("INV-01", now)).await;

        let first = f.dispatcher.dispatch(&alert.id, now).await.unwrap();
        assert_eq!(first.failed, 1);
        assert!(!first.completed);
        // In-app still landed.
        assert_eq!(f.in_app.inbox("u-owner").len(), 1);

        let pending = f.dispatcher.dispatch_pending(now).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempted, 1);
        let last = f.dispatcher.dispatch(&alert.id, now).await.unwrap();
        assert!(last.completed);
        assert_eq!(last.round, 1);

        assert_eq!(f.email.calls.load(Ordering::SeqCst), 3);
        assert!(f.dispatcher.dispatch_pending(now).await.unwrap().is_empty());
        // In-app was never re-sent within the round.
        assert_eq!(f.in_app.inbox("u-owner").len(), 1);
    }

    #[tokio::test]
    async fn test_escalation_opens_one_new_round() {
        let f = fixture(directory(), false);
        let now = Utc::now();
        let alert = stored(&f.store, entity_alert("INV-01", now)).await;
        f.dispatcher.dispatch(&alert.id, now).await.unwrap();

        let mut current = f.store.get(&alert.id).await.unwrap().unwrap();
        let version = current.version;
        current.severity = Severity::Critical;
        f.store.compare_and_swap(current, version).await.unwrap();

        let escalated = f.dispatcher.dispatch(&alert.id, now).await.unwrap();
        assert_eq!(escalated.round, 2);
        assert!(f.dispatcher.dispatch(&alert.id, now).await.unwrap().skipped);
        assert_eq!(f.in_app.inbox("u-owner").len(), 2);
    }

    #[tokio::test]
    async fn test_directory_failure_propagates() {
        let mut directory = MockRoleDirectory::new();
        directory
            .expect_recipients_for()
            .returning(|_, _, _| Err(SourceError::Unavailable("ldap".into())));
        let f = fixture(directory, false);
        let now = Utc::now();
        let alert = stored(&f.store, entity_alert("INV-01", now)).await;

        let err = f.dispatcher.dispatch(&alert.id, now).await.unwrap_err();
        assert!(matches!(err, AlertError::Source(_)));
        let alert = f.store.get(&alert.id).await.unwrap().unwrap();
        assert_eq!(alert.notification_round, 0);
    }

    #[tokio::test]
    async fn test_delegation_notice_channels() {
        let mut directory = MockRoleDirectory::new();
        directory.expect_lookup().returning(|id| {
            Ok(Some(Recipient {
                user_id: id.to_string(),
                ..owner()
            }))
        });
        let f = fixture(directory, false);
        let now = Utc::now();
        let alert = entity_alert("INV-01", now);
        let delegation = Delegation {
            id: crate::model::DelegationId::new("d-1"),
            alert_id: alert.id.clone(),
            delegated_by: "u-boss".into(),
            delegated_to: "u-ops".into(),
            delegated_at: now,
            note: None,
            status: crate::model::DelegationStatus::Pending,
            started_at: None,
            resolution: None,
            resolved_at: None,
            resolved_by: None,
        };

        let records = f
            .dispatcher
            .notify_delegation(&delegation, &alert, now)
            .await
            .unwrap();
        let channels: Vec<Channel> = records.iter().map(|r| r.channel).collect();
        assert_eq!(channels, vec![Channel::InApp, Channel::Email]);
        assert!(f.in_app.inbox("u-ops")[0].subject.contains("déléguée"));
    }
}
