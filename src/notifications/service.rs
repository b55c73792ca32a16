//! Notification service
//!
//! The only component that moves a [`ProactiveMessage`] through its lifecycle.
//! `queue` applies policy in a fixed order (tier channels, priority threshold,
//! quiet hours, daily cap), `dispatch` sends one QUEUED message, `sweep` expires,
//! promotes and dispatches whatever is due. `enqueue` is `queue` without the
//! immediate first attempt.

use super::policy::{self, ResolvedPreferences};
use super::retry::RetryPolicy;
use super::{
    DispatchOutcome, DropReason, HistoryFilter, HistoryPage, MessageStatus, NotificationPayload,
    ProactiveMessage, QueueOutcome, SweepReport, Transition,
};
use crate::channels::{Channel, ChannelRegistry, Contact, DeliveryResult, ErrorCode, Recipient};
use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::error::{NotificationError, PolicyRejection};
use crate::logging::ellipse;
use crate::store::{CappedInsert, ContactDirectory, MessageStore, PreferenceStore};
use crate::tier::TierProvider;
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// PENDING messages younger than this belong to an in-flight `queue` call
const PENDING_GRACE_SECS: i64 = 60;

const TEST_MESSAGE: &str = "This is a test notification from your aura.";

pub struct NotificationService {
    messages: Arc<dyn MessageStore>,
    preferences: Arc<dyn PreferenceStore>,
    contacts: Arc<dyn ContactDirectory>,
    tiers: Arc<dyn TierProvider>,
    channels: ChannelRegistry,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    config: DeliveryConfig,
}

impl NotificationService {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        preferences: Arc<dyn PreferenceStore>,
        contacts: Arc<dyn ContactDirectory>,
        tiers: Arc<dyn TierProvider>,
        channels: ChannelRegistry,
        clock: Arc<dyn Clock>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            messages,
            preferences,
            contacts,
            tiers,
            channels,
            clock,
            retry: RetryPolicy::from_config(&config),
            config,
        }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    async fn resolved_preferences(
        &self,
        user_id: &str,
        entity_id: &str,
    ) -> Result<ResolvedPreferences, NotificationError> {
        let prefs = self
            .preferences
            .preferences_for(user_id)
            .await
            .with_context(|| format!("Failed to load preferences of user {}", user_id))?;
        Ok(policy::resolve(&prefs, entity_id))
    }

    /// Accept a notification request. Returns the new message id, or a drop when
    /// the payload is below the priority threshold. Policy violations are errors.
    /// With `dispatch_on_queue` the first attempt is made right away.
    pub async fn queue(
        &self,
        payload: NotificationPayload,
    ) -> Result<QueueOutcome, NotificationError> {
        self.accept(payload, self.config.dispatch_on_queue).await
    }

    /// Like [`queue`](Self::queue) but never sends: the message stays QUEUED for
    /// the next sweep. Evaluation passes queue through here.
    pub async fn enqueue(
        &self,
        payload: NotificationPayload,
    ) -> Result<QueueOutcome, NotificationError> {
        self.accept(payload, false).await
    }

    async fn accept(
        &self,
        payload: NotificationPayload,
        dispatch_now: bool,
    ) -> Result<QueueOutcome, NotificationError> {
        payload.validate().map_err(NotificationError::Invalid)?;
        let now = self.clock.now();

        let limits = self
            .tiers
            .tier_limits(&payload.user_id)
            .await
            .with_context(|| format!("Failed to resolve tier of user {}", payload.user_id))?;
        let prefs = self
            .resolved_preferences(&payload.user_id, &payload.entity_id)
            .await?;
        if !prefs.enabled {
            info!(
                "Notifications: user {} disabled notifications for entity {}",
                payload.user_id, payload.entity_id
            );
            return Err(PolicyRejection::NotificationsDisabled.into());
        }

        // 1. channels the tier allows
        let channels = policy::gate_channels(&payload.channels, &limits)?;

        // 2. priority threshold
        if let Some(threshold) = policy::priority_threshold(&limits, &prefs) {
            if payload.priority < threshold {
                info!(
                    "Notifications: dropped for user {} (priority {} below threshold {})",
                    payload.user_id, payload.priority, threshold
                );
                return Ok(QueueOutcome::Dropped {
                    reason: DropReason::BelowPriorityThreshold {
                        priority: payload.priority,
                        threshold,
                    },
                });
            }
        }

        // 3. quiet hours defer, they never reject
        let deferred_until = prefs.quiet_hours.as_ref().and_then(|q| q.deferral(now));

        // 4. daily caps, counted and inserted atomically
        let since = policy::local_midnight(now, prefs.timezone);
        let caps = policy::daily_caps(&limits, &prefs, &payload.entity_id);
        let message = ProactiveMessage::from_payload(payload, channels, now);
        let id = message.id.clone();
        debug!(
            "Notifications: queuing {} for user {} via {:?}: {}",
            id,
            message.user_id,
            message.channels,
            ellipse(&message.message, 80)
        );
        let user_id = message.user_id.clone();
        match self
            .messages
            .insert_capped(message, since, &caps)
            .await
            .context("Failed to persist notification")?
        {
            CappedInsert::Inserted => {}
            CappedInsert::Exceeded { limit, count } => {
                info!(
                    "Notifications: user {} reached the daily cap ({}/{})",
                    user_id, count, limit
                );
                return Err(PolicyRejection::RateLimited { limit, count }.into());
            }
        }
        self.messages
            .transition(
                &id,
                &[MessageStatus::Pending],
                Transition::Queue {
                    not_before: deferred_until.unwrap_or(now),
                },
                now,
            )
            .await?;

        match deferred_until {
            Some(until) => info!("Notifications: {} deferred by quiet hours until {}", id, until),
            None if dispatch_now => {
                // A failed first attempt is retried by the sweep; queuing still succeeded
                if let Err(e) = self.dispatch(&id).await {
                    warn!("Notifications: immediate dispatch of {} failed: {}", id, e);
                }
            }
            None => {}
        }

        Ok(QueueOutcome::Queued { id, deferred_until })
    }

    /// Send one QUEUED message through the best available channel.
    pub async fn dispatch(&self, id: &str) -> Result<DispatchOutcome, NotificationError> {
        let message = self
            .messages
            .get(id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(id.to_string()))?;
        let now = self.clock.now();
        if !message.is_due(now) {
            debug!("Notifications: {} not dispatchable ({})", id, message.status);
            return Ok(DispatchOutcome::Skipped {
                status: message.status,
            });
        }

        let prefs = self
            .resolved_preferences(&message.user_id, &message.entity_id)
            .await?;
        if let Some(until) = prefs.quiet_hours.as_ref().and_then(|q| q.deferral(now)) {
            return self.defer(&message, until, now).await;
        }

        let contact = self
            .contacts
            .contact(&message.user_id)
            .await
            .with_context(|| format!("Failed to load contact of user {}", message.user_id))?
            .unwrap_or_else(|| Contact {
                user_id: message.user_id.clone(),
                ..Default::default()
            });
        let recipient = Recipient {
            contact,
            disabled: prefs.disabled_channels.clone(),
        };
        let channel = self.channels.select(&message.channels, &recipient);

        // Re-check right before sending so an already handled message is not sent again
        let current = self
            .messages
            .get(id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(id.to_string()))?;
        if current.status != MessageStatus::Queued {
            debug!("Notifications: {} became {} before send", id, current.status);
            return Ok(DispatchOutcome::Skipped {
                status: current.status,
            });
        }

        let timeout = self.config.send_timeout();
        let result = match self.channels.get(channel) {
            Some(dispatcher) => {
                match tokio::time::timeout(timeout, dispatcher.send(&current, &recipient)).await {
                    Ok(result) => result,
                    Err(_) => DeliveryResult::failed_with(
                        ErrorCode::ExternalServiceError,
                        format!("{} send timed out after {:?}", channel, timeout),
                        true,
                    ),
                }
            }
            None => DeliveryResult::failed(
                ErrorCode::InvalidChannel,
                format!("{} is not registered", channel),
            ),
        };

        self.record_result(&current, channel, result).await
    }

    async fn defer(
        &self,
        message: &ProactiveMessage,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, NotificationError> {
        let updated = self
            .messages
            .transition(&message.id, &[MessageStatus::Queued], Transition::Defer { until }, now)
            .await?;
        Ok(match updated {
            Some(_) => {
                debug!("Notifications: {} deferred until {}", message.id, until);
                DispatchOutcome::Deferred { until }
            }
            None => DispatchOutcome::Skipped {
                status: message.status,
            },
        })
    }

    async fn record_result(
        &self,
        message: &ProactiveMessage,
        channel: Channel,
        result: DeliveryResult,
    ) -> Result<DispatchOutcome, NotificationError> {
        let now = self.clock.now();
        let expected = [MessageStatus::Queued];

        if result.success {
            let updated = self
                .messages
                .transition(
                    &message.id,
                    &expected,
                    Transition::Deliver {
                        channel,
                        external_id: result.message_id,
                        at: now,
                    },
                    now,
                )
                .await?;
            if updated.is_some() {
                info!("Notifications: {} delivered via {}", message.id, channel);
                return Ok(DispatchOutcome::Delivered { channel });
            }
            return Ok(self.skipped(&message.id).await);
        }

        let error = result.error.unwrap_or_else(|| "delivery failed".to_string());

        // A provider-side quiet period holds the message without spending a retry
        if result.error_code == Some(ErrorCode::QuietHours) {
            return self.defer(message, self.retry.next_attempt(0, now), now).await;
        }

        if result.retryable && self.retry.should_retry(message.retry_count) {
            let next_attempt_at = self.retry.next_attempt(message.retry_count, now);
            let retry_count = message.retry_count + 1;
            let updated = self
                .messages
                .transition(
                    &message.id,
                    &expected,
                    Transition::Retry {
                        retry_count,
                        not_before: next_attempt_at,
                        channel,
                        error: error.clone(),
                        code: result.error_code,
                    },
                    now,
                )
                .await?;
            if updated.is_some() {
                warn!(
                    "Notifications: {} via {} failed ({}), retry {}/{} at {}",
                    message.id,
                    channel,
                    error,
                    retry_count,
                    self.retry.max_retries(),
                    next_attempt_at
                );
                return Ok(DispatchOutcome::Retrying {
                    retry_count,
                    next_attempt_at,
                });
            }
            return Ok(self.skipped(&message.id).await);
        }

        let updated = self
            .messages
            .transition(
                &message.id,
                &expected,
                Transition::Fail {
                    channel: Some(channel),
                    error: error.clone(),
                    code: result.error_code,
                },
                now,
            )
            .await?;
        if updated.is_some() {
            warn!("Notifications: {} failed permanently via {}: {}", message.id, channel, error);
            return Ok(DispatchOutcome::Failed {
                code: result.error_code,
            });
        }
        Ok(self.skipped(&message.id).await)
    }

    async fn skipped(&self, id: &str) -> DispatchOutcome {
        let status = match self.messages.get(id).await {
            Ok(Some(message)) => message.status,
            _ => MessageStatus::Queued,
        };
        debug!("Notifications: {} changed concurrently, now {}", id, status);
        DispatchOutcome::Skipped { status }
    }

    /// DELIVERED → READ. Returns the read timestamp; fails on any other status.
    pub async fn mark_as_read(&self, id: &str) -> Result<DateTime<Utc>, NotificationError> {
        let message = self
            .messages
            .get(id)
            .await?
            .ok_or_else(|| NotificationError::NotFound(id.to_string()))?;
        let precondition = |actual: MessageStatus| NotificationError::Precondition {
            id: id.to_string(),
            expected: MessageStatus::Delivered,
            actual,
        };
        if message.status != MessageStatus::Delivered {
            return Err(precondition(message.status));
        }

        let now = self.clock.now();
        // Never before delivery, even with a skewed clock
        let read_at = message.delivered_at.map(|d| d.max(now)).unwrap_or(now);
        match self
            .messages
            .transition(id, &[MessageStatus::Delivered], Transition::Read { at: read_at }, now)
            .await?
        {
            Some(_) => {
                debug!("Notifications: {} read at {}", id, read_at);
                Ok(read_at)
            }
            None => {
                let actual = self
                    .messages
                    .get(id)
                    .await?
                    .map(|m| m.status)
                    .unwrap_or(MessageStatus::Delivered);
                Err(precondition(actual))
            }
        }
    }

    /// A page of the user's notifications, newest first
    pub async fn get_history(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
    ) -> Result<HistoryPage, NotificationError> {
        Ok(self
            .messages
            .history(user_id, filter)
            .await
            .with_context(|| format!("Failed to load history of user {}", user_id))?)
    }

    /// Expire stale messages, promote stuck PENDING ones and dispatch what is due.
    pub async fn sweep(&self) -> Result<SweepReport, NotificationError> {
        let now = self.clock.now();
        let batch = self.config.sweep_batch_size;
        let mut report = SweepReport::default();

        let cutoff = now - Duration::hours(self.config.max_age_hours);
        for status in [MessageStatus::Pending, MessageStatus::Queued] {
            for message in self.messages.list_by_status(status, cutoff, batch).await? {
                let expired = self
                    .messages
                    .transition(&message.id, &[status], Transition::Expire, now)
                    .await?;
                if expired.is_some() {
                    report.expired += 1;
                }
            }
        }

        let grace = now - Duration::seconds(PENDING_GRACE_SECS);
        for message in self
            .messages
            .list_by_status(MessageStatus::Pending, grace, batch)
            .await?
        {
            let promoted = self
                .messages
                .transition(
                    &message.id,
                    &[MessageStatus::Pending],
                    Transition::Queue { not_before: now },
                    now,
                )
                .await?;
            if promoted.is_some() {
                report.promoted += 1;
            }
        }

        for message in self.messages.due(now, batch).await? {
            report.attempted += 1;
            match self.dispatch(&message.id).await {
                Ok(DispatchOutcome::Delivered { .. }) => report.delivered += 1,
                Ok(DispatchOutcome::Retrying { .. }) => report.retried += 1,
                Ok(DispatchOutcome::Failed { .. }) => report.failed += 1,
                Ok(DispatchOutcome::Deferred { .. }) => report.deferred += 1,
                Ok(DispatchOutcome::Skipped { .. }) => report.skipped += 1,
                Err(e) => {
                    warn!("Notifications: sweep dispatch of {} failed: {}", message.id, e);
                    report.errors.push(format!("{}: {}", message.id, e));
                }
            }
        }

        if report.attempted > 0 || report.expired > 0 || report.promoted > 0 {
            info!(
                "Notifications: sweep attempted={} delivered={} retried={} failed={} \
                 deferred={} expired={} promoted={}",
                report.attempted,
                report.delivered,
                report.retried,
                report.failed,
                report.deferred,
                report.expired,
                report.promoted
            );
        }
        Ok(report)
    }

    /// Queue a manual test notification (no rule) on one channel, or IN_APP.
    pub async fn send_test(
        &self,
        user_id: &str,
        entity_id: &str,
        channel: Option<Channel>,
    ) -> Result<QueueOutcome, NotificationError> {
        let payload = NotificationPayload::new(user_id, entity_id, TEST_MESSAGE)
            .with_channels(vec![channel.unwrap_or(Channel::InApp)])
            .with_priority(i32::MAX)
            .with_metadata("test", json!(true))
            .with_metadata("title", json!("Test notification"));
        self.queue(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelDispatcher;
    use crate::clock::ManualClock;
    use crate::notifications::{NotificationPreference, QuietHours};
    use crate::store::MemoryStore;
    use crate::tier::{StaticTierProvider, Tier, TierLimits};
    use async_trait::async_trait;
    use chrono::{NaiveTime, TimeZone};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// SMS stand-in that answers from a script, then succeeds
    struct ScriptedSms {
        script: Mutex<Vec<DeliveryResult>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedSms {
        fn new(script: Vec<DeliveryResult>) -> Self {
            Self {
                script: Mutex::new(script),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl ChannelDispatcher for ScriptedSms {
        fn channel(&self) -> Channel {
            Channel::Sms
        }

        async fn send(&self, message: &ProactiveMessage, _recipient: &Recipient) -> DeliveryResult {
            self.sent.lock().push(message.id.clone());
            let mut script = self.script.lock();
            if script.is_empty() {
                DeliveryResult::delivered("sms-ok")
            } else {
                script.remove(0)
            }
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        service: NotificationService,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn fixture(tier: Tier, sms: Option<Arc<ScriptedSms>>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let tiers = StaticTierProvider::new(HashMap::from([("u1".to_string(), tier)]));
        let mut registry = ChannelRegistry::new();
        if let Some(sms) = sms {
            registry.register(sms);
        }
        let service = NotificationService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(tiers),
            registry,
            clock.clone(),
            DeliveryConfig::default(),
        );
        Fixture { store, clock, service }
    }

    fn payload() -> NotificationPayload {
        NotificationPayload::new("u1", "e1", "Your fern needs water").with_priority(1)
    }

    async fn status_of(f: &Fixture, id: &str) -> ProactiveMessage {
        f.store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_free_tier_narrows_channels_and_delivers_in_app() {
        let f = fixture(Tier::Free, None);
        let outcome = f
            .service
            .queue(payload().with_channels(vec![Channel::Sms, Channel::InApp]))
            .await
            .unwrap();
        let id = outcome.id().unwrap().to_string();
        let msg = status_of(&f, &id).await;
        assert_eq!(msg.channels, vec![Channel::InApp]);
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(msg.delivery_channel, Some(Channel::InApp));
        assert!(msg.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_below_threshold_is_dropped_not_persisted() {
        let f = fixture(Tier::Personal, None);
        f.store
            .upsert_preference(NotificationPreference::new("u1").with_priority_threshold(5))
            .await
            .unwrap();
        let outcome = f.service.queue(payload().with_priority(2)).await.unwrap();
        assert_eq!(
            outcome,
            QueueOutcome::Dropped {
                reason: DropReason::BelowPriorityThreshold {
                    priority: 2,
                    threshold: 5
                }
            }
        );
        assert!(f.store.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_quiet_hours_defer_then_dispatch_in_the_morning() {
        let f = fixture(Tier::Personal, None);
        f.store
            .upsert_preference(NotificationPreference::new("u1").with_quiet_hours(QuietHours::new(
                NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
                "UTC",
            )))
            .await
            .unwrap();
        f.clock.set(Utc.with_ymd_and_hms(2025, 6, 1, 23, 30, 0).unwrap());

        let outcome = f.service.queue(payload()).await.unwrap();
        let morning = Utc.with_ymd_and_hms(2025, 6, 2, 7, 0, 0).unwrap();
        let id = match outcome {
            QueueOutcome::Queued { id, deferred_until } => {
                assert_eq!(deferred_until, Some(morning));
                id
            }
            other => panic!("unexpected outcome {:?}", other),
        };
        let msg = status_of(&f, &id).await;
        assert_eq!(msg.status, MessageStatus::Queued);
        assert_eq!(msg.retry_count, 0);

        // Nothing is due during the night
        f.clock.set(Utc.with_ymd_and_hms(2025, 6, 2, 3, 0, 0).unwrap());
        let night = f.service.sweep().await.unwrap();
        assert_eq!(night.attempted, 0);

        f.clock.set(Utc.with_ymd_and_hms(2025, 6, 2, 7, 1, 0).unwrap());
        let report = f.service.sweep().await.unwrap();
        assert_eq!(report.delivered, 1);
        let msg = status_of(&f, &id).await;
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(msg.retry_count, 0);
    }

    #[tokio::test]
    async fn test_daily_cap_rejects_with_rate_limited() {
        let f = fixture(Tier::Free, None);
        let cap = TierLimits::for_tier(Tier::Free).max_notifications_per_day;
        for _ in 0..cap {
            f.service.queue(payload()).await.unwrap();
        }
        let err = f.service.queue(payload()).await.unwrap_err();
        match err {
            NotificationError::Policy(PolicyRejection::RateLimited { limit, count }) => {
                assert_eq!(limit, cap);
                assert_eq!(count, cap);
            }
            other => panic!("unexpected error {:?}", other),
        }

        // A new day resets the count
        f.clock.advance_secs(24 * 3600);
        assert!(f.service.queue(payload()).await.is_ok());
    }

    #[tokio::test]
    async fn test_daily_cap_resets_at_local_midnight() {
        let f = fixture(Tier::Personal, None);
        f.store
            .upsert_preference(
                NotificationPreference::new("u1")
                    .with_quiet_hours(QuietHours::new(
                        NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
                        NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
                        "America/New_York",
                    ))
                    .with_max_per_day(2),
            )
            .await
            .unwrap();
        // 23:30 EDT on June 1
        f.clock.set(Utc.with_ymd_and_hms(2025, 6, 2, 3, 30, 0).unwrap());
        f.service.queue(payload()).await.unwrap();
        f.service.queue(payload()).await.unwrap();
        assert!(matches!(
            f.service.queue(payload()).await,
            Err(NotificationError::Policy(PolicyRejection::RateLimited { limit: 2, count: 2 }))
        ));

        // 23:59 local: still the same day even though UTC rolled over hours ago
        f.clock.advance_secs(29 * 60);
        assert!(matches!(
            f.service.queue(payload()).await,
            Err(NotificationError::Policy(PolicyRejection::RateLimited { .. }))
        ));

        // 00:00 EDT on June 2
        f.clock.advance_secs(60);
        assert!(f.service.queue(payload()).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_queues_respect_daily_cap() {
        let f = fixture(Tier::Free, None);
        let cap = TierLimits::for_tier(Tier::Free).max_notifications_per_day as usize;
        let service = Arc::new(f.service);
        let handles: Vec<_> = (0..cap * 3)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.queue(payload()).await })
            })
            .collect();

        let mut queued = 0;
        let mut limited = 0;
        for joined in futures_util::future::join_all(handles).await {
            match joined.unwrap() {
                Ok(QueueOutcome::Queued { .. }) => queued += 1,
                Err(NotificationError::Policy(PolicyRejection::RateLimited { .. })) => limited += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(queued, cap);
        assert_eq!(limited, cap * 2);
        assert_eq!(f.store.snapshot().messages.len(), cap);
    }

    #[tokio::test]
    async fn test_negative_priority_without_threshold_is_queued() {
        let f = fixture(Tier::Free, None);
        let outcome = f.service.queue(payload().with_priority(-5)).await.unwrap();
        let msg = status_of(&f, outcome.id().unwrap()).await;
        assert_eq!(msg.priority, -5);
        assert_eq!(msg.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn test_enqueue_leaves_sending_to_the_sweep() {
        let sms = Arc::new(ScriptedSms::new(Vec::new()));
        let f = fixture(Tier::Family, Some(sms.clone()));
        f.store.upsert_contact(Contact {
            user_id: "u1".to_string(),
            phone: Some("+41790000000".to_string()),
            ..Default::default()
        });

        let outcome = f
            .service
            .enqueue(payload().with_channels(vec![Channel::Sms]))
            .await
            .unwrap();
        let id = outcome.id().unwrap().to_string();
        assert_eq!(status_of(&f, &id).await.status, MessageStatus::Queued);
        assert_eq!(sms.sent(), 0);

        let report = f.service.sweep().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(sms.sent(), 1);
        assert_eq!(status_of(&f, &id).await.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn test_entity_cap_from_preference() {
        let f = fixture(Tier::Business, None);
        f.store
            .upsert_preference(
                NotificationPreference::new("u1")
                    .for_entity("e1")
                    .with_max_per_day(1),
            )
            .await
            .unwrap();
        f.service.queue(payload()).await.unwrap();
        assert!(matches!(
            f.service.queue(payload()).await,
            Err(NotificationError::Policy(PolicyRejection::RateLimited { limit: 1, .. }))
        ));
        // Other entities are not affected by the entity-specific cap
        let other = NotificationPayload::new("u1", "e2", "Heron spotted").with_priority(1);
        assert!(f.service.queue(other).await.is_ok());
    }

    #[tokio::test]
    async fn test_disabled_preference_rejects() {
        let f = fixture(Tier::Personal, None);
        let mut pref = NotificationPreference::new("u1");
        pref.enabled = false;
        f.store.upsert_preference(pref).await.unwrap();
        assert!(matches!(
            f.service.queue(payload()).await,
            Err(NotificationError::Policy(PolicyRejection::NotificationsDisabled))
        ));
    }

    #[tokio::test]
    async fn test_retries_exhausted_then_failed_for_good() {
        let failures = (0..4)
            .map(|_| DeliveryResult::failed(ErrorCode::ExternalServiceError, "HTTP 503"))
            .collect();
        let sms = Arc::new(ScriptedSms::new(failures));
        let f = fixture(Tier::Family, Some(sms.clone()));
        f.store.upsert_contact(Contact {
            user_id: "u1".to_string(),
            phone: Some("+41790000000".to_string()),
            ..Default::default()
        });

        let outcome = f
            .service
            .queue(payload().with_channels(vec![Channel::Sms]))
            .await
            .unwrap();
        let id = outcome.id().unwrap().to_string();
        assert_eq!(status_of(&f, &id).await.retry_count, 1);

        // Backoff 60s · 2^n: retries at +120s and +240s, then the final failure
        for _ in 0..3 {
            f.clock.advance_secs(3600);
            f.service.sweep().await.unwrap();
        }
        let msg = status_of(&f, &id).await;
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.retry_count, 3);
        assert_eq!(msg.error_code, Some(ErrorCode::ExternalServiceError));
        assert_eq!(sms.sent(), 4);

        // Terminal: never dispatched again
        f.clock.advance_secs(3600);
        let report = f.service.sweep().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(sms.sent(), 4);
        assert!(matches!(
            f.service.dispatch(&id).await.unwrap(),
            DispatchOutcome::Skipped {
                status: MessageStatus::Failed
            }
        ));
    }

    #[tokio::test]
    async fn test_backoff_holds_message_until_due() {
        let sms = Arc::new(ScriptedSms::new(vec![DeliveryResult::failed(
            ErrorCode::RateLimited,
            "HTTP 429",
        )]));
        let f = fixture(Tier::Family, Some(sms.clone()));
        f.store.upsert_contact(Contact {
            user_id: "u1".to_string(),
            phone: Some("+41790000000".to_string()),
            ..Default::default()
        });
        let id = f
            .service
            .queue(payload().with_channels(vec![Channel::Sms]))
            .await
            .unwrap()
            .id()
            .unwrap()
            .to_string();
        let msg = status_of(&f, &id).await;
        assert_eq!(msg.next_attempt_at, Some(start() + Duration::seconds(60)));

        f.clock.advance_secs(30);
        assert_eq!(f.service.sweep().await.unwrap().attempted, 0);
        f.clock.advance_secs(30);
        assert_eq!(f.service.sweep().await.unwrap().delivered, 1);
        assert_eq!(status_of(&f, &id).await.external_message_id.as_deref(), Some("sms-ok"));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_terminal() {
        let sms = Arc::new(ScriptedSms::new(vec![DeliveryResult::failed(
            ErrorCode::DeliveryFailed,
            "HTTP 422",
        )]));
        let f = fixture(Tier::Family, Some(sms));
        f.store.upsert_contact(Contact {
            user_id: "u1".to_string(),
            phone: Some("+41790000000".to_string()),
            ..Default::default()
        });
        let id = f
            .service
            .queue(payload().with_channels(vec![Channel::Sms]))
            .await
            .unwrap()
            .id()
            .unwrap()
            .to_string();
        let msg = status_of(&f, &id).await;
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.retry_count, 0);
    }

    #[tokio::test]
    async fn test_in_app_disabled_by_user_fails() {
        let f = fixture(Tier::Free, None);
        f.store
            .upsert_preference(NotificationPreference::new("u1").for_channel(Channel::InApp, false))
            .await
            .unwrap();
        let id = f
            .service
            .queue(payload())
            .await
            .unwrap()
            .id()
            .unwrap()
            .to_string();
        let msg = status_of(&f, &id).await;
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.error_code, Some(ErrorCode::UserDisabled));
    }

    #[tokio::test]
    async fn test_mark_as_read_lifecycle() {
        let mut config = DeliveryConfig::default();
        config.dispatch_on_queue = false;
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let service = NotificationService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(StaticTierProvider::default()),
            ChannelRegistry::new(),
            clock.clone(),
            config,
        );

        let id = service
            .queue(payload())
            .await
            .unwrap()
            .id()
            .unwrap()
            .to_string();
        // QUEUED, not yet delivered
        assert!(matches!(
            service.mark_as_read(&id).await,
            Err(NotificationError::Precondition {
                actual: MessageStatus::Queued,
                ..
            })
        ));

        clock.advance_secs(5);
        assert!(matches!(
            service.dispatch(&id).await.unwrap(),
            DispatchOutcome::Delivered {
                channel: Channel::InApp
            }
        ));
        clock.advance_secs(5);
        let read_at = service.mark_as_read(&id).await.unwrap();
        let msg = store.get(&id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Read);
        assert!(Some(read_at) >= msg.delivered_at);

        // Exactly once
        assert!(matches!(
            service.mark_as_read(&id).await,
            Err(NotificationError::Precondition {
                actual: MessageStatus::Read,
                ..
            })
        ));
        assert!(matches!(
            service.mark_as_read("missing").await,
            Err(NotificationError::NotFound(_))
        ));

        let pending = ProactiveMessage::from_payload(payload(), vec![Channel::InApp], clock.now());
        let pending_id = pending.id.clone();
        store.insert(pending).await.unwrap();
        assert!(matches!(
            service.mark_as_read(&pending_id).await,
            Err(NotificationError::Precondition {
                actual: MessageStatus::Pending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_sweep_expires_old_messages() {
        let mut config = DeliveryConfig::default();
        config.dispatch_on_queue = false;
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let service = NotificationService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(StaticTierProvider::default()),
            ChannelRegistry::new(),
            clock.clone(),
            config,
        );
        let id = service
            .queue(payload())
            .await
            .unwrap()
            .id()
            .unwrap()
            .to_string();

        clock.advance_secs(25 * 3600);
        let report = service.sweep().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.attempted, 0);
        assert_eq!(store.get(&id).await.unwrap().unwrap().status, MessageStatus::Expired);
    }

    #[tokio::test]
    async fn test_sweep_promotes_stuck_pending() {
        let f = fixture(Tier::Free, None);
        let msg = ProactiveMessage::from_payload(payload(), vec![Channel::InApp], start());
        let id = msg.id.clone();
        f.store.insert(msg).await.unwrap();

        // Still inside the grace period of an in-flight queue call
        assert_eq!(f.service.sweep().await.unwrap().promoted, 0);

        f.clock.advance_secs(120);
        let report = f.service.sweep().await.unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(status_of(&f, &id).await.status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn test_history_filters_by_status() {
        let f = fixture(Tier::Personal, None);
        for _ in 0..3 {
            f.service.queue(payload()).await.unwrap();
            f.clock.advance_secs(1);
        }
        let delivered = f
            .service
            .get_history(
                "u1",
                &HistoryFilter {
                    statuses: vec![MessageStatus::Delivered],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(delivered.total, 3);
        let read = f
            .service
            .get_history(
                "u1",
                &HistoryFilter {
                    statuses: vec![MessageStatus::Read],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(read.total, 0);
        assert!(!read.has_more);
    }

    #[tokio::test]
    async fn test_send_test_goes_in_app() {
        let f = fixture(Tier::Free, None);
        let outcome = f.service.send_test("u1", "e1", None).await.unwrap();
        let msg = status_of(&f, outcome.id().unwrap()).await;
        assert!(msg.rule_id.is_none());
        assert_eq!(msg.metadata["test"], json!(true));
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(msg.delivery_channel, Some(Channel::InApp));
    }
}
