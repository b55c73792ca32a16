//! Engine facade
//!
//! The operations route handlers and the scheduler call: evaluation passes and
//! dispatch sweeps (secret-protected), queuing, read receipts and history.

use crate::channels::{Channel, ChannelRegistry};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::lock::MemoryRunLock;
use crate::notifications::{
    HistoryFilter, HistoryPage, NotificationPayload, NotificationService, QueueOutcome, SweepReport,
};
use crate::scheduler::verify_secret;
use crate::sensors::{CachedSnapshotProvider, StaticSnapshotProvider};
use crate::store::MemoryStore;
use crate::tier::TierProvider;
use crate::worker::{PassResult, RuleEvaluatorWorker, WorkerDeps};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub read_at: DateTime<Utc>,
}

pub struct Engine {
    notifications: Arc<NotificationService>,
    worker: RuleEvaluatorWorker,
    secret: Option<String>,
}

impl Engine {
    pub fn new(
        notifications: Arc<NotificationService>,
        worker: RuleEvaluatorWorker,
        secret: Option<String>,
    ) -> Self {
        Self {
            notifications,
            worker,
            secret,
        }
    }

    /// Wire an engine over a [`MemoryStore`]: tier assignments and sensor
    /// readings come from the store, channels from the config.
    pub fn with_memory_store(
        config: &EngineConfig,
        store: Arc<MemoryStore>,
        clock: Arc<dyn Clock>,
        secret: Option<String>,
    ) -> Result<Self> {
        let tiers: Arc<dyn TierProvider> = Arc::new(store.tier_provider());
        let channels = ChannelRegistry::from_config(&config.channels)?;
        let notifications = Arc::new(NotificationService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            tiers.clone(),
            channels,
            clock.clone(),
            config.delivery.clone(),
        ));
        let sensors = Arc::new(StaticSnapshotProvider::with_readings(
            clock.clone(),
            store.sensor_readings(),
        ));
        let worker = RuleEvaluatorWorker::new(
            WorkerDeps {
                rules: store.clone(),
                logs: store.clone(),
                snapshots: Arc::new(CachedSnapshotProvider::new(sensors, clock.clone())),
                tiers,
                notifications: notifications.clone(),
                lock: Arc::new(MemoryRunLock::new(clock.clone())),
                clock,
            },
            config.worker.clone(),
        );
        Ok(Self::new(notifications, worker, secret))
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    /// Run one evaluation pass for a caller presenting the shared secret
    pub async fn run_evaluation_pass(&self, secret: &str) -> Result<PassResult, EngineError> {
        verify_secret(self.secret.as_deref(), secret)?;
        Ok(self.worker.run_pass().await)
    }

    /// Run one dispatch sweep for a caller presenting the shared secret
    pub async fn run_dispatch_sweep(&self, secret: &str) -> Result<SweepReport, EngineError> {
        verify_secret(self.secret.as_deref(), secret)?;
        Ok(self.notifications.sweep().await?)
    }

    pub async fn queue_notification(
        &self,
        payload: NotificationPayload,
    ) -> Result<QueueOutcome, EngineError> {
        Ok(self.notifications.queue(payload).await?)
    }

    pub async fn mark_read(&self, id: &str) -> Result<ReadReceipt, EngineError> {
        let read_at = self.notifications.mark_as_read(id).await?;
        Ok(ReadReceipt { read_at })
    }

    pub async fn get_history(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
    ) -> Result<HistoryPage, EngineError> {
        Ok(self.notifications.get_history(user_id, filter).await?)
    }

    pub async fn send_test(
        &self,
        user_id: &str,
        entity_id: &str,
        channel: Option<Channel>,
    ) -> Result<QueueOutcome, EngineError> {
        Ok(self.notifications.send_test(user_id, entity_id, channel).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{NotificationError, PolicyRejection};
    use crate::notifications::MessageStatus;
    use crate::rules::{ActionKind, BehaviorRule, Condition, Entity, Operator, RuleAction};
    use crate::sensors::SensorValues;
    use crate::store::RuleStore;
    use crate::tier::Tier;
    use chrono::TimeZone;
    use serde_json::json;

    async fn engine() -> (Engine, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        store.assign_tier("u1", Tier::Personal);
        store.set_sensor_readings(
            "e1",
            SensorValues::from([("soil_moisture".to_string(), json!(15))]),
        );
        store
            .upsert_entity(Entity {
                id: "e1".to_string(),
                user_id: "u1".to_string(),
                name: "Fern".to_string(),
                enabled: true,
                timezone: Some("Europe/Zurich".to_string()),
            })
            .await
            .unwrap();
        store
            .upsert_rule(
                BehaviorRule::new(
                    "r1",
                    "e1",
                    "Dry soil",
                    Condition::simple("soil_moisture", Operator::Lt, json!(20)),
                    RuleAction::new(ActionKind::Notify),
                )
                .with_cooldown(3600),
            )
            .await
            .unwrap();

        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let engine = Engine::with_memory_store(
            &EngineConfig::default(),
            store.clone(),
            clock.clone(),
            Some("s3cret".to_string()),
        )
        .unwrap();
        (engine, store, clock)
    }

    #[tokio::test]
    async fn test_pass_requires_secret() {
        let (engine, store, _clock) = engine().await;
        assert!(matches!(
            engine.run_evaluation_pass("nope").await,
            Err(EngineError::Unauthorized)
        ));
        assert!(store.snapshot().logs.is_empty());

        let result = engine.run_evaluation_pass("s3cret").await.unwrap();
        assert_eq!(result.triggered, 1);
        assert_eq!(result.queued, 1);
    }

    #[tokio::test]
    async fn test_end_to_end_read_receipt_and_history() {
        let (engine, _store, clock) = engine().await;
        engine.run_evaluation_pass("s3cret").await.unwrap();

        let page = engine.get_history("u1", &HistoryFilter::default()).await.unwrap();
        assert_eq!(page.total, 1);
        let id = page.notifications[0].id.clone();
        assert_eq!(page.notifications[0].status, MessageStatus::Queued);
        // Not delivered until the sweep runs
        assert!(matches!(
            engine.mark_read(&id).await,
            Err(EngineError::Notification(NotificationError::Precondition { .. }))
        ));

        let report = engine.run_dispatch_sweep("s3cret").await.unwrap();
        assert_eq!(report.delivered, 1);
        clock.advance_secs(30);
        let receipt = engine.mark_read(&id).await.unwrap();
        assert_eq!(receipt.read_at, Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 30).unwrap());
        assert_eq!(
            serde_json::to_value(receipt).unwrap()["readAt"],
            json!("2025-06-01T12:00:30Z")
        );
        assert!(engine.mark_read(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_queue_rejection_is_typed() {
        let (engine, _store, _clock) = engine().await;
        let cap = crate::tier::TierLimits::for_tier(Tier::Personal).max_notifications_per_day;
        for _ in 0..cap {
            engine
                .queue_notification(NotificationPayload::new("u1", "e1", "ping"))
                .await
                .unwrap();
        }
        let err = engine
            .queue_notification(NotificationPayload::new("u1", "e1", "ping"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Notification(NotificationError::Policy(
                PolicyRejection::RateLimited { .. }
            ))
        ));
        assert!(err.to_string().starts_with("rate limit reached for today"));
    }

    #[tokio::test]
    async fn test_sweep_requires_secret_and_send_test() {
        let (engine, _store, _clock) = engine().await;
        assert!(engine.run_dispatch_sweep("wrong").await.is_err());
        let outcome = engine.send_test("u1", "e1", Some(Channel::Email)).await.unwrap();
        assert!(outcome.id().is_some());
        let report = engine.run_dispatch_sweep("s3cret").await.unwrap();
        assert_eq!(report.attempted, 0);
    }
}
