//! Persistence collaborators
//!
//! The engine only needs a handful of queries: enabled entities and rules,
//! append-only execution logs with a last-triggered lookup, notifications with an
//! atomic check-and-set status transition, and preferences. Each concern is its
//! own trait so a deployment can back them with different stores.

pub mod memory;

use crate::channels::Contact;
use crate::notifications::{
    HistoryFilter, HistoryPage, MessageStatus, NotificationPreference, ProactiveMessage, Transition,
};
use crate::rules::{BehaviorRule, Entity};
use crate::worker::RuleExecutionLog;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;

/// A daily notification limit, over the whole user or one of its entities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCap {
    /// `None` counts every entity of the user
    pub entity_id: Option<String>,
    pub limit: u32,
}

impl DailyCap {
    pub fn user(limit: u32) -> Self {
        Self {
            entity_id: None,
            limit,
        }
    }

    pub fn entity(entity_id: impl Into<String>, limit: u32) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            limit,
        }
    }
}

/// Result of [`MessageStore::insert_capped`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CappedInsert {
    Inserted,
    /// The first cap already reached; nothing was written
    Exceeded { limit: u32, count: u32 },
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn enabled_entities(&self) -> Result<Vec<Entity>>;

    async fn entity(&self, entity_id: &str) -> Result<Option<Entity>>;

    /// Rules of one entity, highest priority first, then by id
    async fn rules_for_entity(
        &self,
        entity_id: &str,
        enabled_only: bool,
    ) -> Result<Vec<BehaviorRule>>;

    async fn upsert_entity(&self, entity: Entity) -> Result<()>;

    /// Rejects rules whose trigger does not validate
    async fn upsert_rule(&self, rule: BehaviorRule) -> Result<()>;
}

#[async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn append(&self, log: RuleExecutionLog) -> Result<()>;

    /// Most recent triggered execution of a rule (cooldown bookkeeping)
    async fn last_triggered_at(&self, rule_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Newest first
    async fn logs_for_rule(&self, rule_id: &str, limit: usize) -> Result<Vec<RuleExecutionLog>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: ProactiveMessage) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<ProactiveMessage>>;

    /// Apply `transition` only if the message is currently in one of `expected`.
    /// `Ok(None)` when the precondition does not hold; an error when the
    /// transition is not a forward lifecycle move.
    async fn transition(
        &self,
        id: &str,
        expected: &[MessageStatus],
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<ProactiveMessage>>;

    /// Insert `message` unless one of `caps` is reached. A cap counts the
    /// message's user (or the cap's entity) in [`MessageStatus::COUNTED`]
    /// created at or after `since`. Counting and inserting is one atomic step,
    /// so concurrent callers never overshoot a cap.
    async fn insert_capped(
        &self,
        message: ProactiveMessage,
        since: DateTime<Utc>,
        caps: &[DailyCap],
    ) -> Result<CappedInsert>;

    /// QUEUED messages due at `now`, highest priority first, then oldest
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ProactiveMessage>>;

    /// Messages in `status` created before `created_before`, oldest first
    async fn list_by_status(
        &self,
        status: MessageStatus,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProactiveMessage>>;

    async fn history(&self, user_id: &str, filter: &HistoryFilter) -> Result<HistoryPage>;
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn preferences_for(&self, user_id: &str) -> Result<Vec<NotificationPreference>>;

    /// Insert or replace the preference with the same (user, entity, channel) scope
    async fn upsert_preference(&self, preference: NotificationPreference) -> Result<()>;
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn contact(&self, user_id: &str) -> Result<Option<Contact>>;
}
