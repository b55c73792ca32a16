//! Notification lifecycle
//!
//! A notification enters as a [`NotificationPayload`], passes the policy checks in
//! [`policy`], is persisted as a [`ProactiveMessage`] and then moves forward through
//! its lifecycle:
//!
//! ```text
//! PENDING ──> QUEUED ──> DELIVERED ──> READ
//!    │          │ ↺ retry / quiet-hours deferral
//!    │          ├──> FAILED
//!    └──────────┴──> EXPIRED
//! ```
//!
//! Only [`NotificationService`] moves a message between states, always through a
//! [`Transition`] applied by the store with a status precondition.

pub mod policy;
pub mod retry;
pub mod service;

use crate::channels::{Channel, ErrorCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub use policy::{NotificationPreference, QuietHours, ResolvedPreferences};
pub use retry::RetryPolicy;
pub use service::NotificationService;

/// Longest accepted message body (characters)
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Lifecycle status of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Queued,
    Delivered,
    Read,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed | MessageStatus::Expired)
    }

    /// Statuses that count against the daily cap
    pub const COUNTED: [MessageStatus; 4] = [
        MessageStatus::Pending,
        MessageStatus::Queued,
        MessageStatus::Delivered,
        MessageStatus::Read,
    ];

    /// Forward-only lifecycle. QUEUED → QUEUED is a retry or deferral.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Failed)
                | (Pending, Expired)
                | (Queued, Queued)
                | (Queued, Delivered)
                | (Queued, Failed)
                | (Queued, Expired)
                | (Delivered, Read)
        )
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// Request to notify a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub user_id: String,
    pub entity_id: String,
    /// None for test and manual sends
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub priority: i32,
    /// Requested channels, most preferred first
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub trigger_data: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NotificationPayload {
    pub fn new(
        user_id: impl Into<String>,
        entity_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            entity_id: entity_id.into(),
            rule_id: None,
            conversation_id: None,
            message: message.into(),
            priority: 0,
            channels: vec![Channel::InApp],
            trigger_data: Value::Null,
            metadata: Map::new(),
        }
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_trigger_data(mut self, data: Value) -> Self {
        self.trigger_data = data;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.trim().is_empty() {
            return Err("user_id is required".to_string());
        }
        if self.entity_id.trim().is_empty() {
            return Err("entity_id is required".to_string());
        }
        if self.message.trim().is_empty() {
            return Err("message must not be empty".to_string());
        }
        if self.message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(format!("message longer than {} characters", MAX_MESSAGE_CHARS));
        }
        Ok(())
    }
}

/// Persisted notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProactiveMessage {
    pub id: String,
    pub user_id: String,
    pub entity_id: String,
    pub rule_id: Option<String>,
    pub conversation_id: Option<String>,
    pub message: String,
    pub priority: i32,
    /// Channels allowed after policy narrowing, most preferred first
    pub channels: Vec<Channel>,
    pub trigger_data: Value,
    pub metadata: Map<String, Value>,
    pub status: MessageStatus,
    /// Channel actually used for the last attempt
    pub delivery_channel: Option<Channel>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub external_message_id: Option<String>,
    /// Not dispatched before this instant (backoff or quiet hours)
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl ProactiveMessage {
    pub fn from_payload(
        payload: NotificationPayload,
        channels: Vec<Channel>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: payload.user_id,
            entity_id: payload.entity_id,
            rule_id: payload.rule_id,
            conversation_id: payload.conversation_id,
            message: payload.message,
            priority: payload.priority,
            channels,
            trigger_data: payload.trigger_data,
            metadata: payload.metadata,
            status: MessageStatus::Pending,
            delivery_channel: None,
            retry_count: 0,
            error_message: None,
            error_code: None,
            external_message_id: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
            delivered_at: None,
            read_at: None,
        }
    }

    /// Whether the sweep may dispatch this message at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Queued
            && self.next_attempt_at.map(|t| t <= now).unwrap_or(true)
    }
}

/// A forward move in the lifecycle. Each variant keeps the timestamp
/// invariants (delivered_at iff DELIVERED/READ, read_at iff READ).
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// PENDING → QUEUED
    Queue { not_before: DateTime<Utc> },
    /// QUEUED → QUEUED for quiet hours; does not touch retry_count
    Defer { until: DateTime<Utc> },
    /// QUEUED → QUEUED after a retryable failure
    Retry {
        retry_count: u32,
        not_before: DateTime<Utc>,
        channel: Channel,
        error: String,
        code: Option<ErrorCode>,
    },
    Deliver {
        channel: Channel,
        external_id: Option<String>,
        at: DateTime<Utc>,
    },
    Fail {
        channel: Option<Channel>,
        error: String,
        code: Option<ErrorCode>,
    },
    Expire,
    Read { at: DateTime<Utc> },
}

impl Transition {
    pub fn target(&self) -> MessageStatus {
        match self {
            Transition::Queue { .. } | Transition::Defer { .. } | Transition::Retry { .. } => {
                MessageStatus::Queued
            }
            Transition::Deliver { .. } => MessageStatus::Delivered,
            Transition::Fail { .. } => MessageStatus::Failed,
            Transition::Expire => MessageStatus::Expired,
            Transition::Read { .. } => MessageStatus::Read,
        }
    }

    pub fn apply(self, message: &mut ProactiveMessage, now: DateTime<Utc>) {
        message.status = self.target();
        message.updated_at = now;
        match self {
            Transition::Queue { not_before } => {
                message.next_attempt_at = Some(not_before);
            }
            Transition::Defer { until } => {
                message.next_attempt_at = Some(until);
            }
            Transition::Retry {
                retry_count,
                not_before,
                channel,
                error,
                code,
            } => {
                message.retry_count = retry_count;
                message.next_attempt_at = Some(not_before);
                message.delivery_channel = Some(channel);
                message.error_message = Some(error);
                message.error_code = code;
            }
            Transition::Deliver {
                channel,
                external_id,
                at,
            } => {
                message.delivery_channel = Some(channel);
                message.external_message_id = external_id;
                message.delivered_at = Some(at);
                message.next_attempt_at = None;
                message.error_message = None;
                message.error_code = None;
            }
            Transition::Fail {
                channel,
                error,
                code,
            } => {
                if channel.is_some() {
                    message.delivery_channel = channel;
                }
                message.error_message = Some(error);
                message.error_code = code;
                message.next_attempt_at = None;
            }
            Transition::Expire => {
                message.next_attempt_at = None;
                message
                    .error_message
                    .get_or_insert_with(|| "expired before delivery".to_string());
            }
            Transition::Read { at } => {
                message.read_at = Some(at);
            }
        }
    }
}

/// Why `queue` dropped a payload without persisting it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DropReason {
    BelowPriorityThreshold { priority: i32, threshold: i32 },
}

/// Result of `queue`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QueueOutcome {
    Queued {
        id: String,
        /// Set when quiet hours hold the first dispatch back
        deferred_until: Option<DateTime<Utc>>,
    },
    Dropped { reason: DropReason },
}

impl QueueOutcome {
    pub fn id(&self) -> Option<&str> {
        match self {
            QueueOutcome::Queued { id, .. } => Some(id),
            QueueOutcome::Dropped { .. } => None,
        }
    }
}

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered { channel: Channel },
    Retrying { retry_count: u32, next_attempt_at: DateTime<Utc> },
    Failed { code: Option<ErrorCode> },
    Deferred { until: DateTime<Utc> },
    /// Not QUEUED (or not yet due) when checked right before sending
    Skipped { status: MessageStatus },
}

/// Totals of one dispatch sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: usize,
    pub promoted: usize,
    pub attempted: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Filters for `get_history`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryFilter {
    pub statuses: Vec<MessageStatus>,
    pub entity_id: Option<String>,
    pub channel: Option<Channel>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl HistoryFilter {
    pub const DEFAULT_LIMIT: usize = 20;
    pub const MAX_LIMIT: usize = 100;

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn matches(&self, message: &ProactiveMessage) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&message.status) {
            return false;
        }
        if let Some(entity_id) = &self.entity_id {
            if &message.entity_id != entity_id {
                return false;
            }
        }
        if let Some(channel) = self.channel {
            let used = message.delivery_channel == Some(channel);
            if !used && !message.channels.contains(&channel) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if message.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if message.created_at >= until {
                return false;
            }
        }
        true
    }
}

/// One page of history, newest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub notifications: Vec<ProactiveMessage>,
    pub total: usize,
    pub has_more: bool,
}
