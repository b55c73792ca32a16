//! Error taxonomy
//!
//! Collaborator boundaries (store, snapshot provider, tier provider) speak
//! `anyhow::Result`. The errors a caller is expected to branch on are typed here:
//! policy rejections, lifecycle precondition failures, rule validation failures
//! and scheduler authorization.

use crate::notifications::MessageStatus;
use crate::tier::Tier;
use serde::Serialize;

/// Why `queue` refused a notification. Returned to the caller, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PolicyRejection {
    #[error("no requested channel is allowed on the {tier} tier")]
    ChannelNotAllowed { tier: Tier },
    #[error("rate limit reached for today ({count}/{limit})")]
    RateLimited { limit: u32, count: u32 },
    #[error("notifications are disabled by the user")]
    NotificationsDisabled,
}

/// Errors surfaced by the notification service.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("invalid notification: {0}")]
    Invalid(String),
    #[error(transparent)]
    Policy(#[from] PolicyRejection),
    #[error("notification {0} not found")]
    NotFound(String),
    #[error("notification {id} is {actual}, expected {expected}")]
    Precondition {
        id: String,
        expected: MessageStatus,
        actual: MessageStatus,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A trigger or action that is not well-typed enough to persist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("condition has an empty sensor key")]
    EmptySensor,
    #[error("operator {operator} on '{sensor}' needs a numeric value")]
    NonNumericValue { sensor: String, operator: String },
    #[error("'between' on '{sensor}' needs [lo, hi] with lo <= hi")]
    InvalidRange { sensor: String },
    #[error("condition tree deeper than {max} levels")]
    TooDeep { max: usize },
    #[error("rule name must not be empty")]
    EmptyName,
}

/// Errors from the exposed engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("scheduler secret rejected")]
    Unauthorized,
    #[error("scheduler secret is not configured")]
    SecretNotConfigured,
    #[error(transparent)]
    Notification(#[from] NotificationError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
