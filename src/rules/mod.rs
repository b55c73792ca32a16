//! Behavior rules
//!
//! An entity (a user's companion "aura") owns behavior rules. Each rule pairs a
//! trigger condition tree with an action and optional cooldown.

pub mod condition;

use crate::channels::Channel;
use crate::error::ConditionError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use condition::{evaluate, explain, Condition, Logic, Operator, TriggerEvaluation};

/// Companion entity that owns rules and receives sensor data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// IANA timezone used for `clock.*` sensors
    #[serde(default)]
    pub timezone: Option<String>,
}

fn default_true() -> bool {
    true
}

/// What a rule does when its trigger matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Notify,
    Alert,
    Respond,
    Log,
    Webhook,
    Prompt,
}

impl ActionKind {
    /// Channels requested when the action does not name any.
    /// An empty set means the action is recorded in the execution log only.
    pub fn default_channels(&self) -> Vec<Channel> {
        match self {
            ActionKind::Notify => vec![Channel::InApp, Channel::WebPush],
            ActionKind::Alert => vec![Channel::InApp, Channel::WebPush, Channel::Sms],
            ActionKind::Respond | ActionKind::Prompt | ActionKind::Webhook => {
                vec![Channel::InApp]
            }
            ActionKind::Log => Vec::new(),
        }
    }
}

/// Rule action and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    /// Message template, see `worker::compose`
    #[serde(default)]
    pub message: Option<String>,
    /// Explicit channel preference, overrides the action default
    #[serde(default)]
    pub channels: Option<Vec<Channel>>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl RuleAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            message: None,
            channels: None,
            parameters: serde_json::Map::new(),
        }
    }

    pub fn with_message(mut self, template: impl Into<String>) -> Self {
        self.message = Some(template.into());
        self
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn requested_channels(&self) -> Vec<Channel> {
        match &self.channels {
            Some(channels) if !channels.is_empty() => channels.clone(),
            _ => self.kind.default_channels(),
        }
    }

    /// Whether a match produces a notification
    pub fn notifies(&self) -> bool {
        !self.requested_channels().is_empty()
    }
}

/// Behavior rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorRule {
    pub id: String,
    pub entity_id: String,
    pub name: String,
    pub trigger: Condition,
    pub action: RuleAction,
    /// Higher is evaluated and delivered first
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum seconds between two triggered executions
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BehaviorRule {
    pub fn new(
        id: impl Into<String>,
        entity_id: impl Into<String>,
        name: impl Into<String>,
        trigger: Condition,
        action: RuleAction,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            entity_id: entity_id.into(),
            name: name.into(),
            trigger,
            action,
            priority: 0,
            enabled: true,
            cooldown_secs: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = Some(secs);
        self
    }

    /// Validate before persisting
    pub fn validate(&self) -> Result<(), ConditionError> {
        if self.name.trim().is_empty() {
            return Err(ConditionError::EmptyName);
        }
        self.trigger.validate()
    }

    /// Check if the rule is still cooling down at `now`.
    /// Measured from the last triggered execution, not the last evaluation.
    pub fn in_cooldown(&self, last_triggered: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match (self.cooldown_secs, last_triggered) {
            (Some(cooldown), Some(last)) if cooldown > 0 => {
                now.signed_duration_since(last) < Duration::seconds(cooldown as i64)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn rule() -> BehaviorRule {
        BehaviorRule::new(
            "r1",
            "e1",
            "Dry soil",
            Condition::simple("soil_moisture", Operator::Lt, json!(20)),
            RuleAction::new(ActionKind::Notify),
        )
        .with_cooldown(60)
    }

    #[test]
    fn test_cooldown_boundary() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let r = rule();
        assert!(!r.in_cooldown(None, t0));
        assert!(r.in_cooldown(Some(t0), t0));
        assert!(r.in_cooldown(Some(t0), t0 + Duration::seconds(59)));
        assert!(!r.in_cooldown(Some(t0), t0 + Duration::seconds(60)));
    }

    #[test]
    fn test_no_cooldown_never_blocks() {
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let mut r = rule();
        r.cooldown_secs = None;
        assert!(!r.in_cooldown(Some(t0), t0));
        r.cooldown_secs = Some(0);
        assert!(!r.in_cooldown(Some(t0), t0));
    }

    #[test]
    fn test_action_channels() {
        assert_eq!(
            RuleAction::new(ActionKind::Alert).requested_channels(),
            vec![Channel::InApp, Channel::WebPush, Channel::Sms]
        );
        assert!(!RuleAction::new(ActionKind::Log).notifies());
        let explicit = RuleAction::new(ActionKind::Log).with_channels(vec![Channel::Email]);
        assert_eq!(explicit.requested_channels(), vec![Channel::Email]);
    }

    #[test]
    fn test_rule_validation() {
        assert!(rule().validate().is_ok());
        let mut unnamed = rule();
        unnamed.name = String::new();
        assert_eq!(unnamed.validate(), Err(ConditionError::EmptyName));
    }

    #[test]
    fn test_rule_deserialize_defaults() {
        let raw = json!({
            "id": "r9",
            "entity_id": "e1",
            "name": "Heron spotted",
            "trigger": {
                "type": "simple",
                "sensor": "species",
                "operator": "contains",
                "value": "heron"
            },
            "action": { "type": "alert" },
            "created_at": "2025-06-01T08:00:00Z",
            "updated_at": "2025-06-01T08:00:00Z"
        });
        let r: BehaviorRule = serde_json::from_value(raw).unwrap();
        assert!(r.enabled);
        assert_eq!(r.priority, 0);
        assert_eq!(r.cooldown_secs, None);
        assert_eq!(r.action.kind, ActionKind::Alert);
    }
}
