//! Subscription tier policy table
//!
//! Maps a subscription tier to the limits the engine enforces: which channels may
//! be used, how often an entity's rules are evaluated, how many rules and daily
//! notifications are allowed, and how long sensor snapshots may be reused.
//! Limits are supplied by the billing collaborator and are read-only here.

use crate::channels::Channel;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    #[default]
    Free,
    Personal,
    Family,
    Business,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Free => "free",
            Tier::Personal => "personal",
            Tier::Family => "family",
            Tier::Business => "business",
        };
        f.write_str(name)
    }
}

/// Limits attached to a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    pub tier: Tier,
    /// Cadence the tier is sold with (seconds between passes). Informational:
    /// a pass evaluates every enabled entity, cooldowns gate the rules.
    pub evaluation_frequency_secs: u64,
    pub max_notifications_per_day: u32,
    pub max_rules_per_entity: usize,
    pub allowed_channels: Vec<Channel>,
    /// How long a fetched sensor snapshot may be reused (seconds)
    pub sensor_cache_ttl_secs: u64,
    /// Minimum notification priority when the user set none; `None` lets every
    /// priority through
    #[serde(default)]
    pub priority_threshold: Option<i32>,
    /// Processing order within a pass (higher first)
    pub priority: u8,
}

impl TierLimits {
    /// Static limits for a tier
    pub fn for_tier(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self {
                tier,
                evaluation_frequency_secs: 3600,
                max_notifications_per_day: 10,
                max_rules_per_entity: 3,
                allowed_channels: vec![Channel::InApp],
                sensor_cache_ttl_secs: 1800,
                priority_threshold: None,
                priority: 1,
            },
            Tier::Personal => Self {
                tier,
                evaluation_frequency_secs: 900,
                max_notifications_per_day: 50,
                max_rules_per_entity: 10,
                allowed_channels: vec![Channel::InApp, Channel::WebPush, Channel::Email],
                sensor_cache_ttl_secs: 600,
                priority_threshold: None,
                priority: 2,
            },
            Tier::Family => Self {
                tier,
                evaluation_frequency_secs: 300,
                max_notifications_per_day: 200,
                max_rules_per_entity: 25,
                allowed_channels: vec![
                    Channel::InApp,
                    Channel::WebPush,
                    Channel::Email,
                    Channel::Sms,
                ],
                sensor_cache_ttl_secs: 300,
                priority_threshold: None,
                priority: 3,
            },
            Tier::Business => Self {
                tier,
                evaluation_frequency_secs: 60,
                max_notifications_per_day: 1000,
                max_rules_per_entity: 100,
                allowed_channels: Channel::ALL.to_vec(),
                sensor_cache_ttl_secs: 60,
                priority_threshold: None,
                priority: 4,
            },
        }
    }

    pub fn allows(&self, channel: Channel) -> bool {
        self.allowed_channels.contains(&channel)
    }

    /// Intersection of `requested` with the allowed set, keeping the caller's order
    /// and dropping duplicates.
    pub fn narrow(&self, requested: &[Channel]) -> Vec<Channel> {
        let mut narrowed = Vec::with_capacity(requested.len());
        for channel in requested {
            if self.allows(*channel) && !narrowed.contains(channel) {
                narrowed.push(*channel);
            }
        }
        narrowed
    }
}

/// Source of tier limits (billing collaborator)
#[async_trait]
pub trait TierProvider: Send + Sync {
    async fn tier_limits(&self, user_id: &str) -> Result<TierLimits>;
}

/// Tier provider backed by a fixed user → tier assignment
#[derive(Debug, Clone, Default)]
pub struct StaticTierProvider {
    assignments: HashMap<String, Tier>,
    overrides: HashMap<Tier, TierLimits>,
}

impl StaticTierProvider {
    pub fn new(assignments: HashMap<String, Tier>) -> Self {
        Self {
            assignments,
            overrides: HashMap::new(),
        }
    }

    pub fn assign(&mut self, user_id: impl Into<String>, tier: Tier) {
        self.assignments.insert(user_id.into(), tier);
    }

    /// Replace the static limits of one tier (e.g. for a custom plan)
    pub fn with_limits(mut self, limits: TierLimits) -> Self {
        self.overrides.insert(limits.tier, limits);
        self
    }

    pub fn tier_of(&self, user_id: &str) -> Tier {
        self.assignments.get(user_id).copied().unwrap_or_default()
    }
}

#[async_trait]
impl TierProvider for StaticTierProvider {
    async fn tier_limits(&self, user_id: &str) -> Result<TierLimits> {
        let tier = self.tier_of(user_id);
        Ok(self
            .overrides
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierLimits::for_tier(tier)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_tier_narrows_to_in_app() {
        let limits = TierLimits::for_tier(Tier::Free);
        assert_eq!(
            limits.narrow(&[Channel::Sms, Channel::InApp]),
            vec![Channel::InApp]
        );
        assert!(limits.narrow(&[Channel::Sms, Channel::Email]).is_empty());
    }

    #[test]
    fn test_narrow_keeps_order_and_dedups() {
        let limits = TierLimits::for_tier(Tier::Business);
        assert_eq!(
            limits.narrow(&[Channel::Sms, Channel::InApp, Channel::Sms]),
            vec![Channel::Sms, Channel::InApp]
        );
    }

    #[tokio::test]
    async fn test_static_provider_defaults_to_free() {
        let mut provider = StaticTierProvider::default();
        provider.assign("u-family", Tier::Family);
        let unknown = provider.tier_limits("nobody").await.unwrap();
        assert_eq!(unknown.tier, Tier::Free);
        let family = provider.tier_limits("u-family").await.unwrap();
        assert!(family.allows(Channel::Sms));
    }

    #[tokio::test]
    async fn test_static_provider_override() {
        let mut custom = TierLimits::for_tier(Tier::Free);
        custom.max_notifications_per_day = 2;
        let provider = StaticTierProvider::default().with_limits(custom);
        let limits = provider.tier_limits("anyone").await.unwrap();
        assert_eq!(limits.max_notifications_per_day, 2);
    }
}
