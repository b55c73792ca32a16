//! Delivery policy: preferences, quiet hours, channel gating and daily caps
//!
//! Everything here is pure; the service fetches tier limits and preferences and
//! asks these helpers for decisions in a fixed order. Daily caps are enforced by
//! the message store, which counts and inserts in one step.

use crate::channels::Channel;
use crate::error::PolicyRejection;
use crate::sensors::parse_timezone;
use crate::store::DailyCap;
use crate::tier::TierLimits;
use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// `HH:MM` (or `HH:MM:SS`) on the wire
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

/// Daily window during which nothing is dispatched. `start > end` wraps
/// midnight (22:00–07:00).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
    /// IANA name; unknown names fall back to UTC
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime, timezone: impl Into<String>) -> Self {
        Self {
            start,
            end,
            timezone: timezone.into(),
        }
    }

    pub fn tz(&self) -> Tz {
        parse_timezone(Some(&self.timezone))
    }

    /// Whether a local wall-clock time falls inside the window
    /// (start inclusive, end exclusive). An empty window never matches.
    pub fn contains(&self, local: NaiveTime) -> bool {
        if self.start == self.end {
            false
        } else if self.start < self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }

    /// If `now` is inside the window, the instant the window ends.
    pub fn deferral(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz = self.tz();
        let local = now.with_timezone(&tz);
        let time = local.time();
        if !self.contains(time) {
            return None;
        }
        let mut end_date = local.date_naive();
        if self.start > self.end && time >= self.start {
            end_date = end_date.succ_opt()?;
        }
        Some(resolve_local(&tz, end_date.and_time(self.end)))
    }
}

/// Local wall-clock time to an instant. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward by the gap.
fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(early, _) => early.with_timezone(&Utc),
        LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
                LocalResult::None => Utc.from_utc_datetime(&naive),
            }
        }
    }
}

/// Start of the local day containing `now`
pub fn local_midnight(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let date = now.with_timezone(&tz).date_naive();
    resolve_local(&tz, date.and_time(NaiveTime::MIN))
}

/// A user's notification preference. `entity_id` None applies to every
/// entity; `channel` Some only toggles that channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub user_id: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    #[serde(default)]
    pub max_per_day: Option<u32>,
    #[serde(default)]
    pub priority_threshold: Option<i32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn enabled_default() -> bool {
    true
}

impl NotificationPreference {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            entity_id: None,
            channel: None,
            enabled: true,
            quiet_hours: None,
            max_per_day: None,
            priority_threshold: None,
            metadata: Map::new(),
        }
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn for_channel(mut self, channel: Channel, enabled: bool) -> Self {
        self.channel = Some(channel);
        self.enabled = enabled;
        self
    }

    pub fn with_quiet_hours(mut self, quiet_hours: QuietHours) -> Self {
        self.quiet_hours = Some(quiet_hours);
        self
    }

    pub fn with_max_per_day(mut self, max: u32) -> Self {
        self.max_per_day = Some(max);
        self
    }

    pub fn with_priority_threshold(mut self, threshold: i32) -> Self {
        self.priority_threshold = Some(threshold);
        self
    }

    /// Same (user, entity, channel) scope
    pub fn same_scope(&self, other: &NotificationPreference) -> bool {
        self.user_id == other.user_id
            && self.entity_id == other.entity_id
            && self.channel == other.channel
    }
}

/// Preferences that apply to one (user, entity) pair
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPreferences {
    pub enabled: bool,
    pub quiet_hours: Option<QuietHours>,
    pub max_per_day: Option<u32>,
    pub priority_threshold: Option<i32>,
    /// Whether `max_per_day` came from an entity-specific preference
    pub entity_scoped_cap: bool,
    pub disabled_channels: HashSet<Channel>,
    /// Timezone for "today": quiet hours timezone when set, else UTC
    pub timezone: Tz,
}

impl Default for ResolvedPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            quiet_hours: None,
            max_per_day: None,
            priority_threshold: None,
            entity_scoped_cap: false,
            disabled_channels: HashSet::new(),
            timezone: Tz::UTC,
        }
    }
}

/// Merge a user's preferences for `entity_id`. Entity-specific values override
/// user-wide ones field by field.
pub fn resolve(preferences: &[NotificationPreference], entity_id: &str) -> ResolvedPreferences {
    let mut resolved = ResolvedPreferences::default();

    let general = preferences
        .iter()
        .filter(|p| p.channel.is_none() && p.entity_id.is_none());
    let specific = preferences
        .iter()
        .filter(|p| p.channel.is_none() && p.entity_id.as_deref() == Some(entity_id));

    for (pref, entity_scoped) in general.map(|p| (p, false)).chain(specific.map(|p| (p, true))) {
        resolved.enabled = pref.enabled;
        if pref.quiet_hours.is_some() {
            resolved.quiet_hours = pref.quiet_hours.clone();
        }
        if let Some(max) = pref.max_per_day {
            resolved.max_per_day = Some(max);
            resolved.entity_scoped_cap = entity_scoped;
        }
        if pref.priority_threshold.is_some() {
            resolved.priority_threshold = pref.priority_threshold;
        }
    }

    for pref in preferences.iter().filter(|p| p.channel.is_some()) {
        let applies = pref.entity_id.is_none() || pref.entity_id.as_deref() == Some(entity_id);
        if let (Some(channel), true) = (pref.channel, applies) {
            if pref.enabled {
                resolved.disabled_channels.remove(&channel);
            } else {
                resolved.disabled_channels.insert(channel);
            }
        }
    }

    if let Some(quiet_hours) = &resolved.quiet_hours {
        resolved.timezone = quiet_hours.tz();
    }
    resolved
}

/// Narrow the requested channels to the tier's allowed set. Nothing left means
/// IN_APP when the tier has it.
pub fn gate_channels(
    requested: &[Channel],
    limits: &TierLimits,
) -> Result<Vec<Channel>, PolicyRejection> {
    let narrowed = limits.narrow(requested);
    if !narrowed.is_empty() {
        return Ok(narrowed);
    }
    if limits.allows(Channel::InApp) {
        Ok(vec![Channel::InApp])
    } else {
        Err(PolicyRejection::ChannelNotAllowed { tier: limits.tier })
    }
}

/// Effective priority threshold: preference first, tier otherwise. `None` when
/// neither sets one, so no priority is dropped.
pub fn priority_threshold(limits: &TierLimits, prefs: &ResolvedPreferences) -> Option<i32> {
    prefs.priority_threshold.or(limits.priority_threshold)
}

/// Daily caps for a notification to `entity_id`: the tier's cap over the whole
/// user, then the preference cap (scoped to the entity when it came from an
/// entity preference).
pub fn daily_caps(
    limits: &TierLimits,
    prefs: &ResolvedPreferences,
    entity_id: &str,
) -> Vec<DailyCap> {
    let mut caps = vec![DailyCap::user(limits.max_notifications_per_day)];
    match prefs.max_per_day {
        Some(max) if prefs.entity_scoped_cap => caps.push(DailyCap::entity(entity_id, max)),
        Some(max) => caps.push(DailyCap::user(max)),
        None => {}
    }
    caps
}
