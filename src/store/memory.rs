//! In-memory store, optionally persisted as one JSON document
//!
//! Implements every store trait behind a single `parking_lot::RwLock`, so a
//! status transition (check + write) happens under one write lock.

use super::{
    CappedInsert, ContactDirectory, DailyCap, ExecutionLogStore, MessageStore, PreferenceStore,
    RuleStore,
};
use crate::channels::Contact;
use crate::notifications::{
    HistoryFilter, HistoryPage, MessageStatus, NotificationPreference, ProactiveMessage, Transition,
};
use crate::rules::{BehaviorRule, Entity};
use crate::sensors::SensorValues;
use crate::tier::{StaticTierProvider, Tier};
use crate::worker::RuleExecutionLog;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// Everything the store holds; also the on-disk format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreState {
    pub entities: BTreeMap<String, Entity>,
    pub rules: BTreeMap<String, BehaviorRule>,
    pub logs: Vec<RuleExecutionLog>,
    pub messages: BTreeMap<String, ProactiveMessage>,
    pub preferences: Vec<NotificationPreference>,
    pub contacts: BTreeMap<String, Contact>,
    /// user id → tier (billing stand-in for the CLI)
    pub tiers: BTreeMap<String, Tier>,
    /// entity id → static sensor readings (sensor stand-in for the CLI)
    pub sensors: BTreeMap<String, SensorValues>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Load from `path`; a missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Store: {:?} not found, starting empty", path);
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {:?}", path))?;
        let state: StoreState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file {:?}", path))?;
        debug!(
            "Store: loaded {} entities, {} rules, {} notifications",
            state.entities.len(),
            state.rules.len(),
            state.messages.len()
        );
        Ok(Self::from_state(state))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(&*self.state.read())
            .context("Failed to serialize store state")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write state file {:?}", path))?;
        Ok(())
    }

    pub fn snapshot(&self) -> StoreState {
        self.state.read().clone()
    }

    pub fn upsert_contact(&self, contact: Contact) {
        self.state.write().contacts.insert(contact.user_id.clone(), contact);
    }

    pub fn assign_tier(&self, user_id: impl Into<String>, tier: Tier) {
        self.state.write().tiers.insert(user_id.into(), tier);
    }

    pub fn set_sensor_readings(&self, entity_id: impl Into<String>, values: SensorValues) {
        self.state.write().sensors.insert(entity_id.into(), values);
    }

    /// Tier provider over the stored tier assignments
    pub fn tier_provider(&self) -> StaticTierProvider {
        let assignments: HashMap<String, Tier> = self
            .state
            .read()
            .tiers
            .iter()
            .map(|(user, tier)| (user.clone(), *tier))
            .collect();
        StaticTierProvider::new(assignments)
    }

    /// Stored static sensor readings, keyed by entity id
    pub fn sensor_readings(&self) -> HashMap<String, SensorValues> {
        self.state
            .read()
            .sensors
            .iter()
            .map(|(id, values)| (id.clone(), values.clone()))
            .collect()
    }
}

fn by_priority_then_id(a: &BehaviorRule, b: &BehaviorRule) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn enabled_entities(&self) -> Result<Vec<Entity>> {
        Ok(self
            .state
            .read()
            .entities
            .values()
            .filter(|e| e.enabled)
            .cloned()
            .collect())
    }

    async fn entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        Ok(self.state.read().entities.get(entity_id).cloned())
    }

    async fn rules_for_entity(
        &self,
        entity_id: &str,
        enabled_only: bool,
    ) -> Result<Vec<BehaviorRule>> {
        let mut rules: Vec<BehaviorRule> = self
            .state
            .read()
            .rules
            .values()
            .filter(|r| r.entity_id == entity_id && (r.enabled || !enabled_only))
            .cloned()
            .collect();
        rules.sort_by(by_priority_then_id);
        Ok(rules)
    }

    async fn upsert_entity(&self, entity: Entity) -> Result<()> {
        if entity.id.trim().is_empty() || entity.user_id.trim().is_empty() {
            bail!("entity needs an id and a user id");
        }
        self.state.write().entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn upsert_rule(&self, rule: BehaviorRule) -> Result<()> {
        rule.validate()
            .with_context(|| format!("Rule {} is not valid", rule.id))?;
        let mut state = self.state.write();
        if !state.entities.contains_key(&rule.entity_id) {
            bail!("Rule {} references unknown entity {}", rule.id, rule.entity_id);
        }
        state.rules.insert(rule.id.clone(), rule);
        Ok(())
    }
}

#[async_trait]
impl ExecutionLogStore for MemoryStore {
    async fn append(&self, log: RuleExecutionLog) -> Result<()> {
        self.state.write().logs.push(log);
        Ok(())
    }

    async fn last_triggered_at(&self, rule_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .read()
            .logs
            .iter()
            .filter(|l| l.rule_id == rule_id && l.triggered)
            .map(|l| l.executed_at)
            .max())
    }

    async fn logs_for_rule(&self, rule_id: &str, limit: usize) -> Result<Vec<RuleExecutionLog>> {
        let state = self.state.read();
        let mut logs: Vec<RuleExecutionLog> = state
            .logs
            .iter()
            .filter(|l| l.rule_id == rule_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        logs.truncate(limit);
        Ok(logs)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, message: ProactiveMessage) -> Result<()> {
        let mut state = self.state.write();
        if state.messages.contains_key(&message.id) {
            bail!("Notification {} already exists", message.id);
        }
        state.messages.insert(message.id.clone(), message);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ProactiveMessage>> {
        Ok(self.state.read().messages.get(id).cloned())
    }

    async fn transition(
        &self,
        id: &str,
        expected: &[MessageStatus],
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Option<ProactiveMessage>> {
        let mut state = self.state.write();
        let message = state
            .messages
            .get_mut(id)
            .ok_or_else(|| anyhow!("Notification {} not found", id))?;
        if !expected.contains(&message.status) {
            return Ok(None);
        }
        let target = transition.target();
        if !message.status.can_transition_to(target) {
            bail!(
                "Notification {}: {} -> {} is not a forward transition",
                id,
                message.status,
                target
            );
        }
        transition.apply(message, now);
        Ok(Some(message.clone()))
    }

    async fn insert_capped(
        &self,
        message: ProactiveMessage,
        since: DateTime<Utc>,
        caps: &[DailyCap],
    ) -> Result<CappedInsert> {
        let mut state = self.state.write();
        if state.messages.contains_key(&message.id) {
            bail!("Notification {} already exists", message.id);
        }
        for cap in caps {
            let count = state
                .messages
                .values()
                .filter(|m| m.user_id == message.user_id)
                .filter(|m| cap.entity_id.as_deref().map_or(true, |e| m.entity_id == e))
                .filter(|m| MessageStatus::COUNTED.contains(&m.status) && m.created_at >= since)
                .count() as u32;
            if count >= cap.limit {
                return Ok(CappedInsert::Exceeded {
                    limit: cap.limit,
                    count,
                });
            }
        }
        state.messages.insert(message.id.clone(), message);
        Ok(CappedInsert::Inserted)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ProactiveMessage>> {
        let mut due: Vec<ProactiveMessage> = self
            .state
            .read()
            .messages
            .values()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn list_by_status(
        &self,
        status: MessageStatus,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProactiveMessage>> {
        let mut messages: Vec<ProactiveMessage> = self
            .state
            .read()
            .messages
            .values()
            .filter(|m| m.status == status && m.created_at < created_before)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn history(&self, user_id: &str, filter: &HistoryFilter) -> Result<HistoryPage> {
        let mut matching: Vec<ProactiveMessage> = self
            .state
            .read()
            .messages
            .values()
            .filter(|m| m.user_id == user_id && filter.matches(m))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        let total = matching.len();
        let notifications: Vec<ProactiveMessage> = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect();
        let has_more = filter.offset + notifications.len() < total;
        Ok(HistoryPage {
            notifications,
            total,
            has_more,
        })
    }
}

#[async_trait]
impl PreferenceStore for MemoryStore {
    async fn preferences_for(&self, user_id: &str) -> Result<Vec<NotificationPreference>> {
        Ok(self
            .state
            .read()
            .preferences
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert_preference(&self, preference: NotificationPreference) -> Result<()> {
        let mut state = self.state.write();
        match state.preferences.iter_mut().find(|p| p.same_scope(&preference)) {
            Some(existing) => *existing = preference,
            None => state.preferences.push(preference),
        }
        Ok(())
    }
}

#[async_trait]
impl ContactDirectory for MemoryStore {
    async fn contact(&self, user_id: &str) -> Result<Option<Contact>> {
        Ok(self.state.read().contacts.get(user_id).cloned())
    }
}
