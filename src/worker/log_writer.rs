//! Rule execution log
//!
//! One append-only row per rule per pass, triggered or not. Rows are the audit
//! trail and the source of cooldown bookkeeping.

use crate::rules::BehaviorRule;
use crate::store::ExecutionLogStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Triggered,
    NotTriggered,
    SkippedCooldown,
    Error,
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionOutcome::Triggered => "triggered",
            ExecutionOutcome::NotTriggered => "not triggered",
            ExecutionOutcome::SkippedCooldown => "skipped: cooldown",
            ExecutionOutcome::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExecutionLog {
    pub id: String,
    pub rule_id: String,
    pub entity_id: String,
    pub pass_id: String,
    pub executed_at: DateTime<Utc>,
    pub triggered: bool,
    pub outcome: ExecutionOutcome,
    /// Snapshot the trigger was evaluated against
    #[serde(default)]
    pub snapshot_id: Option<String>,
    /// Human-readable trace of the checks
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RuleExecutionLog {
    pub fn new(
        rule: &BehaviorRule,
        pass_id: impl Into<String>,
        executed_at: DateTime<Utc>,
        outcome: ExecutionOutcome,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            entity_id: rule.entity_id.clone(),
            pass_id: pass_id.into(),
            executed_at,
            triggered: outcome == ExecutionOutcome::Triggered,
            outcome,
            snapshot_id: None,
            details: None,
            error: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot_id: Option<String>) -> Self {
        self.snapshot_id = snapshot_id;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

pub struct ExecutionLogWriter {
    store: Arc<dyn ExecutionLogStore>,
}

impl ExecutionLogWriter {
    pub fn new(store: Arc<dyn ExecutionLogStore>) -> Self {
        Self { store }
    }

    /// Append one row and return its id
    pub async fn record(&self, entry: RuleExecutionLog) -> Result<String> {
        let id = entry.id.clone();
        trace!(
            "Worker: log {} rule={} outcome={}",
            id,
            entry.rule_id,
            entry.outcome
        );
        let rule_id = entry.rule_id.clone();
        self.store
            .append(entry)
            .await
            .with_context(|| format!("Failed to write execution log for rule {}", rule_id))?;
        Ok(id)
    }

    pub async fn last_triggered_at(&self, rule_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.store.last_triggered_at(rule_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ActionKind, Condition, Operator, RuleAction};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn rule() -> BehaviorRule {
        BehaviorRule::new(
            "r1",
            "e1",
            "Dry soil",
            Condition::simple("soil_moisture", Operator::Lt, json!(20)),
            RuleAction::new(ActionKind::Notify),
        )
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(ExecutionOutcome::SkippedCooldown.to_string(), "skipped: cooldown");
        assert_eq!(
            serde_json::to_value(ExecutionOutcome::NotTriggered).unwrap(),
            json!("not_triggered")
        );
    }

    #[tokio::test]
    async fn test_only_triggered_rows_count_for_cooldown() {
        let store = Arc::new(MemoryStore::new());
        let writer = ExecutionLogWriter::new(store.clone());
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);

        writer
            .record(RuleExecutionLog::new(&rule(), "p1", t0, ExecutionOutcome::Triggered))
            .await
            .unwrap();
        writer
            .record(RuleExecutionLog::new(&rule(), "p2", t1, ExecutionOutcome::SkippedCooldown))
            .await
            .unwrap();

        assert_eq!(writer.last_triggered_at("r1").await.unwrap(), Some(t0));
        assert_eq!(store.logs_for_rule("r1", 10).await.unwrap()[0].pass_id, "p2");
    }
}
