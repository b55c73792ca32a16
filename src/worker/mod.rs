//! Rule evaluator worker
//!
//! One call to [`RuleEvaluatorWorker::run_pass`] is one time-bounded batch job:
//!
//! 1. acquire the run lock (held elsewhere: benign skip)
//! 2. COLLECT enabled entities, ordered by tier priority, in batches
//! 3. per batch: EVALUATE entities concurrently (rules in priority order, one
//!    snapshot per entity), LOG one row per rule, DISPATCH triggered rules to the
//!    notification service as QUEUED messages
//! 4. DONE, or FAILED when collection itself failed
//!
//! The deadline is checked before an entity is started. An entity that was
//! evaluated is always logged and queued, so a rule is either fully handled in
//! a pass or not touched at all. Passes never send: delivery belongs to the
//! dispatch sweep, so a slow channel cannot stretch a pass past its run lock.
//!
//! Every enabled entity is evaluated on every pass. The cooldown is the only
//! per-rule eligibility gate; a tier's evaluation frequency is the cadence the
//! scheduler should run passes at, not a filter inside one.

pub mod compose;
pub mod log_writer;

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::lock::RunLock;
use crate::notifications::{NotificationPayload, NotificationService, QueueOutcome};
use crate::rules::{explain, BehaviorRule, Entity, TriggerEvaluation};
use crate::sensors::{add_clock_sensors, SensorValues, SnapshotProvider};
use crate::store::{ExecutionLogStore, RuleStore};
use crate::tier::{Tier, TierLimits, TierProvider};
use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use compose::{MessageComposer, TemplateComposer};
pub use log_writer::{ExecutionLogWriter, ExecutionOutcome, RuleExecutionLog};

/// Phase of an evaluation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PassState {
    Collect,
    Evaluate,
    Log,
    Dispatch,
    Done,
    Failed,
}

/// Aggregated outcome of one pass. A pass never errors; failures end up here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassResult {
    pub pass_id: String,
    pub success: bool,
    pub state: PassState,
    /// Rules that got an execution log row
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub triggered: usize,
    /// Rules skipped for cooldown
    pub skipped: usize,
    /// Notifications accepted by the notification service
    pub queued: usize,
    /// Entities left for the next pass because the deadline passed
    pub deferred: usize,
    pub lock_skipped: bool,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

/// Mutable state of the running pass
pub struct PassContext {
    pub pass_id: String,
    pub started_at: DateTime<Utc>,
    pub state: PassState,
    deadline: Instant,
    started: Instant,
    result: PassResult,
}

impl PassContext {
    pub fn new(started_at: DateTime<Utc>, timeout: std::time::Duration) -> Self {
        let pass_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        Self {
            result: PassResult {
                pass_id: pass_id.clone(),
                success: true,
                state: PassState::Collect,
                processed: 0,
                succeeded: 0,
                failed: 0,
                triggered: 0,
                skipped: 0,
                queued: 0,
                deferred: 0,
                lock_skipped: false,
                duration_ms: 0,
                errors: Vec::new(),
            },
            pass_id,
            started_at,
            state: PassState::Collect,
            deadline: started + timeout,
            started,
        }
    }

    pub fn past_deadline(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn enter(&mut self, state: PassState) {
        debug!("Worker: pass {} {:?} -> {:?}", self.pass_id, self.state, state);
        self.state = state;
    }

    fn error(&mut self, message: String) {
        warn!("Worker: {}", message);
        self.result.errors.push(message);
    }

    fn fail(&mut self, message: String) {
        error!("Worker: pass {} failed: {}", self.pass_id, message);
        self.result.errors.push(message);
        self.result.success = false;
        self.state = PassState::Failed;
    }

    pub fn finish(mut self) -> PassResult {
        if self.state != PassState::Failed {
            self.state = PassState::Done;
        }
        self.result.state = self.state;
        self.result.duration_ms = self.started.elapsed().as_millis() as u64;
        self.result
    }
}

/// The worker's collaborators
pub struct WorkerDeps {
    pub rules: Arc<dyn RuleStore>,
    pub logs: Arc<dyn ExecutionLogStore>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub tiers: Arc<dyn TierProvider>,
    pub notifications: Arc<NotificationService>,
    pub lock: Arc<dyn RunLock>,
    pub clock: Arc<dyn Clock>,
}

/// Result of evaluating one rule
struct RuleEvaluation {
    rule: BehaviorRule,
    outcome: ExecutionOutcome,
    evaluation: Option<TriggerEvaluation>,
    error: Option<String>,
}

/// Result of evaluating one entity
enum EntityEvaluation {
    Evaluated {
        entity: Entity,
        snapshot_id: Option<String>,
        values: SensorValues,
        rules: Vec<RuleEvaluation>,
    },
    Deferred,
    Failed(String),
}

pub struct RuleEvaluatorWorker {
    rules: Arc<dyn RuleStore>,
    snapshots: Arc<dyn SnapshotProvider>,
    tiers: Arc<dyn TierProvider>,
    notifications: Arc<NotificationService>,
    lock: Arc<dyn RunLock>,
    clock: Arc<dyn Clock>,
    log_writer: ExecutionLogWriter,
    composer: Arc<dyn MessageComposer>,
    config: WorkerConfig,
}

impl RuleEvaluatorWorker {
    pub fn new(deps: WorkerDeps, config: WorkerConfig) -> Self {
        Self {
            rules: deps.rules,
            snapshots: deps.snapshots,
            tiers: deps.tiers,
            notifications: deps.notifications,
            lock: deps.lock,
            clock: deps.clock,
            log_writer: ExecutionLogWriter::new(deps.logs),
            composer: Arc::new(TemplateComposer),
            config,
        }
    }

    pub fn with_composer(mut self, composer: Arc<dyn MessageComposer>) -> Self {
        self.composer = composer;
        self
    }

    /// Run one evaluation pass
    pub async fn run_pass(&self) -> PassResult {
        let mut ctx = PassContext::new(self.clock.now(), self.config.pass_timeout());
        let ttl = Duration::seconds(self.config.lock_ttl_secs as i64);

        let guard = match self.lock.try_acquire(&self.config.job_name, ttl).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("Worker: {} already running, skipping pass", self.config.job_name);
                ctx.result.lock_skipped = true;
                return ctx.finish();
            }
            Err(e) => {
                ctx.fail(format!("run lock unavailable: {}", e));
                return ctx.finish();
            }
        };

        info!("Worker: pass {} started", ctx.pass_id);
        self.run_locked(&mut ctx).await;

        if let Err(e) = self.lock.release(&guard).await {
            warn!("Worker: failed to release run lock (expires on its own): {}", e);
        }

        let result = ctx.finish();
        info!(
            "Worker: pass {} {:?} in {}ms: processed={} triggered={} skipped={} queued={} \
             failed={} deferred={}",
            result.pass_id,
            result.state,
            result.duration_ms,
            result.processed,
            result.triggered,
            result.skipped,
            result.queued,
            result.failed,
            result.deferred
        );
        result
    }

    async fn run_locked(&self, ctx: &mut PassContext) {
        ctx.enter(PassState::Collect);
        let entities = match self.rules.enabled_entities().await {
            Ok(entities) => entities,
            Err(e) => {
                ctx.fail(format!("failed to collect entities: {:#}", e));
                return;
            }
        };

        let mut work: Vec<(Entity, TierLimits)> = Vec::with_capacity(entities.len());
        for entity in entities {
            let limits = match self.tiers.tier_limits(&entity.user_id).await {
                Ok(limits) => limits,
                Err(e) => {
                    ctx.error(format!(
                        "tier lookup for user {} failed, using free tier: {:#}",
                        entity.user_id, e
                    ));
                    TierLimits::for_tier(Tier::Free)
                }
            };
            work.push((entity, limits));
        }
        work.sort_by(|(a, la), (b, lb)| {
            lb.priority
                .cmp(&la.priority)
                .then_with(|| a.id.cmp(&b.id))
        });
        debug!("Worker: {} entities collected", work.len());

        let batch_size = self.config.batch_size.max(1);
        let mut batches = work.chunks(batch_size);
        while let Some(batch) = batches.next() {
            if ctx.past_deadline() {
                let remaining = batch.len() + batches.by_ref().map(|b| b.len()).sum::<usize>();
                info!("Worker: deadline reached, {} entities deferred", remaining);
                ctx.result.deferred += remaining;
                break;
            }
            self.run_batch(ctx, batch).await;
        }
    }

    async fn run_batch(&self, ctx: &mut PassContext, batch: &[(Entity, TierLimits)]) {
        ctx.enter(PassState::Evaluate);
        let now = self.clock.now();
        let deadline = ctx.deadline;
        let evaluations: Vec<EntityEvaluation> = stream::iter(batch.iter())
            .map(|(entity, limits)| async move {
                if Instant::now() >= deadline {
                    return EntityEvaluation::Deferred;
                }
                self.evaluate_entity(entity, limits, now).await
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut evaluated = Vec::new();
        for evaluation in evaluations {
            match evaluation {
                EntityEvaluation::Evaluated {
                    entity,
                    snapshot_id,
                    values,
                    rules,
                } => evaluated.push((entity, snapshot_id, values, rules)),
                EntityEvaluation::Deferred => ctx.result.deferred += 1,
                EntityEvaluation::Failed(message) => {
                    ctx.result.failed += 1;
                    ctx.error(message);
                }
            }
        }

        ctx.enter(PassState::Log);
        let mut to_dispatch = Vec::new();
        for (entity, snapshot_id, values, rules) in evaluated {
            for rule_eval in rules {
                let mut entry = RuleExecutionLog::new(
                    &rule_eval.rule,
                    ctx.pass_id.clone(),
                    now,
                    rule_eval.outcome,
                )
                .with_snapshot(snapshot_id.clone());
                if let Some(evaluation) = &rule_eval.evaluation {
                    entry = entry.with_details(evaluation.summary());
                }
                if let Some(error) = &rule_eval.error {
                    entry = entry.with_error(error.clone());
                }

                let log_id = match self.log_writer.record(entry).await {
                    Ok(id) => id,
                    Err(e) => {
                        // Not logged: not dispatched either, the next pass retries
                        ctx.result.failed += 1;
                        ctx.error(format!("rule {}: {:#}", rule_eval.rule.id, e));
                        continue;
                    }
                };
                ctx.result.processed += 1;

                match rule_eval.outcome {
                    ExecutionOutcome::Error => {
                        ctx.result.failed += 1;
                        let message = rule_eval.error.clone().unwrap_or_default();
                        ctx.error(format!("rule {}: {}", rule_eval.rule.id, message));
                    }
                    ExecutionOutcome::SkippedCooldown => {
                        ctx.result.skipped += 1;
                        ctx.result.succeeded += 1;
                    }
                    ExecutionOutcome::NotTriggered => ctx.result.succeeded += 1,
                    ExecutionOutcome::Triggered => {
                        ctx.result.triggered += 1;
                        if rule_eval.rule.action.notifies() {
                            to_dispatch.push((entity.clone(), values.clone(), rule_eval, log_id));
                        } else {
                            debug!("Worker: rule {} has a log-only action", rule_eval.rule.id);
                            ctx.result.succeeded += 1;
                        }
                    }
                }
            }
        }

        ctx.enter(PassState::Dispatch);
        for (entity, values, rule_eval, log_id) in to_dispatch {
            let payload = self.build_payload(ctx, &entity, &values, &rule_eval, &log_id);
            match self.notifications.enqueue(payload).await {
                Ok(QueueOutcome::Queued { id, .. }) => {
                    debug!("Worker: rule {} queued notification {}", rule_eval.rule.id, id);
                    ctx.result.queued += 1;
                    ctx.result.succeeded += 1;
                }
                Ok(QueueOutcome::Dropped { reason }) => {
                    debug!(
                        "Worker: rule {} notification dropped: {:?}",
                        rule_eval.rule.id, reason
                    );
                    ctx.result.succeeded += 1;
                }
                Err(e) => {
                    ctx.result.failed += 1;
                    ctx.error(format!("rule {}: queue failed: {}", rule_eval.rule.id, e));
                }
            }
        }
    }

    async fn evaluate_entity(
        &self,
        entity: &Entity,
        limits: &TierLimits,
        now: DateTime<Utc>,
    ) -> EntityEvaluation {
        let mut rules = match self.rules.rules_for_entity(&entity.id, true).await {
            Ok(rules) => rules,
            Err(e) => {
                return EntityEvaluation::Failed(format!(
                    "entity {}: failed to load rules: {:#}",
                    entity.id, e
                ))
            }
        };
        if rules.len() > limits.max_rules_per_entity {
            debug!(
                "Worker: entity {} has {} rules, {} tier evaluates {}",
                entity.id,
                rules.len(),
                limits.tier,
                limits.max_rules_per_entity
            );
            rules.truncate(limits.max_rules_per_entity);
        }

        // Cooldown first: a fully cooling-down entity does not need a snapshot
        let mut pending = Vec::with_capacity(rules.len());
        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            match self.log_writer.last_triggered_at(&rule.id).await {
                Ok(last) if rule.in_cooldown(last, now) => results.push(RuleEvaluation {
                    rule,
                    outcome: ExecutionOutcome::SkippedCooldown,
                    evaluation: None,
                    error: None,
                }),
                Ok(_) => pending.push(rule),
                Err(e) => {
                    let error = format!("cooldown lookup failed: {:#}", e);
                    results.push(RuleEvaluation {
                        rule,
                        outcome: ExecutionOutcome::Error,
                        evaluation: None,
                        error: Some(error),
                    })
                }
            }
        }

        let mut snapshot_id = None;
        let mut values = SensorValues::new();
        if !pending.is_empty() {
            let max_age = Duration::seconds(limits.sensor_cache_ttl_secs as i64);
            let fetched = tokio::time::timeout(
                self.config.snapshot_timeout(),
                self.snapshots.snapshot(entity, max_age),
            )
            .await;
            let snapshot = match fetched {
                Ok(Ok(snapshot)) => Ok(snapshot),
                Ok(Err(e)) => Err(format!("snapshot unavailable: {:#}", e)),
                Err(_) => Err(format!(
                    "snapshot timed out after {}s",
                    self.config.snapshot_timeout_secs
                )),
            };
            match snapshot {
                Ok(snapshot) => {
                    snapshot_id = Some(snapshot.id);
                    values = snapshot.values;
                    add_clock_sensors(&mut values, now, entity.timezone.as_deref());
                    for rule in pending {
                        results.push(evaluate_rule(rule, &values));
                    }
                }
                Err(error) => {
                    warn!("Worker: entity {}: {}", entity.id, error);
                    for rule in pending {
                        results.push(RuleEvaluation {
                            rule,
                            outcome: ExecutionOutcome::Error,
                            evaluation: None,
                            error: Some(error.clone()),
                        });
                    }
                }
            }
        }

        // Keep rule priority order in the log
        results.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then_with(|| a.rule.id.cmp(&b.rule.id))
        });
        EntityEvaluation::Evaluated {
            entity: entity.clone(),
            snapshot_id,
            values,
            rules: results,
        }
    }

    fn build_payload(
        &self,
        ctx: &PassContext,
        entity: &Entity,
        values: &SensorValues,
        rule_eval: &RuleEvaluation,
        log_id: &str,
    ) -> NotificationPayload {
        let rule = &rule_eval.rule;
        let mut sensors = Map::new();
        for key in rule.trigger.sensors() {
            if let Some(value) = values.get(key) {
                sensors.insert(key.to_string(), value.clone());
            }
        }
        let checks = rule_eval
            .evaluation
            .as_ref()
            .map(|e| json!(e.checks))
            .unwrap_or(Value::Null);
        let title = rule
            .action
            .parameters
            .get("title")
            .cloned()
            .unwrap_or_else(|| json!(entity.name));

        NotificationPayload::new(
            entity.user_id.clone(),
            entity.id.clone(),
            self.composer.compose(entity, rule, values),
        )
        .with_rule(rule.id.clone())
        .with_priority(rule.priority)
        .with_channels(rule.action.requested_channels())
        .with_trigger_data(json!({ "sensors": sensors, "checks": checks }))
        .with_metadata("execution_log_id", json!(log_id))
        .with_metadata("action", json!(rule.action.kind))
        .with_metadata("pass_id", json!(ctx.pass_id))
        .with_metadata("title", title)
    }
}

fn evaluate_rule(rule: BehaviorRule, values: &SensorValues) -> RuleEvaluation {
    if let Err(e) = rule.validate() {
        return RuleEvaluation {
            rule,
            outcome: ExecutionOutcome::Error,
            evaluation: None,
            error: Some(format!("invalid trigger: {}", e)),
        };
    }
    let evaluation = explain(&rule.trigger, values);
    let outcome = if evaluation.matched {
        ExecutionOutcome::Triggered
    } else {
        ExecutionOutcome::NotTriggered
    };
    RuleEvaluation {
        rule,
        outcome,
        evaluation: Some(evaluation),
        error: None,
    }
}
