//! Sensor snapshots
//!
//! The engine never talks to weather, location, fitness or wildlife APIs itself.
//! It asks a [`SnapshotProvider`] for a pre-assembled map of sensor key → value
//! per entity. Absent keys are normal (a disconnected integration) and simply make
//! the conditions that reference them false.

use crate::clock::Clock;
use crate::rules::Entity;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sensor key → value
pub type SensorValues = HashMap<String, Value>;

/// Point-in-time sensor readings for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub id: String,
    pub entity_id: String,
    pub fetched_at: DateTime<Utc>,
    pub values: SensorValues,
}

impl SensorSnapshot {
    pub fn new(
        entity_id: impl Into<String>,
        fetched_at: DateTime<Utc>,
        values: SensorValues,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            fetched_at,
            values,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.fetched_at)
    }
}

/// Source of sensor snapshots
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Snapshot for `entity`. A provider that caches may return a snapshot up to
    /// `max_age` old.
    async fn snapshot(&self, entity: &Entity, max_age: Duration) -> Result<SensorSnapshot>;
}

/// Resolve an IANA timezone name, falling back to UTC.
pub fn parse_timezone(name: Option<&str>) -> Tz {
    match name {
        Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
            warn!("Sensors: unknown timezone '{}', using UTC", name);
            Tz::UTC
        }),
        None => Tz::UTC,
    }
}

/// Add the `clock.*` sensors time conditions key on, computed in `timezone`.
pub fn add_clock_sensors(values: &mut SensorValues, now: DateTime<Utc>, timezone: Option<&str>) {
    let local = now.with_timezone(&parse_timezone(timezone));
    values.insert("clock.hour".to_string(), json!(local.hour()));
    values.insert("clock.minute".to_string(), json!(local.minute()));
    values.insert(
        "clock.weekday".to_string(),
        json!(local.weekday().num_days_from_monday()),
    );
    values.insert("clock.day".to_string(), json!(local.day()));
    values.insert("clock.timestamp".to_string(), json!(now.timestamp()));
}

/// Provider over fixed per-entity readings (used by the CLI state file and tests)
pub struct StaticSnapshotProvider {
    readings: RwLock<HashMap<String, SensorValues>>,
    clock: Arc<dyn Clock>,
    fetches: AtomicUsize,
}

impl StaticSnapshotProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            readings: RwLock::new(HashMap::new()),
            clock,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_readings(clock: Arc<dyn Clock>, readings: HashMap<String, SensorValues>) -> Self {
        Self {
            readings: RwLock::new(readings),
            clock,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, entity_id: impl Into<String>, values: SensorValues) {
        self.readings.write().insert(entity_id.into(), values);
    }

    /// Number of snapshots served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotProvider for StaticSnapshotProvider {
    async fn snapshot(&self, entity: &Entity, _max_age: Duration) -> Result<SensorSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let values = self
            .readings
            .read()
            .get(&entity.id)
            .cloned()
            .unwrap_or_default();
        Ok(SensorSnapshot::new(entity.id.clone(), self.clock.now(), values))
    }
}

/// Reuses snapshots from an inner provider while they are younger than `max_age`
pub struct CachedSnapshotProvider {
    inner: Arc<dyn SnapshotProvider>,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, SensorSnapshot>>,
}

impl CachedSnapshotProvider {
    pub fn new(inner: Arc<dyn SnapshotProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every cached snapshot
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[async_trait]
impl SnapshotProvider for CachedSnapshotProvider {
    async fn snapshot(&self, entity: &Entity, max_age: Duration) -> Result<SensorSnapshot> {
        let now = self.clock.now();
        if let Some(cached) = self.entries.lock().get(&entity.id) {
            if cached.age(now) < max_age {
                debug!(
                    "Sensors: cache hit for entity {} (age {}s)",
                    entity.id,
                    cached.age(now).num_seconds()
                );
                return Ok(cached.clone());
            }
        }

        let fresh = self.inner.snapshot(entity, max_age).await?;
        self.entries.lock().insert(entity.id.clone(), fresh.clone());
        Ok(fresh)
    }
}
