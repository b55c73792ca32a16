//! aura-notify Library
//!
//! Rule evaluation and notification delivery engine for companion auras.
//!
//! ## Architecture
//!
//! The codebase is organized into modules:
//! - `rules`: Entities, behavior rules and trigger condition evaluation
//! - `sensors`: Sensor snapshot providers (with per-tier caching)
//! - `tier`: Subscription tier limits
//! - `worker`: The periodic rule evaluation pass (collect, evaluate, log, dispatch)
//! - `notifications`: Queueing policy, delivery lifecycle, retry and history
//! - `channels`: IN_APP and HTTP-backed external channel dispatchers
//! - `store`: Persistence seams and the file-backed memory store
//! - `lock`: Run lock so only one pass runs at a time
//! - `scheduler`: Cron-driven passes and sweeps for the `serve` command
//! - `config`: Configuration management (paths, `config.toml`)
//! - `logging`: Structured logging with tracing
//!
//! ## Main Entry Points
//!
//! - [`Engine::run_evaluation_pass`]: one pass over all enabled entities
//! - [`Engine::run_dispatch_sweep`]: expire, promote and deliver due notifications
//! - [`Engine::queue_notification`]: policy-checked queuing for any caller

pub mod channels;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod logging;
pub mod notifications;
pub mod rules;
pub mod scheduler;
pub mod sensors;
pub mod store;
pub mod tier;
pub mod worker;

pub use engine::{Engine, ReadReceipt};
pub use error::{EngineError, NotificationError, PolicyRejection};
pub use logging::init_tracing;
pub use notifications::{
    HistoryFilter, MessageStatus, NotificationPayload, ProactiveMessage, QueueOutcome,
};
pub use worker::PassResult;
