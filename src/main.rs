use anyhow::{Context, Result};
use aura_notify::channels::Channel;
use aura_notify::clock::SystemClock;
use aura_notify::config::{Config, EngineConfig};
use aura_notify::notifications::HistoryFilter;
use aura_notify::store::MemoryStore;
use aura_notify::{scheduler, Engine, MessageStatus, NotificationPayload};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "aura-notify")]
#[command(about = "Rule evaluation and notification delivery engine", long_about = None)]
struct Args {
    /// Verbose output (-v, -vv, -vvv)
    #[arg(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: ~/.aura-notify/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State file (default: ~/.aura-notify/state.json)
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one evaluation pass
    Pass {
        /// Scheduler secret (default: the configured environment variable)
        #[arg(long)]
        secret: Option<String>,
    },
    /// Run one dispatch sweep
    Sweep {
        #[arg(long)]
        secret: Option<String>,
    },
    /// Queue a notification
    Queue {
        #[arg(long)]
        user: String,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        message: String,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Requested channels, most preferred first (e.g. SMS,IN_APP)
        #[arg(long, value_delimiter = ',', default_value = "IN_APP")]
        channels: Vec<Channel>,
    },
    /// Mark a delivered notification as read
    Read { id: String },
    /// Show a user's notification history
    History {
        #[arg(long)]
        user: String,
        #[arg(long)]
        entity: Option<String>,
        #[arg(long, value_delimiter = ',')]
        status: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Queue a test notification
    Test {
        #[arg(long)]
        user: String,
        #[arg(long)]
        entity: String,
        #[arg(long)]
        channel: Option<Channel>,
    },
    /// Run passes and sweeps on the configured cron schedules until Ctrl-C
    Serve,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_statuses(raw: &[String]) -> Result<Vec<MessageStatus>> {
    raw.iter()
        .map(|s| {
            serde_json::from_value(serde_json::Value::String(s.trim().to_uppercase()))
                .with_context(|| format!("Unknown status '{}'", s))
        })
        .collect()
}

async fn run(args: Args) -> Result<()> {
    let config_path = args.config.unwrap_or_else(Config::config_file_path);
    let state_path = args.state.unwrap_or_else(Config::state_file_path);
    let config = EngineConfig::load(&config_path)?;
    info!(
        "aura-notify {} (config {:?}, state {:?})",
        Config::version(),
        config_path,
        state_path
    );

    let store = Arc::new(MemoryStore::load(&state_path)?);
    let configured_secret = config.scheduler.secret();
    let engine = Engine::with_memory_store(
        &config,
        store.clone(),
        Arc::new(SystemClock),
        configured_secret.clone(),
    )?;
    let save = || -> Result<()> { store.save(&state_path) };

    match args.command {
        Command::Pass { secret } => {
            let secret = secret.or(configured_secret).unwrap_or_default();
            let result = engine.run_evaluation_pass(&secret).await?;
            save()?;
            print_json(&result)?;
        }
        Command::Sweep { secret } => {
            let secret = secret.or(configured_secret).unwrap_or_default();
            let report = engine.run_dispatch_sweep(&secret).await?;
            save()?;
            print_json(&report)?;
        }
        Command::Queue {
            user,
            entity,
            message,
            priority,
            channels,
        } => {
            let payload = NotificationPayload::new(user, entity, message)
                .with_priority(priority)
                .with_channels(channels);
            let outcome = engine.queue_notification(payload).await?;
            save()?;
            print_json(&outcome)?;
        }
        Command::Read { id } => {
            let receipt = engine.mark_read(&id).await?;
            save()?;
            print_json(&receipt)?;
        }
        Command::History {
            user,
            entity,
            status,
            limit,
            offset,
        } => {
            let filter = HistoryFilter {
                statuses: parse_statuses(&status)?,
                entity_id: entity,
                limit,
                offset,
                ..Default::default()
            };
            print_json(&engine.get_history(&user, &filter).await?)?;
        }
        Command::Test {
            user,
            entity,
            channel,
        } => {
            let outcome = engine.send_test(&user, &entity, channel).await?;
            save()?;
            print_json(&outcome)?;
        }
        Command::Serve => {
            let secret = configured_secret.context(format!(
                "Set {} to run the scheduler",
                config.scheduler.secret_env
            ))?;
            let persist = || {
                if let Err(e) = save() {
                    error!("Store: failed to save {:?}: {:#}", state_path, e);
                }
            };
            tokio::select! {
                result = scheduler::run(&engine, &config.scheduler, &secret, persist) => result?,
                _ = tokio::signal::ctrl_c() => info!("Scheduler: interrupted, shutting down"),
            }
            save()?;
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set verbosity level (0-3)
    let verbosity = args.verbose.min(3);
    Config::ensure_base_directory().ok();
    aura_notify::init_tracing(verbosity, Some(Config::log_file_path()));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;
    runtime.block_on(run(args))
}
