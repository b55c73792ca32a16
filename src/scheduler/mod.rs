//! Scheduler: runs evaluation passes and dispatch sweeps on cron schedules.
//!
//! Stands in for the external scheduler when the engine runs as a daemon
//! (`aura-notify serve`). It authenticates with the same shared secret an
//! external caller would use, sleeps until the next due job, runs it, and calls
//! `after_run` (the CLI persists the store there).

use crate::config::SchedulerConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Max sleep between checks, so a clock jump is noticed (seconds).
const MAX_SLEEP_SECS: u64 = 60;

/// Compare a presented secret with the configured one by SHA-256 digest.
pub fn verify_secret(configured: Option<&str>, presented: &str) -> Result<(), EngineError> {
    let configured = configured
        .filter(|s| !s.is_empty())
        .ok_or(EngineError::SecretNotConfigured)?;
    let expected = Sha256::digest(configured.as_bytes());
    let actual = Sha256::digest(presented.as_bytes());
    if expected == actual {
        Ok(())
    } else {
        warn!("Scheduler: rejected request with a wrong secret");
        Err(EngineError::Unauthorized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    EvaluationPass,
    DispatchSweep,
}

#[derive(Debug, Clone)]
pub struct Jobs {
    pass: Schedule,
    sweep: Schedule,
}

impl Jobs {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        let pass = Schedule::from_str(&config.pass_cron)
            .with_context(|| format!("Invalid pass cron {:?}", config.pass_cron))?;
        let sweep = Schedule::from_str(&config.sweep_cron)
            .with_context(|| format!("Invalid sweep cron {:?}", config.sweep_cron))?;
        Ok(Self { pass, sweep })
    }

    /// The jobs due at the next instant strictly after `after`. When both
    /// schedules fire together the pass comes first, then the sweep that
    /// delivers what it queued.
    pub fn next(&self, after: DateTime<Utc>) -> Option<(DateTime<Utc>, Vec<Job>)> {
        let pass = self.pass.after(&after).next();
        let sweep = self.sweep.after(&after).next();
        let at = match (pass, sweep) {
            (Some(p), Some(s)) => p.min(s),
            (p, s) => p.or(s)?,
        };
        let due = [(pass, Job::EvaluationPass), (sweep, Job::DispatchSweep)]
            .into_iter()
            .filter(|(t, _)| *t == Some(at))
            .map(|(_, job)| job)
            .collect();
        Some((at, due))
    }
}

async fn run_job(engine: &Engine, job: Job, secret: &str) {
    match job {
        Job::EvaluationPass => match engine.run_evaluation_pass(secret).await {
            Ok(result) if result.lock_skipped => debug!("Scheduler: pass skipped, lock held"),
            Ok(result) => info!(
                "Scheduler: pass {} processed={} failed={} in {}ms",
                result.pass_id, result.processed, result.failed, result.duration_ms
            ),
            Err(e) => error!("Scheduler: pass rejected: {}", e),
        },
        Job::DispatchSweep => match engine.run_dispatch_sweep(secret).await {
            Ok(report) => debug!(
                "Scheduler: sweep attempted={} delivered={}",
                report.attempted, report.delivered
            ),
            Err(e) => error!("Scheduler: sweep failed: {}", e),
        },
    }
}

/// Run forever. Returns only if the schedules never fire again.
pub async fn run<F>(
    engine: &Engine,
    config: &SchedulerConfig,
    secret: &str,
    after_run: F,
) -> Result<()>
where
    F: Fn(),
{
    let jobs = Jobs::from_config(config)?;
    info!(
        "Scheduler: passes at {:?}, sweeps at {:?}",
        config.pass_cron, config.sweep_cron
    );

    loop {
        let now = Utc::now();
        let Some((next_time, due)) = jobs.next(now) else {
            warn!("Scheduler: no upcoming runs, stopping");
            return Ok(());
        };
        debug!("Scheduler: next {:?} at {}", due, next_time.format("%Y-%m-%d %H:%M:%S"));

        // Millisecond precision so we don't spin when the next run is < 1 second away
        let wait_ms = (next_time - now).num_milliseconds().max(0) as u64;
        tokio::time::sleep(Duration::from_millis(wait_ms.min(MAX_SLEEP_SECS * 1000))).await;

        if Utc::now() >= next_time {
            for job in due {
                run_job(engine, job, secret).await;
            }
            after_run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_verify_secret() {
        assert!(verify_secret(Some("s3cret"), "s3cret").is_ok());
        assert!(matches!(
            verify_secret(Some("s3cret"), "guess"),
            Err(EngineError::Unauthorized)
        ));
        assert!(matches!(
            verify_secret(None, "s3cret"),
            Err(EngineError::SecretNotConfigured)
        ));
        assert!(matches!(
            verify_secret(Some(""), ""),
            Err(EngineError::SecretNotConfigured)
        ));
    }

    #[test]
    fn test_next_job_alternates() {
        let jobs = Jobs::from_config(&SchedulerConfig::default()).unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 10).unwrap();

        let (t1, jobs1) = jobs.next(t0).unwrap();
        assert_eq!(jobs1, vec![Job::DispatchSweep]);
        assert_eq!(t1, Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 30).unwrap());

        let (t2, jobs2) = jobs.next(t1).unwrap();
        assert_eq!(jobs2, vec![Job::EvaluationPass]);
        assert_eq!(t2, Utc.with_ymd_and_hms(2025, 6, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn test_same_instant_runs_pass_then_sweep() {
        let config = SchedulerConfig {
            pass_cron: "0 * * * * *".to_string(),
            sweep_cron: "0,30 * * * * *".to_string(),
            ..Default::default()
        };
        let jobs = Jobs::from_config(&config).unwrap();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 10).unwrap();

        let (t1, jobs1) = jobs.next(t0).unwrap();
        assert_eq!(t1, Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 30).unwrap());
        assert_eq!(jobs1, vec![Job::DispatchSweep]);

        let (t2, jobs2) = jobs.next(t1).unwrap();
        assert_eq!(t2, Utc.with_ymd_and_hms(2025, 6, 1, 12, 1, 0).unwrap());
        assert_eq!(jobs2, vec![Job::EvaluationPass, Job::DispatchSweep]);
    }

    #[test]
    fn test_invalid_cron_rejected() {
        let config = SchedulerConfig {
            pass_cron: "every minute".to_string(),
            ..Default::default()
        };
        assert!(Jobs::from_config(&config).is_err());
    }
}
