//! Scheduled maintenance tasks.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use mailverify_common::AppResult;
use mailverify_core::VerificationService;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// Scheduler configuration.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Interval for the expired token sweep. `None` disables it.
    pub token_sweep_interval: Option<Duration>,
}

/// Job executor trait for scheduled jobs.
#[async_trait::async_trait]
pub trait JobExecutor: Send + Sync {
    /// Delete expired verification tokens, returning how many were removed.
    async fn purge_expired_tokens(&self) -> AppResult<u64>;
}

#[async_trait::async_trait]
impl JobExecutor for VerificationService {
    async fn purge_expired_tokens(&self) -> AppResult<u64> {
        self.purge_expired().await
    }
}

/// Start the enabled scheduled tasks. They stop when `shutdown` turns true.
pub fn run_scheduler<E: JobExecutor + 'static>(
    config: SchedulerConfig,
    executor: Arc<E>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if let Some(sweep_interval) = config.token_sweep_interval {
        let mut shutdown = shutdown;
        handles.push(tokio::spawn(async move {
            let mut interval = interval(sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {}
                }
                match executor.purge_expired_tokens().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!(count, "Purged expired verification tokens");
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to purge expired verification tokens");
                    }
                }
            }
        }));
    }

    handles
}
