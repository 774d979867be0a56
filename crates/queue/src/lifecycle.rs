//! Process lifecycle: signal handling and bounded shutdown.

use mailverify_common::{AppError, AppResult};
use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How a supervised task ended.
#[derive(Debug)]
pub enum ShutdownOutcome {
    /// The task returned before any shutdown was requested.
    Exited(AppResult<()>),
    /// The task drained within the grace period.
    Graceful,
    /// The grace period ran out; the task was abandoned.
    TimedOut,
}

impl ShutdownOutcome {
    /// Process exit code for this outcome.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(Ok(())) | Self::Graceful => 0,
            Self::Exited(Err(_)) | Self::TimedOut => 1,
        }
    }
}

/// Resolve on SIGINT or SIGTERM (Ctrl+C only on non-Unix).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

/// Run `task` until `signal` resolves, then flip `shutdown` and give the
/// task `grace` to finish.
///
/// A task still running at the deadline is aborted: whatever it was doing is
/// dropped without being settled.
pub async fn supervise<T, S>(
    task: T,
    signal: S,
    shutdown: watch::Sender<bool>,
    grace: Duration,
) -> ShutdownOutcome
where
    T: Future<Output = AppResult<()>> + Send + 'static,
    S: Future<Output = ()>,
{
    let mut handle = tokio::spawn(task);

    tokio::select! {
        joined = &mut handle => {
            return ShutdownOutcome::Exited(
                joined.unwrap_or_else(|e| Err(AppError::Internal(format!("task panicked: {e}")))),
            );
        }
        () = signal => {}
    }

    let _ = shutdown.send(true);
    info!(grace_secs = grace.as_secs_f64(), "Waiting for in-flight work");

    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(Ok(()))) => ShutdownOutcome::Graceful,
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "Task failed while shutting down");
            ShutdownOutcome::Graceful
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Task panicked while shutting down");
            ShutdownOutcome::Graceful
        }
        Err(_) => {
            handle.abort();
            error!("Grace period elapsed, abandoning in-flight work");
            ShutdownOutcome::TimedOut
        }
    }
}
