//! mailverify worker entry point.
//!
//! Consumes delivery jobs from the broker and sends the verification emails.
//! Exits non-zero when the broker is unconfigured or unreachable, when the
//! consume loop fails, or when in-flight work outlives the shutdown grace.

use std::sync::Arc;

use mailverify_common::WorkerSettings;
use mailverify_core::mailer;
use mailverify_queue::{
    RedisQueue, RetryPolicy, SharedQueue, VerificationEmailWorker, shutdown_signal, supervise,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailverify=debug".into()),
        )
        .init();

    info!("Starting mailverify worker...");

    let config = WorkerSettings::load()?;

    let queue: SharedQueue = match RedisQueue::connect(&config.queue).await {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            error!(error = %e, "Cannot connect to the broker");
            std::process::exit(1);
        }
    };

    let mailer = mailer::from_config(&config.mail)?;

    let worker = VerificationEmailWorker::new(queue, mailer)
        .with_retry_policy(RetryPolicy {
            max_attempts: config.queue.max_attempts,
        })
        .with_send_timeout(config.mail.send_timeout());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let outcome = supervise(
        async move { worker.run(shutdown_rx).await },
        shutdown_signal(),
        shutdown_tx,
        config.worker.shutdown_grace(),
    )
    .await;

    info!(?outcome, "Worker stopped");
    let code = outcome.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
