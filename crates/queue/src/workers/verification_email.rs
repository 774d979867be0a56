//! Verification email worker.

use mailverify_common::{AppError, AppResult, redact_token};
use mailverify_core::SharedMailSender;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backend::{Delivery, SharedQueue};
use crate::jobs::DeliveryJob;
use crate::retry::RetryPolicy;

/// How a message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Email sent, message acknowledged.
    Sent,
    /// Send failed, message put back on the queue.
    Requeued,
    /// Body was not a valid job, message dropped.
    Discarded,
    /// Send failed on the last allowed attempt, message dead-lettered.
    DeadLettered,
}

/// Consumes delivery jobs one at a time and sends the emails.
#[derive(Clone)]
pub struct VerificationEmailWorker {
    queue: SharedQueue,
    mailer: SharedMailSender,
    retry: RetryPolicy,
    send_timeout: Option<Duration>,
    error_backoff: Duration,
}

impl VerificationEmailWorker {
    /// Create a new worker.
    #[must_use]
    pub fn new(queue: SharedQueue, mailer: SharedMailSender) -> Self {
        Self {
            queue,
            mailer,
            retry: RetryPolicy::unbounded(),
            send_timeout: None,
            error_backoff: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Give up on a send after `timeout`; the attempt counts as failed.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Pause after a broker error before receiving again.
    #[must_use]
    pub const fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Run until `shutdown` turns true.
    ///
    /// The flag is only observed between messages: a message that has been
    /// received is always processed and settled before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        self.queue.declare().await?;
        info!("Verification email worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = self.queue.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.process(delivery).await {
                        error!(error = %e, "Failed to settle message");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Failed to receive from queue");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        info!("Verification email worker stopped");
        Ok(())
    }

    /// Process and settle one message.
    ///
    /// Errors are settlement failures only; the message then stays unsettled
    /// and the broker delivers it again later.
    pub async fn process(&self, delivery: Delivery) -> AppResult<Outcome> {
        let job = match DeliveryJob::decode(&delivery.body) {
            Ok(job) => job,
            Err(e) => {
                warn!(id = %delivery.id, error = %e, "Discarding malformed job");
                self.queue.nack(&delivery, false).await?;
                return Ok(Outcome::Discarded);
            }
        };

        info!(
            id = %delivery.id,
            to = %job.to,
            token = %redact_token(&job.token),
            attempt = delivery.attempt,
            "Sending verification email"
        );

        match self.send(&job).await {
            Ok(()) => {
                self.queue.ack(&delivery).await?;
                info!(id = %delivery.id, to = %job.to, "Verification email sent");
                Ok(Outcome::Sent)
            }
            Err(e) if self.retry.should_retry(delivery.attempt) => {
                warn!(
                    id = %delivery.id,
                    to = %job.to,
                    attempt = delivery.attempt,
                    error = %e,
                    "Verification email failed, requeueing"
                );
                self.queue.nack(&delivery, true).await?;
                Ok(Outcome::Requeued)
            }
            Err(e) => {
                error!(
                    id = %delivery.id,
                    to = %job.to,
                    attempt = delivery.attempt,
                    error = %e,
                    "Verification email failed permanently, dead-lettering"
                );
                self.queue.dead_letter(&delivery, &e.to_string()).await?;
                Ok(Outcome::DeadLettered)
            }
        }
    }

    async fn send(&self, job: &DeliveryJob) -> AppResult<()> {
        let send = self.mailer.send(&job.to, &job.token);
        match self.send_timeout {
            Some(timeout) => tokio::time::timeout(timeout, send)
                .await
                .map_err(|_| AppError::Mail(format!("send timed out after {timeout:?}")))?,
            None => send.await,
        }
    }
}
