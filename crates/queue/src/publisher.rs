//! Job publisher.
//!
//! Implements the core's `VerificationDelivery` by appending a
//! [`DeliveryJob`] to the durable queue.

use async_trait::async_trait;
use mailverify_common::config::QueueConfig;
use mailverify_common::{AppError, AppResult, redact_token};
use mailverify_core::VerificationDelivery;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::backend::{QueueBackend, SharedQueue};
use crate::jobs::DeliveryJob;
use crate::redis_queue::RedisQueue;

/// Publishes delivery jobs to the queue.
///
/// The broker connection is opened on first use and kept for the lifetime of
/// the publisher; the queue is declared once. When either step fails the
/// next publish tries again, so an unconfigured or unreachable broker fails
/// each call instead of the process.
pub struct JobPublisher {
    config: QueueConfig,
    backend: OnceCell<SharedQueue>,
    declared: OnceCell<()>,
}

impl JobPublisher {
    /// Create a publisher for the configured Redis broker.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            backend: OnceCell::new(),
            declared: OnceCell::new(),
        }
    }

    /// Create a publisher over an existing backend.
    #[must_use]
    pub fn with_backend(backend: SharedQueue) -> Self {
        Self {
            config: QueueConfig::default(),
            backend: OnceCell::from(backend),
            declared: OnceCell::new(),
        }
    }

    async fn backend(&self) -> AppResult<&SharedQueue> {
        let backend = self
            .backend
            .get_or_try_init(|| async {
                let queue = RedisQueue::connect(&self.config).await?;
                Ok::<_, AppError>(Arc::new(queue) as SharedQueue)
            })
            .await?;

        self.declared
            .get_or_try_init(|| backend.declare())
            .await?;

        Ok(backend)
    }

    /// Durably enqueue a job.
    pub async fn publish(&self, job: &DeliveryJob) -> AppResult<()> {
        let body = job
            .encode()
            .map_err(|e| AppError::Internal(format!("Failed to encode job: {e}")))?;

        self.backend().await?.publish(&body).await?;

        debug!(to = %job.to, token = %redact_token(&job.token), "Queued verification email");
        Ok(())
    }
}

#[async_trait]
impl VerificationDelivery for JobPublisher {
    async fn queue_verification_email(&self, to: &str, token: &str) -> AppResult<()> {
        self.publish(&DeliveryJob::new(to, token)).await
    }
}
