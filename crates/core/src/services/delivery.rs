//! Verification email delivery.
//!
//! Provides an abstraction for queueing verification emails.
//! The actual implementation is provided by the queue crate.

use async_trait::async_trait;
use mailverify_common::{AppError, AppResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Trait for verification email delivery.
///
/// This allows the verification service to hand off emails
/// without directly depending on the queue implementation.
#[async_trait]
pub trait VerificationDelivery: Send + Sync {
    /// Queue a verification email.
    ///
    /// Returns once the job is durably accepted, not once it is delivered.
    ///
    /// # Arguments
    /// * `to` - Destination email address
    /// * `token` - The token to embed in the verification link
    async fn queue_verification_email(&self, to: &str, token: &str) -> AppResult<()>;
}

/// Delivery that records every queued email in memory.
///
/// Can be switched into a failing mode to simulate an unreachable broker.
#[derive(Clone, Default)]
pub struct RecordingDelivery {
    queued: Arc<Mutex<Vec<(String, String)>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingDelivery {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every `(to, token)` pair queued so far.
    pub async fn queued(&self) -> Vec<(String, String)> {
        self.queued.lock().await.clone()
    }
}

#[async_trait]
impl VerificationDelivery for RecordingDelivery {
    async fn queue_verification_email(&self, to: &str, token: &str) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Queue("broker unavailable".to_string()));
        }
        self.queued
            .lock()
            .await
            .push((to.to_string(), token.to_string()));
        Ok(())
    }
}

/// Type alias for a shared delivery service.
pub type DeliveryService = Arc<dyn VerificationDelivery>;
