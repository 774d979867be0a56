//! Verification email delivery job.

use lettre::message::Mailbox;
use serde::{Deserialize, Serialize};

/// Job to send one verification email.
///
/// Serialized as a JSON object with exactly these two fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryJob {
    /// Destination address.
    pub to: String,

    /// Token embedded in the verification link.
    pub token: String,
}

/// Why a message body is not a valid job.
#[derive(Debug, thiserror::Error)]
pub enum JobDecodeError {
    #[error("invalid job JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("job field `{0}` is empty")]
    EmptyField(&'static str),

    #[error("job recipient `{0}` is not a mailbox")]
    InvalidRecipient(String),
}

impl DeliveryJob {
    /// Create a new delivery job.
    #[must_use]
    pub fn new(to: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            token: token.into(),
        }
    }

    /// Serialize to the wire body.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a wire body.
    pub fn decode(body: &[u8]) -> Result<Self, JobDecodeError> {
        let job: Self = serde_json::from_slice(body)?;

        if job.to.trim().is_empty() {
            return Err(JobDecodeError::EmptyField("to"));
        }
        if job.token.trim().is_empty() {
            return Err(JobDecodeError::EmptyField("token"));
        }
        if job.to.parse::<Mailbox>().is_err() {
            return Err(JobDecodeError::InvalidRecipient(job.to));
        }

        Ok(job)
    }
}
