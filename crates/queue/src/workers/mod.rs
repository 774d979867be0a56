//! Job workers.

mod verification_email;

pub use verification_email::{Outcome, VerificationEmailWorker};
