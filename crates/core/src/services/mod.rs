//! Business logic services.

#![allow(missing_docs)]

pub mod delivery;
pub mod mailer;
pub mod memory;
pub mod store;
pub mod verification;

pub use delivery::{DeliveryService, RecordingDelivery, VerificationDelivery};
pub use mailer::{LogMailSender, MailSender, SharedMailSender, SmtpMailSender};
pub use memory::{MemoryAccountStore, MemoryTokenStore};
pub use store::{AccountStore, SharedAccountStore, SharedTokenStore, TokenStore};
pub use verification::{AccountRef, IssuedToken, VerificationConfirmation, VerificationService};
