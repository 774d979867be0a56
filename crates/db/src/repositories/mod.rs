//! Database repositories.

mod account;
mod verification_token;

pub use account::AccountRepository;
pub use verification_token::VerificationTokenRepository;
