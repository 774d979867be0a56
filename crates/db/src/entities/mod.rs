//! Database entities.

#![allow(missing_docs)]

pub mod account;
pub mod verification_token;

pub use account::Entity as Account;
pub use verification_token::Entity as VerificationToken;
