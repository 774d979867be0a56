//! Core business logic for mailverify.
//!
//! The [`VerificationService`] issues and consumes email verification tokens.
//! Persistence and job delivery sit behind traits so the service never
//! depends on the queue crate.

pub mod services;

pub use services::*;
