//! Common utilities and shared types for mailverify.
//!
//! This crate provides foundational components used across all mailverify crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: ULID identifiers and verification tokens via [`IdGenerator`]
//!
//! # Example
//!
//! ```no_run
//! use mailverify_common::{Config, IdGenerator, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     let token = id_gen.generate_token();
//!     println!("{} issues tokens like {}", config.server.url, token);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;

pub use config::{Config, WorkerSettings};
pub use error::{AppError, AppResult};
pub use id::{IdGenerator, redact_token};
