//! HTTP API layer for mailverify.
//!
//! - **Endpoints**: resend a verification email, verify a token
//! - **Extractors**: validated JSON bodies
//! - **Middleware**: shared application state, tracing and CORS layers
//!
//! Built on Axum 0.8 with Tower middleware stack.

pub mod endpoints;
pub mod extractors;
pub mod middleware;
pub mod response;

pub use endpoints::router;
pub use middleware::{AppState, app};
