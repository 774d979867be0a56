//! API endpoints.

mod verification;

use axum::Router;

use crate::middleware::AppState;

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new().nest("/email-verification", verification::router())
}
