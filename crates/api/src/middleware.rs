//! API middleware.

#![allow(missing_docs)]

use axum::Router;
use mailverify_core::VerificationService;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::endpoints::router;

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub verification_service: VerificationService,
}

impl AppState {
    #[must_use]
    pub const fn new(verification_service: VerificationService) -> Self {
        Self {
            verification_service,
        }
    }
}

/// Full application: the API under `/api` with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/api", router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
