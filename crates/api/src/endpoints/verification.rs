//! Email verification endpoints.

use axum::{
    Router,
    extract::{Query, State},
    routing::post,
};
use mailverify_common::{AppError, AppResult};
use mailverify_core::{AccountRef, VerificationConfirmation};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{extractors::ValidatedJson, middleware::AppState, response::ApiResponse};

/// Resend request. Exactly one of the two fields must be set.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResendRequest {
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub account_id: Option<String>,
}

impl TryFrom<ResendRequest> for AccountRef {
    type Error = AppError;

    fn try_from(req: ResendRequest) -> Result<Self, Self::Error> {
        match (req.email, req.account_id) {
            (Some(email), None) => Ok(Self::Email(email)),
            (None, Some(id)) => Ok(Self::Id(id)),
            _ => Err(AppError::Validation(
                "exactly one of email or accountId is required".to_string(),
            )),
        }
    }
}

/// Resend response. The token itself only travels by email.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendResponse {
    pub expires_at: String,
}

/// Verify request body.
#[derive(Debug, Deserialize, Validate)]
pub struct VerifyRequest {
    #[validate(length(min = 1, max = 256))]
    pub token: String,
}

/// Verify link query.
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    pub token: Option<String>,
}

/// Verify response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub account_id: String,
    pub newly_verified: bool,
}

impl From<VerificationConfirmation> for VerifyResponse {
    fn from(c: VerificationConfirmation) -> Self {
        Self {
            account_id: c.account_id,
            newly_verified: c.newly_verified,
        }
    }
}

/// Issue a fresh token and queue the verification email.
async fn resend(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<ResendRequest>,
) -> AppResult<ApiResponse<ResendResponse>> {
    let issued = state
        .verification_service
        .issue_or_resend(req.try_into()?)
        .await?;

    Ok(ApiResponse::ok(ResendResponse {
        expires_at: issued.expires_at.to_rfc3339(),
    }))
}

/// Verify a token posted by a client.
async fn verify(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<VerifyRequest>,
) -> AppResult<ApiResponse<VerifyResponse>> {
    let confirmation = state.verification_service.consume(&req.token).await?;
    Ok(ApiResponse::ok(confirmation.into()))
}

/// Verify a token from the emailed link.
async fn verify_link(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> AppResult<ApiResponse<VerifyResponse>> {
    let token = query
        .token
        .ok_or_else(|| AppError::Validation("token is required".to_string()))?;
    let confirmation = state.verification_service.consume(&token).await?;
    Ok(ApiResponse::ok(confirmation.into()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/resend", post(resend))
        .route("/verify", post(verify).get(verify_link))
}
