//! `/auth` handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::account::SessionGrant;
use crate::http::problem::ApiError;
use crate::state::AppState;
use crate::token::TokenPair;

/// `POST /auth/initial` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialRequest {
    /// Stable device identifier.
    #[serde(default)]
    pub device_id: String,
    /// Optional starting display name.
    pub display_name: Option<String>,
    /// Optional starting avatar color.
    pub avatar_color: Option<String>,
}

/// `POST /auth/login` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    /// Device the account was bootstrapped on.
    #[serde(default)]
    pub device_id: String,
}

/// `POST /auth/refresh` and `POST /auth/logout` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    /// Opaque refresh token.
    #[serde(default)]
    pub refresh_token: String,
}

/// `POST /auth/refresh` response.
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    /// Rotated credentials.
    pub tokens: TokenPair,
}

/// `POST /auth/logout` response.
#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    /// Whether a live token was revoked.
    pub revoked: bool,
}

/// `POST /auth/initial`
pub async fn initial(
    State(state): State<AppState>,
    payload: Result<Json<InitialRequest>, JsonRejection>,
) -> Result<Json<SessionGrant>, ApiError> {
    let Json(req) = payload?;
    let grant = state
        .accounts
        .initial(
            &req.device_id,
            req.display_name.as_deref(),
            req.avatar_color.as_deref(),
        )
        .await?;
    Ok(Json(grant))
}

/// `POST /auth/login`
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<SessionGrant>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(state.accounts.login(&req.device_id).await?))
}

/// `POST /auth/refresh`
pub async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let Json(req) = payload?;
    let tokens = state.accounts.refresh(&req.refresh_token).await?;
    Ok(Json(RefreshResponse { tokens }))
}

/// `POST /auth/logout`
pub async fn logout(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<LogoutResponse>, ApiError> {
    let Json(req) = payload?;
    state.accounts.logout(&req.refresh_token).await?;
    Ok(Json(LogoutResponse { revoked: true }))
}
