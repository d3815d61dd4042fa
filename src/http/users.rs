//! `/users/me` handlers.
//!
//! Reads return the row version as an `ETag`; writes must send it back in
//! `If-Match`.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::{ETAG, IF_MATCH, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::concurrency::{is_not_modified, Precondition, Version};
use crate::core::UserId;
use crate::error::ConcurrencyError;
use crate::http::extract::AuthUser;
use crate::http::problem::ApiError;
use crate::state::AppState;
use crate::store::{ProfilePatch, User};

/// Public profile representation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    /// User id.
    pub id: UserId,
    /// Shown to other players.
    pub display_name: String,
    /// Optional, unique when set.
    pub email: Option<String>,
    /// Optional `#RRGGBB`.
    pub avatar_color: Option<String>,
    /// Account creation time.
    pub created_at: DateTime<Utc>,
}

impl From<User> for ProfileView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            display_name: user.display_name,
            email: user.email,
            avatar_color: user.avatar_color,
            created_at: user.created_at,
        }
    }
}

fn etag_header(version: Version) -> Result<(axum::http::HeaderName, HeaderValue), ApiError> {
    let value = HeaderValue::from_str(&version.to_etag()).map_err(ApiError::internal)?;
    Ok((ETAG, value))
}

/// `GET /users/me`
pub async fn get_me(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let profile = state.profiles.get_profile(user.user_id).await?;
    let etag = etag_header(profile.version)?;

    let if_none_match = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok());
    if is_not_modified(if_none_match, profile.version) {
        return Ok((StatusCode::NOT_MODIFIED, [etag]).into_response());
    }
    Ok(([etag], Json(ProfileView::from(profile))).into_response())
}

/// `PATCH /users/me`
pub async fn patch_me(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    payload: Result<Json<ProfilePatch>, JsonRejection>,
) -> Result<Response, ApiError> {
    let if_match = match headers.get(IF_MATCH) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ApiError::from(ConcurrencyError::MalformedPrecondition))?,
        ),
        None => None,
    };
    let precondition = Precondition::from_if_match(if_match)?;
    let Json(patch) = payload?;

    let updated = state
        .profiles
        .patch_profile(user.user_id, precondition, patch)
        .await?;
    Ok((StatusCode::NO_CONTENT, [etag_header(updated.version)?]).into_response())
}
