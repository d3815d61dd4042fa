//! `/rooms/{room_id}` handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::info;

use crate::authz::{Permissions, Role};
use crate::core::{RoomId, UserId};
use crate::http::extract::{Authorized, MemberPolicy, ModeratorPolicy};
use crate::http::problem::ApiError;
use crate::realtime::room_hub::evict_user;
use crate::state::AppState;

/// The caller's own membership.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipView {
    /// Room.
    pub room_id: RoomId,
    /// Caller.
    pub user_id: UserId,
    /// Caller's role in the room.
    pub role: Role,
    /// Explicit grants.
    pub permissions: Permissions,
}

/// Users with a live connection in the room.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceView {
    /// Room.
    pub room_id: RoomId,
    /// Online users.
    pub online: Vec<UserId>,
}

/// `GET /rooms/{room_id}/membership`
pub async fn membership(caller: Authorized<MemberPolicy>) -> Json<MembershipView> {
    let m = caller.call.membership;
    Json(MembershipView {
        room_id: m.room_id,
        user_id: m.user_id,
        role: m.role,
        permissions: m.permissions,
    })
}

/// `GET /rooms/{room_id}/presence`
pub async fn presence(
    State(state): State<AppState>,
    caller: Authorized<MemberPolicy>,
) -> Json<PresenceView> {
    let room_id = caller.room_id();
    Json(PresenceView {
        room_id,
        online: state.presence.online(room_id).await,
    })
}

/// `POST /rooms/{room_id}/members/{user_id}/ban`. The caller must outrank
/// the target.
pub async fn ban(
    State(state): State<AppState>,
    caller: Authorized<ModeratorPolicy>,
    Path((_, target)): Path<(String, UserId)>,
) -> Result<StatusCode, ApiError> {
    let room_id = caller.room_id();
    let not_found = || ApiError::new(StatusCode::NOT_FOUND, "member_not_found", "No such member");
    if state
        .authorizer
        .moderation_target(&caller.call.membership, target)
        .await?
        .is_none()
    {
        return Err(not_found());
    }
    if !state.memberships.set_banned(target, room_id, true).await? {
        return Err(not_found());
    }
    info!(%room_id, target = %target, by = %caller.user_id(), "member banned");

    // Live connections lose presence now; later calls fail the ban check.
    evict_user(&state.presence, room_id, target, caller.user_id()).await;

    Ok(StatusCode::NO_CONTENT)
}
