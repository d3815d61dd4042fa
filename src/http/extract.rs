//! Request Extractors
//!
//! `AuthUser` verifies the bearer token. `Authorized<P>` additionally
//! authorizes the caller against the `{room_id}` route parameter using the
//! requirements of policy `P`.

use axum::extract::{FromRef, FromRequestParts, MatchedPath, Path};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::collections::HashMap;
use std::marker::PhantomData;
use tracing::debug;

use crate::authz::{AuthorizedCall, CallContext, HttpCallContext, Requirement, Role};
use crate::core::{RoomId, UserId};
use crate::http::problem::ApiError;
use crate::state::AppState;
use crate::token::{parse_bearer, AccessClaims};

/// Route parameter naming the room.
pub const ROOM_ID_PARAM: &str = "room_id";

/// A caller with a verified access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// Token subject.
    pub user_id: UserId,
    /// Verified claims.
    pub claims: AccessClaims,
}

impl<S> FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer)
            .ok_or_else(ApiError::invalid_token)?;

        let state = AppState::from_ref(state);
        let claims = state.issuer.verify_access_token(token).map_err(|e| {
            debug!(reason = %e, "bearer token rejected");
            ApiError::invalid_token()
        })?;
        let user_id = claims.user_id().map_err(|_| ApiError::invalid_token())?;

        Ok(AuthUser { user_id, claims })
    }
}

/// Requirements a route places on the caller's room membership.
pub trait RoomPolicy: Send + Sync + 'static {
    /// Checked on every request to the route.
    const REQUIREMENTS: &'static [Requirement];
}

/// Any unbanned member.
pub struct MemberPolicy;

impl RoomPolicy for MemberPolicy {
    const REQUIREMENTS: &'static [Requirement] = &[Requirement::Member];
}

/// Moderator or owner.
pub struct ModeratorPolicy;

impl RoomPolicy for ModeratorPolicy {
    const REQUIREMENTS: &'static [Requirement] = &[Requirement::Role(Role::Moderator)];
}

/// A caller authorized for the room in the path.
#[derive(Debug)]
pub struct Authorized<P> {
    /// The authorization decision.
    pub call: AuthorizedCall,
    policy: PhantomData<fn() -> P>,
}

impl<P> Authorized<P> {
    /// Caller.
    pub fn user_id(&self) -> UserId {
        self.call.user_id
    }

    /// Room from the path.
    pub fn room_id(&self) -> RoomId {
        self.call.room_id
    }
}

impl<S, P> FromRequestParts<S> for Authorized<P>
where
    AppState: FromRef<S>,
    S: Send + Sync,
    P: RoomPolicy,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        let room_id = room_id_param(parts).await;
        let route = parts
            .extensions
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_owned())
            .unwrap_or_else(|| parts.uri.path().to_owned());

        let ctx = CallContext::Http(HttpCallContext {
            user_id: Some(user.user_id),
            room_id,
            route,
        });
        let state = AppState::from_ref(state);
        let call = state.authorizer.authorize(&ctx, P::REQUIREMENTS).await?;

        Ok(Authorized {
            call,
            policy: PhantomData,
        })
    }
}

async fn room_id_param(parts: &mut Parts) -> Option<RoomId> {
    let Path(params) = Path::<HashMap<String, String>>::from_request_parts(parts, &())
        .await
        .ok()?;
    params.get(ROOM_ID_PARAM)?.parse().ok()
}
