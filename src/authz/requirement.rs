//! Authorization Requirements
//!
//! Decision rules are written once against [`CallContext`]; only the
//! transport adapters know how to build one.

use tracing::debug;

use crate::authz::membership::{Membership, MembershipResolver, Permissions, Role};
use crate::core::{RoomId, UserId};
use crate::error::AuthzError;

/// A rule a call must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// Any unbanned member.
    Member,
    /// Unbanned member holding every listed permission bit.
    Permission(Permissions),
    /// Unbanned member at or above the role.
    Role(Role),
}

impl Requirement {
    /// Evaluate against a resolved membership. Absent or banned memberships
    /// never satisfy anything.
    pub fn is_satisfied_by(&self, membership: Option<&Membership>) -> bool {
        let Some(membership) = membership.filter(|m| !m.banned) else {
            return false;
        };
        match self {
            Requirement::Member => true,
            Requirement::Permission(required) => membership.permissions.contains(*required),
            Requirement::Role(required) => membership.role.satisfies(*required),
        }
    }

    fn failure(&self) -> AuthzError {
        match self {
            Requirement::Role(_) => AuthzError::MissingRole,
            _ => AuthzError::MissingPermission,
        }
    }
}

/// An HTTP request, as far as authorization cares.
#[derive(Debug, Clone)]
pub struct HttpCallContext {
    /// Subject of the verified bearer token.
    pub user_id: Option<UserId>,
    /// `{room_id}` route parameter.
    pub room_id: Option<RoomId>,
    /// Matched route, for logs.
    pub route: String,
}

/// One method invocation on a real-time connection.
#[derive(Debug, Clone)]
pub struct RealtimeCallContext {
    /// Connection the invocation arrived on.
    pub connection_id: u64,
    /// Identity attached to the connection.
    pub user_id: Option<UserId>,
    /// Room named by the first argument.
    pub room_id: Option<RoomId>,
    /// Hub method name.
    pub method: String,
}

/// The two transports a call can arrive on.
#[derive(Debug, Clone)]
pub enum CallContext {
    /// An HTTP request.
    Http(HttpCallContext),
    /// A hub invocation.
    Realtime(RealtimeCallContext),
}

impl CallContext {
    /// Caller identity.
    pub fn identity(&self) -> Option<UserId> {
        match self {
            CallContext::Http(ctx) => ctx.user_id,
            CallContext::Realtime(ctx) => ctx.user_id,
        }
    }

    /// Room the call targets.
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            CallContext::Http(ctx) => ctx.room_id,
            CallContext::Realtime(ctx) => ctx.room_id,
        }
    }

    /// Route or method name, for logs.
    pub fn operation(&self) -> &str {
        match self {
            CallContext::Http(ctx) => &ctx.route,
            CallContext::Realtime(ctx) => &ctx.method,
        }
    }
}

/// A call that passed authorization, with the membership it was decided on.
#[derive(Debug, Clone)]
pub struct AuthorizedCall {
    /// Authenticated caller.
    pub user_id: UserId,
    /// Room the call targets.
    pub room_id: RoomId,
    /// Caller's membership at decision time.
    pub membership: Membership,
}

/// Evaluates requirements for either transport.
#[derive(Clone)]
pub struct Authorizer {
    resolver: MembershipResolver,
}

impl Authorizer {
    /// Create an authorizer.
    pub fn new(resolver: MembershipResolver) -> Self {
        Self { resolver }
    }

    /// Load the membership of the user a moderation action targets and
    /// check that `actor` strictly outranks it. `Ok(None)` when the target
    /// has no membership in the actor's room.
    pub async fn moderation_target(
        &self,
        actor: &Membership,
        target: UserId,
    ) -> Result<Option<Membership>, AuthzError> {
        let Some(membership) = self.resolver.resolve(target, actor.room_id).await? else {
            return Ok(None);
        };
        if !actor.role.outranks(membership.role) {
            debug!(
                actor = %actor.user_id,
                %target,
                room_id = %actor.room_id,
                "denied: target not outranked"
            );
            return Err(AuthzError::MissingRole);
        }
        Ok(Some(membership))
    }

    /// Authorize a call. Membership is read once no matter how many
    /// requirements are checked.
    pub async fn authorize(
        &self,
        ctx: &CallContext,
        requirements: &[Requirement],
    ) -> Result<AuthorizedCall, AuthzError> {
        let user_id = ctx.identity().ok_or(AuthzError::Unauthenticated)?;
        let room_id = ctx.room_id().ok_or(AuthzError::RoomIdMissing)?;

        let mut scope = self.resolver.scope(user_id, room_id);
        let membership = match scope.get().await? {
            None => {
                debug!(%user_id, %room_id, op = ctx.operation(), "denied: not a member");
                return Err(AuthzError::NotMember);
            }
            Some(m) if m.banned => {
                debug!(%user_id, %room_id, op = ctx.operation(), "denied: banned");
                return Err(AuthzError::Banned);
            }
            Some(m) => m.clone(),
        };

        if let Some(unmet) = requirements.iter().find(|r| !r.is_satisfied_by(Some(&membership))) {
            debug!(%user_id, %room_id, op = ctx.operation(), requirement = ?unmet, "denied");
            return Err(unmet.failure());
        }

        Ok(AuthorizedCall {
            user_id,
            room_id,
            membership,
        })
    }
}
