//! Error taxonomy.
//!
//! Every failure a client can cause maps to one of these enums. Transports
//! translate them into HTTP problem responses or real-time error codes; the
//! `Display` text is for server logs only and never crosses the boundary.

use thiserror::Error;

use crate::concurrency::Version;
use crate::store::StoreError;
use crate::token::TokenError;

/// Refresh / access token failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No such token, or the token could not be verified.
    #[error("invalid token")]
    InvalidToken,
    /// Token lifetime elapsed.
    #[error("token expired")]
    TokenExpired,
    /// Token was explicitly revoked.
    #[error("token revoked")]
    TokenRevoked,
    /// A superseded refresh secret was replayed; its family is now revoked.
    #[error("refresh token reuse detected")]
    ReuseDetected,
    /// Access token could not be signed.
    #[error(transparent)]
    Signing(#[from] TokenError),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Machine-readable code for the refresh endpoint.
    pub fn refresh_code(&self) -> &'static str {
        match self {
            AuthError::InvalidToken => "refresh_invalid",
            AuthError::TokenExpired => "refresh_expired",
            AuthError::TokenRevoked => "refresh_revoked",
            AuthError::ReuseDetected => "refresh_reuse",
            AuthError::Signing(_) | AuthError::Store(_) => "internal_error",
        }
    }
}

/// Outcome of a failed authorization check. These are expected results, not
/// faults, except for [`AuthzError::Store`].
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Caller identity missing or not verifiable.
    #[error("caller is not authenticated")]
    Unauthenticated,
    /// The call does not name a room.
    #[error("room id missing")]
    RoomIdMissing,
    /// Caller has no membership in the room.
    #[error("caller is not a member of the room")]
    NotMember,
    /// Caller is banned from the room.
    #[error("caller is banned from the room")]
    Banned,
    /// A permission requirement was not met.
    #[error("missing permission")]
    MissingPermission,
    /// A role requirement was not met.
    #[error("missing role")]
    MissingRole,
    /// Membership lookup failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthzError {
    /// Code shared by both transports (the real-time form adds `auth.`).
    pub fn code(&self) -> &'static str {
        match self {
            AuthzError::Unauthenticated => "invalid_token",
            AuthzError::RoomIdMissing => "room_id_missing",
            AuthzError::NotMember => "not_member",
            AuthzError::Banned => "banned",
            AuthzError::MissingPermission | AuthzError::MissingRole => "missing_permission",
            AuthzError::Store(_) => "internal_error",
        }
    }
}

/// Optimistic concurrency failures.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    /// Mutation sent without a precondition.
    #[error("precondition required")]
    PreconditionRequired,
    /// Precondition header could not be parsed.
    #[error("malformed precondition")]
    MalformedPrecondition,
    /// Precondition does not match the current version.
    #[error("precondition failed")]
    PreconditionFailed {
        /// Version the caller should retry against.
        current: Version,
    },
    /// A unique constraint was violated.
    #[error("conflict on {field}")]
    Conflict {
        /// Offending field.
        field: &'static str,
    },
}

/// Malformed input, detected before any persistence access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Device identifier absent or blank.
    #[error("device id missing")]
    DeviceIdMissing,
    /// Refresh secret absent or blank.
    #[error("refresh token missing")]
    RefreshTokenMissing,
    /// Display name blank or too long.
    #[error("invalid display name")]
    InvalidDisplayName,
    /// Email address malformed.
    #[error("invalid email")]
    InvalidEmail,
}

impl ValidationError {
    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::DeviceIdMissing => "device_id_missing",
            ValidationError::RefreshTokenMissing => "refresh_token_missing",
            ValidationError::InvalidDisplayName => "invalid_display_name",
            ValidationError::InvalidEmail => "invalid_email",
        }
    }
}

/// Errors from the account flows.
#[derive(Debug, Error)]
pub enum AccountError {
    /// Input rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Device already bootstrapped.
    #[error("user already exists")]
    UserExists,
    /// No user for the device or token subject.
    #[error("user not found")]
    UserNotFound,
    /// Token failure.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Version check failure.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
