//! Persistence boundary.
//!
//! - `MemoryStore`: in-process tables behind one lock (tests, development)
//! - `PostgresStore`: durable storage (feature `postgres`)
//!
//! Each trait method is one unit of work: it either commits fully or leaves
//! no trace, including when the calling future is dropped mid-flight.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresStore};

pub use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::authz::Membership;
use crate::concurrency::Version;
use crate::core::{FamilyId, RoomId, TokenId, UserId};

/// Storage errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend failure.
    #[error("database error: {0}")]
    Database(String),

    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// A unique column already holds the value.
    #[error("unique constraint violated on {field}")]
    UniqueViolation {
        /// Column name.
        field: &'static str,
    },

    /// Conditional write lost to a newer version.
    #[error("row version changed (now {current})")]
    VersionMismatch {
        /// Version now stored.
        current: Version,
    },
}

// =============================================================================
// ROW MODELS
// =============================================================================

/// A player account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Primary key.
    pub id: UserId,
    /// Bootstrap device, unique when set.
    pub device_id: Option<String>,
    /// Unique ignoring case when set.
    pub email: Option<String>,
    /// Shown to other players.
    pub display_name: String,
    /// `#RRGGBB` when set.
    pub avatar_color: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Concurrency token, bumped by every update.
    pub version: Version,
}

/// Fields supplied at first-device bootstrap.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Bootstrap device.
    pub device_id: String,
    /// Starting display name.
    pub display_name: String,
    /// Starting avatar color.
    pub avatar_color: Option<String>,
}

/// Profile fields a client may change. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    /// New display name.
    pub display_name: Option<String>,
    /// New email.
    pub email: Option<String>,
    /// New avatar color.
    pub avatar_color: Option<String>,
}

/// Lifecycle position of a refresh token row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Usable (subject to expiry).
    Active,
    /// Superseded by `successor` during rotation.
    Rotated {
        /// Token that replaced this one.
        successor: TokenId,
    },
    /// Revoked without a successor (logout, or family revocation).
    Revoked,
}

/// A persisted refresh token. Never holds the raw secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    /// Row id.
    pub id: TokenId,
    /// Owner.
    pub user_id: UserId,
    /// Rotation chain this token belongs to.
    pub family_id: FamilyId,
    /// Lowercase hex SHA-256 of the secret.
    pub token_hash: String,
    /// Issue time.
    pub created_at: DateTime<Utc>,
    /// Hard expiry.
    pub expires_at: DateTime<Utc>,
    /// Set once on rotation, logout or reuse containment.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Successor when revoked by rotation.
    pub replaced_by: Option<TokenId>,
}

impl RefreshTokenRecord {
    /// Current lifecycle state.
    pub fn state(&self) -> TokenState {
        match (self.revoked_at, self.replaced_by) {
            (_, Some(successor)) => TokenState::Rotated { successor },
            (Some(_), None) => TokenState::Revoked,
            (None, None) => TokenState::Active,
        }
    }

    /// Whether the token can no longer be used.
    #[inline]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Expired once `expires_at <= now`.
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Account storage.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a new account. Fails with `UniqueViolation { field: "device_id" }`
    /// when the device is already bootstrapped.
    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError>;

    /// Look up by id.
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Look up by device identifier.
    async fn find_user_by_device(&self, device_id: &str) -> Result<Option<User>, StoreError>;

    /// Apply a patch. When `expected` is set the row must still be at that
    /// version at commit time, else `VersionMismatch` with the current one.
    /// Email collisions fail with `UniqueViolation { field: "email" }`.
    async fn update_profile(
        &self,
        id: UserId,
        patch: &ProfilePatch,
        expected: Option<Version>,
    ) -> Result<User, StoreError>;
}

/// Refresh token ledger rows.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Insert a freshly issued row.
    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> Result<(), StoreError>;

    /// Look up by secret hash.
    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Compare-and-swap rotation. If `old` is still active, set its
    /// `revoked_at`/`replaced_by` and insert `successor`, returning `true`.
    /// If `old` is no longer active nothing is written and `false` returns.
    async fn supersede_refresh_token(
        &self,
        old: TokenId,
        successor: RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Set `revoked_at` if still null. Returns whether a row changed.
    async fn revoke_refresh_token(&self, id: TokenId, now: DateTime<Utc>)
        -> Result<bool, StoreError>;

    /// Revoke every still-active row in a family. Returns rows changed.
    async fn revoke_family(&self, family_id: FamilyId, now: DateTime<Utc>)
        -> Result<u64, StoreError>;

    /// All rows of a family, oldest first.
    async fn family_tokens(&self, family_id: FamilyId)
        -> Result<Vec<RefreshTokenRecord>, StoreError>;
}

/// Room membership lookups (owned by room management).
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Single read of one (user, room) membership.
    async fn find_membership(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Option<Membership>, StoreError>;

    /// Insert or replace a membership.
    async fn upsert_membership(&self, membership: Membership) -> Result<(), StoreError>;

    /// Set the ban flag. Returns `false` when there is no such membership.
    async fn set_banned(
        &self,
        user_id: UserId,
        room_id: RoomId,
        banned: bool,
    ) -> Result<bool, StoreError>;
}
