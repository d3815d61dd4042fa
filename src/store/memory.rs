//! In-memory storage backend
//!
//! All tables sit behind a single `RwLock`, so every trait method runs as one
//! critical section with no await point between its checks and its writes.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::authz::Membership;
use crate::concurrency::Version;
use crate::core::{FamilyId, RoomId, TokenId, UserId};
use crate::store::{
    async_trait, MembershipStore, NewUser, ProfilePatch, RefreshTokenRecord, RefreshTokenStore,
    StoreError, User, UserStore,
};

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    refresh_tokens: BTreeMap<TokenId, RefreshTokenRecord>,
    memberships: BTreeMap<(UserId, RoomId), Membership>,
    /// Store-wide rowversion counter.
    last_version: u64,
}

impl Tables {
    fn next_version(&mut self) -> Version {
        self.last_version += 1;
        Version(self.last_version)
    }

    fn token_by_hash(&self, token_hash: &str) -> Option<&RefreshTokenRecord> {
        self.refresh_tokens.values().find(|t| t.token_hash == token_hash)
    }

    fn email_taken(&self, email: &str, except: UserId) -> bool {
        self.users.values().any(|u| {
            u.id != except
                && u.email
                    .as_deref()
                    .is_some_and(|existing| existing.eq_ignore_ascii_case(email))
        })
    }
}

/// In-process store implementing every storage trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        let mut tables = self.tables.write().await;
        let taken = tables
            .users
            .values()
            .any(|u| u.device_id.as_deref() == Some(new_user.device_id.as_str()));
        if taken {
            return Err(StoreError::UniqueViolation { field: "device_id" });
        }

        let version = tables.next_version();
        let user = User {
            id: UserId::new(),
            device_id: Some(new_user.device_id),
            email: None,
            display_name: new_user.display_name,
            avatar_color: new_user.avatar_color,
            created_at: Utc::now(),
            version,
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.users.get(&id).cloned())
    }

    async fn find_user_by_device(&self, device_id: &str) -> Result<Option<User>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.device_id.as_deref() == Some(device_id))
            .cloned())
    }

    async fn update_profile(
        &self,
        id: UserId,
        patch: &ProfilePatch,
        expected: Option<Version>,
    ) -> Result<User, StoreError> {
        let mut tables = self.tables.write().await;
        let current = tables
            .users
            .get(&id)
            .map(|u| u.version)
            .ok_or(StoreError::NotFound("user"))?;

        if let Some(expected) = expected {
            if expected != current {
                return Err(StoreError::VersionMismatch { current });
            }
        }
        if let Some(email) = patch.email.as_deref() {
            if tables.email_taken(email, id) {
                return Err(StoreError::UniqueViolation { field: "email" });
            }
        }

        let version = tables.next_version();
        let user = tables.users.get_mut(&id).ok_or(StoreError::NotFound("user"))?;
        if let Some(name) = &patch.display_name {
            user.display_name = name.clone();
        }
        if let Some(email) = &patch.email {
            user.email = Some(email.clone());
        }
        if let Some(color) = &patch.avatar_color {
            user.avatar_color = Some(color.clone());
        }
        user.version = version;
        Ok(user.clone())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.token_by_hash(&record.token_hash).is_some() {
            return Err(StoreError::UniqueViolation { field: "token_hash" });
        }
        tables.refresh_tokens.insert(record.id, record);
        Ok(())
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.token_by_hash(token_hash).cloned())
    }

    async fn supersede_refresh_token(
        &self,
        old: TokenId,
        successor: RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let still_active = tables
            .refresh_tokens
            .get(&old)
            .map(|t| t.revoked_at.is_none())
            .ok_or(StoreError::NotFound("refresh token"))?;
        if !still_active {
            return Ok(false);
        }
        if tables.token_by_hash(&successor.token_hash).is_some() {
            return Err(StoreError::UniqueViolation { field: "token_hash" });
        }

        if let Some(row) = tables.refresh_tokens.get_mut(&old) {
            row.revoked_at = Some(now);
            row.replaced_by = Some(successor.id);
        }
        tables.refresh_tokens.insert(successor.id, successor);
        Ok(true)
    }

    async fn revoke_refresh_token(
        &self,
        id: TokenId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.refresh_tokens.get_mut(&id) {
            Some(row) if row.revoked_at.is_none() => {
                row.revoked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_family(
        &self,
        family_id: FamilyId,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let mut changed = 0;
        for row in tables.refresh_tokens.values_mut() {
            if row.family_id == family_id && row.revoked_at.is_none() {
                row.revoked_at = Some(now);
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn family_tokens(
        &self,
        family_id: FamilyId,
    ) -> Result<Vec<RefreshTokenRecord>, StoreError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables
            .refresh_tokens
            .values()
            .filter(|t| t.family_id == family_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn find_membership(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Option<Membership>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables.memberships.get(&(user_id, room_id)).cloned())
    }

    async fn upsert_membership(&self, membership: Membership) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables
            .memberships
            .insert((membership.user_id, membership.room_id), membership);
        Ok(())
    }

    async fn set_banned(
        &self,
        user_id: UserId,
        room_id: RoomId,
        banned: bool,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.memberships.get_mut(&(user_id, room_id)) {
            Some(membership) => {
                membership.banned = banned;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
