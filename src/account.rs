//! Account Flows
//!
//! Device bootstrap, login, refresh, logout, and the version-guarded profile.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::concurrency::{translate_store_error, Precondition};
use crate::core::UserId;
use crate::error::{AccountError, ValidationError};
use crate::store::{NewUser, ProfilePatch, StoreError, User, UserStore};
use crate::token::{RefreshTokenLedger, TokenPair};

/// Display name given to accounts bootstrapped without one.
pub const DEFAULT_DISPLAY_NAME: &str = "Player";

/// Longest accepted display name, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 32;

/// Body of a successful initial / login call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    /// The signed-in user.
    pub user_id: UserId,
    /// Fresh credentials.
    pub tokens: TokenPair,
}

/// Bootstrap, login, refresh and logout.
#[derive(Clone)]
pub struct AccountService {
    users: Arc<dyn UserStore>,
    ledger: RefreshTokenLedger,
}

impl AccountService {
    /// Create the service over a user store and the refresh ledger.
    pub fn new(users: Arc<dyn UserStore>, ledger: RefreshTokenLedger) -> Self {
        Self { users, ledger }
    }

    /// First launch on a device: create the account and its first token pair.
    #[instrument(skip_all)]
    pub async fn initial(
        &self,
        device_id: &str,
        display_name: Option<&str>,
        avatar_color: Option<&str>,
    ) -> Result<SessionGrant, AccountError> {
        let device_id = require_device_id(device_id)?;
        let display_name = match display_name {
            Some(name) => validate_display_name(name)?,
            None => DEFAULT_DISPLAY_NAME.to_string(),
        };

        let user = self
            .users
            .create_user(NewUser {
                device_id,
                display_name,
                avatar_color: avatar_color.map(str::to_string),
            })
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation { field: "device_id" } => AccountError::UserExists,
                other => AccountError::Store(other),
            })?;

        info!(user_id = %user.id, "account bootstrapped");
        self.grant(&user).await
    }

    /// Log a known device back in. Starts a new refresh family.
    #[instrument(skip_all)]
    pub async fn login(&self, device_id: &str) -> Result<SessionGrant, AccountError> {
        let device_id = require_device_id(device_id)?;
        let user = self
            .users
            .find_user_by_device(&device_id)
            .await?
            .ok_or(AccountError::UserNotFound)?;

        info!(user_id = %user.id, "device login");
        self.grant(&user).await
    }

    /// Rotate a refresh secret.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AccountError> {
        let secret = refresh_token.trim();
        if secret.is_empty() {
            return Err(ValidationError::RefreshTokenMissing.into());
        }
        let issued = self.ledger.rotate(secret, Utc::now()).await?;
        Ok(issued.pair)
    }

    /// Revoke a refresh secret. Unknown or already revoked secrets succeed.
    pub async fn logout(&self, refresh_token: &str) -> Result<(), AccountError> {
        let secret = refresh_token.trim();
        if !secret.is_empty() {
            self.ledger.revoke(secret, Utc::now()).await?;
        }
        Ok(())
    }

    async fn grant(&self, user: &User) -> Result<SessionGrant, AccountError> {
        let issued = self.ledger.issue(user, Utc::now()).await?;
        Ok(SessionGrant {
            user_id: user.id,
            tokens: issued.pair,
        })
    }
}

/// Profile reads and version-guarded writes.
#[derive(Clone)]
pub struct ProfileService {
    users: Arc<dyn UserStore>,
}

impl ProfileService {
    /// Create the service over a user store.
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    /// Load a user's profile.
    pub async fn get_profile(&self, user_id: UserId) -> Result<User, AccountError> {
        self.users
            .find_user(user_id)
            .await?
            .ok_or(AccountError::UserNotFound)
    }

    /// Apply `patch` if the caller's precondition still holds.
    ///
    /// The version is checked against a fresh read and again by the store at
    /// commit time; a writer landing in between surfaces as
    /// `PreconditionFailed` with the winner's version.
    #[instrument(skip(self, patch), fields(user_id = %user_id))]
    pub async fn patch_profile(
        &self,
        user_id: UserId,
        precondition: Precondition,
        patch: ProfilePatch,
    ) -> Result<User, AccountError> {
        let patch = validate_patch(patch)?;
        let current = self.get_profile(user_id).await?;
        precondition.check(current.version)?;

        self.users
            .update_profile(user_id, &patch, precondition.expected())
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => AccountError::UserNotFound,
                other => match translate_store_error(other) {
                    Ok(concurrency) => AccountError::Concurrency(concurrency),
                    Err(store) => AccountError::Store(store),
                },
            })
    }
}

fn require_device_id(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::DeviceIdMissing);
    }
    Ok(trimmed.to_string())
}

fn validate_display_name(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(ValidationError::InvalidDisplayName);
    }
    Ok(trimmed.to_string())
}

fn validate_email(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    match trimmed.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(trimmed.to_string())
        }
        _ => Err(ValidationError::InvalidEmail),
    }
}

fn validate_patch(patch: ProfilePatch) -> Result<ProfilePatch, ValidationError> {
    Ok(ProfilePatch {
        display_name: patch.display_name.as_deref().map(validate_display_name).transpose()?,
        email: patch.email.as_deref().map(validate_email).transpose()?,
        avatar_color: patch.avatar_color,
    })
}

// =============================================================================
// TESTS
// =============================================================================
