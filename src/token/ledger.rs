//! Refresh Token Ledger
//!
//! Issue, rotate and revoke refresh tokens, and detect replay of superseded
//! secrets.
//!
//! ```text
//!            rotate                    revoke
//!   Active ─────────▶ Rotated(next)    Active ─────▶ Revoked
//! ```
//!
//! Both terminal states are dead ends. Presenting a `Rotated` secret again
//! means someone other than the legitimate holder may have it, so the whole
//! family is revoked and the holder has to log in again.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::core::{hash_secret, FamilyId, TokenId};
use crate::error::AuthError;
use crate::store::{RefreshTokenRecord, RefreshTokenStore, TokenState, User, UserStore};
use crate::token::issuer::{RefreshSecret, TokenIssuer, TokenPair};

/// Result of issuing or rotating.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    /// Credentials for the client.
    pub pair: TokenPair,
    /// Owner of the tokens.
    pub user: User,
    /// Family of the refresh row.
    pub family_id: FamilyId,
    /// Id of the new refresh row.
    pub token_id: TokenId,
}

/// Refresh token lifecycle over the persistence boundary.
#[derive(Clone)]
pub struct RefreshTokenLedger {
    tokens: Arc<dyn RefreshTokenStore>,
    users: Arc<dyn UserStore>,
    issuer: Arc<TokenIssuer>,
}

impl RefreshTokenLedger {
    /// Create a ledger.
    pub fn new(
        tokens: Arc<dyn RefreshTokenStore>,
        users: Arc<dyn UserStore>,
        issuer: Arc<TokenIssuer>,
    ) -> Self {
        Self {
            tokens,
            users,
            issuer,
        }
    }

    /// Start a new family for `user` and return a fresh pair.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn issue(&self, user: &User, now: DateTime<Utc>) -> Result<IssuedTokens, AuthError> {
        let secret = self.issuer.issue_refresh_secret(None, now);
        let record = new_record(user, &secret, now);
        let token_id = record.id;
        self.tokens.insert_refresh_token(record).await?;

        info!(family_id = %secret.family_id, "refresh family started");
        self.build(user.clone(), secret, token_id, now)
    }

    /// Exchange a refresh secret for a new pair in the same family.
    #[instrument(skip(self, presented))]
    pub async fn rotate(&self, presented: &str, now: DateTime<Utc>) -> Result<IssuedTokens, AuthError> {
        let record = self
            .tokens
            .find_refresh_token(&hash_secret(presented))
            .await?
            .ok_or(AuthError::InvalidToken)?;

        match record.state() {
            TokenState::Rotated { .. } => return Err(self.contain_reuse(&record, now).await),
            TokenState::Revoked => return Err(AuthError::TokenRevoked),
            TokenState::Active => {}
        }
        if record.is_expired(now) {
            return Err(AuthError::TokenExpired);
        }

        let user = self
            .users
            .find_user(record.user_id)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        let secret = self.issuer.issue_refresh_secret(Some(record.family_id), now);
        let successor = new_record(&user, &secret, now);
        let successor_id = successor.id;

        if !self.tokens.supersede_refresh_token(record.id, successor, now).await? {
            return Err(self.lost_rotation(&record, now).await);
        }

        debug!(family_id = %record.family_id, old = %record.id, new = %successor_id, "refresh token rotated");
        self.build(user, secret, successor_id, now)
    }

    /// Revoke a refresh secret. Missing or already revoked rows are a no-op.
    /// Returns whether a row changed.
    #[instrument(skip(self, presented))]
    pub async fn revoke(&self, presented: &str, now: DateTime<Utc>) -> Result<bool, AuthError> {
        let Some(record) = self.tokens.find_refresh_token(&hash_secret(presented)).await? else {
            return Ok(false);
        };
        if record.is_revoked() {
            return Ok(false);
        }
        let changed = self.tokens.revoke_refresh_token(record.id, now).await?;
        if changed {
            info!(family_id = %record.family_id, token_id = %record.id, "refresh token revoked");
        }
        Ok(changed)
    }

    /// Return the row for a usable secret: present, not revoked, not expired.
    pub async fn ensure_token(
        &self,
        presented: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshTokenRecord, AuthError> {
        let record = self
            .tokens
            .find_refresh_token(&hash_secret(presented))
            .await?
            .ok_or(AuthError::InvalidToken)?;
        if record.is_revoked() {
            return Err(AuthError::TokenRevoked);
        }
        if record.is_expired(now) {
            return Err(AuthError::TokenExpired);
        }
        Ok(record)
    }

    /// Every row of a family, oldest first.
    pub async fn family(&self, family_id: FamilyId) -> Result<Vec<RefreshTokenRecord>, AuthError> {
        Ok(self.tokens.family_tokens(family_id).await?)
    }

    /// The row stopped being active between read and write. A concurrent
    /// rotation means replay; a concurrent logout is a plain revocation.
    async fn lost_rotation(&self, record: &RefreshTokenRecord, now: DateTime<Utc>) -> AuthError {
        match self.tokens.find_refresh_token(&record.token_hash).await {
            Ok(Some(current)) if current.replaced_by.is_none() => {
                debug!(token_id = %record.id, "rotation lost to revocation");
                AuthError::TokenRevoked
            }
            Ok(_) => self.contain_reuse(record, now).await,
            Err(e) => AuthError::Store(e),
        }
    }

    /// Revoke the whole family of a replayed token. Always yields
    /// `ReuseDetected` unless the revocation itself fails.
    async fn contain_reuse(&self, record: &RefreshTokenRecord, now: DateTime<Utc>) -> AuthError {
        match self.tokens.revoke_family(record.family_id, now).await {
            Ok(revoked) => {
                warn!(
                    user_id = %record.user_id,
                    family_id = %record.family_id,
                    token_id = %record.id,
                    revoked,
                    "refresh token reuse detected, family revoked"
                );
                AuthError::ReuseDetected
            }
            Err(e) => AuthError::Store(e),
        }
    }

    fn build(
        &self,
        user: User,
        secret: RefreshSecret,
        token_id: TokenId,
        now: DateTime<Utc>,
    ) -> Result<IssuedTokens, AuthError> {
        let access = self.issuer.issue_access_token(&user, now)?;
        Ok(IssuedTokens {
            pair: TokenPair {
                access_token: access.token,
                access_expires_at: access.expires_at,
                refresh_token: secret.raw,
                refresh_expires_at: secret.expires_at,
            },
            user,
            family_id: secret.family_id,
            token_id,
        })
    }
}

fn new_record(user: &User, secret: &RefreshSecret, now: DateTime<Utc>) -> RefreshTokenRecord {
    RefreshTokenRecord {
        id: TokenId::new(),
        user_id: user.id,
        family_id: secret.family_id,
        token_hash: secret.hash.clone(),
        created_at: now,
        expires_at: secret.expires_at,
        revoked_at: None,
        replaced_by: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::store::{async_trait, MemoryStore, NewUser, StoreError};

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: RefreshTokenLedger,
        user: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let issuer = Arc::new(TokenIssuer::new(AuthConfig::development()));
        let ledger = RefreshTokenLedger::new(store.clone(), store.clone(), issuer);
        let user = store
            .create_user(NewUser {
                device_id: "device-1".into(),
                display_name: "Scout".into(),
                avatar_color: None,
            })
            .await
            .unwrap();
        Fixture { store, ledger, user }
    }

    #[tokio::test]
    async fn test_issue_expiries() {
        let f = fixture().await;
        let now = Utc::now();
        let issued = f.ledger.issue(&f.user, now).await.unwrap();
        assert_eq!(issued.pair.access_expires_at, now + chrono::Duration::minutes(15));
        assert_eq!(issued.pair.refresh_expires_at, now + chrono::Duration::days(30));
    }

    #[tokio::test]
    async fn test_raw_secret_never_stored() {
        let f = fixture().await;
        let issued = f.ledger.issue(&f.user, Utc::now()).await.unwrap();
        let rows = f.ledger.family(issued.family_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_ne!(rows[0].token_hash, issued.pair.refresh_token);
        assert_eq!(rows[0].token_hash, hash_secret(&issued.pair.refresh_token));
    }

    #[tokio::test]
    async fn test_rotation_yields_new_credentials() {
        let f = fixture().await;
        let now = Utc::now();
        let first = f.ledger.issue(&f.user, now).await.unwrap();
        let second = f.ledger.rotate(&first.pair.refresh_token, now).await.unwrap();

        assert_ne!(first.pair.refresh_token, second.pair.refresh_token);
        assert_ne!(first.pair.access_token, second.pair.access_token);
        assert_eq!(first.family_id, second.family_id);

        let rows = f.ledger.family(first.family_id).await.unwrap();
        let old = rows.iter().find(|r| r.id == first.token_id).unwrap();
        assert_eq!(old.replaced_by, Some(second.token_id));
        assert_eq!(old.revoked_at, Some(now));
    }

    #[tokio::test]
    async fn test_replay_revokes_whole_family() {
        let f = fixture().await;
        let now = Utc::now();
        let first = f.ledger.issue(&f.user, now).await.unwrap();
        let second = f.ledger.rotate(&first.pair.refresh_token, now).await.unwrap();
        let third = f.ledger.rotate(&second.pair.refresh_token, now).await.unwrap();

        let replay = f.ledger.rotate(&first.pair.refresh_token, now).await;
        assert!(matches!(replay, Err(AuthError::ReuseDetected)));

        let rows = f.ledger.family(first.family_id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.revoked_at.is_some()));

        // The newest, legitimately rotated secret is dead too.
        let newest = f.ledger.rotate(&third.pair.refresh_token, now).await;
        assert!(newest.is_err());
    }

    #[tokio::test]
    async fn test_replay_leaves_other_families_alone() {
        let f = fixture().await;
        let now = Utc::now();
        let phone = f.ledger.issue(&f.user, now).await.unwrap();
        let tablet = f.ledger.issue(&f.user, now).await.unwrap();

        f.ledger.rotate(&phone.pair.refresh_token, now).await.unwrap();
        let _ = f.ledger.rotate(&phone.pair.refresh_token, now).await;

        assert!(f.ledger.rotate(&tablet.pair.refresh_token, now).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_secret_invalid() {
        let f = fixture().await;
        let result = f.ledger.rotate("never-issued", Utc::now()).await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_revoked_secret_cannot_rotate() {
        let f = fixture().await;
        let now = Utc::now();
        let issued = f.ledger.issue(&f.user, now).await.unwrap();
        assert!(f.ledger.revoke(&issued.pair.refresh_token, now).await.unwrap());

        let result = f.ledger.rotate(&issued.pair.refresh_token, now).await;
        assert!(matches!(result, Err(AuthError::TokenRevoked)));
    }

    #[tokio::test]
    async fn test_expired_secret_cannot_rotate() {
        let f = fixture().await;
        let issued_at = Utc::now() - chrono::Duration::days(31);
        let issued = f.ledger.issue(&f.user, issued_at).await.unwrap();

        let result = f.ledger.rotate(&issued.pair.refresh_token, Utc::now()).await;
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let f = fixture().await;
        let now = Utc::now();
        let issued = f.ledger.issue(&f.user, now).await.unwrap();
        let at_expiry = issued.pair.refresh_expires_at;

        let result = f.ledger.rotate(&issued.pair.refresh_token, at_expiry).await;
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }

    #[tokio::test]
    async fn test_revoke_twice_is_noop() {
        let f = fixture().await;
        let now = Utc::now();
        let issued = f.ledger.issue(&f.user, now).await.unwrap();

        assert!(f.ledger.revoke(&issued.pair.refresh_token, now).await.unwrap());
        let before = f.ledger.family(issued.family_id).await.unwrap();

        let later = now + chrono::Duration::minutes(5);
        assert!(!f.ledger.revoke(&issued.pair.refresh_token, later).await.unwrap());
        let after = f.ledger.family(issued.family_id).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_revoke_unknown_is_noop() {
        let f = fixture().await;
        assert!(!f.ledger.revoke("never-issued", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_token() {
        let f = fixture().await;
        let now = Utc::now();

        assert!(matches!(
            f.ledger.ensure_token("missing", now).await,
            Err(AuthError::InvalidToken)
        ));

        let live = f.ledger.issue(&f.user, now).await.unwrap();
        let row = f.ledger.ensure_token(&live.pair.refresh_token, now).await.unwrap();
        assert_eq!(row.id, live.token_id);

        let revoked = f.ledger.issue(&f.user, now).await.unwrap();
        f.ledger.revoke(&revoked.pair.refresh_token, now).await.unwrap();
        assert!(matches!(
            f.ledger.ensure_token(&revoked.pair.refresh_token, now).await,
            Err(AuthError::TokenRevoked)
        ));

        let stale = f.ledger.issue(&f.user, now - chrono::Duration::days(40)).await.unwrap();
        assert!(matches!(
            f.ledger.ensure_token(&stale.pair.refresh_token, now).await,
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_rotations_single_winner() {
        let f = fixture().await;
        let now = Utc::now();
        let issued = f.ledger.issue(&f.user, now).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = f.ledger.clone();
            let secret = issued.pair.refresh_token.clone();
            handles.push(tokio::spawn(async move { ledger.rotate(&secret, now).await }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(e) => assert!(matches!(e, AuthError::ReuseDetected), "loser got {:?}", e),
            }
        }
        assert_eq!(successes, 1);

        // Every loser took the reuse branch, so the family is gone.
        let rows = f.store.family_tokens(issued.family_id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.revoked_at.is_some()));
    }

    /// Revokes the row just before delegating, as a logout racing the
    /// rotation would.
    struct LogoutFirst(Arc<MemoryStore>);

    #[async_trait]
    impl RefreshTokenStore for LogoutFirst {
        async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> Result<(), StoreError> {
            self.0.insert_refresh_token(record).await
        }

        async fn find_refresh_token(
            &self,
            token_hash: &str,
        ) -> Result<Option<RefreshTokenRecord>, StoreError> {
            self.0.find_refresh_token(token_hash).await
        }

        async fn supersede_refresh_token(
            &self,
            old: TokenId,
            successor: RefreshTokenRecord,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.0.revoke_refresh_token(old, now).await?;
            self.0.supersede_refresh_token(old, successor, now).await
        }

        async fn revoke_refresh_token(
            &self,
            id: TokenId,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.0.revoke_refresh_token(id, now).await
        }

        async fn revoke_family(
            &self,
            family_id: FamilyId,
            now: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.0.revoke_family(family_id, now).await
        }

        async fn family_tokens(
            &self,
            family_id: FamilyId,
        ) -> Result<Vec<RefreshTokenRecord>, StoreError> {
            self.0.family_tokens(family_id).await
        }
    }

    #[tokio::test]
    async fn test_rotation_losing_to_logout_is_revoked_not_reuse() {
        let f = fixture().await;
        let issuer = Arc::new(TokenIssuer::new(AuthConfig::development()));
        let racing = RefreshTokenLedger::new(
            Arc::new(LogoutFirst(f.store.clone())),
            f.store.clone(),
            issuer,
        );
        let now = Utc::now();
        let issued = racing.issue(&f.user, now).await.unwrap();

        let result = racing.rotate(&issued.pair.refresh_token, now).await;
        assert!(matches!(result, Err(AuthError::TokenRevoked)));

        let rows = f.store.family_tokens(issued.family_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].replaced_by, None);
    }
}
