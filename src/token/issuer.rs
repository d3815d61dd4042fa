//! Token Issuance
//!
//! Mints HS256 access tokens and opaque refresh secrets, and verifies access
//! tokens for both transports. Issuance is a pure function of the user, the
//! supplied clock reading and the signing configuration.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::AuthConfig;
use crate::core::{hash_secret, FamilyId, UserId};
use crate::store::User;

/// Bytes of CSPRNG output in a refresh secret.
pub const REFRESH_SECRET_BYTES: usize = 32;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject: the user id.
    pub sub: String,
    /// Unique token id, for audit correlation.
    pub jti: String,
    /// Issued at (Unix seconds).
    pub iat: u64,
    /// Expiry (Unix seconds).
    pub exp: u64,
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Display name, when the user has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
}

impl AccessClaims {
    /// Parse the subject as a user id.
    pub fn user_id(&self) -> Result<UserId, TokenError> {
        self.sub.parse().map_err(|_| TokenError::InvalidFormat)
    }
}

/// A signed access token and its expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Compact JWS.
    pub token: String,
    /// When the token stops verifying (before leeway).
    pub expires_at: DateTime<Utc>,
    /// Unique token id.
    pub jti: String,
}

/// A freshly generated refresh secret.
///
/// `raw` goes to the client exactly once; only `hash` is stored.
#[derive(Clone)]
pub struct RefreshSecret {
    /// base64url secret handed to the client.
    pub raw: String,
    /// Lowercase hex SHA-256 of `raw`.
    pub hash: String,
    /// Expiry of the refresh token row.
    pub expires_at: DateTime<Utc>,
    /// Family the row belongs to.
    pub family_id: FamilyId,
}

impl fmt::Debug for RefreshSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshSecret")
            .field("raw", &"[REDACTED]")
            .field("hash", &self.hash)
            .field("expires_at", &self.expires_at)
            .field("family_id", &self.family_id)
            .finish()
    }
}

/// Access + refresh credentials as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    /// Signed access JWT.
    pub access_token: String,
    /// When the access token stops verifying.
    pub access_expires_at: DateTime<Utc>,
    /// Opaque refresh secret.
    pub refresh_token: String,
    /// When the refresh token expires.
    pub refresh_expires_at: DateTime<Utc>,
}

/// Signing and verification failures.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
    /// Signing failed.
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Issues and verifies tokens for one signing configuration.
pub struct TokenIssuer {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer").field("config", &self.config).finish()
    }
}

impl TokenIssuer {
    /// Build an issuer. Verification checks signature, issuer, audience and
    /// expiry, allowing `clock_skew_secs` of leeway.
    pub fn new(config: AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.clock_skew_secs;
        validation.set_issuer(&[&config.issuer]);
        validation.set_audience(&[&config.audience]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        Self {
            encoding_key: EncodingKey::from_secret(config.signing_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.signing_key.as_bytes()),
            validation,
            config,
        }
    }

    /// Signing configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Mint an access token for `user` valid from `now`.
    pub fn issue_access_token(
        &self,
        user: &User,
        now: DateTime<Utc>,
    ) -> Result<AccessToken, TokenError> {
        let expires_at = now + self.config.access_lifetime();
        let jti = uuid::Uuid::new_v4().to_string();
        let nickname = Some(user.display_name.trim())
            .filter(|name| !name.is_empty())
            .map(str::to_owned);

        let claims = AccessClaims {
            sub: user.id.to_string(),
            jti: jti.clone(),
            iat: unix_seconds(now),
            exp: unix_seconds(expires_at),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            nickname,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok(AccessToken {
            token,
            expires_at,
            jti,
        })
    }

    /// Generate a refresh secret. Rotation passes the existing family;
    /// first issuance passes `None` and gets a fresh one.
    pub fn issue_refresh_secret(
        &self,
        existing_family: Option<FamilyId>,
        now: DateTime<Utc>,
    ) -> RefreshSecret {
        let mut bytes = [0u8; REFRESH_SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let raw = URL_SAFE_NO_PAD.encode(bytes);

        RefreshSecret {
            hash: hash_secret(&raw),
            raw,
            expires_at: now + self.config.refresh_lifetime(),
            family_id: existing_family.unwrap_or_default(),
        }
    }

    /// Validate an access token and extract its claims.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let token_data = decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map_err(map_jwt_error)?;
        let claims = token_data.claims;

        // Validate subject exists
        if claims.sub.is_empty() {
            return Err(TokenError::MissingClaim("sub".into()));
        }
        claims.user_id()?;

        Ok(claims)
    }
}

/// Extract the credential from an `Authorization: Bearer <token>` value.
/// The scheme is matched case-insensitively.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

fn unix_seconds(at: DateTime<Utc>) -> u64 {
    at.timestamp().max(0) as u64
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        ErrorKind::InvalidSignature => TokenError::InvalidSignature,
        ErrorKind::InvalidIssuer => TokenError::InvalidIssuer,
        ErrorKind::InvalidAudience => TokenError::InvalidAudience,
        ErrorKind::MissingRequiredClaim(claim) => TokenError::MissingClaim(claim.clone()),
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => TokenError::InvalidFormat,
        _ => TokenError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
