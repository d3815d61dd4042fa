//! Configuration
//!
//! Token signing and listener settings, read from `GEOQUEST_*` environment
//! variables. Token settings have no production defaults; only
//! [`AuthConfig::development`] supplies placeholders.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Default verification leeway for access token timestamps (seconds).
pub const DEFAULT_CLOCK_SKEW_SECS: u64 = 60;

/// Longest accepted access token lifetime (one day).
pub const MAX_ACCESS_TOKEN_MINUTES: i64 = 24 * 60;

/// Longest accepted refresh token lifetime.
pub const MAX_REFRESH_TOKEN_DAYS: i64 = 365;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Token issuance and verification settings.
#[derive(Clone)]
pub struct AuthConfig {
    /// Expected and emitted issuer claim ("iss").
    pub issuer: String,
    /// Expected and emitted audience claim ("aud").
    pub audience: String,
    /// HS256 signing key.
    pub signing_key: String,
    /// Access token lifetime in minutes.
    pub access_token_minutes: i64,
    /// Refresh token lifetime in days.
    pub refresh_token_days: i64,
    /// Accepted clock skew when verifying access tokens.
    pub clock_skew_secs: u64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("signing_key", &"[REDACTED]")
            .field("access_token_minutes", &self.access_token_minutes)
            .field("refresh_token_days", &self.refresh_token_days)
            .field("clock_skew_secs", &self.clock_skew_secs)
            .finish()
    }
}

impl AuthConfig {
    /// Placeholder settings for local development and tests.
    pub fn development() -> Self {
        Self {
            issuer: "geoquest-dev".into(),
            audience: "geoquest-clients".into(),
            signing_key: "development-signing-key-change-me-0123456789".into(),
            access_token_minutes: 15,
            refresh_token_days: 30,
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            issuer: required("GEOQUEST_JWT_ISSUER")?,
            audience: required("GEOQUEST_JWT_AUDIENCE")?,
            signing_key: required("GEOQUEST_JWT_SIGNING_KEY")?,
            access_token_minutes: parsed("GEOQUEST_ACCESS_TOKEN_MINUTES")?,
            refresh_token_days: parsed("GEOQUEST_REFRESH_TOKEN_DAYS")?,
            clock_skew_secs: optional_parsed("GEOQUEST_CLOCK_SKEW_SECS")?
                .unwrap_or(DEFAULT_CLOCK_SKEW_SECS),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would mint unusable tokens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signing_key.len() < 32 {
            return Err(ConfigError::Invalid {
                name: "GEOQUEST_JWT_SIGNING_KEY",
                reason: "must be at least 32 bytes".into(),
            });
        }
        if !(1..=MAX_ACCESS_TOKEN_MINUTES).contains(&self.access_token_minutes) {
            return Err(ConfigError::Invalid {
                name: "GEOQUEST_ACCESS_TOKEN_MINUTES",
                reason: format!("must be between 1 and {}", MAX_ACCESS_TOKEN_MINUTES),
            });
        }
        if !(1..=MAX_REFRESH_TOKEN_DAYS).contains(&self.refresh_token_days) {
            return Err(ConfigError::Invalid {
                name: "GEOQUEST_REFRESH_TOKEN_DAYS",
                reason: format!("must be between 1 and {}", MAX_REFRESH_TOKEN_DAYS),
            });
        }
        Ok(())
    }

    /// Access token lifetime, clamped to the accepted range.
    pub fn access_lifetime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.access_token_minutes.clamp(1, MAX_ACCESS_TOKEN_MINUTES))
    }

    /// Refresh token lifetime, clamped to the accepted range.
    pub fn refresh_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(self.refresh_token_days.clamp(1, MAX_REFRESH_TOKEN_DAYS))
    }
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP API bind address.
    pub http_addr: SocketAddr,
    /// Real-time WebSocket bind address.
    pub realtime_addr: SocketAddr,
    /// Maximum concurrent real-time connections.
    pub max_connections: usize,
    /// Idle real-time connections are closed after this long.
    pub idle_timeout: Duration,
    /// Server version string.
    pub version: String,
    /// Postgres connection string; in-memory storage when absent.
    pub database_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            realtime_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(120),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database_url: None,
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            http_addr: optional_parsed("GEOQUEST_HTTP_ADDR")?.unwrap_or(defaults.http_addr),
            realtime_addr: optional_parsed("GEOQUEST_REALTIME_ADDR")?
                .unwrap_or(defaults.realtime_addr),
            max_connections: optional_parsed("GEOQUEST_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            idle_timeout: optional_parsed("GEOQUEST_IDLE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            version: defaults.version,
            database_url: std::env::var("DATABASE_URL").ok(),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parsed<T>(name: &'static str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_parsed(name)?.ok_or(ConfigError::Missing(name))
}

fn optional_parsed<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_config_is_valid() {
        assert!(AuthConfig::development().validate().is_ok());
    }

    #[test]
    fn test_short_signing_key_rejected() {
        let config = AuthConfig {
            signing_key: "short".into(),
            ..AuthConfig::development()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_non_positive_lifetimes_rejected() {
        let config = AuthConfig {
            access_token_minutes: 0,
            ..AuthConfig::development()
        };
        assert!(config.validate().is_err());

        let config = AuthConfig {
            refresh_token_days: -1,
            ..AuthConfig::development()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_lifetimes_rejected() {
        let config = AuthConfig {
            access_token_minutes: i64::MAX,
            ..AuthConfig::development()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "GEOQUEST_ACCESS_TOKEN_MINUTES", .. })
        ));
        assert_eq!(
            config.access_lifetime(),
            chrono::Duration::minutes(MAX_ACCESS_TOKEN_MINUTES)
        );

        let config = AuthConfig {
            refresh_token_days: MAX_REFRESH_TOKEN_DAYS + 1,
            ..AuthConfig::development()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.refresh_lifetime(), chrono::Duration::days(MAX_REFRESH_TOKEN_DAYS));

        let config = AuthConfig {
            access_token_minutes: MAX_ACCESS_TOKEN_MINUTES,
            refresh_token_days: MAX_REFRESH_TOKEN_DAYS,
            ..AuthConfig::development()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_signing_key() {
        let config = AuthConfig::development();
        let printed = format!("{:?}", config);
        assert!(!printed.contains(&config.signing_key));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_lifetimes() {
        let config = AuthConfig::development();
        assert_eq!(config.access_lifetime(), chrono::Duration::minutes(15));
        assert_eq!(config.refresh_lifetime(), chrono::Duration::days(30));
    }
}
