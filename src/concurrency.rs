//! Optimistic Concurrency
//!
//! Row versions are handed to clients as opaque ETags and must come back as
//! `If-Match` preconditions on mutation. The store re-checks the version at
//! commit time, so a writer that slipped in between read and write surfaces
//! as [`StoreError::VersionMismatch`] and is translated here into a
//! precondition failure carrying the winner's version.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConcurrencyError;
use crate::store::StoreError;

/// Storage row version. Changes on every committed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// Render as a strong ETag: the 8 version bytes, base64url, quoted.
    pub fn to_etag(&self) -> String {
        format!("\"{}\"", URL_SAFE_NO_PAD.encode(self.0.to_be_bytes()))
    }

    /// Parse an ETag produced by [`Version::to_etag`]. Quotes are optional;
    /// weak validators are rejected.
    pub fn from_etag(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.starts_with("W/") {
            return None;
        }
        let inner = match raw.strip_prefix('"') {
            Some(rest) => rest.strip_suffix('"')?,
            None => raw,
        };
        let bytes = URL_SAFE_NO_PAD.decode(inner).ok()?;
        let bytes: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_etag())
    }
}

/// A parsed `If-Match` precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// `*`: apply unconditionally.
    Any,
    /// Apply only if the entity is still at this version.
    Exactly(Version),
}

impl Precondition {
    /// Parse the raw `If-Match` header value.
    pub fn from_if_match(header: Option<&str>) -> Result<Self, ConcurrencyError> {
        let raw = match header {
            Some(raw) if !raw.trim().is_empty() => raw.trim(),
            _ => return Err(ConcurrencyError::PreconditionRequired),
        };
        if raw == "*" {
            return Ok(Precondition::Any);
        }
        Version::from_etag(raw)
            .map(Precondition::Exactly)
            .ok_or(ConcurrencyError::MalformedPrecondition)
    }

    /// Version the store must still see at commit time, if any.
    pub fn expected(&self) -> Option<Version> {
        match self {
            Precondition::Any => None,
            Precondition::Exactly(version) => Some(*version),
        }
    }

    /// Check against the version observed before writing.
    pub fn check(&self, current: Version) -> Result<(), ConcurrencyError> {
        match self {
            Precondition::Exactly(expected) if *expected != current => {
                Err(ConcurrencyError::PreconditionFailed { current })
            }
            _ => Ok(()),
        }
    }
}

/// Whether an `If-None-Match` header allows answering "not modified".
pub fn is_not_modified(if_none_match: Option<&str>, current: Version) -> bool {
    let Some(raw) = if_none_match else {
        return false;
    };
    raw.split(',')
        .map(str::trim)
        .any(|tag| tag == "*" || Version::from_etag(tag) == Some(current))
}

/// Translate a commit-time store failure into its concurrency meaning.
/// Failures with no concurrency meaning are handed back unchanged.
pub fn translate_store_error(err: StoreError) -> Result<ConcurrencyError, StoreError> {
    match err {
        StoreError::VersionMismatch { current } => {
            Ok(ConcurrencyError::PreconditionFailed { current })
        }
        StoreError::UniqueViolation { field } => Ok(ConcurrencyError::Conflict { field }),
        other => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_roundtrip() {
        let version = Version(42);
        let etag = version.to_etag();
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(Version::from_etag(&etag), Some(version));
    }

    #[test]
    fn test_unquoted_etag_accepted() {
        let etag = Version(7).to_etag();
        let bare = etag.trim_matches('"');
        assert_eq!(Version::from_etag(bare), Some(Version(7)));
    }

    #[test]
    fn test_weak_and_garbage_rejected() {
        let weak = format!("W/{}", Version(1).to_etag());
        assert_eq!(Version::from_etag(&weak), None);
        assert_eq!(Version::from_etag("\"not base64!\""), None);
        // Valid base64 but the wrong width.
        assert_eq!(Version::from_etag("\"AAAA\""), None);
    }

    #[test]
    fn test_missing_precondition() {
        assert!(matches!(
            Precondition::from_if_match(None),
            Err(ConcurrencyError::PreconditionRequired)
        ));
        assert!(matches!(
            Precondition::from_if_match(Some("  ")),
            Err(ConcurrencyError::PreconditionRequired)
        ));
    }

    #[test]
    fn test_malformed_precondition() {
        assert!(matches!(
            Precondition::from_if_match(Some("\"???\"")),
            Err(ConcurrencyError::MalformedPrecondition)
        ));
    }

    #[test]
    fn test_wildcard_always_passes() {
        let pre = Precondition::from_if_match(Some("*")).unwrap();
        assert_eq!(pre, Precondition::Any);
        assert!(pre.check(Version(99)).is_ok());
        assert_eq!(pre.expected(), None);
    }

    #[test]
    fn test_mismatch_reports_current() {
        let pre = Precondition::from_if_match(Some(&Version(1).to_etag())).unwrap();
        assert!(pre.check(Version(1)).is_ok());
        match pre.check(Version(2)) {
            Err(ConcurrencyError::PreconditionFailed { current }) => assert_eq!(current, Version(2)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_not_modified() {
        let current = Version(5);
        assert!(is_not_modified(Some(&current.to_etag()), current));
        assert!(is_not_modified(Some("*"), current));
        assert!(!is_not_modified(Some(&Version(4).to_etag()), current));
        assert!(!is_not_modified(None, current));
        let list = format!("{}, {}", Version(4).to_etag(), current.to_etag());
        assert!(is_not_modified(Some(&list), current));
    }

    #[test]
    fn test_translate_store_errors() {
        let translated = translate_store_error(StoreError::VersionMismatch { current: Version(3) });
        assert!(matches!(
            translated,
            Ok(ConcurrencyError::PreconditionFailed { current: Version(3) })
        ));

        let translated = translate_store_error(StoreError::UniqueViolation { field: "email" });
        assert!(matches!(translated, Ok(ConcurrencyError::Conflict { field: "email" })));

        let translated = translate_store_error(StoreError::Database("down".into()));
        assert!(matches!(translated, Err(StoreError::Database(_))));
    }
}
