//! Secret Hashing
//!
//! One-way digests for refresh secrets. Only the digest is ever stored;
//! lookups hash the presented secret and compare digests.

use sha2::{Sha256, Digest};

/// Digest output type (256 bits / 32 bytes)
pub type SecretDigest = [u8; 32];

/// Length of the lowercase hex encoding of a [`SecretDigest`].
pub const SECRET_HASH_HEX_LEN: usize = 64;

/// Compute the raw SHA-256 digest of a secret.
#[inline]
pub fn digest_secret(secret: &str) -> SecretDigest {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Hash a secret for storage: SHA-256, lowercase hex.
pub fn hash_secret(secret: &str) -> String {
    hex::encode(digest_secret(secret))
}

/// Check that a stored value looks like the output of [`hash_secret`].
pub fn is_secret_hash(value: &str) -> bool {
    value.len() == SECRET_HASH_HEX_LEN
        && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

// =============================================================================
// TESTS
// =============================================================================
