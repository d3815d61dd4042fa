//! Token lifecycle.
//!
//! `issuer` mints and verifies credentials; `ledger` tracks refresh token
//! rows through rotation and revocation.

pub mod issuer;
pub mod ledger;

pub use issuer::{
    parse_bearer, AccessClaims, AccessToken, RefreshSecret, TokenError, TokenIssuer, TokenPair,
};
pub use ledger::{IssuedTokens, RefreshTokenLedger};
