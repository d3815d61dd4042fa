//! Core primitives.
//!
//! Identifier newtypes and secret hashing shared by every other module.

pub mod hash;
pub mod ids;

pub use hash::{hash_secret, is_secret_hash};
pub use ids::{FamilyId, RoomId, TokenId, UserId};
