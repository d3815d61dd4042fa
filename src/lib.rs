//! # GeoQuest Server
//!
//! Account, token and room authorization backend for the GeoQuest
//! location game.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     GEOQUEST SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Identifiers and secret hashing            │
//! │  token/          - Access JWTs and the refresh ledger        │
//! │  ├── issuer.rs   - Mint/verify credentials                   │
//! │  └── ledger.rs   - Rotation, reuse detection, revocation     │
//! │  concurrency.rs  - Row versions, ETags, preconditions        │
//! │  authz/          - Room membership authorization             │
//! │  ├── membership.rs  - Roles, permissions, resolver           │
//! │  └── requirement.rs - Requirements and the authorizer        │
//! │  account.rs      - Device bootstrap, login, profile          │
//! │  store/          - Persistence (memory, postgres)            │
//! │                                                              │
//! │  http/           - JSON API (axum)                           │
//! │  realtime/       - WebSocket hub                             │
//! │  ├── server.rs   - Accept loop and sessions                  │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── hub.rs      - Method dispatch and authorization         │
//! │  └── presence.rs - Who is online in which room               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authorization
//!
//! HTTP routes and hub methods build a [`authz::CallContext`] and hand it to
//! the same [`authz::Authorizer`], so a given caller, room and requirement
//! set gets the same decision on either transport.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod account;
pub mod authz;
pub mod concurrency;
pub mod config;
pub mod core;
pub mod error;
pub mod http;
pub mod realtime;
pub mod state;
pub mod store;
pub mod token;

// Re-export commonly used types
pub use authz::{Authorizer, Membership, Permissions, Requirement, Role};
pub use concurrency::{Precondition, Version};
pub use config::{AuthConfig, ServerConfig};
pub use crate::core::{FamilyId, RoomId, TokenId, UserId};
pub use error::{AccountError, AuthError, AuthzError, ConcurrencyError, ValidationError};
pub use state::AppState;
pub use store::{MemoryStore, StoreError};
pub use token::{TokenIssuer, TokenPair};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
