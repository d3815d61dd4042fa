//! Room authorization.
//!
//! - `membership`: roles, permission bits, per-call membership resolution
//! - `requirement`: Member / Permission / Role rules and the transport-neutral
//!   `Authorizer`

pub mod membership;
pub mod requirement;

pub use membership::{Membership, MembershipResolver, MembershipScope, Permissions, Role};
pub use requirement::{
    AuthorizedCall, Authorizer, CallContext, HttpCallContext, RealtimeCallContext, Requirement,
};
