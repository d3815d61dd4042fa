//! Real-time transport.
//!
//! - `protocol`: JSON frames exchanged over the socket
//! - `hub`: method registry and the per-invocation authorization filter
//! - `room_hub`: presence, location and moderation methods
//! - `presence`: which connections are in which rooms
//! - `server`: WebSocket accept loop and connection tasks

pub mod hub;
pub mod presence;
pub mod protocol;
pub mod room_hub;
pub mod server;

pub use hub::{Caller, HasRoomId, Hub, HubError, HubMethod, InvocationContext};
pub use presence::{ConnectionId, PresenceRegistry};
pub use protocol::{ClientMessage, ErrorCode, Invocation, ServerMessage};
pub use room_hub::room_hub;
pub use server::{RealtimeError, RealtimeServer};
