//! Protocol Messages
//!
//! Wire format for the real-time connection. Every frame is a JSON text
//! message tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::UserId;
use crate::error::AuthzError;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Attach an identity to the connection.
    Authenticate(AuthenticateRequest),

    /// Call a hub method.
    Invoke(Invocation),

    /// Ping for latency measurement.
    Ping {
        /// Client clock, echoed back.
        timestamp: u64,
    },
}

/// Late authentication for clients that could not set a handshake header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    /// Access JWT.
    pub access_token: String,
}

/// A hub method call. The first argument names the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    /// Client-chosen id echoed in the completion or error.
    pub invocation_id: String,
    /// Method name.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub arguments: Vec<Value>,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Identity accepted.
    Authenticated(Authenticated),

    /// An invocation finished.
    Completion(Completion),

    /// An invocation or frame was rejected.
    Error(ServerError),

    /// Room fan-out.
    Event(HubEvent),

    /// Pong response.
    Pong {
        /// Echo of the ping timestamp.
        timestamp: u64,
        /// Server clock in milliseconds.
        #[serde(rename = "serverTime")]
        server_time: u64,
    },

    /// Server is shutting down.
    Shutdown {
        /// Human-readable reason.
        reason: String,
    },
}

/// Identity accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authenticated {
    /// Bound identity.
    pub user_id: UserId,
}

/// Successful invocation result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    /// Echo of the invocation id.
    pub invocation_id: String,
    /// Method result, if it returns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Error frame. Carries a code only; details stay in server logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    /// Set when the error answers an invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    /// What went wrong.
    pub code: ErrorCode,
}

/// A named event pushed to room members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEvent {
    /// Event name.
    pub name: String,
    /// Event body.
    pub payload: Value,
}

impl HubEvent {
    /// Build an event.
    pub fn new(name: &str, payload: Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
        }
    }
}

/// Error codes. `auth.*` are authorization outcomes, `hub.*` everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No identity, or the token did not verify.
    #[serde(rename = "auth.invalid_token")]
    InvalidToken,
    /// The first argument names no room.
    #[serde(rename = "auth.room_id_missing")]
    RoomIdMissing,
    /// Caller is not in the room.
    #[serde(rename = "auth.not_member")]
    NotMember,
    /// Caller is banned from the room.
    #[serde(rename = "auth.banned")]
    Banned,
    /// Role or permission too low.
    #[serde(rename = "auth.missing_permission")]
    MissingPermission,
    /// No such method.
    #[serde(rename = "hub.unknown_method")]
    UnknownMethod,
    /// Arguments did not parse.
    #[serde(rename = "hub.invalid_arguments")]
    InvalidArguments,
    /// Server-side failure.
    #[serde(rename = "hub.internal_error")]
    InternalError,
}

impl ErrorCode {
    /// Wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "auth.invalid_token",
            ErrorCode::RoomIdMissing => "auth.room_id_missing",
            ErrorCode::NotMember => "auth.not_member",
            ErrorCode::Banned => "auth.banned",
            ErrorCode::MissingPermission => "auth.missing_permission",
            ErrorCode::UnknownMethod => "hub.unknown_method",
            ErrorCode::InvalidArguments => "hub.invalid_arguments",
            ErrorCode::InternalError => "hub.internal_error",
        }
    }
}

impl From<&AuthzError> for ErrorCode {
    fn from(err: &AuthzError) -> Self {
        match err {
            AuthzError::Unauthenticated => ErrorCode::InvalidToken,
            AuthzError::RoomIdMissing => ErrorCode::RoomIdMissing,
            AuthzError::NotMember => ErrorCode::NotMember,
            AuthzError::Banned => ErrorCode::Banned,
            AuthzError::MissingPermission | AuthzError::MissingRole => {
                ErrorCode::MissingPermission
            }
            AuthzError::Store(_) => ErrorCode::InternalError,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error frame for an invocation.
    pub fn invocation_error(invocation_id: Option<String>, code: ErrorCode) -> Self {
        ServerMessage::Error(ServerError {
            invocation_id,
            code,
        })
    }

    /// Event frame.
    pub fn event(name: &str, payload: Value) -> Self {
        ServerMessage::Event(HubEvent::new(name, payload))
    }
}
