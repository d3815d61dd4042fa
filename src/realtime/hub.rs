//! Hub Dispatch
//!
//! Routes invocations to registered methods. Every invocation passes the
//! same filter before its method runs:
//!
//! ```text
//!   identity? ──▶ room id from first argument ──▶ membership (one read)
//!       │                    │                           │
//!   auth.invalid_token   auth.room_id_missing     auth.not_member / auth.banned
//!                                                        │
//!                     hub + method requirements ──▶ InvocationContext ──▶ method
//!                                │
//!                     auth.missing_permission
//! ```

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error};

use crate::authz::{
    Authorizer, CallContext, Membership, RealtimeCallContext, Requirement,
};
use crate::core::{RoomId, UserId};
use crate::error::AuthzError;
use crate::realtime::presence::ConnectionId;
use crate::realtime::protocol::{ErrorCode, Invocation};
use crate::store::{async_trait, StoreError};

/// Arguments that name the room an invocation targets.
pub trait HasRoomId {
    /// The targeted room.
    fn room_id(&self) -> RoomId;
}

impl HasRoomId for RoomId {
    fn room_id(&self) -> RoomId {
        *self
    }
}

/// Best-effort room lookup on an argument that failed typed parsing:
/// a bare room id string, or an object with a `roomId` field.
pub fn room_ref(arg: &Value) -> Option<RoomId> {
    match arg {
        Value::String(raw) => raw.parse().ok(),
        Value::Object(map) => map.get("roomId")?.as_str()?.parse().ok(),
        _ => None,
    }
}

/// Invocation failures.
#[derive(Debug, Error)]
pub enum HubError {
    /// No method registered under the name.
    #[error("unknown method {0}")]
    UnknownMethod(String),

    /// Arguments missing or the wrong shape.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Authorization failed.
    #[error(transparent)]
    Denied(#[from] AuthzError),

    /// Storage failed inside the method.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HubError {
    /// Wire code.
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::UnknownMethod(_) => ErrorCode::UnknownMethod,
            HubError::InvalidArguments(_) => ErrorCode::InvalidArguments,
            HubError::Denied(denied) => ErrorCode::from(denied),
            HubError::Store(_) => ErrorCode::InternalError,
        }
    }

    fn is_internal(&self) -> bool {
        matches!(self, HubError::Store(_) | HubError::Denied(AuthzError::Store(_)))
    }
}

/// Who is calling.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    /// Connection the frame arrived on.
    pub connection_id: ConnectionId,
    /// Identity bound to the connection, if any.
    pub user_id: Option<UserId>,
}

/// Call-scoped facts established by the filter, handed to the method.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Calling connection.
    pub connection_id: ConnectionId,
    /// Authenticated caller.
    pub user_id: UserId,
    /// Room from the first argument.
    pub room_id: RoomId,
    /// Caller's membership in that room.
    pub membership: Membership,
}

/// A room-scoped hub method.
#[async_trait]
pub trait HubMethod: Send + Sync + 'static {
    /// Parsed from the first invocation argument.
    type Args: DeserializeOwned + HasRoomId + Send;

    /// Wire name.
    fn name(&self) -> &'static str;

    /// Requirements on top of the hub's own.
    fn requirements(&self) -> &[Requirement] {
        &[]
    }

    /// Run the method for an authorized caller.
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        args: Self::Args,
    ) -> Result<Option<Value>, HubError>;
}

#[async_trait]
trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        hub: &Hub,
        caller: Caller,
        invocation: &Invocation,
    ) -> Result<Option<Value>, HubError>;
}

struct Registered<M>(M);

#[async_trait]
impl<M: HubMethod> Dispatch for Registered<M> {
    async fn dispatch(
        &self,
        hub: &Hub,
        caller: Caller,
        invocation: &Invocation,
    ) -> Result<Option<Value>, HubError> {
        let first = invocation.arguments.first();
        let parsed = first.map(|arg| serde_json::from_value::<M::Args>(arg.clone()));
        let room_id = match &parsed {
            Some(Ok(args)) => Some(args.room_id()),
            _ => first.and_then(room_ref),
        };

        let ctx = CallContext::Realtime(RealtimeCallContext {
            connection_id: caller.connection_id,
            user_id: caller.user_id,
            room_id,
            method: invocation.method.clone(),
        });
        let requirements: Vec<Requirement> = hub
            .requirements
            .iter()
            .chain(self.0.requirements())
            .copied()
            .collect();
        let call = hub.authorizer.authorize(&ctx, &requirements).await?;

        let args = match parsed {
            Some(Ok(args)) => args,
            Some(Err(e)) => return Err(HubError::InvalidArguments(e.to_string())),
            None => return Err(HubError::InvalidArguments("no arguments".into())),
        };

        let invocation_ctx = InvocationContext {
            connection_id: caller.connection_id,
            user_id: call.user_id,
            room_id: call.room_id,
            membership: call.membership,
        };
        self.0.invoke(&invocation_ctx, args).await
    }
}

/// A named set of methods sharing hub-level requirements.
pub struct Hub {
    name: &'static str,
    authorizer: Authorizer,
    requirements: Vec<Requirement>,
    methods: BTreeMap<&'static str, Box<dyn Dispatch>>,
}

impl Hub {
    /// Create a hub whose every method also requires `requirements`.
    pub fn new(name: &'static str, authorizer: Authorizer, requirements: Vec<Requirement>) -> Self {
        Self {
            name,
            authorizer,
            requirements,
            methods: BTreeMap::new(),
        }
    }

    /// Register a method.
    pub fn register<M: HubMethod>(mut self, method: M) -> Self {
        self.methods.insert(method.name(), Box::new(Registered(method)));
        self
    }

    /// Hub name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Registered method names.
    pub fn methods(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.keys().copied()
    }

    /// Run the filter and, if it passes, the method.
    pub async fn invoke(
        &self,
        caller: Caller,
        invocation: &Invocation,
    ) -> Result<Option<Value>, HubError> {
        if caller.user_id.is_none() {
            debug!(hub = self.name, method = %invocation.method, "anonymous invocation");
            return Err(HubError::Denied(AuthzError::Unauthenticated));
        }
        let Some(method) = self.methods.get(invocation.method.as_str()) else {
            debug!(hub = self.name, method = %invocation.method, "unknown method");
            return Err(HubError::UnknownMethod(invocation.method.clone()));
        };

        let result = method.dispatch(self, caller, invocation).await;
        if let Err(e) = &result {
            if e.is_internal() {
                error!(hub = self.name, method = %invocation.method, error = %e, "invocation failed");
            } else {
                debug!(hub = self.name, method = %invocation.method, code = e.code().as_str(), "invocation rejected");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{MembershipResolver, Permissions, Role};
    use crate::store::{MembershipStore, MemoryStore};
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct EchoArgs {
        room_id: RoomId,
        text: String,
    }

    impl HasRoomId for EchoArgs {
        fn room_id(&self) -> RoomId {
            self.room_id
        }
    }

    struct Echo;

    #[async_trait]
    impl HubMethod for Echo {
        type Args = EchoArgs;

        fn name(&self) -> &'static str {
            "echo"
        }

        async fn invoke(
            &self,
            ctx: &InvocationContext,
            args: EchoArgs,
        ) -> Result<Option<Value>, HubError> {
            Ok(Some(json!({ "text": args.text, "role": ctx.membership.role })))
        }
    }

    struct StartGame;

    #[async_trait]
    impl HubMethod for StartGame {
        type Args = RoomId;

        fn name(&self) -> &'static str {
            "start_game"
        }

        fn requirements(&self) -> &[Requirement] {
            &[Requirement::Permission(Permissions::START_GAME)]
        }

        async fn invoke(&self, _: &InvocationContext, _: RoomId) -> Result<Option<Value>, HubError> {
            Ok(None)
        }
    }

    async fn hub_with(membership: Option<Membership>) -> (Hub, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        if let Some(m) = membership {
            store.upsert_membership(m).await.unwrap();
        }
        let authorizer = Authorizer::new(MembershipResolver::new(store.clone()));
        let hub = Hub::new("test", authorizer, vec![Requirement::Member])
            .register(Echo)
            .register(StartGame);
        (hub, store)
    }

    fn invocation(method: &str, arguments: Vec<Value>) -> Invocation {
        Invocation {
            invocation_id: "1".into(),
            method: method.into(),
            arguments,
        }
    }

    fn caller(user_id: Option<UserId>) -> Caller {
        Caller {
            connection_id: 1,
            user_id,
        }
    }

    #[test]
    fn test_room_ref_shapes() {
        let room = RoomId::new();
        assert_eq!(room_ref(&json!(room.to_string())), Some(room));
        assert_eq!(room_ref(&json!({ "roomId": room.to_string() })), Some(room));
        assert_eq!(room_ref(&json!({ "room": room.to_string() })), None);
        assert_eq!(room_ref(&json!(42)), None);
    }

    #[tokio::test]
    async fn test_member_invokes() {
        let m = Membership::new(UserId::new(), RoomId::new(), Role::Player, Permissions::empty());
        let (hub, _) = hub_with(Some(m.clone())).await;

        let result = hub
            .invoke(
                caller(Some(m.user_id)),
                &invocation("echo", vec![json!({ "roomId": m.room_id, "text": "hi" })]),
            )
            .await
            .unwrap();
        assert_eq!(result, Some(json!({ "text": "hi", "role": "player" })));
    }

    #[tokio::test]
    async fn test_unauthenticated_rejected_first() {
        let (hub, _) = hub_with(None).await;
        let err = hub
            .invoke(caller(None), &invocation("echo", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidToken);
    }

    #[tokio::test]
    async fn test_anonymous_unknown_method_is_invalid_token() {
        let (hub, _) = hub_with(None).await;
        let err = hub
            .invoke(caller(None), &invocation("no_such_method", vec![json!(RoomId::new())]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidToken);

        let err = hub
            .invoke(caller(Some(UserId::new())), &invocation("no_such_method", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownMethod);
    }

    #[tokio::test]
    async fn test_missing_room() {
        let (hub, _) = hub_with(None).await;
        let err = hub
            .invoke(caller(Some(UserId::new())), &invocation("echo", vec![json!({ "text": "hi" })]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomIdMissing);

        let err = hub
            .invoke(caller(Some(UserId::new())), &invocation("echo", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RoomIdMissing);
    }

    #[tokio::test]
    async fn test_non_member_denied_before_argument_validation() {
        let (hub, _) = hub_with(None).await;
        let room = RoomId::new();
        let err = hub
            .invoke(
                caller(Some(UserId::new())),
                &invocation("echo", vec![json!({ "roomId": room })]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotMember);
    }

    #[tokio::test]
    async fn test_member_with_bad_arguments() {
        let m = Membership::new(UserId::new(), RoomId::new(), Role::Player, Permissions::empty());
        let (hub, _) = hub_with(Some(m.clone())).await;
        let err = hub
            .invoke(
                caller(Some(m.user_id)),
                &invocation("echo", vec![json!({ "roomId": m.room_id })]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArguments);
    }

    #[tokio::test]
    async fn test_banned() {
        let m = Membership::new(UserId::new(), RoomId::new(), Role::Owner, Permissions::START_GAME);
        let (hub, store) = hub_with(Some(m.clone())).await;
        store.set_banned(m.user_id, m.room_id, true).await.unwrap();

        let err = hub
            .invoke(caller(Some(m.user_id)), &invocation("start_game", vec![json!(m.room_id)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Banned);
    }

    #[tokio::test]
    async fn test_method_requirement_combined_with_hub() {
        let m = Membership::new(UserId::new(), RoomId::new(), Role::Player, Permissions::TAG);
        let (hub, _) = hub_with(Some(m.clone())).await;
        let err = hub
            .invoke(caller(Some(m.user_id)), &invocation("start_game", vec![json!(m.room_id)]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingPermission);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (hub, _) = hub_with(None).await;
        let err = hub
            .invoke(caller(Some(UserId::new())), &invocation("nope", vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownMethod);
        assert_eq!(hub.methods().collect::<Vec<_>>(), vec!["echo", "start_game"]);
    }
}
