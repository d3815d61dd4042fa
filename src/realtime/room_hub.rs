//! Room Hub
//!
//! Presence, location sharing and the moderation actions available to
//! players inside a room.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::authz::{Authorizer, Permissions, Requirement, Role};
use crate::core::{RoomId, UserId};
use crate::realtime::hub::{HasRoomId, Hub, HubError, HubMethod, InvocationContext};
use crate::realtime::presence::{deliver, PresenceRegistry};
use crate::realtime::protocol::ServerMessage;
use crate::store::async_trait;

/// Hub name.
pub const ROOM_HUB: &str = "rooms";

/// Event names pushed to room members.
pub mod events {
    /// A member came online or went offline.
    pub const PRESENCE: &str = "presence";
    /// A member reported a position.
    pub const LOCATION: &str = "location";
    /// A member was tagged.
    pub const TAGGED: &str = "tagged";
    /// Sent to the connections of a kicked member.
    pub const KICKED: &str = "kicked";
}

/// Build the room hub. Every method requires membership.
pub fn room_hub(authorizer: Authorizer, presence: PresenceRegistry) -> Hub {
    Hub::new(ROOM_HUB, authorizer.clone(), vec![Requirement::Member])
        .register(JoinRoom(presence.clone()))
        .register(LeaveRoom(presence.clone()))
        .register(UpdateLocation(presence.clone()))
        .register(TagPlayer(presence.clone()))
        .register(KickPlayer {
            presence,
            authorizer: authorizer.clone(),
        })
}

/// `presence` event frame.
pub fn presence_event(room_id: RoomId, user_id: UserId, online: bool) -> ServerMessage {
    ServerMessage::event(
        events::PRESENCE,
        json!({ "roomId": room_id, "userId": user_id, "online": online }),
    )
}

/// Drop every connection of `target` from the room, tell those connections
/// they were kicked and tell the room they went offline. Returns how many
/// connections were removed.
pub async fn evict_user(
    presence: &PresenceRegistry,
    room_id: RoomId,
    target: UserId,
    by: UserId,
) -> usize {
    let removed = presence.remove_user(room_id, target).await;
    let kicked = ServerMessage::event(events::KICKED, json!({ "roomId": room_id, "by": by }));
    for outbox in &removed {
        deliver(outbox, kicked.clone());
    }
    if !removed.is_empty() {
        presence
            .broadcast(room_id, presence_event(room_id, target, false))
            .await;
    }
    removed.len()
}

// =============================================================================
// ARGUMENTS
// =============================================================================

/// A position report.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    /// Room to share with.
    pub room_id: RoomId,
    /// Degrees, -90 to 90.
    pub latitude: f64,
    /// Degrees, -180 to 180.
    pub longitude: f64,
}

impl HasRoomId for LocationUpdate {
    fn room_id(&self) -> RoomId {
        self.room_id
    }
}

impl LocationUpdate {
    fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// An action aimed at another player in the room.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerAction {
    /// Room of both players.
    pub room_id: RoomId,
    /// Player acted on.
    pub target_user_id: UserId,
}

impl HasRoomId for PlayerAction {
    fn room_id(&self) -> RoomId {
        self.room_id
    }
}

// =============================================================================
// METHODS
// =============================================================================

/// `join_room(roomId)`
pub struct JoinRoom(PresenceRegistry);

#[async_trait]
impl HubMethod for JoinRoom {
    type Args = RoomId;

    fn name(&self) -> &'static str {
        "join_room"
    }

    async fn invoke(&self, ctx: &InvocationContext, _: RoomId) -> Result<Option<Value>, HubError> {
        if self.0.join(ctx.room_id, ctx.connection_id, ctx.user_id).await {
            self.0
                .broadcast(ctx.room_id, presence_event(ctx.room_id, ctx.user_id, true))
                .await;
        }
        let online = self.0.online(ctx.room_id).await;
        Ok(Some(json!({ "roomId": ctx.room_id, "online": online })))
    }
}

/// `leave_room(roomId)`
pub struct LeaveRoom(PresenceRegistry);

#[async_trait]
impl HubMethod for LeaveRoom {
    type Args = RoomId;

    fn name(&self) -> &'static str {
        "leave_room"
    }

    async fn invoke(&self, ctx: &InvocationContext, _: RoomId) -> Result<Option<Value>, HubError> {
        if self.0.leave(ctx.room_id, ctx.connection_id).await.is_some() {
            self.0
                .broadcast(ctx.room_id, presence_event(ctx.room_id, ctx.user_id, false))
                .await;
        }
        Ok(None)
    }
}

/// `update_location({roomId, latitude, longitude})`
pub struct UpdateLocation(PresenceRegistry);

#[async_trait]
impl HubMethod for UpdateLocation {
    type Args = LocationUpdate;

    fn name(&self) -> &'static str {
        "update_location"
    }

    async fn invoke(
        &self,
        ctx: &InvocationContext,
        update: LocationUpdate,
    ) -> Result<Option<Value>, HubError> {
        if !update.is_valid() {
            return Err(HubError::InvalidArguments("coordinates out of range".into()));
        }
        let event = ServerMessage::event(
            events::LOCATION,
            json!({
                "roomId": ctx.room_id,
                "userId": ctx.user_id,
                "latitude": update.latitude,
                "longitude": update.longitude,
            }),
        );
        self.0.broadcast(ctx.room_id, event).await;
        Ok(None)
    }
}

/// `tag_player({roomId, targetUserId})`
pub struct TagPlayer(PresenceRegistry);

#[async_trait]
impl HubMethod for TagPlayer {
    type Args = PlayerAction;

    fn name(&self) -> &'static str {
        "tag_player"
    }

    fn requirements(&self) -> &[Requirement] {
        &[Requirement::Permission(Permissions::TAG)]
    }

    async fn invoke(
        &self,
        ctx: &InvocationContext,
        action: PlayerAction,
    ) -> Result<Option<Value>, HubError> {
        if action.target_user_id == ctx.user_id {
            return Err(HubError::InvalidArguments("cannot tag yourself".into()));
        }
        let event = ServerMessage::event(
            events::TAGGED,
            json!({
                "roomId": ctx.room_id,
                "taggerId": ctx.user_id,
                "targetUserId": action.target_user_id,
            }),
        );
        self.0.broadcast(ctx.room_id, event).await;
        Ok(None)
    }
}

/// `kick_player({roomId, targetUserId})`. The caller must also outrank the
/// target.
pub struct KickPlayer {
    presence: PresenceRegistry,
    authorizer: Authorizer,
}

#[async_trait]
impl HubMethod for KickPlayer {
    type Args = PlayerAction;

    fn name(&self) -> &'static str {
        "kick_player"
    }

    fn requirements(&self) -> &[Requirement] {
        &[Requirement::Role(Role::Moderator)]
    }

    async fn invoke(
        &self,
        ctx: &InvocationContext,
        action: PlayerAction,
    ) -> Result<Option<Value>, HubError> {
        let target = action.target_user_id;
        self.authorizer
            .moderation_target(&ctx.membership, target)
            .await?;
        let removed = evict_user(&self.presence, ctx.room_id, target, ctx.user_id).await;
        Ok(Some(json!({ "removed": removed })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::{Membership, MembershipResolver};
    use crate::realtime::hub::Caller;
    use crate::realtime::protocol::{ErrorCode, Invocation};
    use crate::store::{MembershipStore, MemoryStore};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Room {
        hub: Hub,
        presence: PresenceRegistry,
        store: Arc<MemoryStore>,
        room_id: RoomId,
    }

    async fn room() -> Room {
        let store = Arc::new(MemoryStore::new());
        let presence = PresenceRegistry::new();
        let authorizer = Authorizer::new(MembershipResolver::new(store.clone()));
        Room {
            hub: room_hub(authorizer, presence.clone()),
            presence,
            store,
            room_id: RoomId::new(),
        }
    }

    impl Room {
        async fn member(
            &self,
            connection_id: u64,
            role: Role,
            permissions: Permissions,
        ) -> (Caller, mpsc::Receiver<ServerMessage>) {
            let user_id = UserId::new();
            self.store
                .upsert_membership(Membership::new(user_id, self.room_id, role, permissions))
                .await
                .unwrap();
            let (tx, rx) = mpsc::channel(16);
            self.presence.connect(connection_id, Some(user_id), tx).await;
            (
                Caller {
                    connection_id,
                    user_id: Some(user_id),
                },
                rx,
            )
        }

        async fn call(&self, caller: Caller, method: &str, arg: Value) -> Result<Option<Value>, HubError> {
            let invocation = Invocation {
                invocation_id: "1".into(),
                method: method.into(),
                arguments: vec![arg],
            };
            self.hub.invoke(caller, &invocation).await
        }
    }

    fn event_name(msg: ServerMessage) -> String {
        match msg {
            ServerMessage::Event(event) => event.name,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_broadcasts_presence() {
        let room = room().await;
        let (alice, mut alice_rx) = room.member(1, Role::Player, Permissions::empty()).await;
        let (bob, _bob_rx) = room.member(2, Role::Player, Permissions::empty()).await;

        room.call(alice, "join_room", json!(room.room_id)).await.unwrap();
        assert_eq!(event_name(alice_rx.recv().await.unwrap()), events::PRESENCE);

        let result = room.call(bob, "join_room", json!(room.room_id)).await.unwrap();
        assert_eq!(event_name(alice_rx.recv().await.unwrap()), events::PRESENCE);
        assert_eq!(result.unwrap()["online"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_location_fan_out() {
        let room = room().await;
        let (alice, mut alice_rx) = room.member(1, Role::Player, Permissions::empty()).await;
        room.call(alice, "join_room", json!(room.room_id)).await.unwrap();
        alice_rx.recv().await.unwrap();

        let update = json!({ "roomId": room.room_id, "latitude": 51.5, "longitude": -0.12 });
        room.call(alice, "update_location", update).await.unwrap();
        match alice_rx.recv().await.unwrap() {
            ServerMessage::Event(event) => {
                assert_eq!(event.name, events::LOCATION);
                assert_eq!(event.payload["latitude"], 51.5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_location_range_checked() {
        let room = room().await;
        let (alice, _rx) = room.member(1, Role::Player, Permissions::empty()).await;
        let update = json!({ "roomId": room.room_id, "latitude": 91.0, "longitude": 0.0 });
        let err = room.call(alice, "update_location", update).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArguments);
    }

    #[tokio::test]
    async fn test_tag_requires_permission() {
        let room = room().await;
        let (plain, _a) = room.member(1, Role::Owner, Permissions::empty()).await;
        let (tagger, _b) = room.member(2, Role::Player, Permissions::TAG).await;
        let target = json!({ "roomId": room.room_id, "targetUserId": UserId::new() });

        let err = room.call(plain, "tag_player", target.clone()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingPermission);
        assert!(room.call(tagger, "tag_player", target).await.is_ok());
    }

    #[tokio::test]
    async fn test_kick_requires_moderator_and_drops_presence() {
        let room = room().await;
        let (player, mut player_rx) = room.member(1, Role::Player, Permissions::KICK).await;
        let (moderator, _m) = room.member(2, Role::Moderator, Permissions::empty()).await;
        room.call(player, "join_room", json!(room.room_id)).await.unwrap();
        player_rx.recv().await.unwrap();

        let kick_moderator = json!({ "roomId": room.room_id, "targetUserId": moderator.user_id });
        let err = room.call(player, "kick_player", kick_moderator).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingPermission);

        let kick_player = json!({ "roomId": room.room_id, "targetUserId": player.user_id });
        let result = room.call(moderator, "kick_player", kick_player).await.unwrap();
        assert_eq!(result.unwrap()["removed"], 1);
        assert_eq!(event_name(player_rx.recv().await.unwrap()), events::KICKED);
        assert!(!room.presence.is_present(room.room_id, player.connection_id).await);
    }

    #[tokio::test]
    async fn test_kick_needs_higher_rank_than_target() {
        let room = room().await;
        let (owner, mut owner_rx) = room.member(1, Role::Owner, Permissions::empty()).await;
        let (moderator, _m) = room.member(2, Role::Moderator, Permissions::empty()).await;
        let (peer, _p) = room.member(3, Role::Moderator, Permissions::empty()).await;
        room.call(owner, "join_room", json!(room.room_id)).await.unwrap();
        owner_rx.recv().await.unwrap();

        for target in [owner, peer] {
            let kick = json!({ "roomId": room.room_id, "targetUserId": target.user_id });
            let err = room.call(moderator, "kick_player", kick).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::MissingPermission);
        }
        assert!(room.presence.is_present(room.room_id, owner.connection_id).await);

        let kick = json!({ "roomId": room.room_id, "targetUserId": moderator.user_id });
        assert!(room.call(owner, "kick_player", kick).await.is_ok());
    }

    #[tokio::test]
    async fn test_leave_room() {
        let room = room().await;
        let (alice, mut rx) = room.member(1, Role::Player, Permissions::empty()).await;
        room.call(alice, "join_room", json!(room.room_id)).await.unwrap();
        rx.recv().await.unwrap();

        room.call(alice, "leave_room", json!(room.room_id)).await.unwrap();
        assert!(room.presence.online(room.room_id).await.is_empty());
    }
}
