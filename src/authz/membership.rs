//! Room Membership
//!
//! Role hierarchy, permission bits and the per-call membership resolver.
//! Memberships are owned by room management; this module only reads them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::Arc;
use tracing::debug;

use crate::core::{RoomId, UserId};
use crate::store::{MembershipStore, StoreError};

/// Room role. Higher roles satisfy every requirement of lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Created the room.
    Owner,
    /// Trusted to moderate.
    Moderator,
    /// Regular participant.
    Player,
}

impl Role {
    /// All roles, highest first.
    pub const ALL: [Role; 3] = [Role::Owner, Role::Moderator, Role::Player];

    fn rank(self) -> u8 {
        match self {
            Role::Owner => 2,
            Role::Moderator => 1,
            Role::Player => 0,
        }
    }

    /// Whether holding `self` meets a requirement for `required`.
    #[inline]
    pub fn satisfies(self, required: Role) -> bool {
        self.rank() >= required.rank()
    }

    /// Strictly higher than `other`. Moderation actions need this against
    /// their target.
    #[inline]
    pub fn outranks(self, other: Role) -> bool {
        self.rank() > other.rank()
    }

    /// Storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Moderator => "moderator",
            Role::Player => "player",
        }
    }

    /// Parse a storage name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "owner" => Some(Role::Owner),
            "moderator" => Some(Role::Moderator),
            "player" => Some(Role::Player),
            _ => None,
        }
    }
}

/// Room permission bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u32);

impl Permissions {
    /// Start a game round.
    pub const START_GAME: Permissions = Permissions(1 << 0);
    /// Change room settings.
    pub const EDIT_SETTINGS: Permissions = Permissions(1 << 1);
    /// Tag another player.
    pub const TAG: Permissions = Permissions(1 << 2);
    /// Remove a player from the room.
    pub const KICK: Permissions = Permissions(1 << 3);
    /// Invite new players.
    pub const INVITE: Permissions = Permissions(1 << 4);

    /// No permissions.
    pub const fn empty() -> Self {
        Permissions(0)
    }

    /// Wrap raw bits, keeping unknown ones.
    pub const fn from_bits_retain(bits: u32) -> Self {
        Permissions(bits)
    }

    /// Raw bits.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Containment: every bit of `required` is set here.
    #[inline]
    pub const fn contains(&self, required: Permissions) -> bool {
        self.0 & required.0 == required.0
    }

    /// True when no bits are set.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Permissions(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permissions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Permissions {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Permissions(self.0 & rhs.0)
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Permissions, &str); 5] = [
            (Permissions::START_GAME, "START_GAME"),
            (Permissions::EDIT_SETTINGS, "EDIT_SETTINGS"),
            (Permissions::TAG, "TAG"),
            (Permissions::KICK, "KICK"),
            (Permissions::INVITE, "INVITE"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

/// A user's standing in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    /// Member.
    pub user_id: UserId,
    /// Room.
    pub room_id: RoomId,
    /// Role in the room.
    pub role: Role,
    /// Granted permissions.
    pub permissions: Permissions,
    /// Banned members keep their row but fail every check.
    pub banned: bool,
}

impl Membership {
    /// Convenience constructor for an unbanned member.
    pub fn new(user_id: UserId, room_id: RoomId, role: Role, permissions: Permissions) -> Self {
        Self {
            user_id,
            room_id,
            role,
            permissions,
            banned: false,
        }
    }
}

/// Loads memberships from storage. Holds no cache of its own; see
/// [`MembershipScope`] for per-call reuse.
#[derive(Clone)]
pub struct MembershipResolver {
    store: Arc<dyn MembershipStore>,
}

impl MembershipResolver {
    /// Create a resolver over the given store.
    pub fn new(store: Arc<dyn MembershipStore>) -> Self {
        Self { store }
    }

    /// Single storage read.
    pub async fn resolve(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Option<Membership>, StoreError> {
        let membership = self.store.find_membership(user_id, room_id).await?;
        debug!(%user_id, %room_id, found = membership.is_some(), "membership resolved");
        Ok(membership)
    }

    /// Start a call scope for one (user, room) pair.
    pub fn scope(&self, user_id: UserId, room_id: RoomId) -> MembershipScope {
        MembershipScope {
            resolver: self.clone(),
            user_id,
            room_id,
            loaded: None,
        }
    }
}

/// Membership cache that lives exactly as long as one request or invocation.
pub struct MembershipScope {
    resolver: MembershipResolver,
    user_id: UserId,
    room_id: RoomId,
    loaded: Option<Option<Membership>>,
}

impl MembershipScope {
    /// Resolve on first use, then answer from the scope.
    pub async fn get(&mut self) -> Result<Option<&Membership>, StoreError> {
        if self.loaded.is_none() {
            let membership = self.resolver.resolve(self.user_id, self.room_id).await?;
            self.loaded = Some(membership);
        }
        Ok(self.loaded.as_ref().and_then(Option::as_ref))
    }

    /// Consume the scope, keeping whatever was resolved.
    pub fn into_inner(self) -> Option<Membership> {
        self.loaded.flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use proptest::prelude::*;

    fn any_role() -> impl Strategy<Value = Role> {
        prop_oneof![Just(Role::Owner), Just(Role::Moderator), Just(Role::Player)]
    }

    #[test]
    fn test_owner_satisfies_everything() {
        for required in Role::ALL {
            assert!(Role::Owner.satisfies(required));
        }
    }

    #[test]
    fn test_outranks_is_strict() {
        assert!(Role::Owner.outranks(Role::Moderator));
        assert!(Role::Moderator.outranks(Role::Player));
        assert!(!Role::Moderator.outranks(Role::Moderator));
        assert!(!Role::Moderator.outranks(Role::Owner));
        assert!(!Role::Player.outranks(Role::Player));
    }

    #[test]
    fn test_moderator_hierarchy() {
        assert!(Role::Moderator.satisfies(Role::Moderator));
        assert!(Role::Moderator.satisfies(Role::Player));
        assert!(!Role::Moderator.satisfies(Role::Owner));
    }

    #[test]
    fn test_player_only_satisfies_player() {
        assert!(Role::Player.satisfies(Role::Player));
        assert!(!Role::Player.satisfies(Role::Moderator));
        assert!(!Role::Player.satisfies(Role::Owner));
    }

    #[test]
    fn test_role_names_roundtrip() {
        for role in Role::ALL {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("admin"), None);
    }

    #[test]
    fn test_permission_containment() {
        let mask = Permissions::START_GAME | Permissions::EDIT_SETTINGS;
        assert!(mask.contains(Permissions::START_GAME));
        assert!(mask.contains(Permissions::START_GAME | Permissions::EDIT_SETTINGS));
        assert!(!mask.contains(Permissions::START_GAME | Permissions::TAG));
        assert!(!Permissions::TAG.contains(Permissions::START_GAME));
    }

    #[test]
    fn test_unknown_bits_retained() {
        let mask = Permissions::from_bits_retain(0x8000_0001);
        assert_eq!(mask.bits(), 0x8000_0001);
        assert!(mask.contains(Permissions::START_GAME));
    }

    #[test]
    fn test_permissions_debug_lists_names() {
        let printed = format!("{:?}", Permissions::TAG | Permissions::KICK);
        assert!(printed.contains("TAG"));
        assert!(printed.contains("KICK"));
    }

    #[tokio::test]
    async fn test_scope_caches_absent_membership() {
        let store = Arc::new(MemoryStore::new());
        let resolver = MembershipResolver::new(store);
        let mut scope = resolver.scope(UserId::new(), RoomId::new());

        assert!(scope.get().await.unwrap().is_none());
        assert!(scope.get().await.unwrap().is_none());
        assert!(scope.into_inner().is_none());
    }

    #[tokio::test]
    async fn test_scope_returns_member() {
        let store = Arc::new(MemoryStore::new());
        let user = UserId::new();
        let room = RoomId::new();
        store
            .upsert_membership(Membership::new(user, room, Role::Player, Permissions::TAG))
            .await
            .unwrap();

        let resolver = MembershipResolver::new(store);
        let mut scope = resolver.scope(user, room);
        let found = scope.get().await.unwrap().cloned().unwrap();
        assert_eq!(found.role, Role::Player);
    }

    proptest! {
        #[test]
        fn prop_role_hierarchy_reflexive(role in any_role()) {
            prop_assert!(role.satisfies(role));
        }

        #[test]
        fn prop_role_hierarchy_transitive(a in any_role(), b in any_role(), c in any_role()) {
            if a.satisfies(b) && b.satisfies(c) {
                prop_assert!(a.satisfies(c));
            }
        }

        #[test]
        fn prop_union_contains_parts(a in any::<u32>(), b in any::<u32>()) {
            let union = Permissions::from_bits_retain(a) | Permissions::from_bits_retain(b);
            prop_assert!(union.contains(Permissions::from_bits_retain(a)));
            prop_assert!(union.contains(Permissions::from_bits_retain(b)));
        }
    }
}
