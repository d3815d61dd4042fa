//! Shared Services
//!
//! Everything a request or invocation needs, wired once at startup and
//! cloned into each transport.

use std::sync::Arc;

use crate::account::{AccountService, ProfileService};
use crate::authz::{Authorizer, MembershipResolver};
use crate::config::AuthConfig;
use crate::realtime::PresenceRegistry;
use crate::store::{MembershipStore, RefreshTokenStore, UserStore};
use crate::token::{RefreshTokenLedger, TokenIssuer};

/// Service graph shared by the HTTP and real-time adapters.
#[derive(Clone)]
pub struct AppState {
    /// Access token signing and verification.
    pub issuer: Arc<TokenIssuer>,
    /// Bootstrap, login and token lifecycle.
    pub accounts: AccountService,
    /// Profile reads and conditional writes.
    pub profiles: ProfileService,
    /// Room authorization for both transports.
    pub authorizer: Authorizer,
    /// Membership writes (bans).
    pub memberships: Arc<dyn MembershipStore>,
    /// Live real-time connections.
    pub presence: PresenceRegistry,
}

impl AppState {
    /// Wire services over a store implementing every persistence trait.
    pub fn new<S>(auth: AuthConfig, store: Arc<S>) -> Self
    where
        S: UserStore + RefreshTokenStore + MembershipStore + 'static,
    {
        Self::with_stores(auth, store.clone(), store.clone(), store)
    }

    /// Wire services over separate stores.
    pub fn with_stores(
        auth: AuthConfig,
        users: Arc<dyn UserStore>,
        tokens: Arc<dyn RefreshTokenStore>,
        memberships: Arc<dyn MembershipStore>,
    ) -> Self {
        let issuer = Arc::new(TokenIssuer::new(auth));
        let ledger = RefreshTokenLedger::new(tokens, users.clone(), issuer.clone());

        Self {
            accounts: AccountService::new(users.clone(), ledger),
            profiles: ProfileService::new(users),
            authorizer: Authorizer::new(MembershipResolver::new(memberships.clone())),
            memberships,
            presence: PresenceRegistry::new(),
            issuer,
        }
    }
}
