//! HTTP API
//!
//! JSON endpoints under `/api/v1`. Errors are rendered as problem documents
//! by [`ApiError`].

pub mod auth;
pub mod extract;
pub mod problem;
pub mod rooms;
pub mod users;

use std::future::Future;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use crate::state::AppState;

pub use extract::{AuthUser, Authorized, MemberPolicy, ModeratorPolicy, RoomPolicy};
pub use problem::ApiError;

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/auth/initial", post(auth::initial))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/users/me", get(users::get_me).patch(users::patch_me))
        .route("/rooms/{room_id}/membership", get(rooms::membership))
        .route("/rooms/{room_id}/presence", get(rooms::presence))
        .route(
            "/rooms/{room_id}/members/{user_id}/ban",
            post(rooms::ban),
        );

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "connections": state.presence.connection_count().await,
    }))
}

/// Serve the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP API listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
