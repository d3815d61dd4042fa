//! GeoQuest Server
//!
//! Runs the HTTP API and the real-time hub side by side over one set of
//! shared services.

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use geoquest::{
    http,
    realtime::RealtimeServer,
    state::AppState,
    AuthConfig, MemoryStore, ServerConfig, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("GeoQuest Server v{}", VERSION);

    let auth = AuthConfig::from_env().context("loading token settings")?;
    let config = ServerConfig::from_env().context("loading server settings")?;
    info!(
        http = %config.http_addr,
        realtime = %config.realtime_addr,
        access_minutes = auth.access_token_minutes,
        refresh_days = auth.refresh_token_days,
        "Configuration loaded"
    );

    let state = build_state(auth, &config).await?;

    let realtime = Arc::new(RealtimeServer::new(config.clone(), &state));
    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding {}", config.http_addr))?;

    let (stop_http, http_stopped) = oneshot::channel::<()>();
    let mut http_task = tokio::spawn(http::serve(http_listener, state, async move {
        let _ = http_stopped.await;
    }));
    let mut realtime_task = {
        let realtime = realtime.clone();
        tokio::spawn(async move { realtime.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        result = &mut http_task => {
            error!("HTTP API stopped unexpectedly: {:?}", result);
        }
        result = &mut realtime_task => {
            error!("Real-time server stopped unexpectedly: {:?}", result);
        }
    }

    realtime.shutdown();
    let _ = stop_http.send(());

    if !http_task.is_finished() {
        http_task.await?.context("HTTP API")?;
    }
    if !realtime_task.is_finished() {
        realtime_task.await?.context("real-time server")?;
    }

    info!("Server stopped");
    Ok(())
}

/// Pick the storage backend: Postgres when configured and compiled in,
/// otherwise in-memory.
async fn build_state(auth: AuthConfig, config: &ServerConfig) -> anyhow::Result<AppState> {
    #[cfg(feature = "postgres")]
    if let Some(url) = config.database_url.as_deref() {
        use geoquest::store::{PostgresConfig, PostgresStore};

        let store = PostgresStore::connect(PostgresConfig::new(url))
            .await
            .context("connecting to Postgres")?;
        info!("Using Postgres storage");
        return Ok(AppState::new(auth, Arc::new(store)));
    }

    if config.database_url.is_some() && cfg!(not(feature = "postgres")) {
        warn!("DATABASE_URL set but the postgres feature is disabled; using memory storage");
    } else {
        info!("Using in-memory storage");
    }
    Ok(AppState::new(auth, Arc::new(MemoryStore::new())))
}
