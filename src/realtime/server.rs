//! WebSocket Server
//!
//! Accepts real-time connections, attaches identity from the handshake or an
//! `authenticate` frame, and routes invocations through the room hub.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::UserId;
use crate::realtime::hub::{Caller, Hub};
use crate::realtime::presence::{ConnectionId, PresenceRegistry};
use crate::realtime::protocol::{
    Authenticated, ClientMessage, Completion, ErrorCode, ServerMessage,
};
use crate::realtime::room_hub::{presence_event, room_hub};
use crate::state::AppState;
use crate::token::{parse_bearer, TokenIssuer};

/// Query parameter carrying an access token for clients that cannot set
/// handshake headers.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Real-time server errors.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

struct Shared {
    issuer: Arc<TokenIssuer>,
    hub: Hub,
    presence: PresenceRegistry,
    idle_timeout: Duration,
}

/// Per-connection state owned by its task.
struct Session {
    id: ConnectionId,
    addr: SocketAddr,
    user_id: Option<UserId>,
}

/// The real-time server.
pub struct RealtimeServer {
    config: ServerConfig,
    shared: Arc<Shared>,
    next_connection_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl RealtimeServer {
    /// Create a server over the shared services.
    pub fn new(config: ServerConfig, state: &AppState) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Shared {
            issuer: state.issuer.clone(),
            hub: room_hub(state.authorizer.clone(), state.presence.clone()),
            presence: state.presence.clone(),
            idle_timeout: config.idle_timeout,
        };

        Self {
            config,
            shared: Arc::new(shared),
            next_connection_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), RealtimeError> {
        let listener = TcpListener::bind(self.config.realtime_addr).await?;
        info!("Real-time server listening on {}", self.config.realtime_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RealtimeError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let count = self.shared.presence.connection_count().await;
                            if count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let shared = self.shared.clone();
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut credential = None;
            let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                credential = handshake_credential(req);
                Ok(resp)
            };
            let ws_stream = match accept_hdr_async(stream, callback).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let user_id = credential.and_then(|token| match verify(&shared.issuer, &token) {
                Ok(user_id) => Some(user_id),
                Err(reason) => {
                    debug!(connection = id, %reason, "handshake credential rejected");
                    None
                }
            });

            let session = Session { id, addr, user_id };
            serve_session(shared, session, ws_stream, shutdown_rx).await;
        });
    }

    /// Signal every connection and the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Active connection count.
    pub async fn connection_count(&self) -> usize {
        self.shared.presence.connection_count().await
    }
}

async fn serve_session(
    shared: Arc<Shared>,
    mut session: Session,
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

    shared
        .presence
        .connect(session.id, session.user_id, msg_tx.clone())
        .await;
    if let Some(user_id) = session.user_id {
        let _ = msg_tx
            .send(ServerMessage::Authenticated(Authenticated { user_id }))
            .await;
    }
    info!(connection = session.id, addr = %session.addr, authenticated = session.user_id.is_some(), "client connected");

    // Spawn message sender task
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match ClientMessage::from_json(&text) {
                            Ok(client_msg) => {
                                handle_client_message(&shared, &mut session, client_msg, &msg_tx).await;
                            }
                            Err(e) => {
                                debug!(connection = session.id, "Invalid message: {}", e);
                                let _ = msg_tx
                                    .send(ServerMessage::invocation_error(None, ErrorCode::InvalidArguments))
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = session.id, "Client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = session.id, "WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = tokio::time::sleep(shared.idle_timeout) => {
                info!(connection = session.id, "Closing idle connection");
                break;
            }
            _ = shutdown_rx.recv() => {
                let _ = msg_tx.send(ServerMessage::Shutdown {
                    reason: "Server shutting down".to_string(),
                }).await;
                break;
            }
        }
    }

    // Cleanup
    let left = shared.presence.disconnect(session.id).await;
    for (room_id, user_id) in left {
        shared
            .presence
            .broadcast(room_id, presence_event(room_id, user_id, false))
            .await;
    }

    drop(msg_tx);
    if tokio::time::timeout(Duration::from_secs(1), sender_task).await.is_err() {
        debug!(connection = session.id, "sender did not drain in time");
    }
    info!(connection = session.id, "Client cleaned up");
}

/// Handle a client message.
async fn handle_client_message(
    shared: &Shared,
    session: &mut Session,
    msg: ClientMessage,
    sender: &mpsc::Sender<ServerMessage>,
) {
    let reply = match msg {
        ClientMessage::Authenticate(request) => {
            match verify(&shared.issuer, &request.access_token) {
                Ok(user_id) if session.user_id.map_or(true, |current| current == user_id) => {
                    session.user_id = Some(user_id);
                    shared.presence.set_identity(session.id, user_id).await;
                    debug!(connection = session.id, %user_id, "connection authenticated");
                    ServerMessage::Authenticated(Authenticated { user_id })
                }
                Ok(_) => {
                    debug!(connection = session.id, "identity change refused");
                    ServerMessage::invocation_error(None, ErrorCode::InvalidToken)
                }
                Err(reason) => {
                    debug!(connection = session.id, %reason, "authenticate rejected");
                    ServerMessage::invocation_error(None, ErrorCode::InvalidToken)
                }
            }
        }
        ClientMessage::Invoke(invocation) => {
            let caller = Caller {
                connection_id: session.id,
                user_id: session.user_id,
            };
            match shared.hub.invoke(caller, &invocation).await {
                Ok(result) => ServerMessage::Completion(Completion {
                    invocation_id: invocation.invocation_id,
                    result,
                }),
                Err(e) => ServerMessage::invocation_error(Some(invocation.invocation_id), e.code()),
            }
        }
        ClientMessage::Ping { timestamp } => ServerMessage::Pong {
            timestamp,
            server_time: Utc::now().timestamp_millis().max(0) as u64,
        },
    };
    let _ = sender.send(reply).await;
}

fn verify(issuer: &TokenIssuer, token: &str) -> Result<UserId, crate::token::TokenError> {
    issuer.verify_access_token(token)?.user_id()
}

/// Access token from the handshake: `Authorization: Bearer` first, then the
/// `access_token` query parameter.
fn handshake_credential(req: &Request) -> Option<String> {
    let from_header = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer);
    let from_query = || {
        req.uri()
            .query()
            .and_then(|query| query_param(query, ACCESS_TOKEN_PARAM))
    };
    from_header.or_else(from_query).map(str::to_owned)
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}
