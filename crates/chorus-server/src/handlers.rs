//! Connection handlers for the Chorus server.
//!
//! Each WebSocket connection is bound to the user named by the trusted
//! `x-user-id` header set by the authentication gateway. Client frames are
//! mapped onto hub operations; hub events for the user arrive through a
//! bounded per-connection channel and are written out as `event` frames.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use chorus_core::{
    ConnectionId, CoreError, Envelope, Hub, InMemoryDirectory, MessageDraft, UserId,
};
use chorus_protocol::{codec, Frame, PROTOCOL_VERSION};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header carrying the authenticated user id.
pub const USER_HEADER: &str = "x-user-id";

/// Shared server state.
pub struct AppState {
    /// The messaging core.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state over in-memory storage.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            hub: Hub::in_memory(config.hub_config(), InMemoryDirectory::new()),
            config,
        }
    }
}

/// Failure of one client request, reported back as an `error` frame.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Malformed {field}: {value}")]
    MalformedId { field: &'static str, value: String },

    #[error("Send needs exactly one of conversation_id or recipient")]
    AmbiguousTarget,

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Unexpected frame from client")]
    UnexpectedFrame,

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl RequestError {
    fn code(&self) -> u16 {
        match self {
            RequestError::Core(e) => e.code(),
            _ => 4000,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RequestError::Core(e) => e.kind().as_str(),
            _ => "protocol",
        }
    }
}

fn parse_id(field: &'static str, value: &str) -> Result<Uuid, RequestError> {
    Uuid::parse_str(value).map_err(|_| RequestError::MalformedId {
        field,
        value: value.to_string(),
    })
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let _sweeper = spawn_heartbeat_sweeper(state.clone());

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Chorus server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Periodically drop connections that stopped sending heartbeats.
pub fn spawn_heartbeat_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let interval = state.config.heartbeat.interval();
    let timeout = state.config.heartbeat.timeout();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pruned = state.hub.prune_stale(timeout).await;
            if !pruned.is_empty() {
                metrics::record_pruned(pruned.len());
                info!(count = pruned.len(), "Dropped connections with missed heartbeats");
            }
            metrics::record_transport(&state.hub.transport().stats());
        }
    })
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.transport().stats();
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "online_users": stats.online_users,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(UserId::from);

    match user {
        Some(user) => ws
            .on_upgrade(move |socket| handle_websocket(socket, user, state))
            .into_response(),
        None => {
            metrics::record_error("unauthenticated");
            (StatusCode::UNAUTHORIZED, "missing x-user-id").into_response()
        }
    }
}

type WsSender = SplitSink<WebSocket, Message>;

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, user: UserId, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = ConnectionId::generate();

    debug!(connection = %connection_id, user = %user, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let connected_frame = Frame::connected(
        connection_id.as_str(),
        PROTOCOL_VERSION,
        state.config.heartbeat.interval_ms as u32,
    );
    if send_frame(&mut sender, &connected_frame).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }

    let (event_tx, mut event_rx) =
        mpsc::channel::<Arc<Envelope>>(state.config.transport.outbound_buffer.max(1));
    let change = state
        .hub
        .connect(&user, &connection_id, Arc::new(event_tx))
        .await;
    debug!(connection = %connection_id, user = %user, change = ?change, "Registered");

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            envelope = event_rx.recv() => {
                let Some(envelope) = envelope else {
                    // The hub dropped our sink: pruned by the heartbeat sweeper.
                    debug!(connection = %connection_id, "Connection dropped by hub");
                    break;
                };
                let frame = Frame::event(envelope.event, envelope.payload.as_ref().clone());
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
                metrics::record_event(envelope.event.as_str());
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        state.hub.transport().touch(&connection_id);
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);
                        if !process_buffer(&mut read_buffer, &user, &connection_id, &state, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        state.hub.transport().touch(&connection_id);
                        metrics::record_frame(text.len(), "inbound");
                        read_buffer.extend_from_slice(text.as_bytes());
                        if !process_buffer(&mut read_buffer, &user, &connection_id, &state, &mut sender).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        state.hub.transport().touch(&connection_id);
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.hub.transport().touch(&connection_id);
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.hub.disconnect(&connection_id).await;
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Decode and handle every complete frame in the buffer. Returns `false`
/// when the connection should close.
async fn process_buffer(
    read_buffer: &mut BytesMut,
    user: &UserId,
    connection_id: &ConnectionId,
    state: &AppState,
    sender: &mut WsSender,
) -> bool {
    loop {
        match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => {
                let start = Instant::now();
                let response = handle_frame(frame, user, connection_id, state).await;
                metrics::record_request(start.elapsed().as_secs_f64());
                if let Some(response) = response {
                    if send_frame(sender, &response).await.is_err() {
                        return false;
                    }
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Undecodable frame, resetting buffer");
                metrics::record_error("protocol");
                read_buffer.clear();
                return send_frame(sender, &Frame::error(0, 4000, e.to_string()))
                    .await
                    .is_ok();
            }
        }
    }
}

/// Turn a request outcome into its response frame.
fn reply(id: u64, result: RequestResult) -> Frame {
    match result {
        Ok(None) => Frame::ack(id),
        Ok(Some(data)) => Frame::ack_with(id, data),
        Err(e) => {
            metrics::record_error(e.kind());
            debug!(request = id, error = %e, "Request failed");
            Frame::error(id, e.code(), e.to_string())
        }
    }
}

/// Handle a decoded frame, returning the frame to send back, if any.
async fn handle_frame(
    frame: Frame,
    user: &UserId,
    connection_id: &ConnectionId,
    state: &AppState,
) -> Option<Frame> {
    let hub = &state.hub;

    match frame {
        Frame::Join {
            id,
            conversation_id,
        } => Some(reply(id, join(hub, connection_id, &conversation_id).await)),

        Frame::Leave {
            id,
            conversation_id,
        } => {
            let result = parse_id("conversation_id", &conversation_id).and_then(|conversation| {
                hub.leave_conversation(connection_id, conversation)?;
                Ok(None)
            });
            Some(reply(id, result))
        }

        Frame::Send {
            id,
            conversation_id,
            recipient,
            content,
            media,
            reply_to,
        } => {
            let draft = MessageDraft {
                content,
                media,
                reply_to: reply_to.and_then(|r| Uuid::parse_str(&r).ok()),
            };
            Some(reply(
                id,
                send(hub, user, conversation_id, recipient, draft).await,
            ))
        }

        Frame::MarkRead {
            id,
            conversation_id,
        } => Some(reply(id, mark_read(hub, user, &conversation_id).await)),

        Frame::React {
            id,
            message_id,
            emoji,
        } => Some(reply(id, react(hub, user, &message_id, emoji).await)),

        Frame::Typing {
            conversation_id,
            active,
        } => {
            if let Ok(conversation) = Uuid::parse_str(&conversation_id) {
                if let Err(e) = hub.messages().typing(conversation, user, active).await {
                    debug!(connection = %connection_id, error = %e, "Typing ignored");
                }
            }
            None
        }

        Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

        Frame::Pong { .. } => None,

        Frame::Connect { version } => {
            if version == PROTOCOL_VERSION {
                debug!(connection = %connection_id, "Connect frame (already connected)");
                None
            } else {
                Some(reply(0, Err(RequestError::UnsupportedVersion(version))))
            }
        }

        other => {
            warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
            Some(reply(0, Err(RequestError::UnexpectedFrame)))
        }
    }
}

type RequestResult = Result<Option<Value>, RequestError>;

async fn join(hub: &Hub, connection_id: &ConnectionId, conversation_id: &str) -> RequestResult {
    let conversation = parse_id("conversation_id", conversation_id)?;
    let joined = hub.join_conversation(connection_id, conversation).await?;
    Ok(Some(json!({ "joined": joined })))
}

async fn send(
    hub: &Hub,
    user: &UserId,
    conversation_id: Option<String>,
    recipient: Option<String>,
    draft: MessageDraft,
) -> RequestResult {
    let message = match (conversation_id, recipient) {
        (Some(conversation), None) => {
            let conversation = parse_id("conversation_id", &conversation)?;
            hub.messages().send(conversation, user, draft).await?
        }
        (None, Some(recipient)) => {
            hub.messages()
                .send_direct(user, &UserId::from(recipient), draft)
                .await?
        }
        _ => return Err(RequestError::AmbiguousTarget),
    };
    Ok(Some(json!({
        "conversation_id": message.conversation_id,
        "message_id": message.id,
        "status": message.status,
    })))
}

async fn mark_read(hub: &Hub, user: &UserId, conversation_id: &str) -> RequestResult {
    let conversation = parse_id("conversation_id", conversation_id)?;
    let receipt = hub.messages().mark_read(conversation, user).await?;
    Ok(Some(json!({ "count": receipt.message_ids.len() })))
}

async fn react(hub: &Hub, user: &UserId, message_id: &str, emoji: Option<String>) -> RequestResult {
    let message = parse_id("message_id", message_id)?;
    hub.messages().react(message, user, emoji).await?;
    Ok(None)
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
