//! Connection handlers for the Huddle server.
//!
//! Each WebSocket connection is one engine session. Inbound frames are
//! dispatched to the engine; events on the topics a connection subscribed to
//! are forwarded back down its socket.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use huddle_core::{Broker, Clock, Engine, EngineError, GatewayError, SystemClock};
use huddle_protocol::{
    codec, ChatRecord, ClientFrame, ProtocolError, RoomPresenceRecord, RoomSummaryRecord,
    ServerEvent, ServerFrame, SystemStatsRecord, Topic, UserRecord, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Codes carried by `error` frames.
pub mod codes {
    pub const INVALID_FRAME: u16 = 1001;
    pub const SUBSCRIPTION_REFUSED: u16 = 1002;
    pub const USER_NOT_FOUND: u16 = 1004;
    pub const INVALID_TARGET: u16 = 1005;
    pub const UNSUPPORTED_VERSION: u16 = 1006;
}

/// Shared server state.
pub struct AppState {
    /// The presence engine.
    pub engine: Engine,
    /// Topic fan-out; the engine publishes into it, connections subscribe.
    pub broker: Arc<Broker>,
    /// Server configuration.
    pub config: Config,
    connections: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let broker = Arc::new(Broker::with_capacity(config.limits.topic_capacity));
        let engine = Engine::with_config(config.engine_config(), broker.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            engine,
            broker,
            config,
            connections: AtomicUsize::new(0),
            shutdown,
        }
    }

    /// Number of open WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Tell every connection to close.
    fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// A claimed connection slot, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl ConnectionSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self {
                state: Arc::clone(state),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves, then disconnect every
/// session and close the broker.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sweeper = spawn_heartbeat_sweeper(Arc::clone(&state));
    let notify = Arc::clone(&state);

    let result = axum::serve(listener, app(Arc::clone(&state)))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutdown requested; closing connections");
            notify.begin_shutdown();
        })
        .await;

    sweeper.abort();
    state.engine.shutdown();
    state.broker.close();
    info!("Huddle server stopped");

    result.context("Server error")
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/", get(banner_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Periodically disconnect sessions that stopped sending heartbeats.
fn spawn_heartbeat_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let interval = Duration::from_millis(state.config.heartbeat.interval_ms);
    let timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pruned = state.engine.prune_stale(timeout);
            if !pruned.is_empty() {
                info!(count = pruned.len(), "Pruned stale sessions");
                metrics::record_pruned(pruned.len());
            }
            metrics::set_engine_gauges(&state.engine.system_stats());
        }
    })
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "UP",
        "service": "huddle",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": SystemClock.now_millis(),
    }))
}

/// Plain-text banner.
async fn banner_handler(State(state): State<Arc<AppState>>) -> String {
    format!(
        "Huddle presence server {}\nWebSocket endpoint: {}\n",
        env!("CARGO_PKG_VERSION"),
        state.config.transport.websocket_path
    )
}

/// Engine counters.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<SystemStatsRecord> {
    Json(state.engine.system_stats().into())
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = ConnectionSlot::acquire(&state) else {
        warn!(
            limit = state.config.limits.max_connections,
            active = state.connection_count(),
            "Connection limit reached"
        );
        metrics::record_rejected_connection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
        .into_response()
}

/// Encoding of outbound frames, following the client's latest frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    /// Text frames carrying JSON.
    Json,
    /// Binary frames carrying length-prefixed MessagePack.
    MessagePack,
}

impl WireFormat {
    fn encode(self, frame: &ServerFrame) -> Result<Message, ProtocolError> {
        match self {
            WireFormat::Json => Ok(Message::Text(codec::encode_json(frame)?)),
            WireFormat::MessagePack => Ok(Message::Binary(codec::encode(frame)?.to_vec())),
        }
    }
}

/// Per-connection state.
struct Connection {
    session_id: String,
    format: WireFormat,
    subscriptions: HashMap<Topic, JoinHandle<()>>,
    /// The signal queue followed on behalf of the joined user.
    user_queue: Option<Topic>,
    events: mpsc::UnboundedSender<(Topic, Arc<ServerEvent>)>,
}

impl Connection {
    fn new(session_id: String, events: mpsc::UnboundedSender<(Topic, Arc<ServerEvent>)>) -> Self {
        Self {
            session_id,
            format: WireFormat::Json,
            subscriptions: HashMap::new(),
            user_queue: None,
            events,
        }
    }

    /// Forward `topic` into this connection's event stream.
    fn subscribe(&mut self, broker: &Broker, topic: Topic) -> Result<(), GatewayError> {
        let mut rx = broker.subscribe(&topic)?;
        let tx = self.events.clone();
        let forwarded = topic.clone();
        let session_id = self.session_id.clone();

        // Spawn a task to forward events from broadcast to mpsc
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send((forwarded.clone(), event)).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session = %session_id, topic = %forwarded, skipped, "Subscriber lagged");
                    }
                }
            }
        });

        if let Some(previous) = self.subscriptions.insert(topic, handle) {
            previous.abort();
        }
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &Topic) -> bool {
        match self.subscriptions.remove(topic) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Follow the signal queue of the user this session joined as.
    fn follow_user(&mut self, broker: &Broker, user_id: &str) {
        let topic = Topic::User(user_id.to_string());
        if self.user_queue.as_ref() == Some(&topic) {
            return;
        }
        if let Some(previous) = self.user_queue.take() {
            self.unsubscribe(&previous);
        }
        match self.subscribe(broker, topic.clone()) {
            Ok(()) => self.user_queue = Some(topic),
            Err(e) => warn!(session = %self.session_id, error = %e, "Failed to follow user queue"),
        }
    }

    /// Whether the engine still binds this session to `user_id`.
    fn holds(&self, engine: &Engine, user_id: &str) -> bool {
        engine
            .user_by_session(&self.session_id)
            .is_some_and(|u| u.user_id == user_id)
    }

    fn close(self) {
        for (_, handle) in self.subscriptions {
            handle.abort();
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let session_id = format!("sess_{}", Uuid::new_v4());
    debug!(session = %session_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut conn = Connection::new(session_id.clone(), events_tx);
    let mut shutdown = state.shutdown.subscribe();

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = ServerFrame::connected(&session_id, PROTOCOL_VERSION.major, heartbeat);
    if let Err(e) = send_frame(&mut sender, conn.format, &connected).await {
        error!(session = %session_id, error = %e, "Failed to send Connected frame");
        return;
    }

    // Read buffer for partial MessagePack frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                debug!(session = %session_id, "Server shutting down");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            // Events from subscribed topics
            Some((topic, event)) = events_rx.recv() => {
                if let Topic::User(user_id) = &topic {
                    if !conn.holds(&state.engine, user_id) {
                        debug!(session = %session_id, user = %user_id, "Dropping signal for a user this session no longer holds");
                        continue;
                    }
                }
                let frame = ServerFrame::event(topic, (*event).clone());
                if send_frame(&mut sender, conn.format, &frame).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        conn.format = WireFormat::Json;
                        let start = Instant::now();
                        let reply = match codec::decode_json::<ClientFrame>(&text) {
                            Ok(frame) => {
                                metrics::record_frame(frame.name(), text.len(), "inbound");
                                handle_frame(frame, &mut conn, &state)
                            }
                            Err(e) => {
                                debug!(session = %session_id, error = %e, "Undecodable text frame");
                                metrics::record_error("decode");
                                ServerFrame::error(0, codes::INVALID_FRAME, e.to_string())
                            }
                        };
                        metrics::record_latency(start.elapsed().as_secs_f64());

                        if send_frame(&mut sender, conn.format, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        conn.format = WireFormat::MessagePack;
                        read_buffer.extend_from_slice(&data);

                        let mut replies = Vec::new();
                        loop {
                            let start = Instant::now();
                            match next_binary_frame(&mut read_buffer) {
                                Ok(Some((frame, size))) => {
                                    metrics::record_frame(frame.name(), size, "inbound");
                                    replies.push(handle_frame(frame, &mut conn, &state));
                                    metrics::record_latency(start.elapsed().as_secs_f64());
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    // The stream cannot be resynchronized.
                                    warn!(session = %session_id, error = %e, "Undecodable binary frame");
                                    metrics::record_error("decode");
                                    read_buffer.clear();
                                    replies.push(ServerFrame::error(0, codes::INVALID_FRAME, e.to_string()));
                                    break;
                                }
                            }
                        }

                        let mut failed = false;
                        for reply in &replies {
                            if send_frame(&mut sender, conn.format, reply).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: stop forwarding, then drop the session from the engine
    conn.close();
    state.engine.disconnect(&session_id);
    metrics::set_engine_gauges(&state.engine.system_stats());

    debug!(session = %session_id, "WebSocket disconnected");
}

/// Dispatch a decoded frame to the engine and build the reply.
fn handle_frame(frame: ClientFrame, conn: &mut Connection, state: &AppState) -> ServerFrame {
    let request_id = frame.request_id();
    if let Err(e) = frame.validate() {
        debug!(session = %conn.session_id, frame = frame.name(), error = %e, "Rejected frame");
        return ServerFrame::error(request_id, codes::INVALID_FRAME, e.to_string());
    }

    let engine = &state.engine;
    let session_id = conn.session_id.clone();

    match frame {
        ClientFrame::Connect { version } => match PROTOCOL_VERSION.negotiate(version) {
            Ok(negotiated) => {
                let heartbeat =
                    u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
                ServerFrame::connected(session_id, negotiated.major, heartbeat)
            }
            Err(e) => {
                warn!(session = %session_id, client = version, "Unsupported protocol version");
                ServerFrame::error(request_id, codes::UNSUPPORTED_VERSION, e.to_string())
            }
        },

        ClientFrame::Join {
            id,
            user_id,
            username,
            room_id,
        } => {
            engine.join(&session_id, &user_id, &username, &room_id);
            conn.follow_user(&state.broker, &user_id);
            ServerFrame::ack(id)
        }

        ClientFrame::Leave { id } => match engine.leave(&session_id) {
            Ok(()) => ServerFrame::ack(id),
            Err(e) => engine_error(id, &e),
        },

        ClientFrame::Ping { timestamp } => {
            engine.ping(&session_id);
            ServerFrame::pong(timestamp)
        }

        ClientFrame::CreateRoom { id, room_id } => {
            engine.create_room(&room_id);
            ServerFrame::ack(id)
        }

        ClientFrame::Subscribe { id, topic } => match topic.parse::<Topic>() {
            Err(e) => ServerFrame::error(id, codes::INVALID_FRAME, format!("Invalid topic {topic:?}: {e}")),
            Ok(topic) if !topic.is_public() => ServerFrame::error(
                id,
                codes::SUBSCRIPTION_REFUSED,
                format!("Topic {topic} is reserved"),
            ),
            Ok(topic) => {
                debug!(session = %session_id, topic = %topic, "Subscribe request");
                match conn.subscribe(&state.broker, topic) {
                    Ok(()) => ServerFrame::ack(id),
                    Err(e) => {
                        warn!(session = %session_id, error = %e, "Subscribe failed");
                        ServerFrame::error(id, codes::SUBSCRIPTION_REFUSED, e.to_string())
                    }
                }
            }
        },

        ClientFrame::Unsubscribe { id, topic } => match topic.parse::<Topic>() {
            Err(e) => ServerFrame::error(id, codes::INVALID_FRAME, format!("Invalid topic {topic:?}: {e}")),
            Ok(topic) if !topic.is_public() => ServerFrame::error(
                id,
                codes::SUBSCRIPTION_REFUSED,
                format!("Topic {topic} is reserved"),
            ),
            Ok(topic) => {
                let was_subscribed = conn.unsubscribe(&topic);
                debug!(session = %session_id, topic = %topic, was_subscribed, "Unsubscribe request");
                ServerFrame::ack(id)
            }
        },

        ClientFrame::RoomPresence { id, room_id } => ServerFrame::RoomPresence {
            id,
            presence: RoomPresenceRecord::from(&engine.room_presence(&room_id)),
        },

        ClientFrame::OnlineUsers { id } => ServerFrame::OnlineUsers {
            id,
            users: engine
                .online_users()
                .iter()
                .map(|u| UserRecord::from(&**u))
                .collect(),
        },

        ClientFrame::RoomList { id } => ServerFrame::RoomList {
            id,
            rooms: engine
                .room_summaries()
                .iter()
                .map(RoomSummaryRecord::from)
                .collect(),
        },

        ClientFrame::Chat {
            id,
            room_id,
            content,
        } => match engine.send_chat(&session_id, &room_id, &content) {
            Ok(message) => ServerFrame::ChatSent {
                id,
                message_id: message.message_id,
            },
            Err(e) => engine_error(id, &e),
        },

        ClientFrame::ChatHistory { id, room_id } => {
            let messages = engine
                .chat_history(&room_id)
                .iter()
                .map(ChatRecord::from)
                .collect();
            ServerFrame::ChatHistory {
                id,
                room_id,
                messages,
            }
        }

        ClientFrame::CallSignal {
            id,
            room_id,
            target_user_id,
            kind,
            payload,
        } => match engine.relay_signal(&session_id, &room_id, &target_user_id, kind, payload) {
            Ok(()) => ServerFrame::ack(id),
            Err(e) => engine_error(id, &e),
        },

        ClientFrame::SystemStats { id } => ServerFrame::SystemStats {
            id,
            stats: engine.system_stats().into(),
        },
    }
}

/// Turn an engine error into an error frame.
/// Pop the next binary frame with the number of bytes it took on the wire.
fn next_binary_frame(buf: &mut BytesMut) -> Result<Option<(ClientFrame, usize)>, ProtocolError> {
    let before = buf.len();
    Ok(codec::decode_from::<ClientFrame>(buf)?.map(|frame| (frame, before - buf.len())))
}

fn engine_error(id: u64, error: &EngineError) -> ServerFrame {
    metrics::record_engine_error(error.kind());
    let code = match error {
        EngineError::UserNotFound(_) => codes::USER_NOT_FOUND,
        EngineError::InvalidTarget { .. } => codes::INVALID_TARGET,
    };
    debug!(kind = error.kind(), error = %error, "Engine rejected request");
    ServerFrame::error(id, code, error.to_string())
}

/// Metric label for an outbound frame.
fn frame_label(frame: &ServerFrame) -> &'static str {
    match frame {
        ServerFrame::Connected { .. } => "connected",
        ServerFrame::Ack { .. } => "ack",
        ServerFrame::Error { .. } => "error",
        ServerFrame::Pong { .. } => "pong",
        ServerFrame::Event { .. } => "event",
        ServerFrame::RoomPresence { .. } => "room_presence",
        ServerFrame::OnlineUsers { .. } => "online_users",
        ServerFrame::RoomList { .. } => "room_list",
        ServerFrame::ChatHistory { .. } => "chat_history",
        ServerFrame::SystemStats { .. } => "system_stats",
        ServerFrame::ChatSent { .. } => "chat_sent",
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    format: WireFormat,
    frame: &ServerFrame,
) -> Result<()> {
    let message = format.encode(frame)?;
    let bytes = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_frame(frame_label(frame), bytes, "outbound");
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use huddle_protocol::SignalKind;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        state: Arc<AppState>,
        stop: Option<oneshot::Sender<()>>,
        handle: JoinHandle<Result<()>>,
    }

    impl TestServer {
        async fn start(config: Config) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let state = Arc::new(AppState::new(config));
            let (stop, stopped) = oneshot::channel::<()>();
            let handle = tokio::spawn(serve(listener, Arc::clone(&state), async move {
                let _ = stopped.await;
            }));
            Self {
                addr,
                state,
                stop: Some(stop),
                handle,
            }
        }

        fn url(&self) -> String {
            format!("ws://{}{}", self.addr, self.state.config.transport.websocket_path)
        }

        /// Connect and consume the `connected` frame.
        async fn connect(&self) -> (Client, String) {
            let (mut client, _) = connect_async(self.url()).await.unwrap();
            match recv(&mut client).await {
                ServerFrame::Connected {
                    session_id,
                    version,
                    heartbeat,
                } => {
                    assert_eq!(version, PROTOCOL_VERSION.major);
                    assert_eq!(heartbeat, 30_000);
                    (client, session_id)
                }
                other => panic!("expected connected, got {other:?}"),
            }
        }

        async fn wait_for_sessions(&self, expected: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.state.engine.system_stats().active_sessions != expected {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("session count never settled");
        }
    }

    async fn send(client: &mut Client, frame: &ClientFrame) {
        let text = codec::encode_json(frame).unwrap();
        client.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn recv(client: &mut Client) -> ServerFrame {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                WsMessage::Text(text) => return codec::decode_json(&text).unwrap(),
                WsMessage::Binary(data) => return codec::decode(&data).unwrap(),
                _ => continue,
            }
        }
    }

    async fn request(client: &mut Client, frame: ClientFrame) -> ServerFrame {
        send(client, &frame).await;
        recv(client).await
    }

    fn join(id: u64, user_id: &str, username: &str, room_id: &str) -> ClientFrame {
        ClientFrame::Join {
            id,
            user_id: user_id.into(),
            username: username.into(),
            room_id: room_id.into(),
        }
    }

    fn error_code(frame: &ServerFrame) -> u16 {
        match frame {
            ServerFrame::Error { code, .. } => *code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_and_join() {
        let server = TestServer::start(Config::default()).await;
        let (mut client, session_id) = server.connect().await;
        assert!(session_id.starts_with("sess_"));

        assert_eq!(
            request(&mut client, join(1, "u1", "Alice", "r1")).await,
            ServerFrame::ack(1)
        );

        match request(
            &mut client,
            ClientFrame::RoomPresence {
                id: 2,
                room_id: "r1".into(),
            },
        )
        .await
        {
            ServerFrame::RoomPresence { id, presence } => {
                assert_eq!(id, 2);
                assert_eq!(presence.user_count, 1);
                assert_eq!(presence.users[0].username, "Alice");
            }
            other => panic!("expected room presence, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_presence_events_reach_subscribers() {
        let server = TestServer::start(Config::default()).await;
        let (mut alice, _) = server.connect().await;
        let (mut bob, _) = server.connect().await;

        request(&mut alice, join(1, "u1", "Alice", "r1")).await;
        assert_eq!(
            request(
                &mut alice,
                ClientFrame::Subscribe {
                    id: 2,
                    topic: "/topic/room/r1".into()
                }
            )
            .await,
            ServerFrame::ack(2)
        );

        assert_eq!(
            request(&mut bob, join(1, "u2", "Bob", "r1")).await,
            ServerFrame::ack(1)
        );
        match recv(&mut alice).await {
            ServerFrame::Event {
                topic,
                event: ServerEvent::RoomPresence(presence),
            } => {
                assert_eq!(topic, Topic::Room("r1".into()));
                assert_eq!(presence.user_count, 2);
            }
            other => panic!("expected presence event, got {other:?}"),
        }

        bob.close(None).await.unwrap();
        match recv(&mut alice).await {
            ServerFrame::Event {
                event: ServerEvent::RoomPresence(presence),
                ..
            } => {
                assert_eq!(presence.user_count, 1);
                assert_eq!(presence.users[0].user_id, "u1");
            }
            other => panic!("expected presence event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_signal_reaches_target_only() {
        let server = TestServer::start(Config::default()).await;
        let (mut alice, _) = server.connect().await;
        let (mut bob, _) = server.connect().await;

        request(&mut alice, join(1, "u1", "Alice", "r1")).await;
        request(&mut bob, join(1, "u2", "Bob", "r1")).await;

        let signal = ClientFrame::CallSignal {
            id: 5,
            room_id: "r1".into(),
            target_user_id: "u2".into(),
            kind: SignalKind::Offer,
            payload: json!({"sdp": "v=0"}),
        };
        assert_eq!(request(&mut alice, signal).await, ServerFrame::ack(5));

        match recv(&mut bob).await {
            ServerFrame::Event {
                topic,
                event: ServerEvent::CallSignal(record),
            } => {
                assert_eq!(topic, Topic::User("u2".into()));
                assert_eq!(record.from_user_id, "u1");
                assert_eq!(record.kind, SignalKind::Offer);
                assert_eq!(record.payload, json!({"sdp": "v=0"}));
            }
            other => panic!("expected call signal, got {other:?}"),
        }

        let missing = ClientFrame::CallSignal {
            id: 6,
            room_id: "r1".into(),
            target_user_id: "u3".into(),
            kind: SignalKind::End,
            payload: json!(null),
        };
        assert_eq!(
            error_code(&request(&mut alice, missing).await),
            codes::INVALID_TARGET
        );
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let server = TestServer::start(Config::default()).await;
        let (mut client, _) = server.connect().await;

        let reserved = ClientFrame::Subscribe {
            id: 1,
            topic: "/user/u2/queue/signal".into(),
        };
        assert_eq!(
            error_code(&request(&mut client, reserved).await),
            codes::SUBSCRIPTION_REFUSED
        );

        let bogus = ClientFrame::Subscribe {
            id: 2,
            topic: "bogus".into(),
        };
        assert_eq!(
            error_code(&request(&mut client, bogus).await),
            codes::INVALID_FRAME
        );

        let rooms = ClientFrame::Unsubscribe {
            id: 3,
            topic: "/topic/rooms".into(),
        };
        assert_eq!(request(&mut client, rooms).await, ServerFrame::ack(3));
    }

    #[tokio::test]
    async fn test_chat_and_history() {
        let server = TestServer::start(Config::default()).await;
        let (mut client, _) = server.connect().await;
        request(&mut client, join(1, "u1", "Alice", "r1")).await;

        let chat = ClientFrame::Chat {
            id: 2,
            room_id: "r1".into(),
            content: "hello".into(),
        };
        let message_id = match request(&mut client, chat).await {
            ServerFrame::ChatSent { id, message_id } => {
                assert_eq!(id, 2);
                message_id
            }
            other => panic!("expected chat_sent, got {other:?}"),
        };

        match request(
            &mut client,
            ClientFrame::ChatHistory {
                id: 3,
                room_id: "r1".into(),
            },
        )
        .await
        {
            ServerFrame::ChatHistory { messages, .. } => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].message_id, message_id);
            }
            other => panic!("expected chat history, got {other:?}"),
        }

        let elsewhere = ClientFrame::Chat {
            id: 4,
            room_id: "r2".into(),
            content: "hello?".into(),
        };
        assert_eq!(
            error_code(&request(&mut client, elsewhere).await),
            codes::USER_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_invalid_frames() {
        let server = TestServer::start(Config::default()).await;
        let (mut client, _) = server.connect().await;

        client
            .send(WsMessage::Text("not json".into()))
            .await
            .unwrap();
        match recv(&mut client).await {
            ServerFrame::Error { id, code, .. } => {
                assert_eq!(id, 0);
                assert_eq!(code, codes::INVALID_FRAME);
            }
            other => panic!("expected error, got {other:?}"),
        }

        let blank_room = join(7, "u1", "Alice", " ");
        match request(&mut client, blank_room).await {
            ServerFrame::Error { id, code, .. } => {
                assert_eq!(id, 7);
                assert_eq!(code, codes::INVALID_FRAME);
            }
            other => panic!("expected error, got {other:?}"),
        }

        assert_eq!(
            error_code(&request(&mut client, ClientFrame::Leave { id: 8 }).await),
            codes::USER_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_messagepack_replies_in_kind() {
        let server = TestServer::start(Config::default()).await;
        let (mut client, _) = server.connect().await;

        let ping = codec::encode(&ClientFrame::Ping { timestamp: Some(7) }).unwrap();
        client.send(WsMessage::Binary(ping.to_vec())).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match msg {
            WsMessage::Binary(data) => {
                let frame: ServerFrame = codec::decode(&data).unwrap();
                assert_eq!(frame, ServerFrame::pong(Some(7)));
            }
            other => panic!("expected binary pong, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_version_negotiation() {
        let server = TestServer::start(Config::default()).await;
        let (mut client, session_id) = server.connect().await;

        assert_eq!(
            error_code(&request(&mut client, ClientFrame::Connect { version: 2 }).await),
            codes::UNSUPPORTED_VERSION
        );
        match request(&mut client, ClientFrame::Connect { version: 1 }).await {
            ServerFrame::Connected { session_id: echoed, .. } => assert_eq!(echoed, session_id),
            other => panic!("expected connected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let server = TestServer::start(config).await;

        let (_first, _) = server.connect().await;
        match connect_async(server.url()).await {
            Err(tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            }
            other => panic!("expected 503, got {:?}", other.map(|_| ())),
        }
        assert_eq!(server.state.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_session() {
        let server = TestServer::start(Config::default()).await;
        let (mut client, _) = server.connect().await;
        request(&mut client, join(1, "u1", "Alice", "r1")).await;
        server.wait_for_sessions(1).await;

        drop(client);
        server.wait_for_sessions(0).await;
        assert!(server.state.engine.all_room_ids().is_empty());
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let mut server = TestServer::start(Config::default()).await;
        let (mut client, _) = server.connect().await;
        request(&mut client, join(1, "u1", "Alice", "r1")).await;

        if let Some(stop) = server.stop.take() {
            stop.send(()).unwrap();
        }

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        server.handle.await.unwrap().unwrap();
        assert_eq!(server.state.engine.system_stats().active_sessions, 0);
        assert!(server.state.broker.is_closed());
    }

    #[test]
    fn test_binary_frames_report_their_own_size() {
        let small = ClientFrame::Leave { id: 1 };
        let large = join(2, "u1", "Alice with a much longer display name", "r1");
        let small_size = codec::encode(&small).unwrap().len();
        let large_size = codec::encode(&large).unwrap().len();
        assert_ne!(small_size, large_size);

        let mut buf = BytesMut::new();
        codec::encode_into(&small, &mut buf).unwrap();
        codec::encode_into(&large, &mut buf).unwrap();
        let partial = buf.split_off(buf.len() - 1);

        assert_eq!(next_binary_frame(&mut buf).unwrap(), Some((small, small_size)));
        assert_eq!(next_binary_frame(&mut buf).unwrap(), None);

        buf.unsplit(partial);
        assert_eq!(next_binary_frame(&mut buf).unwrap(), Some((large, large_size)));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_http_endpoints() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "UP");
        assert_eq!(health["service"], "huddle");

        let state = Arc::new(AppState::new(Config::default()));
        state.engine.join("s1", "u1", "Alice", "r1");
        let Json(stats) = stats_handler(State(Arc::clone(&state))).await;
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.active_rooms, 1);

        let banner = banner_handler(State(state)).await;
        assert!(banner.contains("/ws-presence"));
    }
}
