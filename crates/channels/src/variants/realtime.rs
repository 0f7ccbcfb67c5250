//! WebSocket realtime Channel: accepts client connections on a configured
//! port, keeps a per-connection sender task alive, and forwards inbound
//! frames to the installed handler. Grounded on the teacher's
//! `gateway::ws::handle_connection` lifecycle (split socket into tx/rx,
//! spawn write loop over an mpsc channel, handshake with a timeout, touch
//! activity on every frame, cleanup on disconnect) generalized down from
//! its JSON-RPC method dispatch to this spec's `{type, content}` frames.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, EventSink, InboundHandler},
    error::{Error, Result},
    types::{
        ChannelStatus, ChannelType, ContentType, HealthCheck, HealthState, IncomingMessage,
        OutgoingMessage, Sender, SenderType, ThinkingEvent,
    },
};

const EVENT_CHAN_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub ping_interval: Duration,
    pub allowed_origins: Vec<String>,
    pub token: Option<String>,
    pub dev_mode: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".parse().unwrap_or_else(|_| {
                SocketAddr::from(([127, 0, 0, 1], 8765))
            }),
            max_connections: 100,
            ping_interval: Duration::from_secs(30),
            allowed_origins: Vec::new(),
            token: None,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    session_id: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutboundFrame {
    Connected {
        #[serde(rename = "sessionID")]
        session_id: String,
        message: String,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    Message {
        content: String,
        timestamp: i64,
    },
    Thinking {
        event: ThinkingEvent,
        timestamp: i64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InboundFrame {
    Message { content: String },
    Ping,
}

/// What the per-connection write task forwards to the socket: an
/// application frame, or a protocol-level ping to keep the connection alive.
enum WireMessage {
    Text(String),
    Ping,
}

struct ConnectionHandle {
    sender: mpsc::UnboundedSender<WireMessage>,
    event_tx: mpsc::Sender<ThinkingEvent>,
    last_activity: Mutex<std::time::Instant>,
}

#[async_trait]
impl EventSink for ConnectionHandle {
    async fn emit(&self, event: ThinkingEvent) {
        // Bounded, drop-oldest on overflow: a blocked receiver should never
        // stall the channel's own dispatch path.
        if self.event_tx.try_send(event).is_err() {
            debug!("thinking event dropped: sink full or closed");
        }
    }
}

struct RuntimeState {
    name: String,
    connections: RwLock<HashMap<String, Arc<ConnectionHandle>>>,
    /// Plain sync lock: `set_on_message` is a synchronous trait method and
    /// must install the handler before `start()` returns (see
    /// `SPEC_FULL.md` §5: "Installed onMessage: atomic-pointer swap").
    on_message: std::sync::RwLock<Option<InboundHandler>>,
    config: RealtimeConfig,
    total_messages: AtomicI64,
    last_message_time: Mutex<Option<chrono::DateTime<Utc>>>,
}

/// WebSocket server Channel. `GET /ws?session_id=&token=` upgrades; inbound
/// frames are `{type:"message", content}` or `{type:"ping"}`.
pub struct RealtimeChannel {
    name: String,
    description: String,
    state: Arc<RuntimeState>,
    running: AtomicBool,
    start_time: Mutex<Option<chrono::DateTime<Utc>>>,
    shutdown: Mutex<Option<CancellationToken>>,
    server_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RealtimeChannel {
    pub fn new(name: impl Into<String>, config: RealtimeConfig) -> Self {
        let name = name.into();
        Self {
            description: "WebSocket realtime client gateway".into(),
            state: Arc::new(RuntimeState {
                name: name.clone(),
                connections: RwLock::new(HashMap::new()),
                on_message: std::sync::RwLock::new(None),
                config,
                total_messages: AtomicI64::new(0),
                last_message_time: Mutex::new(None),
            }),
            name,
            running: AtomicBool::new(false),
            start_time: Mutex::new(None),
            shutdown: Mutex::new(None),
            server_task: Mutex::new(None),
        }
    }

    fn origin_allowed(config: &RealtimeConfig, origin: Option<&str>) -> bool {
        if config.dev_mode || config.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(o) => config.allowed_origins.iter().any(|a| a == o),
            None => false,
        }
    }
}

#[async_trait]
impl Channel for RealtimeChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Realtime
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn start(&self, lifecycle: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning(self.name.clone()));
        }

        let state = self.state.clone();
        let addr = state.config.bind_addr;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                Error::Other(anyhow::anyhow!("bind {addr}: {e}"))
            })?;

        let router = Router::new()
            .route("/ws", get(ws_upgrade))
            .with_state(state);

        let stop_token = lifecycle.clone();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, router.into_make_service());
            if let Err(e) = server
                .with_graceful_shutdown(async move { stop_token.cancelled().await })
                .await
            {
                warn!(error = %e, "realtime websocket server exited with error");
            }
        });

        *self.start_time.lock().await = Some(Utc::now());
        *self.shutdown.lock().await = Some(lifecycle);
        *self.server_task.lock().await = Some(task);
        info!(channel = %self.name, addr = %addr, "realtime channel started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(token) = self.shutdown.lock().await.take() {
            token.cancel();
        }
        if let Some(task) = self.server_task.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        self.state.connections.write().await.clear();
        info!(channel = %self.name, "realtime channel stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_on_message(&self, handler: InboundHandler) {
        *self.state.on_message.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    async fn send_message(&self, msg: OutgoingMessage) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning(self.name.clone()));
        }
        let handle = self
            .state
            .connections
            .read()
            .await
            .get(&msg.session_id)
            .cloned()
            .ok_or_else(|| Error::NoRoute(msg.session_id.clone(), self.name.clone()))?;

        let frame = OutboundFrame::Message {
            content: msg.content,
            timestamp: Utc::now().timestamp_millis(),
        };
        let text = serde_json::to_string(&frame).map_err(|e| Error::Other(e.into()))?;
        handle
            .sender
            .send(WireMessage::Text(text))
            .map_err(|_| Error::NoRoute(msg.session_id, self.name.clone()))
    }

    async fn get_status(&self) -> ChannelStatus {
        ChannelStatus {
            name: self.name.clone(),
            channel_type: ChannelType::Realtime,
            description: self.description.clone(),
            running: self.is_running(),
            start_time: *self.start_time.lock().await,
            last_message_time: *self.state.last_message_time.lock().await,
            total_messages: self.state.total_messages.load(Ordering::SeqCst),
            health_check: HealthCheck {
                status: if self.is_running() {
                    HealthState::Healthy
                } else {
                    HealthState::Unhealthy
                },
                message: String::new(),
                last_check_time: Utc::now(),
                latency_ms: 0,
            },
        }
    }

    fn event_sink(&self, session_id: &str) -> Option<Arc<dyn EventSink>> {
        // Cheap synchronous best-effort lookup: connections are inserted
        // under the write lock at handshake time, so a `try_read` miss here
        // just means the sink isn't ready yet, which is a legitimate "no
        // sink" answer for a session that hasn't connected.
        self.state
            .connections
            .try_read()
            .ok()
            .and_then(|m| m.get(session_id).cloned())
            .map(|h| h as Arc<dyn EventSink>)
    }
}

async fn ws_upgrade(
    State(state): State<Arc<RuntimeState>>,
    Query(query): Query<ConnectQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Some(expected) = &state.config.token {
        if query.token.as_deref() != Some(expected.as_str()) {
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
    }
    let origin = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    if !RealtimeChannel::origin_allowed(&state.config, origin) {
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    if state.connections.read().await.len() >= state.config.max_connections {
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_connection(socket, state, query.session_id))
}

async fn handle_connection(socket: WebSocket, state: Arc<RuntimeState>, session_id: Option<String>) {
    let session_id = session_id.unwrap_or_else(|| format!("ws-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()));
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<WireMessage>();
    let (event_tx, mut event_rx) = mpsc::channel::<ThinkingEvent>(EVENT_CHAN_CAPACITY);

    let write_tx = client_tx.clone();
    let write_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = client_rx.recv() => {
                    let frame = match msg {
                        WireMessage::Text(t) => Message::Text(t.into()),
                        WireMessage::Ping => Message::Ping(Vec::new().into()),
                    };
                    if ws_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(event) = event_rx.recv() => {
                    let frame = OutboundFrame::Thinking { event, timestamp: Utc::now().timestamp_millis() };
                    if let Ok(text) = serde_json::to_string(&frame) {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
                else => break,
            }
        }
        drop(write_tx);
    });

    let handle = Arc::new(ConnectionHandle {
        sender: client_tx.clone(),
        event_tx,
        last_activity: Mutex::new(std::time::Instant::now()),
    });
    state.connections.write().await.insert(session_id.clone(), handle);

    let hello = OutboundFrame::Connected {
        session_id: session_id.clone(),
        message: "connected".into(),
        timestamp: Utc::now().timestamp_millis(),
    };
    if let Ok(text) = serde_json::to_string(&hello) {
        let _ = client_tx.send(WireMessage::Text(text));
    }
    info!(session_id = %session_id, "realtime connection established");

    let ping_interval = state.config.ping_interval;
    let read_deadline = ping_interval * 2;
    let mut deadline = tokio::time::Instant::now() + read_deadline;
    let mut ping_ticker = tokio::time::interval(ping_interval);
    ping_ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                debug!(session_id = %session_id, "realtime connection read deadline elapsed");
                break;
            }
            _ = ping_ticker.tick() => {
                if client_tx.send(WireMessage::Ping).is_err() {
                    break;
                }
            }
            next = ws_rx.next() => {
                let Some(msg) = next else { break };
                let text = match msg {
                    Ok(Message::Text(t)) => t.to_string(),
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Pong(_)) => {
                        deadline = tokio::time::Instant::now() + read_deadline;
                        continue;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(session_id = %session_id, error = %e, "realtime read error");
                        break;
                    }
                };

                if let Some(c) = state.connections.read().await.get(&session_id) {
                    *c.last_activity.lock().await = std::time::Instant::now();
                }

                match serde_json::from_str::<InboundFrame>(&text) {
                    Ok(InboundFrame::Ping) => {
                        let pong = OutboundFrame::Pong { timestamp: Utc::now().timestamp_millis() };
                        if let Ok(t) = serde_json::to_string(&pong) {
                            let _ = client_tx.send(WireMessage::Text(t));
                        }
                    }
                    Ok(InboundFrame::Message { content }) => {
                        state.total_messages.fetch_add(1, Ordering::SeqCst);
                        *state.last_message_time.lock().await = Some(Utc::now());
                        let incoming = IncomingMessage {
                            channel_id: session_id.clone(),
                            channel_name: state.name.clone(),
                            session_id: session_id.clone(),
                            message_id: uuid::Uuid::new_v4().to_string(),
                            sender: Sender { id: session_id.clone(), name: session_id.clone(), kind: SenderType::User },
                            content,
                            content_type: ContentType::Text,
                            timestamp: Utc::now(),
                            metadata: HashMap::new(),
                        };
                        let handler = state.on_message.read().unwrap_or_else(|e| e.into_inner()).clone();
                        if let Some(handler) = handler {
                            handler(incoming).await;
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "realtime frame parse failed");
                    }
                }
            }
        }
    }

    state.connections.write().await.remove(&session_id);
    drop(client_tx);
    write_handle.abort();
    info!(session_id = %session_id, "realtime connection closed");
}
