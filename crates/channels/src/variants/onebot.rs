//! OneBot WebSocket client channel (QQ): dials a configured URL, decodes
//! event envelopes to `IncomingMessage`s, and reconnects with a 5s delay
//! bound to the lifecycle context. Grounded on the teacher's
//! `telegram::bot` background-task-with-reconnect-loop shape, adapted from
//! long-polling to a WS dialer per `SPEC_FULL.md` §4.1.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{Channel, InboundHandler},
    error::{Error, Result},
    types::{ChannelStatus, ChannelType, ContentType, HealthCheck, HealthState, IncomingMessage, OutgoingMessage, Sender, SenderType},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OneBotConfig {
    pub ws_url: String,
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OneBotEvent {
    post_type: String,
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    group_id: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sender: Option<OneBotSender>,
}

#[derive(Debug, Deserialize)]
struct OneBotSender {
    #[serde(default)]
    nickname: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct SendPrivateMsg<'a> {
    action: &'static str,
    params: SendPrivateParams<'a>,
}

#[derive(Debug, serde::Serialize)]
struct SendPrivateParams<'a> {
    user_id: &'a str,
    message: &'a str,
}

#[derive(Debug, serde::Serialize)]
struct SendGroupMsg<'a> {
    action: &'static str,
    params: SendGroupParams<'a>,
}

#[derive(Debug, serde::Serialize)]
struct SendGroupParams<'a> {
    group_id: &'a str,
    message: &'a str,
}

struct RuntimeState {
    outbound: Mutex<Option<futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        Message,
    >>>,
    /// Plain sync lock: `set_on_message` is a synchronous trait method and
    /// must install the handler before `start()` returns (see
    /// `SPEC_FULL.md` §5: "Installed onMessage: atomic-pointer swap").
    on_message: std::sync::RwLock<Option<InboundHandler>>,
    total_messages: AtomicI64,
    last_message_time: Mutex<Option<chrono::DateTime<Utc>>>,
}

/// QQ/OneBot WebSocket dialer channel.
pub struct OneBotChannel {
    name: String,
    config: OneBotConfig,
    state: Arc<RuntimeState>,
    running: AtomicBool,
    start_time: Mutex<Option<chrono::DateTime<Utc>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OneBotChannel {
    pub fn new(name: impl Into<String>, config: OneBotConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(RuntimeState {
                outbound: Mutex::new(None),
                on_message: std::sync::RwLock::new(None),
                total_messages: AtomicI64::new(0),
                last_message_time: Mutex::new(None),
            }),
            running: AtomicBool::new(false),
            start_time: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    async fn dial_and_serve(name: String, config: OneBotConfig, state: Arc<RuntimeState>, lifecycle: CancellationToken) {
        loop {
            if lifecycle.is_cancelled() {
                break;
            }

            let mut request = match config.ws_url.as_str().into_client_request() {
                Ok(r) => r,
                Err(e) => {
                    warn!(channel = %name, error = %e, "invalid onebot ws url");
                    break;
                },
            };
            if let Some(token) = &config.access_token {
                if let Ok(value) = format!("Bearer {token}").parse() {
                    request.headers_mut().insert("Authorization", value);
                }
            }

            let stream = match tokio_tungstenite::connect_async(request).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(channel = %name, error = %e, "onebot ws connect failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                        _ = lifecycle.cancelled() => break,
                    }
                },
            };

            info!(channel = %name, "onebot ws connected");
            let (sink, mut stream_rx) = stream.split();
            *state.outbound.lock().await = Some(sink);

            loop {
                tokio::select! {
                    msg = stream_rx.next() => {
                        let Some(msg) = msg else { break };
                        match msg {
                            Ok(Message::Text(text)) => {
                                Self::dispatch_event(&name, &state, &text).await;
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => continue,
                            Err(e) => {
                                debug!(channel = %name, error = %e, "onebot ws read error");
                                break;
                            }
                        }
                    }
                    _ = lifecycle.cancelled() => {
                        info!(channel = %name, "onebot ws lifecycle cancelled");
                        return;
                    }
                }
            }

            *state.outbound.lock().await = None;
            warn!(channel = %name, "onebot ws disconnected, reconnecting in {:?}", RECONNECT_DELAY);
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {},
                _ = lifecycle.cancelled() => break,
            }
        }
    }

    async fn dispatch_event(name: &str, state: &Arc<RuntimeState>, text: &str) {
        let event: OneBotEvent = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                debug!(channel = %name, error = %e, "onebot event parse failed");
                return;
            },
        };
        if event.post_type != "message" {
            return;
        }
        let Some(content) = event.message else { return };

        let session_id = match (event.message_type.as_deref(), event.user_id, event.group_id) {
            (Some("group"), _, Some(group_id)) => format!("group_{group_id}"),
            (_, Some(user_id), _) => format!("user_{user_id}"),
            _ => {
                debug!(channel = %name, "onebot message missing user/group id");
                return;
            },
        };

        let sender_id = event.user_id.map(|id| id.to_string()).unwrap_or_default();
        let sender_name = event
            .sender
            .and_then(|s| s.nickname)
            .unwrap_or_else(|| sender_id.clone());

        state.total_messages.fetch_add(1, Ordering::SeqCst);
        *state.last_message_time.lock().await = Some(Utc::now());

        let incoming = IncomingMessage {
            channel_id: session_id.clone(),
            channel_name: name.to_string(),
            session_id: session_id.clone(),
            message_id: uuid::Uuid::new_v4().to_string(),
            sender: Sender { id: sender_id, name: sender_name, kind: SenderType::User },
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
}

#[async_trait]
impl Channel for OneBotChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_type(&self) -> ChannelType {
        ChannelType::Qq
    }

    fn description(&self) -> &str {
        "OneBot (QQ) WebSocket client"
    }

    async fn start(&self, lifecycle: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning(self.name.clone()));
        }
        let name = self.name.clone();
        let config = self.config.clone();
        let state = self.state.clone();
        let task = tokio::spawn(Self::dial_and_serve(name, config, state, lifecycle));
        *self.start_time.lock().await = Some(Utc::now());
        *self.task.lock().await = Some(task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        *self.state.outbound.lock().await = None;
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
        let mut guard = self.state.outbound.lock().await;
        let sink = guard.as_mut().ok_or_else(|| Error::NoRoute(msg.session_id.clone(), self.name.clone()))?;

        let payload = if let Some(group_id) = msg.session_id.strip_prefix("group_") {
            serde_json::to_string(&SendGroupMsg {
                action: "send_group_msg",
                params: SendGroupParams { group_id, message: &msg.content },
            })
        } else if let Some(user_id) = msg.session_id.strip_prefix("user_") {
            serde_json::to_string(&SendPrivateMsg {
                action: "send_private_msg",
                params: SendPrivateParams { user_id, message: &msg.content },
            })
        } else {
            return Err(Error::NoRoute(msg.session_id, self.name.clone()));
        }
        .map_err(|e| Error::Other(e.into()))?;

        sink.send(Message::Text(payload.into()))
            .await
            .map_err(|e| Error::Other(e.into()))
    }

    async fn get_status(&self) -> ChannelStatus {
        ChannelStatus {
            name: self.name.clone(),
            channel_type: ChannelType::Qq,
            description: self.description().to_string(),
            running: self.is_running(),
            start_time: *self.start_time.lock().await,
            last_message_time: *self.state.last_message_time.lock().await,
            total_messages: self.state.total_messages.load(Ordering::SeqCst),
            health_check: HealthCheck {
                status: if self.is_running() { HealthState::Healthy } else { HealthState::Unhealthy },
                message: String::new(),
                last_check_time: Utc::now(),
                latency_ms: 0,
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn session_id_for_group_message() {
        let event: OneBotEvent = serde_json::from_str(
            r#"{"post_type":"message","message_type":"group","group_id":555,"user_id":1,"message":"hi"}"#,
        )
        .expect("parse");
        assert_eq!(event.group_id, Some(555));
    }

    #[test]
    fn non_message_events_are_ignored() {
        let event: OneBotEvent = serde_json::from_str(r#"{"post_type":"meta_event"}"#).expect("parse");
        assert_eq!(event.post_type, "meta_event");
    }
}
