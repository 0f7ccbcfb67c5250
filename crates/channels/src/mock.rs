//! An in-memory Channel used by the gateway's own test suite (the spec's
//! S1–S6 scenarios all register a `MockChannel`) and usable by any
//! downstream crate wiring integration tests against the dispatcher.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{Channel, InboundHandler},
    error::{Error, Result},
    types::{ChannelStatus, ChannelType, HealthCheck, HealthState, OutgoingMessage},
};

pub struct MockChannel {
    name: String,
    channel_type: ChannelType,
    running: AtomicBool,
    on_message: RwLock<Option<InboundHandler>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    total_messages: AtomicI64,
    start_time: Mutex<Option<chrono::DateTime<Utc>>>,
    /// When set, `send_message` fails for these session IDs (used to test
    /// circuit-breaker / NoRoute paths).
    no_route_sessions: Mutex<HashMap<String, ()>>,
}

impl MockChannel {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            channel_type: ChannelType::Realtime,
            running: AtomicBool::new(false),
            on_message: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            total_messages: AtomicI64::new(0),
            start_time: Mutex::new(None),
            no_route_sessions: Mutex::new(HashMap::new()),
        })
    }

    pub async fn sent_messages(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub async fn deny_route(&self, session_id: impl Into<String>) {
        self.no_route_sessions.lock().await.insert(session_id.into(), ());
    }

    pub async fn handler(&self) -> Option<InboundHandler> {
        self.on_message.read().await.clone()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    fn description(&self) -> &str {
        "mock test channel"
    }

    async fn start(&self, _lifecycle: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning(self.name.clone()));
        }
        *self.start_time.lock().await = Some(Utc::now());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_on_message(&self, handler: InboundHandler) {
        // Test channel: no separate task owns this lock, so a blocking
        // write is fine and keeps `set_on_message` synchronous for callers.
        if let Ok(mut guard) = self.on_message.try_write() {
            *guard = Some(handler);
        }
    }

    async fn send_message(&self, msg: OutgoingMessage) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning(self.name.clone()));
        }
        if self.no_route_sessions.lock().await.contains_key(&msg.session_id) {
            return Err(Error::NoRoute(msg.session_id, self.name.clone()));
        }
        self.total_messages.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().await.push(msg);
        Ok(())
    }

    async fn get_status(&self) -> ChannelStatus {
        ChannelStatus {
            name: self.name.clone(),
            channel_type: self.channel_type,
            description: "mock test channel".into(),
            running: self.is_running(),
            start_time: *self.start_time.lock().await,
            last_message_time: None,
            total_messages: self.total_messages.load(Ordering::SeqCst),
            health_check: HealthCheck {
                status: if self.is_running() { HealthState::Healthy } else { HealthState::Unhealthy },
                message: String::new(),
                last_check_time: Utc::now(),
                latency_ms: 0,
            },
        }
    }
}
