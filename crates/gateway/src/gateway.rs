//! The central dispatcher: routes an `IncomingMessage` through the
//! installed processing callback and, on a non-empty answer, out through
//! the matched (or inbound) channel's circuit-breaker-protected send.
//!
//! No direct teacher source file generalizes cleanly to this shape — built
//! in the corpus's idiom instead, combining `telegram`'s
//! background-task-owns-its-lifecycle pattern with the panic-guard-and-log
//! shape used around webhook handlers elsewhere in the teacher.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use futures::FutureExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relaygate_channels::{ChannelManager, EventSink, IncomingMessage, OutgoingMessage};
use relaygate_common::error::{Error, Result};
use relaygate_matcher::{EmbeddingService, SemanticChannelMatcher};
use relaygate_resilience::BreakerRegistry;

use crate::context::ChannelContextManager;

/// The stable, never-the-raw-error string sent back to the user when
/// `onMessage` fails or panics (resolved open question: always this exact
/// text, regardless of failure cause).
pub const ERROR_REPLY_MESSAGE: &str =
    "Sorry, something went wrong processing your message. Please try again.";

const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub type OnMessageResult = std::result::Result<(String, String), anyhow::Error>;

/// The processing callback installed by the application: given an inbound
/// message and (if the channel supports it) a thinking-event sink, returns
/// `(answer, sendToHint)` or an error.
pub type OnMessageFn = Arc<
    dyn Fn(IncomingMessage, Option<Arc<dyn EventSink>>) -> Pin<Box<dyn Future<Output = OnMessageResult> + Send>>
        + Send
        + Sync,
>;

/// Decrements the in-flight counter on every exit path out of
/// `handle_message`, including panics caught by `catch_unwind` and early
/// returns — the one place the spec's "always decrement" rule is enforced
/// structurally rather than by discipline at every return site.
struct InFlightGuard<'a>(&'a AtomicI64);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Gateway {
    default_channel: String,
    manager: Arc<ChannelManager>,
    ctx_manager: Arc<ChannelContextManager>,
    matcher: Arc<SemanticChannelMatcher>,
    breakers: Arc<BreakerRegistry>,
    on_message: RwLock<Option<OnMessageFn>>,
    in_flight: AtomicI64,
    shutting_down: AtomicBool,
    lifecycle: CancellationToken,
}

impl Gateway {
    /// Constructs the dispatcher and its owned collaborators, subscribing
    /// the matcher to the channel manager's change hook and starting the
    /// session sweeper.
    pub async fn new(default_channel: impl Into<String>, embedding_service: Arc<dyn EmbeddingService>) -> Arc<Self> {
        Self::with_idle_ttl(default_channel, embedding_service, DEFAULT_IDLE_TTL).await
    }

    /// Like [`Gateway::new`], but overrides the session idle-eviction TTL
    /// (`GatewayConfig::session_idle_ttl_seconds` in the ambient config
    /// schema) instead of using the spec's 30-minute default.
    pub async fn with_idle_ttl(
        default_channel: impl Into<String>,
        embedding_service: Arc<dyn EmbeddingService>,
        idle_ttl: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new(ChannelManager::new());
        let ctx_manager = ChannelContextManager::new(idle_ttl);
        let matcher = SemanticChannelMatcher::new(embedding_service);
        matcher.subscribe(&manager).await;
        let lifecycle = CancellationToken::new();
        ctx_manager.spawn_sweeper(lifecycle.clone());

        Arc::new(Self {
            default_channel: default_channel.into(),
            manager,
            ctx_manager,
            matcher,
            breakers: Arc::new(BreakerRegistry::new()),
            on_message: RwLock::new(None),
            in_flight: AtomicI64::new(0),
            shutting_down: AtomicBool::new(false),
            lifecycle,
        })
    }

    pub fn channel_manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    pub fn context_manager(&self) -> &Arc<ChannelContextManager> {
        &self.ctx_manager
    }

    /// Atomically installs the processing callback, replacing any prior
    /// one.
    pub async fn set_on_message(&self, callback: OnMessageFn) {
        *self.on_message.write().await = Some(callback);
    }

    pub fn get_active_message_count(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// The central dispatch algorithm. Safe for concurrent invocation from
    /// any number of Channels.
    pub async fn handle_message(&self, msg: IncomingMessage) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(session = %msg.session_id, "dropping inbound message, gateway is shutting down");
            return;
        }

        self.ctx_manager.ensure(&msg.session_id, &msg.channel_name).await;

        let Some(inbound_channel) = self.manager.get(&msg.channel_name).await else {
            warn!(channel = %msg.channel_name, "inbound message from unregistered channel, dropping");
            return;
        };

        let event_sink = inbound_channel.event_sink(&msg.session_id);

        let Some(callback) = self.on_message.read().await.clone() else {
            warn!("no onMessage callback installed, dropping inbound message");
            return;
        };

        let outcome = std::panic::AssertUnwindSafe(callback(msg.clone(), event_sink))
            .catch_unwind()
            .await;

        let (answer, send_to_hint) = match outcome {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                error!(session = %msg.session_id, error = %e, "onMessage callback returned an error");
                self.reply_with_error(&msg, &inbound_channel.name().to_string()).await;
                return;
            },
            Err(_panic) => {
                error!(session = %msg.session_id, "onMessage callback panicked");
                self.reply_with_error(&msg, &inbound_channel.name().to_string()).await;
                return;
            },
        };

        if answer.is_empty() {
            return;
        }

        let target_name = if send_to_hint.is_empty() {
            msg.channel_name.clone()
        } else {
            match self.matcher.match_hint(&send_to_hint).await {
                Some(matched) => {
                    self.ctx_manager.switch(&msg.session_id, &matched).await;
                    matched
                },
                None => msg.channel_name.clone(),
            }
        };

        let outgoing = OutgoingMessage::text(msg.session_id.clone(), answer);
        self.send_via_breaker(&target_name, outgoing).await;
    }

    async fn reply_with_error(&self, msg: &IncomingMessage, inbound_channel_name: &str) {
        let outgoing = OutgoingMessage::text(msg.session_id.clone(), ERROR_REPLY_MESSAGE);
        self.send_via_breaker(inbound_channel_name, outgoing).await;
    }

    /// Sends `outgoing` on the named channel through its circuit breaker.
    /// Best-effort: failures are logged, never retried synchronously, never
    /// surfaced to the caller.
    async fn send_via_breaker(&self, target_name: &str, outgoing: OutgoingMessage) {
        let Some(target) = self.manager.get(target_name).await else {
            warn!(channel = %target_name, "no route: target channel not registered");
            return;
        };

        let breaker = self.breakers.get_or_create(target_name).await;
        if !breaker.try_acquire().await {
            warn!(channel = %target_name, "circuit open, dropping outbound send");
            return;
        }

        match target.send_message(outgoing).await {
            Ok(()) => breaker.record_success(),
            Err(e) => {
                breaker.record_failure();
                warn!(channel = %target_name, error = %e, "outbound send failed");
            },
        }
    }

    /// Sets the shutting-down flag, then polls the in-flight counter until
    /// it reaches zero or `deadline` elapses, then stops every managed
    /// channel. A channel whose stop fails does not abort shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.lifecycle.cancel();

        let wait = async {
            while self.in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
            }
        };

        let result = tokio::time::timeout(deadline, wait).await;

        let failures = self.manager.stop_all().await;
        for (name, e) in &failures {
            error!(channel = %name, error = %e, "channel stop failed during shutdown");
        }

        match result {
            Ok(()) => {
                info!("gateway shutdown complete");
                Ok(())
            },
            Err(_) => {
                error!(in_flight = self.get_active_message_count(), "shutdown deadline elapsed with requests still in flight");
                Err(Error::ShutdownTimeout)
            },
        }
    }

    pub fn default_channel(&self) -> &str {
        &self.default_channel
    }
}
