//! The Channel capability set: one polymorphic interface implemented by
//! every IM-platform adapter, modeled as a trait with tagged variants
//! rather than the source's inheritance hierarchy (see `plugin.rs` in the
//! teacher for the analogous `ChannelPlugin`/`ChannelOutbound` split this
//! generalizes).

use std::{future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Result,
    types::{ChannelStatus, ChannelType, OutgoingMessage, IncomingMessage, ThinkingEvent},
};

/// The inbound binding a `ChannelManager` installs on every managed
/// Channel: a single callback invoked for every message the Channel
/// receives. In this codebase the installed handler is always
/// `Gateway::handle_message`, but the Channel itself only knows the
/// function shape, not the Gateway.
pub type InboundHandler =
    Arc<dyn Fn(IncomingMessage) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Sink capability for a session's out-of-band "thinking" event stream.
/// The processing callback writes; the owning Channel task reads and
/// serializes to the wire. Bounded, drop-oldest on overflow.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: ThinkingEvent);
}

/// One adapter to one IM/chat platform: both inbound receiver and outbound
/// sender. `RealTime`, `Webhook`, `OneBotWS`, and `IMessage` are modeled as
/// distinct implementors rather than an enum, since each owns materially
/// different background-task machinery.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    fn channel_type(&self) -> ChannelType;

    fn description(&self) -> &str;

    /// Idempotent-by-failure: calling twice while running fails with
    /// `AlreadyRunning`. Binds `lifecycle` as the channel's cancellation
    /// token; on cancellation the channel must stop accepting new inbound
    /// and begin its stop sequence. Must return promptly — network
    /// listeners run in background tasks.
    async fn start(&self, lifecycle: CancellationToken) -> Result<()>;

    /// Idempotent: no-op if already stopped. Closes client connections,
    /// halts background tasks, waits for in-flight receive handlers to
    /// complete or a bounded timeout to elapse.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Registers the single inbound handler invoked for every message.
    /// Replaces any prior handler.
    fn set_on_message(&self, handler: InboundHandler);

    /// Fails with `NotRunning` if stopped, `NoRoute` if the session has no
    /// active endpoint on this channel; otherwise attempts delivery and
    /// succeeds only once the platform acknowledges.
    async fn send_message(&self, msg: OutgoingMessage) -> Result<()>;

    async fn get_status(&self) -> ChannelStatus;

    /// The per-session thinking-event sink, if this channel supports
    /// streaming progress tokens. `None` for channels without a live
    /// duplex connection (e.g. Webhook).
    fn event_sink(&self, _session_id: &str) -> Option<Arc<dyn EventSink>> {
        None
    }
}

/// Factory function registered per channel-type string: builds a Channel
/// instance from its config map.
pub type ChannelFactory =
    Arc<dyn Fn(&std::collections::HashMap<String, serde_json::Value>) -> Result<Arc<dyn Channel>> + Send + Sync>;
