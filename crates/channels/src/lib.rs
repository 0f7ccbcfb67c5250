//! Channel plugin abstraction: the `Channel` trait, its concrete variants
//! (realtime WebSocket, generic webhook, OneBot, iMessage), the process-wide
//! factory registry, and the `ChannelManager` that owns running instances.

pub mod channel;
pub mod error;
pub mod factory;
pub mod manager;
pub mod mock;
pub mod types;
pub mod variants;

pub use channel::{Channel, ChannelFactory, EventSink, InboundHandler};
pub use error::{Error, FromMessage, Result};
pub use factory::{create_channel, register_channel_factory, registered_types};
pub use manager::{ChangeHook, ChannelManager};
pub use mock::MockChannel;
pub use types::{
    ChannelStatus, ChannelType, ContentType, HealthCheck, HealthState, IncomingMessage,
    OutgoingMessage, Sender, SenderType, ThinkingEvent,
};
pub use variants::{IMessageChannel, IMessageSource, OneBotChannel, RealtimeChannel, WebhookChannel, WebhookParser};
