pub mod imessage;
pub mod onebot;
pub mod realtime;
pub mod webhook;

pub use imessage::{IMessageChannel, IMessageSource};
pub use onebot::OneBotChannel;
pub use realtime::RealtimeChannel;
pub use webhook::{WebhookChannel, WebhookParser};
