//! Data model shared by every Channel implementation: the inbound/outbound
//! message envelopes and the read-only status snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tag identifying which IM platform a channel adapts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Realtime,
    Wechat,
    Qq,
    Dingtalk,
    Feishu,
    Telegram,
    Whatsapp,
    Facebook,
    Imessage,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Wechat => "wechat",
            Self::Qq => "qq",
            Self::Dingtalk => "dingtalk",
            Self::Feishu => "feishu",
            Self::Telegram => "telegram",
            Self::Whatsapp => "whatsapp",
            Self::Facebook => "facebook",
            Self::Imessage => "imessage",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content kind carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Audio,
    Video,
    File,
}

impl Default for ContentType {
    fn default() -> Self {
        Self::Text
    }
}

/// Kind of the sender identity on the originating platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Group,
    Bot,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SenderType,
}

/// A message received from a Channel. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub channel_id: String,
    pub channel_name: String,
    pub session_id: String,
    pub message_id: String,
    pub sender: Sender,
    pub content: String,
    pub content_type: ContentType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A reply constructed by the Gateway and handed to a Channel's
/// `send_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub session_id: String,
    pub content: String,
    pub content_type: ContentType,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl OutgoingMessage {
    pub fn text(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            content_type: ContentType::Text,
            metadata: HashMap::new(),
        }
    }
}

/// Health status reported in a [`ChannelStatus`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthState,
    pub message: String,
    pub last_check_time: DateTime<Utc>,
    pub latency_ms: u64,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            status: HealthState::Healthy,
            message: String::new(),
            last_check_time: Utc::now(),
            latency_ms: 0,
        }
    }
}

/// Read-only snapshot of a Channel's runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub name: String,
    pub channel_type: ChannelType,
    pub description: String,
    pub running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub total_messages: i64,
    pub health_check: HealthCheck,
}

/// An out-of-band progress token streamed back to the client ahead of the
/// final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}
