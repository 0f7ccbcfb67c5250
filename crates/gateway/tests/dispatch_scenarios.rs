#![allow(clippy::unwrap_used, clippy::expect_used)]
//! The concrete dispatch scenarios: happy path, error reply, graceful and
//! timed-out shutdown, hint-based forwarding, and panic recovery.

use std::{collections::HashMap, sync::Arc, time::Duration};

use relaygate_channels::{
    Channel, ContentType, IncomingMessage, InboundHandler, MockChannel, Sender, SenderType,
};
use relaygate_gateway::{ERROR_REPLY_MESSAGE, Gateway};
use relaygate_matcher::HashEmbeddingService;
use tokio_util::sync::CancellationToken;

/// The Gateway installs its own routing on every channel it manages in
/// production; these tests drive `handle_message` directly, so the
/// channel-level inbound binding is never actually invoked.
fn noop_inbound_handler() -> InboundHandler {
    Arc::new(|_msg| Box::pin(async {}))
}

fn inbound_message(channel: &str, session: &str, content: &str) -> IncomingMessage {
    IncomingMessage {
        channel_id: channel.to_string(),
        channel_name: channel.to_string(),
        session_id: session.to_string(),
        message_id: "m1".to_string(),
        sender: Sender { id: "u1".to_string(), name: "user".to_string(), kind: SenderType::User },
        content: content.to_string(),
        content_type: ContentType::Text,
        timestamp: chrono::Utc::now(),
        metadata: HashMap::new(),
    }
}

async fn gateway_with_channel(name: &str) -> (Arc<Gateway>, Arc<MockChannel>) {
    let gateway = Gateway::new("feishu", Arc::new(HashEmbeddingService::default())).await;
    let channel = MockChannel::new(name);
    gateway
        .channel_manager()
        .create_and_start_channel(channel.clone(), noop_inbound_handler(), CancellationToken::new())
        .await
        .expect("start channel");
    (gateway, channel)
}

// S1 — Happy path: inbound, answer, reply on same channel.
#[tokio::test]
async fn happy_path_replies_on_inbound_channel() {
    let (gateway, channel) = gateway_with_channel("feishu").await;
    gateway
        .set_on_message(Arc::new(|_msg, _sink| Box::pin(async { Ok(("hello back".to_string(), String::new())) })))
        .await;

    gateway.handle_message(inbound_message("feishu", "s1", "hi")).await;

    let sent = channel.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "hello back");
    assert_eq!(gateway.get_active_message_count(), 0);
}

// S2 — Error reply: callback errors, user gets the stable message, never
// the raw error text.
#[tokio::test]
async fn callback_error_sends_stable_reply() {
    let (gateway, channel) = gateway_with_channel("feishu").await;
    gateway
        .set_on_message(Arc::new(|_msg, _sink| {
            Box::pin(async { Err(anyhow::anyhow!("db connection refused on port 5432")) })
        }))
        .await;

    gateway.handle_message(inbound_message("feishu", "s1", "hi")).await;

    let sent = channel.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, ERROR_REPLY_MESSAGE);
    assert!(!sent[0].content.contains("5432"), "raw error must never reach the user");
}

// S3 — Graceful shutdown: in-flight work drains before stop_all runs.
#[tokio::test]
async fn graceful_shutdown_waits_for_in_flight_then_stops_channels() {
    let (gateway, channel) = gateway_with_channel("feishu").await;
    gateway
        .set_on_message(Arc::new(|_msg, _sink| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(("done".to_string(), String::new()))
            })
        }))
        .await;

    let gw = gateway.clone();
    let handle = tokio::spawn(async move { gw.handle_message(inbound_message("feishu", "s1", "hi")).await });

    let result = gateway.shutdown(Duration::from_secs(2)).await;
    handle.await.expect("task join");

    assert!(result.is_ok());
    assert_eq!(gateway.get_active_message_count(), 0);
    assert!(!channel.is_running());
}

// S4 — Shutdown timeout: in-flight work outlives the deadline.
#[tokio::test]
async fn shutdown_times_out_when_deadline_too_short() {
    let (gateway, _channel) = gateway_with_channel("feishu").await;
    gateway
        .set_on_message(Arc::new(|_msg, _sink| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(("done".to_string(), String::new()))
            })
        }))
        .await;

    let gw = gateway.clone();
    let handle = tokio::spawn(async move { gw.handle_message(inbound_message("feishu", "s1", "hi")).await });
    // Give handle_message a moment to actually increment the counter.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = gateway.shutdown(Duration::from_millis(50)).await;
    assert!(result.is_err(), "shutdown should report the deadline was missed");

    handle.abort();
}

// S5 — Forwarding attempt with hint: matcher resolves the hint to a
// distinct registered channel and the session context switches to it.
#[tokio::test]
async fn forwarding_hint_switches_session_to_matched_channel() {
    let gateway = Gateway::new("feishu", Arc::new(HashEmbeddingService::default())).await;

    let feishu = MockChannel::new("feishu");
    let wechat = MockChannel::new("wechat");
    for channel in [feishu.clone(), wechat.clone()] {
        gateway
            .channel_manager()
            .create_and_start_channel(channel, noop_inbound_handler(), CancellationToken::new())
            .await
            .expect("start channel");
    }
    // Vectors recompute asynchronously off the change hook; give it a tick.
    tokio::time::sleep(Duration::from_millis(20)).await;

    gateway
        .set_on_message(Arc::new(|_msg, _sink| Box::pin(async { Ok(("OK".to_string(), "wechat".to_string())) })))
        .await;

    gateway.handle_message(inbound_message("feishu", "s1", "hi")).await;

    let ctx = gateway.context_manager().get("s1").await.expect("session context");
    assert_eq!(ctx.current_channel, "wechat");
    assert_eq!(wechat.sent_count().await, 1);
    assert_eq!(feishu.sent_count().await, 0);
}

// S6 — Panic recovery: a panicking callback is treated as an error, not a
// crashed task, and the gateway keeps serving subsequent messages.
#[tokio::test]
async fn panicking_callback_is_treated_as_error() {
    let (gateway, channel) = gateway_with_channel("feishu").await;
    gateway
        .set_on_message(Arc::new(|_msg, _sink| Box::pin(async { panic!("boom") })))
        .await;

    gateway.handle_message(inbound_message("feishu", "s1", "hi")).await;

    let sent = channel.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, ERROR_REPLY_MESSAGE);
    assert_eq!(gateway.get_active_message_count(), 0);

    // Gateway must still be usable after recovering from the panic.
    gateway
        .set_on_message(Arc::new(|_msg, _sink| Box::pin(async { Ok(("still alive".to_string(), String::new())) })))
        .await;
    gateway.handle_message(inbound_message("feishu", "s2", "hi again")).await;
    assert_eq!(channel.sent_count().await, 2);
}
