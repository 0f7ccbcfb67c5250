//! Registers one `ChannelFactory` per supported channel type at process
//! startup, reading each factory's config map per `SPEC_FULL.md` §6's
//! per-platform key list (appID/appSecret/token/encryptKey/port/path/...).

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use relaygate_channels::{
    Channel, ChannelType, Error, Result,
    register_channel_factory,
    variants::{
        OneBotChannel,
        RealtimeChannel,
        WebhookChannel, WebhookParser,
        onebot::OneBotConfig,
        realtime::RealtimeConfig,
        webhook::{DingTalkParser, WeChatParser},
    },
};

fn str_field(cfg: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    cfg.get(key).and_then(|v| v.as_str()).map(ToString::to_string)
}

fn bind_addr_field(cfg: &HashMap<String, serde_json::Value>, default_port: u16) -> SocketAddr {
    let port = cfg.get("port").and_then(|v| v.as_u64()).map(|p| p as u16).unwrap_or(default_port);
    SocketAddr::from(([0, 0, 0, 0], port))
}

/// Registers the realtime, WeChat webhook, DingTalk webhook, OneBot, and
/// iMessage factories. Call once at startup, before loading any config.
pub fn register_builtin_factories() {
    register_channel_factory(
        "realtime",
        Arc::new(|cfg| -> Result<Arc<dyn Channel>> {
            let mut config = RealtimeConfig::default();
            config.bind_addr = bind_addr_field(cfg, 8765);
            if let Some(max) = cfg.get("max_connections").and_then(|v| v.as_u64()) {
                config.max_connections = max as usize;
            }
            if let Some(secs) = cfg.get("ping_interval_seconds").and_then(|v| v.as_u64()) {
                config.ping_interval = Duration::from_secs(secs);
            }
            if let Some(token) = str_field(cfg, "token") {
                config.token = Some(token);
            }
            if let Some(origins) = cfg.get("allowed_origins").and_then(|v| v.as_array()) {
                config.allowed_origins =
                    origins.iter().filter_map(|v| v.as_str().map(ToString::to_string)).collect();
            }
            Ok(Arc::new(RealtimeChannel::new("realtime", config)))
        }),
    );

    register_channel_factory(
        "wechat",
        Arc::new(|cfg| -> Result<Arc<dyn Channel>> {
            let token = str_field(cfg, "token")
                .ok_or_else(|| Error::Validation("wechat channel requires a 'token'".to_string()))?;
            let path = str_field(cfg, "path").unwrap_or_else(|| "/webhook/wechat".to_string());
            let bind_addr = bind_addr_field(cfg, 8766);
            let parser: Arc<dyn WebhookParser> = Arc::new(WeChatParser { token });
            Ok(Arc::new(WebhookChannel::new("wechat", ChannelType::Wechat, path, bind_addr, parser)))
        }),
    );

    register_channel_factory(
        "dingtalk",
        Arc::new(|cfg| -> Result<Arc<dyn Channel>> {
            let encrypt_key = str_field(cfg, "encryptKey")
                .ok_or_else(|| Error::Validation("dingtalk channel requires an 'encryptKey'".to_string()))?;
            let path = str_field(cfg, "path").unwrap_or_else(|| "/webhook/dingtalk".to_string());
            let bind_addr = bind_addr_field(cfg, 8767);
            let parser: Arc<dyn WebhookParser> = Arc::new(DingTalkParser { encrypt_key });
            Ok(Arc::new(WebhookChannel::new("dingtalk", ChannelType::Dingtalk, path, bind_addr, parser)))
        }),
    );

    register_channel_factory(
        "qq",
        Arc::new(|cfg| -> Result<Arc<dyn Channel>> {
            let ws_url = str_field(cfg, "webhookURL")
                .or_else(|| str_field(cfg, "ws_url"))
                .ok_or_else(|| Error::Validation("qq channel requires a 'webhookURL'".to_string()))?;
            let access_token = str_field(cfg, "accessToken");
            Ok(Arc::new(OneBotChannel::new("qq", OneBotConfig { ws_url, access_token })))
        }),
    );

    // Registered so `registered_types` reports "imessage" as a known type
    // name; the factory always errors because `IMessageChannel` needs a
    // concrete `IMessageSource` (the local Messages.app database reader),
    // which only a real macOS deployment can supply.
    register_channel_factory(
        "imessage",
        Arc::new(|_cfg| -> Result<Arc<dyn Channel>> {
            Err(Error::Validation(
                "imessage requires an IMessageSource implementation wired by the embedding binary, not the generic factory".to_string(),
            ))
        }),
    );
}
