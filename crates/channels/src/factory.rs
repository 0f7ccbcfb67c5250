//! Process-wide channel-type factory registry.
//!
//! Each channel-type adapter registers its constructor once, typically from
//! a `lazy_static`-free `OnceLock`-guarded init call performed by the CLI
//! wiring at startup. The registry is write-only during that startup phase
//! and read-only afterwards, so a single `RwLock` is adequate (see
//! `SPEC_FULL.md` §5: "No global mutable state beyond: the factory
//! registry... and the breaker registry").

use std::{collections::HashMap, sync::RwLock};

use crate::{channel::ChannelFactory, error::Error};

static FACTORIES: RwLock<Option<HashMap<String, ChannelFactory>>> = RwLock::new(None);

/// Registers a factory for `type_name`. Called once per channel-type
/// adapter during process startup. Overwrites any prior registration for
/// the same type name.
pub fn register_channel_factory(type_name: impl Into<String>, factory: ChannelFactory) {
    let mut guard = FACTORIES.write().unwrap_or_else(|e| e.into_inner());
    guard.get_or_insert_with(HashMap::new).insert(type_name.into(), factory);
}

/// Looks up the factory for `type_name` and invokes it with `config`.
pub fn create_channel(
    type_name: &str,
    config: &HashMap<String, serde_json::Value>,
) -> crate::error::Result<std::sync::Arc<dyn crate::channel::Channel>> {
    let guard = FACTORIES.read().unwrap_or_else(|e| e.into_inner());
    let factory = guard
        .as_ref()
        .and_then(|m| m.get(type_name))
        .ok_or_else(|| Error::UnknownChannelType(type_name.to_string()))?;
    factory(config)
}

/// Lists the type names currently registered. Intended for diagnostics.
pub fn registered_types() -> Vec<String> {
    FACTORIES
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::{ChannelStatus, ChannelType, HealthCheck};

    struct StubChannel(String);

    #[async_trait::async_trait]
    impl crate::channel::Channel for StubChannel {
        fn name(&self) -> &str {
            &self.0
        }
        fn channel_type(&self) -> ChannelType {
            ChannelType::Realtime
        }
        fn description(&self) -> &str {
            "stub"
        }
        async fn start(&self, _lifecycle: tokio_util::sync::CancellationToken) -> crate::error::Result<()> {
            Ok(())
        }
        async fn stop(&self) -> crate::error::Result<()> {
            Ok(())
        }
        fn is_running(&self) -> bool {
            false
        }
        fn set_on_message(&self, _handler: crate::channel::InboundHandler) {}
        async fn send_message(&self, _msg: crate::types::OutgoingMessage) -> crate::error::Result<()> {
            Ok(())
        }
        async fn get_status(&self) -> ChannelStatus {
            ChannelStatus {
                name: self.0.clone(),
                channel_type: ChannelType::Realtime,
                description: "stub".into(),
                running: false,
                start_time: None,
                last_message_time: None,
                total_messages: 0,
                health_check: HealthCheck::default(),
            }
        }
    }

    #[test]
    fn register_and_create_round_trips() {
        register_channel_factory(
            "stub-test-type",
            Arc::new(|_cfg| Ok(Arc::new(StubChannel("from-factory".into())) as Arc<dyn crate::channel::Channel>)),
        );
        let created = create_channel("stub-test-type", &HashMap::new()).expect("factory present");
        assert_eq!(created.name(), "from-factory");
    }

    #[test]
    fn unknown_type_errors() {
        let err = create_channel("definitely-not-registered", &HashMap::new());
        assert!(matches!(err, Err(Error::UnknownChannelType(_))));
    }
}
