//! Registry + lifecycle of Channels; config→instance factory.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    channel::{Channel, InboundHandler},
    error::{Error, Result},
    factory,
};

/// Insert/remove notification so collaborators (the semantic matcher) can
/// keep their channel-derived state current. See `SPEC_FULL.md`'s resolved
/// open question: vectors are recomputed on every add/remove, never once
/// at construction time.
pub type ChangeHook = Arc<dyn Fn(Vec<Arc<dyn Channel>>) + Send + Sync>;

/// Registry of all managed Channels, keyed by name.
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
    on_change: RwLock<Vec<ChangeHook>>,
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            on_change: RwLock::new(Vec::new()),
        }
    }

    /// Registers a hook invoked with the full channel list after every
    /// successful add or remove.
    pub async fn on_change(&self, hook: ChangeHook) {
        self.on_change.write().await.push(hook);
    }

    async fn notify(&self) {
        let snapshot: Vec<Arc<dyn Channel>> = self.channels.read().await.values().cloned().collect();
        for hook in self.on_change.read().await.iter() {
            hook(snapshot.clone());
        }
    }

    /// Inserts into the name→channel map. Fails if a channel with that
    /// name already exists. Does NOT start it.
    pub async fn add_channel(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let name = channel.name().to_string();
        {
            let mut guard = self.channels.write().await;
            if guard.contains_key(&name) {
                return Err(Error::AlreadyRegistered(name));
            }
            guard.insert(name.clone(), channel);
        }
        info!(channel = %name, "channel registered");
        self.notify().await;
        Ok(())
    }

    /// Adds, installs the inbound binding, and starts the channel. On any
    /// step's failure the channel is removed again.
    pub async fn create_and_start_channel(
        &self,
        channel: Arc<dyn Channel>,
        inbound: InboundHandler,
        lifecycle: CancellationToken,
    ) -> Result<()> {
        let name = channel.name().to_string();
        self.add_channel(channel.clone()).await?;
        channel.set_on_message(inbound);
        if let Err(e) = channel.start(lifecycle).await {
            warn!(channel = %name, error = %e, "channel start failed, removing");
            self.remove_channel(&name).await?;
            return Err(e);
        }
        Ok(())
    }

    /// For each enabled channel in `configs` (type_name → config map),
    /// invokes the registered factory, adds and starts it. Continues past
    /// individual failures, collecting them rather than aborting.
    pub async fn create_channels_from_config(
        &self,
        configs: &[(String, HashMap<String, serde_json::Value>)],
        inbound: InboundHandler,
        lifecycle: CancellationToken,
    ) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for (type_name, cfg) in configs {
            let channel = match factory::create_channel(type_name, cfg) {
                Ok(c) => c,
                Err(e) => {
                    error!(channel_type = %type_name, error = %e, "channel factory failed");
                    failures.push((type_name.clone(), e));
                    continue;
                },
            };
            if let Err(e) = self
                .create_and_start_channel(channel, inbound.clone(), lifecycle.clone())
                .await
            {
                error!(channel_type = %type_name, error = %e, "channel start failed");
                failures.push((type_name.clone(), e));
            }
        }
        failures
    }

    /// Stops and removes the channel. Idempotent on unknown name.
    pub async fn remove_channel(&self, name: &str) -> Result<()> {
        let channel = self.channels.write().await.remove(name);
        if let Some(channel) = channel {
            if let Err(e) = channel.stop().await {
                warn!(channel = %name, error = %e, "stop failed during removal");
            }
            info!(channel = %name, "channel removed");
            self.notify().await;
        }
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Stops every managed channel. A channel whose `stop` fails does not
    /// abort the sweep; its error is logged and aggregated.
    pub async fn stop_all(&self) -> Vec<(String, Error)> {
        let channels: Vec<Arc<dyn Channel>> = self.channels.read().await.values().cloned().collect();
        let mut failures = Vec::new();
        for channel in channels {
            let name = channel.name().to_string();
            if let Err(e) = channel.stop().await {
                error!(channel = %name, error = %e, "stop failed during stop_all");
                failures.push((name, e));
            }
        }
        failures
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;
    use crate::mock::MockChannel;

    fn noop_inbound() -> InboundHandler {
        Arc::new(|_msg| Box::pin(async {}))
    }

    #[tokio::test]
    async fn add_channel_rejects_duplicate_name() {
        let manager = ChannelManager::new();
        manager.add_channel(MockChannel::new("feishu")).await.expect("first add");

        let err = manager.add_channel(MockChannel::new("feishu")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(name) if name == "feishu"));
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn create_and_start_channel_installs_handler_before_running() {
        let manager = ChannelManager::new();
        let channel = MockChannel::new("feishu");
        manager
            .create_and_start_channel(channel.clone(), noop_inbound(), CancellationToken::new())
            .await
            .expect("create and start");

        assert!(channel.is_running());
        assert!(channel.handler().await.is_some());
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn remove_channel_is_idempotent_on_unknown_name() {
        let manager = ChannelManager::new();
        manager.remove_channel("ghost").await.expect("removing unknown channel is a no-op");
        assert_eq!(manager.count().await, 0);
    }

    #[tokio::test]
    async fn remove_channel_stops_and_evicts() {
        let manager = ChannelManager::new();
        let channel = MockChannel::new("feishu");
        manager.add_channel(channel.clone()).await.expect("add");
        channel.start(CancellationToken::new()).await.expect("start");

        manager.remove_channel("feishu").await.expect("remove");
        assert!(!channel.is_running());
        assert!(manager.get("feishu").await.is_none());
    }

    #[tokio::test]
    async fn stop_all_stops_every_managed_channel() {
        let manager = ChannelManager::new();
        let a = MockChannel::new("feishu");
        let b = MockChannel::new("wechat");
        for c in [a.clone(), b.clone()] {
            manager.add_channel(c.clone()).await.expect("add");
            c.start(CancellationToken::new()).await.expect("start");
        }

        let failures = manager.stop_all().await;
        assert!(failures.is_empty());
        assert!(!a.is_running());
        assert!(!b.is_running());
    }

    #[tokio::test]
    async fn on_change_hook_fires_on_add_and_remove() {
        let manager = ChannelManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = calls.clone();
        manager
            .on_change(Arc::new(move |_channels| {
                hook_calls.fetch_add(1, AtomicOrdering::SeqCst);
            }))
            .await;

        manager.add_channel(MockChannel::new("feishu")).await.expect("add");
        manager.remove_channel("feishu").await.expect("remove");

        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
    }
}
