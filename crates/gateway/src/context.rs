//! Per-session routing state: which channel a session's replies currently
//! go out on. Grounded on the teacher's background-sweeper idiom (a
//! `tokio::spawn`'d loop on a fixed interval evicting idle entries), as
//! seen wired up in `telegram`'s bot task and reused here with an
//! `idle_ttl` rather than a poll interval.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub current_channel: String,
    pub last_active_at: DateTime<Utc>,
}

pub struct ChannelContextManager {
    sessions: RwLock<HashMap<String, SessionContext>>,
    idle_ttl: Duration,
}

impl ChannelContextManager {
    pub fn new(idle_ttl: Duration) -> Arc<Self> {
        Arc::new(Self { sessions: RwLock::new(HashMap::new()), idle_ttl })
    }

    /// Spawns the idle-session sweeper bound to `lifecycle`. Call once per
    /// manager instance.
    pub fn spawn_sweeper(self: &Arc<Self>, lifecycle: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                    _ = lifecycle.cancelled() => {
                        info!("session sweeper stopping");
                        return;
                    }
                }
                manager.sweep_idle().await;
            }
        });
    }

    async fn sweep_idle(&self) {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, ctx| {
            now.signed_duration_since(ctx.last_active_at).to_std().map(|age| age <= self.idle_ttl).unwrap_or(true)
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, remaining = sessions.len(), "swept idle sessions");
        }
    }

    /// Creates the context if absent, setting `current_channel` to
    /// `initial_channel`; returns the existing context unchanged otherwise.
    /// Never overwrites an existing `current_channel`.
    pub async fn ensure(&self, session_id: &str, initial_channel: &str) -> SessionContext {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionContext {
                session_id: session_id.to_string(),
                current_channel: initial_channel.to_string(),
                last_active_at: Utc::now(),
            })
            .clone()
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionContext> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Updates `current_channel` and `last_active_at`; a true no-op if
    /// `new_channel` already matches `current_channel` (activity is still
    /// refreshed on every inbound message via `ensure`, so this doesn't
    /// need to double as a keepalive).
    pub async fn switch(&self, session_id: &str, new_channel: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(ctx) = sessions.get_mut(session_id) {
            if ctx.current_channel != new_channel {
                ctx.current_channel = new_channel.to_string();
                ctx.last_active_at = Utc::now();
            }
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_creates_once_and_never_overwrites() {
        let mgr = ChannelContextManager::new(Duration::from_secs(60));
        let first = mgr.ensure("s1", "feishu").await;
        assert_eq!(first.current_channel, "feishu");

        let second = mgr.ensure("s1", "wechat").await;
        assert_eq!(second.current_channel, "feishu", "ensure must not overwrite an existing context");
        assert_eq!(mgr.count().await, 1);
    }

    #[tokio::test]
    async fn switch_updates_current_channel() {
        let mgr = ChannelContextManager::new(Duration::from_secs(60));
        mgr.ensure("s1", "feishu").await;
        mgr.switch("s1", "wechat").await;
        let ctx = mgr.get("s1").await.expect("context");
        assert_eq!(ctx.current_channel, "wechat");
    }

    #[tokio::test]
    async fn switch_on_unknown_session_is_noop() {
        let mgr = ChannelContextManager::new(Duration::from_secs(60));
        mgr.switch("ghost", "wechat").await;
        assert!(mgr.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn switch_to_same_channel_does_not_touch_last_active_at() {
        let mgr = ChannelContextManager::new(Duration::from_secs(60));
        let created = mgr.ensure("s1", "feishu").await;
        mgr.switch("s1", "feishu").await;
        let ctx = mgr.get("s1").await.expect("context");
        assert_eq!(ctx.current_channel, "feishu");
        assert_eq!(ctx.last_active_at, created.last_active_at);
    }

    #[tokio::test]
    async fn sweep_evicts_idle_sessions_only() {
        let mgr = ChannelContextManager::new(Duration::from_millis(0));
        mgr.ensure("s1", "feishu").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.sweep_idle().await;
        assert_eq!(mgr.count().await, 0);
    }
}
