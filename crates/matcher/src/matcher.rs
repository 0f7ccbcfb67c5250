//! Embedding-vector nearest-channel search with an LRU cache in front,
//! wired to a `ChannelManager`'s change hook so its vector table always
//! reflects the live channel set (see `SPEC_FULL.md`'s resolution of the
//! precomputation-timing question: recompute on every add/remove, no
//! construction-time snapshot to go stale).

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use relaygate_channels::{Channel, ChannelManager};

use crate::{
    cache::MatchCache,
    embedding::{Embedding, EmbeddingService},
};

const MIN_SIMILARITY: f32 = 0.35;

pub struct SemanticChannelMatcher {
    embedding_service: Arc<dyn EmbeddingService>,
    vectors: RwLock<HashMap<String, Embedding>>,
    cache: Mutex<MatchCache>,
}

impl SemanticChannelMatcher {
    pub fn new(embedding_service: Arc<dyn EmbeddingService>) -> Arc<Self> {
        Arc::new(Self {
            embedding_service,
            vectors: RwLock::new(HashMap::new()),
            cache: Mutex::new(MatchCache::default()),
        })
    }

    /// Registers this matcher as a change hook on `manager` so every
    /// channel add/remove triggers a full vector recompute.
    pub async fn subscribe(self: &Arc<Self>, manager: &ChannelManager) {
        let matcher = self.clone();
        manager
            .on_change(Arc::new(move |channels| {
                let matcher = matcher.clone();
                tokio::spawn(async move { matcher.recompute(channels).await });
            }))
            .await;
    }

    /// Recomputes the full vector table from the current channel set.
    /// Invalidates the match cache, since previously-cached winners may no
    /// longer be the argmax over the new set.
    pub async fn recompute(&self, channels: Vec<Arc<dyn Channel>>) {
        let mut vectors = HashMap::with_capacity(channels.len());
        for channel in &channels {
            let text = format!("{} {} {}", channel.name(), channel.description(), channel.channel_type());
            match self.embedding_service.embed(&text).await {
                Ok(embedding) => {
                    vectors.insert(channel.name().to_string(), embedding);
                },
                Err(e) => {
                    warn!(channel = channel.name(), error = %e, "embedding service failed computing channel vector");
                },
            }
        }
        *self.vectors.write().await = vectors;
        self.cache.lock().await.clear();
        debug!(channel_count = channels.len(), "channel vector table recomputed");
    }

    /// Resolves a free-form `sendTo` hint to a managed channel name, or
    /// `None` for "no match".
    pub async fn match_hint(&self, hint: &str) -> Option<String> {
        if hint.trim().is_empty() {
            return None;
        }

        if let Some(entry) = self.cache.lock().await.get(hint) {
            return Some(entry.channel_name);
        }

        let vectors = self.vectors.read().await;
        if vectors.is_empty() {
            return self.exact_name_match(hint, &vectors);
        }

        let hint_embedding = match self.embedding_service.embed(hint).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "embedding service unavailable, falling back to exact-name match");
                return self.exact_name_match(hint, &vectors);
            },
        };

        let best = vectors
            .iter()
            .map(|(name, vector)| (name.clone(), hint_embedding.cosine_similarity(vector)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        // A below-threshold argmax is a confident "no match", not a
        // degradation — the exact-name fallback is reserved for the two
        // documented degradation paths above (embedding service unavailable,
        // empty vector table), never for a semantic score that simply lost.
        match best {
            Some((name, score)) if score >= MIN_SIMILARITY => {
                self.cache.lock().await.insert(hint, name.clone(), score);
                Some(name)
            },
            _ => None,
        }
    }

    fn exact_name_match(&self, hint: &str, vectors: &HashMap<String, Embedding>) -> Option<String> {
        vectors
            .keys()
            .find(|name| hint.eq_ignore_ascii_case(name) || hint.to_lowercase().contains(&name.to_lowercase()))
            .cloned()
    }
}
