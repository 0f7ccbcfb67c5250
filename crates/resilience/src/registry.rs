//! Process-global registry of circuit breakers keyed by channel name,
//! lazily created on first use. Mirrors the factory registry's
//! write-rarely/read-often shape in `relaygate_channels::factory`.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::RwLock;

use crate::circuit_breaker::CircuitBreaker;

pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self { breakers: RwLock::new(HashMap::new()) }
    }

    /// Returns the breaker for `channel_name`, creating it with default
    /// configuration (threshold 5, 30s cooldown) if it doesn't exist yet.
    pub async fn get_or_create(&self, channel_name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(channel_name) {
            return existing.clone();
        }
        let mut guard = self.breakers.write().await;
        guard
            .entry(channel_name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_name(channel_name)))
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.breakers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reuses_breaker_for_same_name() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("slack").await;
        let b = registry.get_or_create("slack").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_names_get_distinct_breakers() {
        let registry = BreakerRegistry::new();
        let a = registry.get_or_create("slack").await;
        let b = registry.get_or_create("telegram").await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 2);
    }
}
