//! Single-flight OAuth-style token refresher for platforms (WeChat,
//! DingTalk, …) that hand out short-lived bearer tokens. Grounded on the
//! single-flight-via-shared-mutex idiom: concurrent callers queue on the
//! same `tokio::sync::Mutex` rather than each kicking off their own
//! refresh, so by the time a queued caller acquires the lock the token
//! refreshed by whoever got there first is already visible.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use relaygate_common::error::{Error, Result};

pub type RefreshFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<(String, u64)>> + Send>> + Send + Sync,
>;

struct TokenState {
    token: String,
    /// `issued_at + 0.9 × ttl` — past this point `get_token` attempts a
    /// fresh refresh rather than reusing the cached token.
    soft_expires_at: Instant,
    /// `issued_at + ttl` — the platform's actual expiry. A refresh that
    /// fails while still inside this window serves the stale token instead
    /// of surfacing the error.
    hard_expires_at: Instant,
}

impl TokenState {
    fn new(token: String, ttl_secs: u64) -> Self {
        let issued_at = Instant::now();
        Self {
            token,
            soft_expires_at: issued_at + Duration::from_secs_f64(ttl_secs as f64 * 0.9),
            hard_expires_at: issued_at + Duration::from_secs(ttl_secs),
        }
    }
}

struct Inner {
    refresh: RefreshFn,
    state: Mutex<Option<TokenState>>,
}

/// Schedules its own proactive background refresh at `0.9 × ttl` after each
/// success, so `get_token` only blocks on a synchronous refresh the first
/// time or after the proactive refresh itself has failed repeatedly.
#[derive(Clone)]
pub struct TokenRefresher {
    inner: Arc<Inner>,
}

impl TokenRefresher {
    pub fn new(refresh: RefreshFn) -> Self {
        Self { inner: Arc::new(Inner { refresh, state: Mutex::new(None) }) }
    }

    /// Returns the current token, refreshing (and coalescing concurrent
    /// refreshes) if past its soft expiry or not yet fetched. A refresh
    /// failure between soft and hard expiry serves the stale token instead
    /// of propagating the error.
    pub async fn get_token(&self) -> Result<String> {
        let mut guard = self.inner.state.lock().await;

        if let Some(state) = guard.as_ref() {
            if state.soft_expires_at > Instant::now() {
                return Ok(state.token.clone());
            }
        }

        match (self.inner.refresh)().await {
            Ok((token, ttl_secs)) => {
                let state = TokenState::new(token.clone(), ttl_secs);
                *guard = Some(state);
                drop(guard);
                self.schedule_background_refresh(ttl_secs);
                Ok(token)
            },
            Err(e) => match guard.as_ref() {
                Some(stale) if stale.hard_expires_at > Instant::now() => {
                    warn!(error = %e, "token refresh failed, serving stale token still within ttl");
                    Ok(stale.token.clone())
                },
                _ => Err(e),
            },
        }
    }

    fn schedule_background_refresh(&self, ttl_secs: u64) {
        let delay = Duration::from_secs_f64(ttl_secs as f64 * 0.9);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut guard = inner.state.lock().await;
            match (inner.refresh)().await {
                Ok((token, ttl_secs)) => {
                    *guard = Some(TokenState::new(token, ttl_secs));
                    info!("proactive token refresh succeeded");
                },
                Err(e) => {
                    debug!(error = %e, "proactive token refresh failed, will retry on next get_token");
                },
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_refresher(ttl_secs: u64, calls: Arc<AtomicUsize>) -> TokenRefresher {
        TokenRefresher::new(Arc::new(move || {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok((format!("token-{n}"), ttl_secs))
            })
        }))
    }

    #[tokio::test]
    async fn fetches_token_on_first_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = counting_refresher(3600, calls.clone());
        let token = refresher.get_token().await.expect("refresh");
        assert_eq!(token, "token-0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reuses_unexpired_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = counting_refresher(3600, calls.clone());
        let first = refresher.get_token().await.expect("refresh");
        let second = refresher.get_token().await.expect("refresh");
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refreshes_again_once_expired() {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = counting_refresher(0, calls.clone());
        let first = refresher.get_token().await.expect("refresh");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = refresher.get_token().await.expect("refresh");
        assert_ne!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stale_token_served_on_refresh_error_within_ttl() {
        // Always-failing refresh fn: any call into it drives the error
        // branch of `get_token`.
        let refresher = TokenRefresher::new(Arc::new(|| {
            Box::pin(async { Err(Error::message("refresh endpoint unavailable")) })
        }));

        // Seed a token whose soft expiry has already passed (forcing
        // `get_token` to attempt a refresh) but whose hard expiry is still
        // well in the future (so the failed refresh must serve it stale).
        {
            let mut guard = refresher.inner.state.lock().await;
            *guard = Some(TokenState {
                token: "stale-token".to_string(),
                soft_expires_at: Instant::now() - Duration::from_secs(1),
                hard_expires_at: Instant::now() + Duration::from_secs(3600),
            });
        }

        let token = refresher.get_token().await.expect("stale token served");
        assert_eq!(token, "stale-token");
    }

    #[tokio::test]
    async fn refresh_error_past_hard_expiry_surfaces() {
        let refresher = TokenRefresher::new(Arc::new(|| {
            Box::pin(async { Err(Error::message("refresh endpoint unavailable")) })
        }));

        {
            let mut guard = refresher.inner.state.lock().await;
            *guard = Some(TokenState {
                token: "long-gone".to_string(),
                soft_expires_at: Instant::now() - Duration::from_secs(2),
                hard_expires_at: Instant::now() - Duration::from_secs(1),
            });
        }

        assert!(refresher.get_token().await.is_err());
    }
}
