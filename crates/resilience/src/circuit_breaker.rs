//! Three-state circuit breaker guarding outbound channel sends.
//!
//! ```text
//! ┌─────────┐  failure_threshold   ┌────────┐
//! │ CLOSED  │ ─────────────────── ▶│  OPEN  │
//! └─────────┘                      └────────┘
//!      ▲                                │
//!      │ probe succeeds                 │ cooldown elapsed
//!      │                                ▼
//!      │                         ┌───────────┐
//!      └─────────────────────────│ HALF_OPEN │
//!        probe fails reopens  ◀──│(one probe)│
//!                                └───────────┘
//! ```
//!
//! Unlike a success-threshold variant, half-open here admits exactly one
//! probe: the first caller through wins the slot, everyone else is turned
//! away with [`CircuitState::Open`]'s fail-fast behaviour until that probe
//! resolves.

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub name: String,
}

impl CircuitBreakerConfig {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30), name: "default".to_string() }
    }
}

const STATE_CLOSED: u32 = 0;
const STATE_OPEN: u32 = 1;
const STATE_HALF_OPEN: u32 = 2;
/// Set on the half-open slot while a probe is in flight so exactly one
/// caller is admitted; cleared when the probe's outcome is recorded.
const STATE_HALF_OPEN_CLAIMED: u32 = 3;

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    failure_count: AtomicU32,
    opened_at_ms: AtomicU64,
    state: AtomicU32,
    /// Guards the open→half-open and half-open→claimed transitions so two
    /// racing callers can't both believe they won the probe slot.
    transition: Mutex<()>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failure_count: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            state: AtomicU32::new(STATE_CLOSED),
            transition: Mutex::new(()),
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::with_name(name))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_HALF_OPEN | STATE_HALF_OPEN_CLAIMED => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }

    /// Attempts to reserve a slot to execute through the breaker. Returns
    /// `true` when the caller may proceed (closed, or the one admitted
    /// half-open probe); `false` means fail fast.
    pub async fn try_acquire(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => true,
            STATE_HALF_OPEN_CLAIMED => false,
            STATE_OPEN => {
                if self.cooldown_elapsed() {
                    self.try_enter_half_open().await
                } else {
                    false
                }
            },
            STATE_HALF_OPEN => self.try_enter_half_open().await,
            _ => true,
        }
    }

    async fn try_enter_half_open(&self) -> bool {
        let _guard = self.transition.lock().await;
        match self.state.compare_exchange(
            STATE_OPEN,
            STATE_HALF_OPEN_CLAIMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::info!(circuit = %self.config.name, "circuit breaker admitted half-open probe");
                true
            },
            Err(_) => self
                .state
                .compare_exchange(STATE_HALF_OPEN, STATE_HALF_OPEN_CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }

    pub fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN_CLAIMED => self.close(),
            STATE_CLOSED => self.failure_count.store(0, Ordering::Relaxed),
            _ => {},
        }
    }

    pub fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN_CLAIMED => self.open(),
            STATE_CLOSED => {
                let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold {
                    self.open();
                }
            },
            _ => {},
        }
    }

    pub fn reset(&self) {
        self.close();
    }

    fn cooldown_elapsed(&self) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::Relaxed);
        if opened_at == 0 {
            return false;
        }
        now_ms().saturating_sub(opened_at) >= self.config.cooldown.as_millis() as u64
    }

    fn open(&self) {
        self.state.store(STATE_OPEN, Ordering::Release);
        self.opened_at_ms.store(now_ms(), Ordering::Relaxed);
        tracing::warn!(circuit = %self.config.name, cooldown_secs = self.config.cooldown.as_secs(), "circuit breaker opened");
    }

    fn close(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Relaxed);
        self.opened_at_ms.store(0, Ordering::Relaxed);
        tracing::info!(circuit = %self.config.name, "circuit breaker closed");
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_closed_and_admits() {
        let cb = CircuitBreaker::with_name("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().await);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 3, ..CircuitBreakerConfig::with_name("test") });
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire().await);
    }

    #[tokio::test]
    async fn half_open_admits_exactly_one_probe() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(0),
            name: "test".to_string(),
        });
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.try_acquire().await);
        assert!(!cb.try_acquire().await, "second caller must be rejected while probe is in flight");
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn probe_success_closes_circuit() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(0),
            name: "test".to_string(),
        });
        cb.record_failure();
        assert!(cb.try_acquire().await);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().await);
    }

    #[tokio::test]
    async fn probe_failure_reopens_and_restarts_cooldown() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(0),
            name: "test".to_string(),
        });
        cb.record_failure();
        assert!(cb.try_acquire().await);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().await, "cooldown of 0ms means the next probe is admitted immediately");
    }

    #[tokio::test]
    async fn manual_reset_closes_circuit() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig { failure_threshold: 2, ..CircuitBreakerConfig::with_name("test") });
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().await);
    }
}
