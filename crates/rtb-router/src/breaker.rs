//! Per-agent circuit breaker for the solicitation path.
//!
//! An agent whose transport keeps failing is skipped instead of burning
//! deadline budget on it: the breaker opens after K consecutive failures,
//! half-opens after a cool-down to let one probe through, and closes again
//! on the first success.
//!
//! `allows_send()` is on the hot path and must stay a single atomic load.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Breaker tuning, shared by every agent unless overridden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive transport failures before the breaker opens.
    pub max_consecutive_failures: u32,
    /// How long the breaker stays open before allowing a probe.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            cooldown_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Breaker state as seen by diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Lock-free per-agent circuit breaker.
#[derive(Debug)]
pub struct AgentBreaker {
    config: BreakerConfig,
    open: AtomicBool,
    half_open: AtomicBool,
    consecutive_failures: AtomicU32,
    opened_at_ms: AtomicI64,
    total_trips: AtomicU32,
}

impl AgentBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            open: AtomicBool::new(false),
            half_open: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
            total_trips: AtomicU32::new(0),
        }
    }

    /// May the router solicit this agent right now?
    ///
    /// Single atomic load; called once per (request, agent).
    #[inline(always)]
    pub fn allows_send(&self) -> bool {
        !self.open.load(Ordering::Acquire)
    }

    pub fn state(&self) -> BreakerState {
        if self.open.load(Ordering::Acquire) {
            if self.half_open.load(Ordering::Acquire) {
                BreakerState::HalfOpen
            } else {
                BreakerState::Open
            }
        } else {
            BreakerState::Closed
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn total_trips(&self) -> u32 {
        self.total_trips.load(Ordering::Relaxed)
    }

    /// The agent answered (or at least accepted the solicitation).
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.half_open.load(Ordering::Acquire) {
            self.half_open.store(false, Ordering::Release);
            self.open.store(false, Ordering::Release);
        }
    }

    /// The agent transport failed. Returns true if the breaker opened.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        // A probe failure while half-open re-opens immediately.
        if self.half_open.load(Ordering::Acquire)
            || failures >= self.config.max_consecutive_failures
        {
            self.trip();
            return true;
        }
        false
    }

    fn trip(&self) {
        if !self.open.swap(true, Ordering::AcqRel) {
            self.total_trips.fetch_add(1, Ordering::Relaxed);
        }
        self.half_open.store(false, Ordering::Release);
        self.opened_at_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// Transition Open → HalfOpen once the cool-down has elapsed.
    ///
    /// Returns true when a probe solicitation should be attempted. Call from
    /// the solicit path; it is cheap when the breaker is closed.
    pub fn try_half_open(&self) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        if self.half_open.load(Ordering::Acquire) {
            return true;
        }
        let opened_at = self.opened_at_ms.load(Ordering::Acquire);
        let elapsed = Utc::now().timestamp_millis() - opened_at;
        if elapsed < self.config.cooldown().as_millis() as i64 {
            return false;
        }
        self.half_open.store(true, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        true
    }

    /// Force-close, e.g. after a config replacement.
    pub fn reset(&self) {
        self.open.store(false, Ordering::Release);
        self.half_open.store(false, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }
}

impl Default for AgentBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
