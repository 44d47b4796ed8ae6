//! Router-wide counters for observability.
//!
//! Every error category from the error-handling design has a counter here;
//! nothing on the hot path allocates or locks to record one. Counters are
//! monotone; rates are the consumer's problem.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free router-wide counters.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Requests admitted into the engine.
    pub auctions_started: AtomicU64,
    /// Auctions answered "no bid" (no eligible agents or no valid bids).
    pub auctions_no_bid: AtomicU64,
    /// Auctions emitted with at least one winner.
    pub auctions_won: AtomicU64,

    /// Bids accepted into an in-flight auction.
    pub bids_received: AtomicU64,
    /// Bids rejected at validation.
    pub invalid_bids: AtomicU64,
    /// Bids that arrived after their auction resolved.
    pub late_bids: AtomicU64,

    /// Requests rejected because the id was already in flight.
    pub duplicate_requests: AtomicU64,
    /// Solicitations suppressed by the per-agent in-flight cap.
    pub max_in_flight_exceeded: AtomicU64,
    /// Solicitations suppressed by round-robin group rotation.
    pub round_robin_skipped: AtomicU64,
    /// Solicitations dropped because the agent transport failed.
    pub agent_unreachable: AtomicU64,
    /// Solicitations suppressed by an open circuit breaker.
    pub breaker_open: AtomicU64,

    /// Winners demoted for lack of budget.
    pub insufficient_budget: AtomicU64,
    /// Winners demoted by the slow-mode spend cap.
    pub slow_mode_demotions: AtomicU64,

    /// Post-auction notifications that failed validation.
    pub invalid_events: AtomicU64,
    /// Duplicate (auction id, event kind) notifications.
    pub duplicate_events: AtomicU64,
    /// Notifications that never matched a submitted auction.
    pub orphan_events: AtomicU64,
    /// Auctions that timed out waiting for a win notification.
    pub loss_assumed: AtomicU64,
}

/// Point-in-time copy of [`RouterMetrics`] for logging and health output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub auctions_started: u64,
    pub auctions_no_bid: u64,
    pub auctions_won: u64,
    pub bids_received: u64,
    pub invalid_bids: u64,
    pub late_bids: u64,
    pub duplicate_requests: u64,
    pub max_in_flight_exceeded: u64,
    pub round_robin_skipped: u64,
    pub agent_unreachable: u64,
    pub breaker_open: u64,
    pub insufficient_budget: u64,
    pub slow_mode_demotions: u64,
    pub invalid_events: u64,
    pub duplicate_events: u64,
    pub orphan_events: u64,
    pub loss_assumed: u64,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            auctions_started: self.auctions_started.load(Ordering::Relaxed),
            auctions_no_bid: self.auctions_no_bid.load(Ordering::Relaxed),
            auctions_won: self.auctions_won.load(Ordering::Relaxed),
            bids_received: self.bids_received.load(Ordering::Relaxed),
            invalid_bids: self.invalid_bids.load(Ordering::Relaxed),
            late_bids: self.late_bids.load(Ordering::Relaxed),
            duplicate_requests: self.duplicate_requests.load(Ordering::Relaxed),
            max_in_flight_exceeded: self.max_in_flight_exceeded.load(Ordering::Relaxed),
            round_robin_skipped: self.round_robin_skipped.load(Ordering::Relaxed),
            agent_unreachable: self.agent_unreachable.load(Ordering::Relaxed),
            breaker_open: self.breaker_open.load(Ordering::Relaxed),
            insufficient_budget: self.insufficient_budget.load(Ordering::Relaxed),
            slow_mode_demotions: self.slow_mode_demotions.load(Ordering::Relaxed),
            invalid_events: self.invalid_events.load(Ordering::Relaxed),
            duplicate_events: self.duplicate_events.load(Ordering::Relaxed),
            orphan_events: self.orphan_events.load(Ordering::Relaxed),
            loss_assumed: self.loss_assumed.load(Ordering::Relaxed),
        }
    }
}
