//! Agent configuration registry.
//!
//! Writers build a whole new map and swap the pointer; readers clone the
//! `Arc` once per auction and never block a writer. The filter pipeline
//! consumes snapshots thousands of times per second, so there is no
//! per-read allocation beyond the single `Arc` clone.
//!
//! Stats and circuit-breaker state survive config replacement: republishing
//! an agent swaps its config without zeroing its counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use rtb_common::agent_config::{AgentConfig, ConfigError};

use crate::breaker::{AgentBreaker, BreakerConfig};
use crate::filter::{FilterCounters, FilterStage};

/// Why a publish was refused.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid filter pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Live, per-agent counters.
///
/// One block per registered agent, shared between the pipeline, the engine,
/// and the post-auction loop.
#[derive(Debug, Default)]
pub struct AgentStats {
    /// Per-stage filter rejection counters.
    pub filters: FilterCounters,
    /// Last failing stage, for diagnostics. Zero means "never rejected";
    /// otherwise stage index + 1.
    last_rejection: AtomicU8,

    pub auctions_offered: AtomicU64,
    pub bids_sent: AtomicU64,
    pub bids_received: AtomicU64,
    pub no_bids: AtomicU64,
    pub late_bids: AtomicU64,
    pub wins: AtomicU64,
    pub losses: AtomicU64,
    pub round_robin_skipped: AtomicU64,

    /// Outstanding solicitations right now.
    pub in_flight: AtomicU64,
}

impl AgentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rejection(&self, stage: FilterStage) {
        self.filters.incr(stage);
        self.last_rejection.store(stage.index() as u8 + 1, Ordering::Relaxed);
    }

    pub fn last_rejection(&self) -> Option<FilterStage> {
        match self.last_rejection.load(Ordering::Relaxed) {
            0 => None,
            n => FilterStage::from_index(n as usize - 1),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// An agent as the hot path sees it: immutable config plus live state.
#[derive(Debug)]
pub struct AgentEntry {
    pub agent_id: Arc<str>,
    pub config: Arc<AgentConfig>,
    pub stats: Arc<AgentStats>,
    pub breaker: Arc<AgentBreaker>,
    /// Registry generation at which this config was installed.
    pub generation: u64,
}

/// Immutable view of the registry, valid across a single auction.
pub type Snapshot = Arc<HashMap<Arc<str>, Arc<AgentEntry>>>;

/// Change notifications for subscribers (monitoring, external syncs).
///
/// Subscribers that lag may miss events; the current state is always
/// recoverable from `snapshot()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Published { agent_id: Arc<str>, generation: u64 },
    Retired { agent_id: Arc<str>, generation: u64 },
}

/// The registry itself.
pub struct AgentRegistry {
    current: RwLock<Snapshot>,
    generation: AtomicU64,
    events: broadcast::Sender<RegistryEvent>,
    breaker_config: BreakerConfig,
}

impl AgentRegistry {
    pub fn new(breaker_config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            current: RwLock::new(Arc::new(HashMap::new())),
            generation: AtomicU64::new(0),
            events,
            breaker_config,
        }
    }

    /// Validate and atomically install a config, replacing any previous one
    /// for the same agent. Returns the new generation.
    pub fn publish(&self, agent_id: &str, config: AgentConfig) -> Result<u64, RegistryError> {
        config.validate()?;
        for patterns in [&config.url_filter, &config.language_filter, &config.location_filter] {
            crate::filter::cache::validate_patterns(patterns)?;
        }
        for creative in &config.creatives {
            crate::filter::cache::validate_patterns(&creative.location_filter)?;
        }

        let agent_id: Arc<str> = Arc::from(agent_id);
        let config = Arc::new(config);

        let mut current = self.current.write();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        // Carry stats and breaker state across replacement.
        let (stats, breaker) = match current.get(&agent_id) {
            Some(old) => (Arc::clone(&old.stats), Arc::clone(&old.breaker)),
            None => (
                Arc::new(AgentStats::new()),
                Arc::new(AgentBreaker::new(self.breaker_config)),
            ),
        };

        let mut next: HashMap<Arc<str>, Arc<AgentEntry>> = (**current).clone();
        next.insert(
            Arc::clone(&agent_id),
            Arc::new(AgentEntry {
                agent_id: Arc::clone(&agent_id),
                config,
                stats,
                breaker,
                generation,
            }),
        );
        *current = Arc::new(next);
        drop(current);

        info!(agent = %agent_id, generation, "published agent config");
        let _ = self.events.send(RegistryEvent::Published {
            agent_id,
            generation,
        });
        Ok(generation)
    }

    /// Remove an agent. In-flight auctions holding a snapshot proceed
    /// against the retired entry untouched.
    pub fn retire(&self, agent_id: &str) -> bool {
        let mut current = self.current.write();
        if !current.contains_key(agent_id) {
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut next = (**current).clone();
        let removed = next.remove(agent_id);
        *current = Arc::new(next);
        drop(current);

        debug!(agent = agent_id, generation, "retired agent config");
        if let Some(entry) = removed {
            let _ = self.events.send(RegistryEvent::Retired {
                agent_id: Arc::clone(&entry.agent_id),
                generation,
            });
        }
        true
    }

    /// Current immutable view; one pointer load plus an `Arc` clone.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.current.read())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentEntry>> {
        self.current.read().get(agent_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtb_common::agent_config::{Creative, PatternIncludeExclude};

    fn config() -> AgentConfig {
        AgentConfig {
            account: "campaign".parse().unwrap(),
            creatives: vec![Creative::sample_box(1)],
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_publish_and_snapshot() {
        let registry = AgentRegistry::default();
        assert_eq!(registry.generation(), 0);

        let generation = registry.publish("agent-1", config()).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(registry.len(), 1);

        let snap = registry.snapshot();
        let entry = snap.get("agent-1").unwrap();
        assert_eq!(&*entry.agent_id, "agent-1");
        assert_eq!(entry.generation, 1);
    }

    #[test]
    fn test_publish_rejects_invalid_config() {
        let registry = AgentRegistry::default();
        let mut bad = config();
        bad.creatives.clear();
        assert!(matches!(
            registry.publish("agent-1", bad),
            Err(RegistryError::Config(ConfigError::NoCreatives))
        ));
        assert_eq!(registry.generation(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_publish_rejects_bad_pattern() {
        let registry = AgentRegistry::default();
        let mut bad = config();
        bad.url_filter = PatternIncludeExclude::including(["(unclosed"]);
        assert!(matches!(
            registry.publish("agent-1", bad),
            Err(RegistryError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_old_snapshot_survives_retire() {
        let registry = AgentRegistry::default();
        registry.publish("agent-1", config()).unwrap();

        let before = registry.snapshot();
        assert!(registry.retire("agent-1"));
        assert!(!registry.retire("agent-1"));

        // The earlier snapshot still resolves the retired agent.
        assert!(before.contains_key("agent-1"));
        assert!(!registry.snapshot().contains_key("agent-1"));
    }

    #[test]
    fn test_republish_preserves_stats() {
        let registry = AgentRegistry::default();
        registry.publish("agent-1", config()).unwrap();

        let entry = registry.get("agent-1").unwrap();
        entry.stats.bids_sent.fetch_add(5, Ordering::Relaxed);

        registry.publish("agent-1", config()).unwrap();
        let entry = registry.get("agent-1").unwrap();
        assert_eq!(entry.stats.bids_sent.load(Ordering::Relaxed), 5);
        assert_eq!(entry.generation, 2);
    }

    #[test]
    fn test_events_broadcast() {
        let registry = AgentRegistry::default();
        let mut rx = registry.subscribe();

        registry.publish("agent-1", config()).unwrap();
        registry.retire("agent-1");

        match rx.try_recv().unwrap() {
            RegistryEvent::Published { agent_id, generation } => {
                assert_eq!(&*agent_id, "agent-1");
                assert_eq!(generation, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            RegistryEvent::Retired { generation: 2, .. }
        ));
    }

    #[test]
    fn test_last_rejection_roundtrip() {
        let stats = AgentStats::new();
        assert_eq!(stats.last_rejection(), None);
        stats.record_rejection(FilterStage::HourOfWeek);
        assert_eq!(stats.last_rejection(), Some(FilterStage::HourOfWeek));
    }
}
