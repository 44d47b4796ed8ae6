//! The per-request filter pipeline.
//!
//! Given a bid request and a registry snapshot, produce the ordered list of
//! (agent, biddable spots) pairs eligible to bid. Stages run in a fixed
//! order and short-circuit on the first rejection; the failing stage is
//! counted both router-wide and on the agent, and recorded as the agent's
//! last rejection for diagnostics.
//!
//! Stage order is part of the contract: cheap set-membership checks first,
//! regex filters behind the request-scoped cache next, then the per-creative
//! match, and the probability draw dead last so sampled-out agents still
//! show up in the earlier stages' counters.

pub mod biddable;
pub mod blacklist;
pub mod cache;
pub mod partition;
pub mod probability;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use rtb_common::agent_config::SegmentMatch;
use rtb_common::bid_request::BidRequest;

use crate::registry::{AgentEntry, Snapshot};

pub use biddable::{BiddableSpot, BiddableSpots};
pub use blacklist::BlacklistStore;
pub use cache::RequestFilterCache;

/// The fifteen pipeline stages, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterStage {
    Exchange,
    CreativeFormat,
    Host,
    Url,
    Language,
    Location,
    UserPartition,
    RequiredIds,
    HourOfWeek,
    FoldPosition,
    Segments,
    Tags,
    CreativeSpot,
    Blacklist,
    BidProbability,
}

impl FilterStage {
    pub const ALL: [FilterStage; 15] = [
        FilterStage::Exchange,
        FilterStage::CreativeFormat,
        FilterStage::Host,
        FilterStage::Url,
        FilterStage::Language,
        FilterStage::Location,
        FilterStage::UserPartition,
        FilterStage::RequiredIds,
        FilterStage::HourOfWeek,
        FilterStage::FoldPosition,
        FilterStage::Segments,
        FilterStage::Tags,
        FilterStage::CreativeSpot,
        FilterStage::Blacklist,
        FilterStage::BidProbability,
    ];

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).expect("stage in ALL")
    }

    pub fn from_index(index: usize) -> Option<FilterStage> {
        Self::ALL.get(index).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterStage::Exchange => "exchange",
            FilterStage::CreativeFormat => "creativeFormat",
            FilterStage::Host => "host",
            FilterStage::Url => "url",
            FilterStage::Language => "language",
            FilterStage::Location => "location",
            FilterStage::UserPartition => "userPartition",
            FilterStage::RequiredIds => "requiredIds",
            FilterStage::HourOfWeek => "hourOfWeek",
            FilterStage::FoldPosition => "foldPosition",
            FilterStage::Segments => "segments",
            FilterStage::Tags => "tags",
            FilterStage::CreativeSpot => "creativeSpot",
            FilterStage::Blacklist => "blacklist",
            FilterStage::BidProbability => "bidProbability",
        }
    }
}

impl std::fmt::Display for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Per-stage rejection counters, plus the segment-missing sub-counter the
/// segments stage distinguishes.
#[derive(Debug, Default)]
pub struct FilterCounters {
    counters: [AtomicU64; 15],
    pub segment_missing: AtomicU64,
}

impl FilterCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, stage: FilterStage) {
        self.counters[stage.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, stage: FilterStage) -> u64 {
        self.counters[stage.index()].load(Ordering::Relaxed)
    }

    pub fn segment_missing(&self) -> u64 {
        self.segment_missing.load(Ordering::Relaxed)
    }

    /// (stage name, count) pairs with non-zero counts, for logs.
    pub fn non_zero(&self) -> Vec<(&'static str, u64)> {
        FilterStage::ALL
            .iter()
            .filter_map(|s| {
                let n = self.get(*s);
                (n > 0).then(|| (s.name(), n))
            })
            .collect()
    }
}

/// Why one agent was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub stage: FilterStage,
    /// Segments stage only: the taxonomy was absent and the agent excludes
    /// on absence.
    pub missing_taxonomy: bool,
}

impl Rejection {
    fn at(stage: FilterStage) -> Self {
        Self {
            stage,
            missing_taxonomy: false,
        }
    }
}

/// One eligible agent with the spots it may bid on.
#[derive(Debug, Clone)]
pub struct Eligible {
    pub entry: Arc<AgentEntry>,
    pub spots: BiddableSpots,
}

/// The pipeline: stateless per request apart from the shared counters and
/// blacklist store.
pub struct FilterPipeline {
    pub counters: FilterCounters,
    blacklist: Arc<BlacklistStore>,
}

impl FilterPipeline {
    pub fn new(blacklist: Arc<BlacklistStore>) -> Self {
        Self {
            counters: FilterCounters::new(),
            blacklist,
        }
    }

    pub fn blacklist(&self) -> &Arc<BlacklistStore> {
        &self.blacklist
    }

    /// Run the pipeline for every agent in the snapshot.
    ///
    /// The result is ordered by agent id so downstream processing is
    /// deterministic given the same snapshot and request.
    pub fn eligible(&self, request: &BidRequest, snapshot: &Snapshot) -> Vec<Eligible> {
        let mut cache = RequestFilterCache::new(request);
        let mut rng = StdRng::from_entropy();

        let mut agents: Vec<&Arc<AgentEntry>> = snapshot.values().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let mut eligible = Vec::new();
        for entry in agents {
            match self.evaluate(request, entry, &mut cache, &mut rng) {
                Ok(spots) => {
                    entry.stats.auctions_offered.fetch_add(1, Ordering::Relaxed);
                    eligible.push(Eligible {
                        entry: Arc::clone(entry),
                        spots,
                    });
                }
                Err(rejection) => {
                    self.counters.incr(rejection.stage);
                    entry.stats.record_rejection(rejection.stage);
                    if rejection.missing_taxonomy {
                        self.counters.segment_missing.fetch_add(1, Ordering::Relaxed);
                        entry
                            .stats
                            .filters
                            .segment_missing
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        eligible
    }

    /// All fifteen stages for one agent, in order.
    fn evaluate(
        &self,
        request: &BidRequest,
        entry: &AgentEntry,
        cache: &mut RequestFilterCache,
        rng: &mut StdRng,
    ) -> Result<BiddableSpots, Rejection> {
        let config = &entry.config;

        // 1. Exchange.
        if !config.exchange_filter.accepts(&request.exchange) {
            return Err(Rejection::at(FilterStage::Exchange));
        }

        // 2. Creative-format prefilter.
        if !biddable::format_prefilter(config, request) {
            return Err(Rejection::at(FilterStage::CreativeFormat));
        }

        // 3. Host.
        if !config.host_filter.is_empty() && !config.host_filter.accepts(request.host()) {
            return Err(Rejection::at(FilterStage::Host));
        }

        // 4. Url.
        if !config.url_filter.is_empty() && !cache.url_accepts(&config.url_filter) {
            return Err(Rejection::at(FilterStage::Url));
        }

        // 5. Language.
        if !config.language_filter.is_empty() && !cache.language_accepts(&config.language_filter) {
            return Err(Rejection::at(FilterStage::Language));
        }

        // 6. Location.
        if !config.location_filter.is_empty() && !cache.location_accepts(&config.location_filter) {
            return Err(Rejection::at(FilterStage::Location));
        }

        // 7. User partition.
        if !partition::matches(&config.user_partition, request, rng) {
            return Err(Rejection::at(FilterStage::UserPartition));
        }

        // 8. Required ids.
        if !config
            .required_ids
            .iter()
            .all(|domain| request.user_ids.has(domain))
        {
            return Err(Rejection::at(FilterStage::RequiredIds));
        }

        // 9. Hour of week, on the auction timestamp in UTC.
        if !config.hour_of_week_filter.is_included(request.timestamp) {
            return Err(Rejection::at(FilterStage::HourOfWeek));
        }

        // 10. Fold position: at least one format-compatible spot in an
        // accepted position.
        if !config.fold_position_filter.is_empty() {
            let any = request.spots.iter().any(|spot| {
                config.creatives.iter().any(|c| c.fits(&spot.format))
                    && config.fold_position_filter.accepts(&spot.position)
            });
            if !any {
                return Err(Rejection::at(FilterStage::FoldPosition));
            }
        }

        // 11. Segments, per configured taxonomy.
        for (source, filter) in &config.segments {
            if !filter.apply_to_exchanges.accepts(&request.exchange) {
                continue;
            }
            match filter.evaluate(request.segments_for(source)) {
                SegmentMatch::Accept => {}
                SegmentMatch::MissingTaxonomy => {
                    return Err(Rejection {
                        stage: FilterStage::Segments,
                        missing_taxonomy: true,
                    })
                }
                SegmentMatch::Excluded | SegmentMatch::NotIncluded => {
                    return Err(Rejection::at(FilterStage::Segments))
                }
            }
        }

        // 12. Tags.
        if let Some(tag_filter) = &config.tag_filter {
            if !tag_filter.matches(&request.tags) {
                return Err(Rejection::at(FilterStage::Tags));
            }
        }

        // 13. Per-creative spot match.
        let spots = biddable::biddable_spots(config, request, cache);
        if spots.is_empty() {
            return Err(Rejection::at(FilterStage::CreativeSpot));
        }

        // 14. Blacklist.
        if self
            .blacklist
            .is_blacklisted(&entry.agent_id, config, request, request.timestamp)
        {
            return Err(Rejection::at(FilterStage::Blacklist));
        }

        // 15. Bid probability, deterministic per (request, agent).
        if !probability::passes(&request.id, &entry.agent_id, config.bid_probability) {
            return Err(Rejection::at(FilterStage::BidProbability));
        }

        Ok(spots)
    }
}
