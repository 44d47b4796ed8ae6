//! Real-time bidding router core.
//!
//! The hot path runs a bid request through the filter pipeline against an
//! immutable registry snapshot, solicits the eligible agents, collects bids
//! until a hard deadline, selects and budget-checks winners, and hands the
//! result to the post-auction loop for settlement against exchange-side
//! win/loss/impression/click notifications.
//!
//! ## Modules
//!
//! - `registry`: agent configurations, snapshot/publish discipline
//! - `filter`: the fifteen-stage per-request filter pipeline
//! - `engine`: auction lifecycle from admission to emission
//! - `banker`: the budget shard (slave banker) and slow mode
//! - `postauction`: the submitted-auction state machine and delivery log
//! - `bidder`: transport seam between router and agents
//! - `connectors`: exchange/adserver seams and the static registration table
//! - `breaker`: per-agent circuit breakers
//! - `config`: TOML + env configuration
//! - `metrics`: router-wide counters

pub mod banker;
pub mod bidder;
pub mod breaker;
pub mod config;
pub mod connectors;
pub mod engine;
pub mod filter;
pub mod metrics;
pub mod postauction;
pub mod registry;

pub use banker::{
    Authorization, BankerConfig, BankerError, MasterBankerClient, PoolSnapshot, SlaveBanker,
    UnlimitedMaster,
};
pub use bidder::{AgentError, BidSolicitation, BidderInterface, LocalBidder};
pub use breaker::{AgentBreaker, BreakerConfig, BreakerState};
pub use config::{ConnectorEntry, InstanceConfig, RouterConfig};
pub use connectors::{
    AdServerSource, ConnectorRegistry, ExchangeConnector, LoopbackAdServer,
    LoopbackAdServerHandle, LoopbackExchange, LoopbackHandle, WinCostModel,
};
pub use engine::{
    AdmitError, Auction, AuctionEngine, AuctionOutcome, AuctionState, BidError, BidIngest,
    EngineConfig, LossReason, LossRecord, SubmittedAuction, SubmittedWinner, WinnerRecord,
};
pub use filter::{
    BiddableSpot, BiddableSpots, BlacklistStore, Eligible, FilterCounters, FilterPipeline,
    FilterStage, RequestFilterCache,
};
pub use metrics::{MetricsSnapshot, RouterMetrics};
pub use postauction::{
    ChannelSink, DeliverySink, FileSink, NullSink, PostAuctionConfig, PostAuctionLoop, ShardState,
};
pub use registry::{AgentEntry, AgentRegistry, AgentStats, RegistryError, RegistryEvent, Snapshot};

use std::sync::Arc;

/// Cheap health snapshot for monitoring surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RouterHealth {
    pub in_flight: usize,
    pub slow_mode: bool,
    pub master_sync_age_secs: u64,
    pub registered_agents: usize,
}

impl RouterHealth {
    pub fn gather(
        engine: &Arc<AuctionEngine>,
        banker: &Arc<SlaveBanker>,
        registry: &Arc<AgentRegistry>,
    ) -> Self {
        Self {
            in_flight: engine.in_flight(),
            slow_mode: banker.in_slow_mode(),
            master_sync_age_secs: banker.master_sync_age().as_secs(),
            registered_agents: registry.len(),
        }
    }
}
