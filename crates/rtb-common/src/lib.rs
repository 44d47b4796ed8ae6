//! Shared domain model for the RTB router.
//!
//! This crate contains:
//! - Monetary types (integer micros, currency codes, spend rates)
//! - Identifiers (auction ids, hierarchical account keys)
//! - The normalized bid request model
//! - Agent configuration and its filter vocabulary
//! - The agent wire protocol envelope
//! - Post-auction event and delivery-log types
//!
//! CRITICAL: all prices and budget amounts are integer [`money::Micros`].
//! NEVER use `f64` for monetary math; `rust_decimal` is for the edges only.

pub mod agent_config;
pub mod bid_request;
pub mod events;
pub mod ids;
pub mod money;
pub mod protocol;

pub use agent_config::{
    AgentConfig, AugmentationConfig, BidControl, BlacklistConfig, BlacklistKind, BlacklistScope,
    ConfigError, Creative, HostIncludeExclude, HourOfWeekFilter, IncludeExclude, PartitionHash,
    PartitionInterval, PatternIncludeExclude, ProviderData, ResultVerbosity, SegmentFilter,
    SegmentMatch, TagFilter, UserPartition,
};
pub use bid_request::{AdSpot, BidRequest, FoldPosition, Format, Location, SegmentList, UserIds};
pub use events::{
    DeliveryKind, DeliveryRecord, EventDictionary, EventKind, PostAuctionEvent,
};
pub use ids::{md5_hash64, AccountKey, AccountKeyError, AuctionId};
pub use money::{Amount, CurrencyCode, Micros, MoneyParseError, MoneyRate, RatePeriod};
pub use protocol::{AgentBid, BidResponse, Envelope, MessageKind};
