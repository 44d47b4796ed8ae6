//! In-flight auction state.
//!
//! An `Auction` is owned by exactly one engine shard from admission to
//! destruction; nothing here is shared. State only moves forward:
//! `Open → Solicited → Collecting → Resolved → Emitted`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use rtb_common::bid_request::BidRequest;
use rtb_common::ids::{AccountKey, AuctionId};
use rtb_common::money::{CurrencyCode, Micros};

use crate::connectors::WinCostModel;
use crate::filter::BiddableSpots;
use crate::registry::AgentEntry;

/// Lifecycle of one auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionState {
    Open,
    Solicited,
    Collecting,
    Resolved,
    Emitted,
}

/// One agent the auction solicited.
#[derive(Debug)]
pub struct Solicitation {
    pub entry: Arc<AgentEntry>,
    pub spots: BiddableSpots,
    pub sent_at: DateTime<Utc>,
    /// What the agent was told it has:
    /// min(auction deadline, send + min_time_available).
    pub agent_deadline: Instant,
    pub responded: bool,
}

/// A validated bid waiting for resolution.
#[derive(Debug, Clone)]
pub struct ReceivedBid {
    pub agent_id: Arc<str>,
    pub account: AccountKey,
    pub spot_index: u32,
    pub creative_id: u32,
    pub price_micros: Micros,
    /// Round-robin weight at solicitation time; first tie-break key.
    pub weight: u32,
    /// When the solicitation went out; second tie-break key.
    pub sent_at: DateTime<Utc>,
    /// Stable hash of the agent id; final tie-break key.
    pub agent_hash: u64,
    /// Test agents cannot make real bids: a test bid settles separately
    /// and never reaches the exchange or the budget pools.
    pub test: bool,
}

/// The in-flight record.
pub struct Auction {
    pub request: Arc<BidRequest>,
    pub state: AuctionState,
    pub deadline: Instant,
    pub started_at: DateTime<Utc>,
    pub solicited: Vec<Solicitation>,
    /// Agents yet to respond.
    pub outstanding: usize,
    /// Received bids, per spot index.
    pub bids: Vec<Vec<ReceivedBid>>,
    /// Completion channel back to the admitting caller.
    pub outcome_tx: Option<oneshot::Sender<AuctionOutcome>>,
}

impl Auction {
    pub fn new(
        request: Arc<BidRequest>,
        deadline: Instant,
        outcome_tx: oneshot::Sender<AuctionOutcome>,
    ) -> Self {
        let spots = request.spots.len();
        Self {
            request,
            state: AuctionState::Open,
            deadline,
            started_at: Utc::now(),
            solicited: Vec::new(),
            outstanding: 0,
            bids: vec![Vec::new(); spots],
            outcome_tx: Some(outcome_tx),
        }
    }

    pub fn solicitation_mut(&mut self, agent_id: &str) -> Option<&mut Solicitation> {
        self.solicited
            .iter_mut()
            .find(|s| &*s.entry.agent_id == agent_id)
    }

    /// Has the auction already passed the point of accepting bids?
    pub fn is_closed(&self) -> bool {
        matches!(self.state, AuctionState::Resolved | AuctionState::Emitted)
    }
}

/// Why a bid ended up a loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossReason {
    /// A better bid took the spot.
    Outbid,
    /// Demoted by the slow-mode spend cap.
    SlowMode,
    /// Budget authorization refused.
    InsufficientBudget,
}

/// A winning (agent, creative, price) for one spot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinnerRecord {
    pub agent_id: Arc<str>,
    pub account: AccountKey,
    pub spot_index: u32,
    pub creative_id: u32,
    pub price_micros: Micros,
    pub currency: CurrencyCode,
}

/// A losing bid and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossRecord {
    pub agent_id: Arc<str>,
    pub spot_index: u32,
    pub price_micros: Micros,
    pub reason: LossReason,
}

/// What the engine hands back upstream when the auction completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuctionOutcome {
    pub auction_id: AuctionId,
    pub winners: Vec<WinnerRecord>,
    pub losers: Vec<LossRecord>,
}

impl AuctionOutcome {
    pub fn no_bid(auction_id: AuctionId) -> Self {
        Self {
            auction_id,
            winners: Vec::new(),
            losers: Vec::new(),
        }
    }

    pub fn is_no_bid(&self) -> bool {
        self.winners.is_empty()
    }
}

/// A winner as the post-auction loop tracks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedWinner {
    pub agent_id: Arc<str>,
    pub account: AccountKey,
    pub spot_index: u32,
    pub creative_id: u32,
    pub price_micros: Micros,
    pub currency: CurrencyCode,
    /// How the clearing price is derived from the win notification.
    pub win_cost: WinCostModel,
}

/// The record handed to the post-auction loop at emission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedAuction {
    pub auction_id: AuctionId,
    pub exchange: String,
    pub submitted_at: DateTime<Utc>,
    /// Expected win notice by this time; past it the loop assumes a loss.
    pub win_deadline: DateTime<Utc>,
    pub winners: Vec<SubmittedWinner>,
}

impl SubmittedAuction {
    pub fn winner_for_spot(&self, spot_index: u32) -> Option<&SubmittedWinner> {
        self.winners.iter().find(|w| w.spot_index == spot_index)
    }
}
