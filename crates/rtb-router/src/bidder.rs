//! The bidder interface: how solicitations reach agents and results come
//! back.
//!
//! The engine only sees the trait; the channel-backed [`LocalBidder`] ships
//! for tests and single-process deployments, and socket-based interfaces
//! implement the same contract out of tree.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

use rtb_common::bid_request::BidRequest;
use rtb_common::ids::AuctionId;
use rtb_common::protocol::Envelope;

use crate::filter::BiddableSpots;

/// Transport failures on the agent boundary.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {0} is not registered with this bidder interface")]
    NotRegistered(String),

    #[error("agent {0} unreachable: {1}")]
    Unreachable(String, String),
}

/// One bid solicitation as the agent receives it.
#[derive(Debug, Clone)]
pub struct BidSolicitation {
    pub auction_id: AuctionId,
    pub request: Arc<BidRequest>,
    /// The spots and creatives this agent may bid on.
    pub spots: BiddableSpots,
    /// Milliseconds the agent has before its bids stop counting.
    pub time_available_ms: u64,
}

/// Transport abstraction between router and agents.
#[async_trait]
pub trait BidderInterface: Send + Sync {
    /// Deliver a solicitation. An error means the agent could not be
    /// reached; the engine skips it for this auction and feeds its breaker.
    async fn send_auction(
        &self,
        agent_id: &str,
        solicitation: BidSolicitation,
    ) -> Result<(), AgentError>;

    /// Deliver a win/loss/error result message.
    async fn send_result(&self, agent_id: &str, envelope: Envelope) -> Result<(), AgentError>;
}

/// Per-agent channel pair held by the local bidder.
struct LocalAgent {
    solicitations: mpsc::Sender<BidSolicitation>,
    results: mpsc::Sender<Envelope>,
}

/// Channel-backed bidder interface for in-process agents.
#[derive(Default)]
pub struct LocalBidder {
    agents: DashMap<String, LocalAgent>,
}

impl LocalBidder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, returning the receiving ends it should poll.
    pub fn register(
        &self,
        agent_id: &str,
    ) -> (mpsc::Receiver<BidSolicitation>, mpsc::Receiver<Envelope>) {
        let (sol_tx, sol_rx) = mpsc::channel(256);
        let (res_tx, res_rx) = mpsc::channel(256);
        self.agents.insert(
            agent_id.to_string(),
            LocalAgent {
                solicitations: sol_tx,
                results: res_tx,
            },
        );
        (sol_rx, res_rx)
    }

    pub fn deregister(&self, agent_id: &str) -> bool {
        self.agents.remove(agent_id).is_some()
    }
}

#[async_trait]
impl BidderInterface for LocalBidder {
    async fn send_auction(
        &self,
        agent_id: &str,
        solicitation: BidSolicitation,
    ) -> Result<(), AgentError> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| AgentError::NotRegistered(agent_id.to_string()))?;
        agent
            .solicitations
            .try_send(solicitation)
            .map_err(|err| AgentError::Unreachable(agent_id.to_string(), err.to_string()))
    }

    async fn send_result(&self, agent_id: &str, envelope: Envelope) -> Result<(), AgentError> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| AgentError::NotRegistered(agent_id.to_string()))?;
        agent
            .results
            .try_send(envelope)
            .map_err(|err| AgentError::Unreachable(agent_id.to_string(), err.to_string()))
    }
}
