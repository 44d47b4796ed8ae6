//! Wire envelope exchanged between the router and its bidding agents.
//!
//! Transport is out of scope here; bidder interfaces move these values over
//! whatever carrier they implement (local channels in-process, sockets in
//! production deployments).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::AuctionId;
use crate::money::Micros;

/// Kinds of messages in the agent protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Auction,
    Win,
    Loss,
    /// The router rejected something the agent sent (e.g. invalid bids);
    /// delivery is subject to the agent's error verbosity.
    Error,
    Impression,
    Click,
    Ping,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Auction => "AUCTION",
            MessageKind::Win => "WIN",
            MessageKind::Loss => "LOSS",
            MessageKind::Error => "ERROR",
            MessageKind::Impression => "IMPRESSION",
            MessageKind::Click => "CLICK",
            MessageKind::Ping => "PING",
        };
        write!(f, "{s}")
    }
}

/// The message envelope sent to and from agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub auction_id: AuctionId,
    pub agent_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(
        kind: MessageKind,
        auction_id: AuctionId,
        agent_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            auction_id,
            agent_id: agent_id.into(),
            payload,
        }
    }
}

/// One bid within an agent's response.
///
/// The price is in micros of the agent's account currency; spot and creative
/// must come from the `BiddableSpots` the solicitation carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentBid {
    pub spot_index: u32,
    pub creative_id: u32,
    pub price_micros: Micros,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

impl AgentBid {
    pub fn new(spot_index: u32, creative_id: u32, price_micros: Micros) -> Self {
        Self {
            spot_index,
            creative_id,
            price_micros,
            extra: serde_json::Value::Null,
        }
    }
}

/// An agent's full response to one solicitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidResponse {
    pub auction_id: AuctionId,
    pub bids: Vec<AgentBid>,
}

impl BidResponse {
    pub fn new(auction_id: impl Into<AuctionId>, bids: Vec<AgentBid>) -> Self {
        Self {
            auction_id: auction_id.into(),
            bids,
        }
    }

    /// An explicit pass: the agent saw the request and declined every spot.
    pub fn no_bid(auction_id: impl Into<AuctionId>) -> Self {
        Self::new(auction_id, Vec::new())
    }

    pub fn is_no_bid(&self) -> bool {
        self.bids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Micros;

    #[test]
    fn test_message_kind_serde_uppercase() {
        assert_eq!(
            serde_json::to_string(&MessageKind::Auction).unwrap(),
            "\"AUCTION\""
        );
        assert_eq!(
            serde_json::to_string(&MessageKind::Error).unwrap(),
            "\"ERROR\""
        );
        let kind: MessageKind = serde_json::from_str("\"IMPRESSION\"").unwrap();
        assert_eq!(kind, MessageKind::Impression);
    }

    #[test]
    fn test_envelope_roundtrip() {
        let env = Envelope::new(
            MessageKind::Win,
            AuctionId::from("a-1"),
            "agent-7",
            serde_json::json!({"price": 1500000}),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_bid_response_no_bid() {
        let resp = BidResponse::no_bid("a-1");
        assert!(resp.is_no_bid());

        let resp = BidResponse::new("a-1", vec![AgentBid::new(0, 1, Micros::from_units(2))]);
        assert!(!resp.is_no_bid());
        assert_eq!(resp.bids[0].price_micros, Micros(2_000_000));
    }
}
