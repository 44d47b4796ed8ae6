//! Post-auction event vocabulary and the delivery-log record format.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bid_request::SegmentList;
use crate::ids::{AccountKey, AuctionId};
use crate::money::Micros;

/// Normalized kinds of exchange-side settlement notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Win,
    Loss,
    Impression,
    Click,
    Visit,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Win => "WIN",
            EventKind::Loss => "LOSS",
            EventKind::Impression => "IMPRESSION",
            EventKind::Click => "CLICK",
            EventKind::Visit => "VISIT",
        };
        write!(f, "{s}")
    }
}

/// Maps exchange-specific event vocabulary onto [`EventKind`]s.
///
/// Adserver connectors push whatever strings their upstream uses; the
/// dictionary absorbs that variation at the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventDictionary(BTreeMap<String, EventKind>);

impl Default for EventDictionary {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        for (name, kind) in [
            ("win", EventKind::Win),
            ("loss", EventKind::Loss),
            ("lose", EventKind::Loss),
            ("impression", EventKind::Impression),
            ("imp", EventKind::Impression),
            ("click", EventKind::Click),
            ("visit", EventKind::Visit),
        ] {
            map.insert(name.to_string(), kind);
        }
        EventDictionary(map)
    }
}

impl EventDictionary {
    pub fn lookup(&self, name: &str) -> Option<EventKind> {
        self.0.get(&name.to_ascii_lowercase()).copied()
    }

    /// Add or override a mapping; names are case-folded.
    pub fn define(&mut self, name: &str, kind: EventKind) {
        self.0.insert(name.to_ascii_lowercase(), kind);
    }
}

/// A normalized settlement notification from an adserver connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostAuctionEvent {
    pub auction_id: AuctionId,
    pub kind: EventKind,
    /// Spot the event applies to; `None` means the first (or only) spot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_index: Option<u32>,
    pub timestamp: DateTime<Utc>,
    /// Clearing price reported by the exchange, when the event carries one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_micros: Option<Micros>,
    /// Channels a VISIT event belongs to; empty otherwise.
    #[serde(default)]
    pub channels: SegmentList,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub provider_data: serde_json::Value,
}

impl PostAuctionEvent {
    pub fn new(auction_id: impl Into<AuctionId>, kind: EventKind) -> Self {
        Self {
            auction_id: auction_id.into(),
            kind,
            spot_index: None,
            timestamp: Utc::now(),
            price_micros: None,
            channels: SegmentList::default(),
            provider_data: serde_json::Value::Null,
        }
    }

    pub fn with_spot(mut self, spot_index: u32) -> Self {
        self.spot_index = Some(spot_index);
        self
    }

    pub fn with_price(mut self, price_micros: Micros) -> Self {
        self.price_micros = Some(price_micros);
        self
    }

    /// The spot this event targets, defaulting to the first.
    pub fn spot(&self) -> u32 {
        self.spot_index.unwrap_or(0)
    }
}

/// Terminal outcomes written to the delivery log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryKind {
    Submitted,
    Won,
    Lost,
    LossAssumed,
    Impression,
    Click,
    Visit,
    Orphan,
}

impl fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryKind::Submitted => "SUBMITTED",
            DeliveryKind::Won => "WON",
            DeliveryKind::Lost => "LOST",
            DeliveryKind::LossAssumed => "LOSSASSUMED",
            DeliveryKind::Impression => "IMPRESSION",
            DeliveryKind::Click => "CLICK",
            DeliveryKind::Visit => "VISIT",
            DeliveryKind::Orphan => "ORPHAN",
        };
        write!(f, "{s}")
    }
}

/// One newline-delimited record in the post-auction delivery log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub ts: DateTime<Utc>,
    pub auction_id: AuctionId,
    pub kind: DeliveryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_micros: Option<Micros>,
}

impl DeliveryRecord {
    pub fn new(auction_id: AuctionId, kind: DeliveryKind) -> Self {
        Self {
            ts: Utc::now(),
            auction_id,
            kind,
            agent: None,
            account: None,
            spot: None,
            price_micros: None,
        }
    }

    pub fn with_winner(
        mut self,
        agent: impl Into<String>,
        account: AccountKey,
        spot: u32,
        price_micros: Micros,
    ) -> Self {
        self.agent = Some(agent.into());
        self.account = Some(account);
        self.spot = Some(spot);
        self.price_micros = Some(price_micros);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_dictionary_defaults() {
        let dict = EventDictionary::default();
        assert_eq!(dict.lookup("win"), Some(EventKind::Win));
        assert_eq!(dict.lookup("WIN"), Some(EventKind::Win));
        assert_eq!(dict.lookup("imp"), Some(EventKind::Impression));
        assert_eq!(dict.lookup("conversion"), None);
    }

    #[test]
    fn test_event_dictionary_define() {
        let mut dict = EventDictionary::default();
        dict.define("View", EventKind::Impression);
        assert_eq!(dict.lookup("view"), Some(EventKind::Impression));
    }

    #[test]
    fn test_post_auction_event_builder() {
        let event = PostAuctionEvent::new("a-1", EventKind::Win)
            .with_spot(2)
            .with_price(Micros::from_units(2));
        assert_eq!(event.spot(), 2);
        assert_eq!(event.price_micros, Some(Micros(2_000_000)));

        let event = PostAuctionEvent::new("a-1", EventKind::Click);
        assert_eq!(event.spot(), 0);
    }

    #[test]
    fn test_delivery_record_ndjson_shape() {
        let record = DeliveryRecord::new(AuctionId::from("a-1"), DeliveryKind::Won).with_winner(
            "agent-1",
            "campaign".parse().unwrap(),
            0,
            Micros::from_units(2),
        );
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        let back: DeliveryRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back, record);
    }
}
