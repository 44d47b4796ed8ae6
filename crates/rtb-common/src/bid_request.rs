//! The exchange-normalized bid request model.
//!
//! Exchange connectors parse their wire formats into this structure before
//! anything on the hot path sees the request. Everything here is plain data;
//! filtering logic lives in the router crate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::AuctionId;
use crate::money::Amount;

/// Creative / ad-spot dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Format {
    pub width: u16,
    pub height: u16,
}

impl Format {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// A creative fits a spot when the dimensions match exactly.
    pub fn fits(&self, spot: &Format) -> bool {
        self == spot
    }

    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Position of a spot relative to the fold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FoldPosition {
    #[default]
    Unknown,
    Above,
    Below,
}

impl fmt::Display for FoldPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FoldPosition::Unknown => write!(f, "unknown"),
            FoldPosition::Above => write!(f, "above"),
            FoldPosition::Below => write!(f, "below"),
        }
    }
}

/// A sorted, deduplicated set of segment strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SegmentList(Vec<String>);

// Deserialization re-normalizes: membership checks binary-search, so the
// sorted invariant must hold regardless of what the wire carried.
impl<'de> Deserialize<'de> for SegmentList {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(SegmentList::new(Vec::<String>::deserialize(deserializer)?))
    }
}

impl SegmentList {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut v: Vec<String> = segments.into_iter().map(Into::into).collect();
        v.sort();
        v.dedup();
        SegmentList(v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, segment: &str) -> bool {
        self.0.binary_search_by(|s| s.as_str().cmp(segment)).is_ok()
    }

    /// True when the two lists share at least one segment.
    pub fn intersects(&self, other: &SegmentList) -> bool {
        // Both sides are sorted; walk them in lockstep.
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return true,
            }
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for SegmentList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        SegmentList::new(iter)
    }
}

/// Normalized geographic location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
}

impl Location {
    pub fn new(country: &str, region: &str, city: &str) -> Self {
        Self {
            country: country.to_string(),
            region: region.to_string(),
            city: city.to_string(),
        }
    }

    /// Full-string form consumed by location regex filters, e.g.
    /// `"CA:QC:Montreal"`.
    pub fn full_location_string(&self) -> String {
        format!("{}:{}:{}", self.country, self.region, self.city)
    }
}

/// User identifiers keyed by the naming domain that issued them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserIds(BTreeMap<String, String>);

impl UserIds {
    /// Key under which the exchange-issued id is stored.
    pub const EXCHANGE: &'static str = "exchange";
    /// Key under which the data-provider id is stored.
    pub const PROVIDER: &'static str = "provider";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, domain: impl Into<String>, id: impl Into<String>) {
        self.0.insert(domain.into(), id.into());
    }

    pub fn with(mut self, domain: impl Into<String>, id: impl Into<String>) -> Self {
        self.insert(domain, id);
        self
    }

    pub fn get(&self, domain: &str) -> Option<&str> {
        self.0.get(domain).map(String::as_str)
    }

    pub fn has(&self, domain: &str) -> bool {
        self.0.contains_key(domain)
    }

    pub fn exchange_id(&self) -> Option<&str> {
        self.get(Self::EXCHANGE)
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.get(Self::PROVIDER)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One placement within a bid request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdSpot {
    /// Exchange-scoped spot id.
    pub id: String,
    pub format: Format,
    #[serde(default)]
    pub position: FoldPosition,
    /// Minimum acceptable price for this spot.
    pub floor: Amount,
}

impl AdSpot {
    pub fn new(id: impl Into<String>, format: Format, floor: Amount) -> Self {
        Self {
            id: id.into(),
            format,
            position: FoldPosition::Unknown,
            floor,
        }
    }

    pub fn with_position(mut self, position: FoldPosition) -> Self {
        self.position = position;
        self
    }
}

/// An exchange-normalized auction opportunity.
///
/// Segment membership is keyed by taxonomy source (e.g. `"iab"`); the tag
/// list is the flat vocabulary the symbolic tag filters evaluate against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidRequest {
    pub id: AuctionId,
    pub exchange: String,
    #[serde(default)]
    pub protocol_version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub user_ids: UserIds,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub user_agent: String,
    pub spots: Vec<AdSpot>,
    #[serde(default)]
    pub segments: BTreeMap<String, SegmentList>,
    #[serde(default)]
    pub tags: SegmentList,
}

impl BidRequest {
    /// Minimal request for wiring and tests; connectors fill in the rest.
    pub fn new(id: impl Into<AuctionId>, exchange: impl Into<String>, spots: Vec<AdSpot>) -> Self {
        Self {
            id: id.into(),
            exchange: exchange.into(),
            protocol_version: String::new(),
            timestamp: Utc::now(),
            url: String::new(),
            language: String::new(),
            location: Location::default(),
            user_ids: UserIds::default(),
            ip: String::new(),
            user_agent: String::new(),
            spots,
            segments: BTreeMap::new(),
            tags: SegmentList::default(),
        }
    }

    /// Host portion of the request url, without scheme, port, or path.
    pub fn host(&self) -> &str {
        let s = self
            .url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url);
        let end = s.find(['/', ':', '?']).unwrap_or(s.len());
        &s[..end]
    }

    /// Segments for a given taxonomy source, if the request carries any.
    pub fn segments_for(&self, source: &str) -> Option<&SegmentList> {
        self.segments.get(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::{CurrencyCode, Micros};

    fn spot() -> AdSpot {
        AdSpot::new(
            "0",
            Format::new(300, 250),
            Amount::new(Micros::from_units(1), CurrencyCode::Usd),
        )
    }

    #[test]
    fn test_format_fits() {
        assert!(Format::new(300, 250).fits(&Format::new(300, 250)));
        assert!(!Format::new(300, 250).fits(&Format::new(728, 90)));
        assert!(Format::new(0, 250).is_zero_area());
    }

    #[test]
    fn test_segment_list_dedup_and_sort() {
        let list = SegmentList::new(["b", "a", "b"]);
        assert_eq!(list.len(), 2);
        assert!(list.contains("a"));
        assert!(!list.contains("c"));
    }

    #[test]
    fn test_segment_list_intersects() {
        let a = SegmentList::new(["sports", "news"]);
        let b = SegmentList::new(["finance", "sports"]);
        let c = SegmentList::new(["autos"]);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(!SegmentList::default().intersects(&a));
    }

    #[test]
    fn test_location_full_string() {
        let loc = Location::new("CA", "QC", "Montreal");
        assert_eq!(loc.full_location_string(), "CA:QC:Montreal");
    }

    #[test]
    fn test_user_ids() {
        let ids = UserIds::new()
            .with(UserIds::EXCHANGE, "xid-1")
            .with("dmp", "u-9");
        assert_eq!(ids.exchange_id(), Some("xid-1"));
        assert!(ids.has("dmp"));
        assert!(!ids.has(UserIds::PROVIDER));
    }

    #[test]
    fn test_host_extraction() {
        let mut req = BidRequest::new("a1", "ex", vec![spot()]);
        req.url = "http://news.example.com/story?id=4".to_string();
        assert_eq!(req.host(), "news.example.com");

        req.url = "example.org:8080/x".to_string();
        assert_eq!(req.host(), "example.org");

        req.url = String::new();
        assert_eq!(req.host(), "");
    }

    #[test]
    fn test_segment_list_deserialize_normalizes() {
        let list: SegmentList = serde_json::from_str(r#"["b","a","b"]"#).unwrap();
        assert_eq!(list, SegmentList::new(["a", "b"]));
        assert!(list.contains("a"));
    }

    #[test]
    fn test_bid_request_serde_roundtrip() {
        let mut req = BidRequest::new("a1", "adx", vec![spot()]);
        req.segments
            .insert("iab".to_string(), SegmentList::new(["IAB1", "IAB2"]));
        req.tags = SegmentList::new(["video"]);
        let json = serde_json::to_string(&req).unwrap();
        let back: BidRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
