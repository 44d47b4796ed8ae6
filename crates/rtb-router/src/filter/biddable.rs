//! Creative-to-spot matching.
//!
//! Stage 2 is the cheap prefilter (does any creative's format fit any
//! spot?); stage 13 is the full per-creative match that also applies the
//! creative's own exchange, language, location, and tag-eligibility
//! filters. The result is the `BiddableSpots` the solicitation carries and
//! bid validation later checks against.

use serde::{Deserialize, Serialize};

use rtb_common::agent_config::AgentConfig;
use rtb_common::bid_request::BidRequest;

use super::cache::RequestFilterCache;

/// One biddable spot and the creatives that may fill it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiddableSpot {
    pub spot_index: u32,
    pub creative_ids: Vec<u32>,
}

/// The (spot, creatives) pairs one agent may bid on for one request.
///
/// Computed once per (request, agent); order follows the request's spots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BiddableSpots(Vec<BiddableSpot>);

impl BiddableSpots {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BiddableSpot> {
        self.0.iter()
    }

    /// Is the (spot, creative) pair one the agent was offered?
    pub fn allows(&self, spot_index: u32, creative_id: u32) -> bool {
        self.0
            .iter()
            .any(|s| s.spot_index == spot_index && s.creative_ids.contains(&creative_id))
    }
}

/// Stage 2: does at least one creative's format fit at least one spot?
pub fn format_prefilter(config: &AgentConfig, request: &BidRequest) -> bool {
    request.spots.iter().any(|spot| {
        config
            .creatives
            .iter()
            .any(|creative| creative.fits(&spot.format))
    })
}

/// Stage 13: full creative-by-spot match.
pub fn biddable_spots(
    config: &AgentConfig,
    request: &BidRequest,
    cache: &mut RequestFilterCache,
) -> BiddableSpots {
    let mut spots = Vec::new();
    for (index, spot) in request.spots.iter().enumerate() {
        let mut creative_ids = Vec::new();
        for creative in &config.creatives {
            if !creative.fits(&spot.format) {
                continue;
            }
            if !creative.biddable_on(&request.exchange) {
                continue;
            }
            if !creative.language_filter.is_empty()
                && !creative.language_filter.accepts(&cache.language)
            {
                continue;
            }
            if !creative.location_filter.is_empty()
                && !cache.location_accepts(&creative.location_filter)
            {
                continue;
            }
            if let Some(filter) = &creative.eligibility_filter {
                if !filter.matches(&request.tags) {
                    continue;
                }
            }
            creative_ids.push(creative.id);
        }
        if !creative_ids.is_empty() {
            spots.push(BiddableSpot {
                spot_index: index as u32,
                creative_ids,
            });
        }
    }
    BiddableSpots(spots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtb_common::agent_config::{Creative, IncludeExclude, PatternIncludeExclude, TagFilter};
    use rtb_common::bid_request::{AdSpot, Format, SegmentList};
    use rtb_common::money::{Amount, CurrencyCode, Micros};

    fn floor() -> Amount {
        Amount::new(Micros::from_units(1), CurrencyCode::Usd)
    }

    fn request_with_spots(formats: &[(u16, u16)]) -> BidRequest {
        let spots = formats
            .iter()
            .enumerate()
            .map(|(i, (w, h))| AdSpot::new(i.to_string(), Format::new(*w, *h), floor()))
            .collect();
        BidRequest::new("a-1", "adx", spots)
    }

    fn config_with(creatives: Vec<Creative>) -> AgentConfig {
        AgentConfig {
            account: "acct".parse().unwrap(),
            creatives,
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_format_prefilter() {
        let config = config_with(vec![Creative::sample_box(1)]);
        assert!(format_prefilter(&config, &request_with_spots(&[(300, 250)])));
        assert!(!format_prefilter(&config, &request_with_spots(&[(728, 90)])));
    }

    #[test]
    fn test_biddable_spots_by_format() {
        let config = config_with(vec![
            Creative::sample_box(1),
            Creative::sample_leaderboard(2),
        ]);
        let request = request_with_spots(&[(300, 250), (728, 90), (160, 600)]);
        let mut cache = RequestFilterCache::new(&request);
        let spots = biddable_spots(&config, &request, &mut cache);

        assert_eq!(spots.len(), 2);
        assert!(spots.allows(0, 1));
        assert!(spots.allows(1, 2));
        assert!(!spots.allows(0, 2));
        assert!(!spots.allows(2, 1));
    }

    #[test]
    fn test_creative_exchange_filter() {
        let mut creative = Creative::sample_box(1);
        creative.exchange_filter = IncludeExclude::including(["appnexus"]);
        let config = config_with(vec![creative]);
        let request = request_with_spots(&[(300, 250)]);
        let mut cache = RequestFilterCache::new(&request);
        assert!(biddable_spots(&config, &request, &mut cache).is_empty());
    }

    #[test]
    fn test_creative_language_filter_exact() {
        let mut creative = Creative::sample_box(1);
        creative.language_filter = IncludeExclude::including(["fr"]);
        let config = config_with(vec![creative]);

        let mut request = request_with_spots(&[(300, 250)]);
        request.language = "en".to_string();
        let mut cache = RequestFilterCache::new(&request);
        assert!(biddable_spots(&config, &request, &mut cache).is_empty());

        request.language = "fr".to_string();
        let mut cache = RequestFilterCache::new(&request);
        assert!(!biddable_spots(&config, &request, &mut cache).is_empty());
    }

    #[test]
    fn test_creative_location_filter() {
        let mut creative = Creative::sample_box(1);
        creative.location_filter = PatternIncludeExclude::including(["^CA:"]);
        let config = config_with(vec![creative]);

        let mut request = request_with_spots(&[(300, 250)]);
        request.location = rtb_common::bid_request::Location::new("US", "NY", "NYC");
        let mut cache = RequestFilterCache::new(&request);
        assert!(biddable_spots(&config, &request, &mut cache).is_empty());
    }

    #[test]
    fn test_creative_tag_eligibility() {
        let mut creative = Creative::sample_box(1);
        creative.eligibility_filter = Some(TagFilter::Tag("video".into()));
        let config = config_with(vec![creative]);

        let mut request = request_with_spots(&[(300, 250)]);
        let mut cache = RequestFilterCache::new(&request);
        assert!(biddable_spots(&config, &request, &mut cache).is_empty());

        request.tags = SegmentList::new(["video"]);
        let mut cache = RequestFilterCache::new(&request);
        assert!(biddable_spots(&config, &request, &mut cache).allows(0, 1));
    }
}
