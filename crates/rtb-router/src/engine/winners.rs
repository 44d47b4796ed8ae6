//! Winner selection.
//!
//! Per spot: highest price at or above the floor wins. Ties break by
//! round-robin weight (higher first), then send timestamp (earlier first),
//! then the stable agent-id hash (lower first). The hash leg makes the
//! order total, so the same bids always pick the same winner.

use std::cmp::Ordering;

use rtb_common::bid_request::BidRequest;
use rtb_common::money::Micros;

use super::auction::ReceivedBid;

/// Total order on competing bids; `Greater` means "wins against".
fn beats(a: &ReceivedBid, b: &ReceivedBid) -> Ordering {
    a.price_micros
        .cmp(&b.price_micros)
        .then_with(|| a.weight.cmp(&b.weight))
        .then_with(|| b.sent_at.cmp(&a.sent_at))
        .then_with(|| b.agent_hash.cmp(&a.agent_hash))
}

/// Pick the winner for one spot, given its floor.
pub fn select_for_spot<'a>(bids: &'a [ReceivedBid], floor: Micros) -> Option<&'a ReceivedBid> {
    bids.iter()
        .filter(|b| b.price_micros >= floor)
        .max_by(|a, b| beats(a, b))
}

/// Pick winners for every spot of a request.
///
/// The result is indexed by spot; `None` where no bid met the floor.
pub fn select(request: &BidRequest, bids_per_spot: &[Vec<ReceivedBid>]) -> Vec<Option<ReceivedBid>> {
    request
        .spots
        .iter()
        .enumerate()
        .map(|(index, spot)| {
            bids_per_spot
                .get(index)
                .and_then(|bids| select_for_spot(bids, spot.floor.value))
                .cloned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rtb_common::ids::md5_hash64;
    use std::sync::Arc;

    fn bid(agent: &str, price_units: i64, weight: u32, sent_offset_ms: i64) -> ReceivedBid {
        ReceivedBid {
            agent_id: Arc::from(agent),
            account: "acct".parse().unwrap(),
            spot_index: 0,
            creative_id: 1,
            price_micros: Micros::from_units(price_units),
            weight,
            sent_at: Utc::now() + Duration::milliseconds(sent_offset_ms),
            agent_hash: md5_hash64(agent.as_bytes()),
            test: false,
        }
    }

    #[test]
    fn test_highest_price_wins() {
        let bids = vec![bid("a", 2, 1, 0), bid("b", 3, 1, 0), bid("c", 1, 1, 0)];
        let winner = select_for_spot(&bids, Micros::from_units(1)).unwrap();
        assert_eq!(&*winner.agent_id, "b");
    }

    #[test]
    fn test_floor_filters_bids() {
        let bids = vec![bid("a", 2, 1, 0)];
        assert!(select_for_spot(&bids, Micros::from_units(3)).is_none());
        // At the floor is acceptable.
        assert!(select_for_spot(&bids, Micros::from_units(2)).is_some());
    }

    #[test]
    fn test_price_tie_breaks_on_weight() {
        let bids = vec![bid("a", 2, 1, 0), bid("b", 2, 5, 0)];
        let winner = select_for_spot(&bids, Micros::ZERO).unwrap();
        assert_eq!(&*winner.agent_id, "b");
    }

    #[test]
    fn test_weight_tie_breaks_on_send_time() {
        // Same price and weight; "a" was solicited earlier.
        let bids = vec![bid("a", 2, 1, -10), bid("b", 2, 1, 0)];
        let winner = select_for_spot(&bids, Micros::ZERO).unwrap();
        assert_eq!(&*winner.agent_id, "a");
    }

    #[test]
    fn test_final_tie_breaks_on_agent_hash() {
        let mut a = bid("a", 2, 1, 0);
        let mut b = bid("b", 2, 1, 0);
        b.sent_at = a.sent_at;
        let expected = if a.agent_hash < b.agent_hash { "a" } else { "b" };
        let bids = vec![a.clone(), b.clone()];
        let winner = select_for_spot(&bids, Micros::ZERO).unwrap();
        assert_eq!(&*winner.agent_id, expected);

        // Selection is order-independent.
        let bids = vec![b, a];
        let winner = select_for_spot(&bids, Micros::ZERO).unwrap();
        assert_eq!(&*winner.agent_id, expected);
    }

    #[test]
    fn test_select_per_spot() {
        use rtb_common::bid_request::{AdSpot, Format};
        use rtb_common::money::{Amount, CurrencyCode};

        let request = BidRequest::new(
            "a-1",
            "adx",
            vec![
                AdSpot::new(
                    "0",
                    Format::new(300, 250),
                    Amount::new(Micros::from_units(1), CurrencyCode::Usd),
                ),
                AdSpot::new(
                    "1",
                    Format::new(728, 90),
                    Amount::new(Micros::from_units(5), CurrencyCode::Usd),
                ),
            ],
        );
        let bids = vec![
            vec![bid("a", 2, 1, 0)],
            vec![bid("b", 3, 1, 0)], // below the 5 USD floor
        ];
        let winners = select(&request, &bids);
        assert!(winners[0].is_some());
        assert!(winners[1].is_none());
    }
}
