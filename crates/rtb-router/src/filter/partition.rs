//! User partition evaluation (stage 7).
//!
//! Partitions slice the user population consistently so A/B tests see the
//! same users on the same side across requests. The hash is a 64-bit
//! truncation of MD5, reduced modulo the configured modulus; intervals are
//! half-open.

use rand::Rng;

use rtb_common::agent_config::{PartitionHash, UserPartition};
use rtb_common::bid_request::BidRequest;
use rtb_common::ids::md5_hash64;

fn reduce(hash: u64, modulus: u32) -> u32 {
    (hash % modulus as u64) as u32
}

/// Evaluate a partition against a request.
///
/// Returns false when a required id is absent: an agent partitioning on
/// provider ids does not want users it cannot attribute.
pub fn matches(partition: &UserPartition, request: &BidRequest, rng: &mut impl Rng) -> bool {
    if partition.is_empty() {
        return true;
    }
    let value = match partition.hash_on {
        PartitionHash::None => 0,
        PartitionHash::Random => rng.gen_range(0..partition.modulus),
        PartitionHash::ExchangeId => match request.user_ids.exchange_id() {
            Some(id) => reduce(md5_hash64(id.as_bytes()), partition.modulus),
            None => return false,
        },
        PartitionHash::ProviderId => match request.user_ids.provider_id() {
            Some(id) => reduce(md5_hash64(id.as_bytes()), partition.modulus),
            None => return false,
        },
        PartitionHash::Ipua => {
            // ip ‖ user-agent, no delimiter.
            let mut bytes = Vec::with_capacity(request.ip.len() + request.user_agent.len());
            bytes.extend_from_slice(request.ip.as_bytes());
            bytes.extend_from_slice(request.user_agent.as_bytes());
            reduce(md5_hash64(&bytes), partition.modulus)
        }
    };
    partition.accepts_hash(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rtb_common::agent_config::PartitionInterval;
    use rtb_common::bid_request::{AdSpot, Format, UserIds};
    use rtb_common::money::{Amount, CurrencyCode, Micros};

    fn request() -> BidRequest {
        let mut req = BidRequest::new(
            "a-1",
            "adx",
            vec![AdSpot::new(
                "0",
                Format::new(300, 250),
                Amount::new(Micros::from_units(1), CurrencyCode::Usd),
            )],
        );
        req.ip = "10.0.0.1".to_string();
        req.user_agent = "test-agent/1.0".to_string();
        req.user_ids = UserIds::new().with(UserIds::EXCHANGE, "xid-42");
        req
    }

    fn partition(hash_on: PartitionHash, modulus: u32, ranges: &[(u32, u32)]) -> UserPartition {
        UserPartition {
            hash_on,
            modulus,
            include_ranges: ranges
                .iter()
                .map(|&(a, b)| PartitionInterval::new(a, b))
                .collect(),
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_empty_partition_accepts_everyone() {
        assert!(matches(&UserPartition::default(), &request(), &mut rng()));
    }

    #[test]
    fn test_none_hash_is_zero() {
        // Hash 0 is inside [0, 1) but outside [1, 2).
        let p = partition(PartitionHash::None, 2, &[(0, 1)]);
        assert!(matches(&p, &request(), &mut rng()));
        let p = partition(PartitionHash::None, 2, &[(1, 2)]);
        assert!(!matches(&p, &request(), &mut rng()));
    }

    #[test]
    fn test_exchange_id_is_consistent() {
        let p = partition(PartitionHash::ExchangeId, 100, &[(0, 100)]);
        assert!(matches(&p, &request(), &mut rng()));

        // The same id lands in the same bucket every time.
        let value = reduce(md5_hash64(b"xid-42"), 100);
        let inside = partition(PartitionHash::ExchangeId, 100, &[(value, value + 1)]);
        let outside = partition(
            PartitionHash::ExchangeId,
            100,
            &[((value + 1) % 100, (value + 1) % 100 + 1)],
        );
        assert!(matches(&inside, &request(), &mut rng()));
        assert!(!matches(&outside, &request(), &mut rng()));
    }

    #[test]
    fn test_missing_id_rejects() {
        let p = partition(PartitionHash::ProviderId, 10, &[(0, 10)]);
        // Full-range partition, but the request has no provider id.
        assert!(!matches(&p, &request(), &mut rng()));
    }

    #[test]
    fn test_ipua_concatenates_without_delimiter() {
        let req = request();
        let mut bytes = req.ip.as_bytes().to_vec();
        bytes.extend_from_slice(req.user_agent.as_bytes());
        let value = reduce(md5_hash64(&bytes), 50);

        let p = partition(PartitionHash::Ipua, 50, &[(value, value + 1)]);
        assert!(matches(&p, &req, &mut rng()));
    }

    #[test]
    fn test_random_respects_modulus() {
        let p = partition(PartitionHash::Random, 10, &[(0, 10)]);
        let mut rng = rng();
        // Full-range interval accepts any random draw.
        for _ in 0..50 {
            assert!(matches(&p, &request(), &mut rng));
        }
    }
}
