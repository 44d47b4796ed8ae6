//! Deterministic bid-probability sampling (stage 15).
//!
//! The rng is seeded from md5(request id ‖ agent id), so the decision for a
//! given (request, agent) pair is a pure function of the two ids: test
//! replays and cross-process comparisons see identical outcomes.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rtb_common::ids::{md5_hash64, AuctionId};

/// Seed for the (request, agent) decision stream.
pub fn decision_seed(request_id: &AuctionId, agent_id: &str) -> u64 {
    let mut bytes = Vec::with_capacity(request_id.as_str().len() + agent_id.len());
    bytes.extend_from_slice(request_id.as_str().as_bytes());
    bytes.extend_from_slice(agent_id.as_bytes());
    md5_hash64(&bytes)
}

/// Should this agent enter this auction?
pub fn passes(request_id: &AuctionId, agent_id: &str, probability: f64) -> bool {
    if probability >= 1.0 {
        return true;
    }
    if probability <= 0.0 {
        return false;
    }
    let mut rng = StdRng::seed_from_u64(decision_seed(request_id, agent_id));
    rng.gen::<f64>() < probability
}
