//! The auction engine: one bid request from arrival to emission.
//!
//! In-flight auctions live in shards keyed by the auction-id hash; every
//! touch of an auction goes through its shard, and the shard lock is never
//! held across an await. The sequence for one auction is serial:
//! admit → solicit → receive bids → resolve → commit → emit. Across
//! auctions there is no ordering at all.
//!
//! Deadlines are absolute instants on the tokio monotone clock. At the
//! deadline the auction force-resolves with whatever arrived; later bids
//! are counted as late and discarded.

pub mod auction;
pub mod winners;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use rtb_common::agent_config::{BidControl, ResultVerbosity};
use rtb_common::bid_request::BidRequest;
use rtb_common::ids::{md5_hash64, AuctionId};
use rtb_common::money::Micros;
use rtb_common::protocol::{BidResponse, Envelope, MessageKind};

use crate::banker::{Authorization, SlaveBanker};
use crate::bidder::{BidSolicitation, BidderInterface};
use crate::connectors::WinCostModel;
use crate::filter::{BlacklistStore, Eligible, FilterPipeline};
use crate::metrics::RouterMetrics;
use crate::registry::AgentRegistry;

pub use auction::{
    Auction, AuctionOutcome, AuctionState, LossReason, LossRecord, ReceivedBid, Solicitation,
    SubmittedAuction, SubmittedWinner, WinnerRecord,
};

/// Why a request was refused at the door.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("duplicate request id {0}")]
    DuplicateRequest(AuctionId),

    #[error("request has no ad spots")]
    NoSpots,
}

/// Why a bid response (or one bid within it) was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BidError {
    #[error("unknown auction {0}")]
    UnknownAuction(AuctionId),

    #[error("auction {0} already resolved")]
    Late(AuctionId),

    #[error("agent was not solicited for this auction")]
    NotSolicited,

    #[error("agent already responded to this auction")]
    DuplicateResponse,
}

/// Per-response accounting of accepted vs rejected bids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BidIngest {
    pub accepted: usize,
    pub rejected: usize,
}

/// Engine tuning, derived from the router configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default auction deadline when the exchange states none.
    pub auction_timeout: Duration,
    /// How long an emitted auction lingers so late bids are recognized as
    /// late rather than unknown.
    pub grace: Duration,
    /// Hard ceiling on any single bid.
    pub max_bid_price: Micros,
    /// Stamped onto submitted auctions as the expected-win deadline.
    pub win_timeout: Duration,
    /// Number of in-flight shards.
    pub shards: usize,
    /// Per-exchange win cost models.
    pub win_cost_models: HashMap<String, WinCostModel>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auction_timeout: Duration::from_millis(100),
            grace: Duration::from_secs(2),
            max_bid_price: Micros::from_units(100_000),
            win_timeout: Duration::from_secs(300),
            shards: 8,
            win_cost_models: HashMap::new(),
        }
    }
}

/// A solicitation waiting to be dispatched over the bidder interface.
///
/// Built under the shard lock, sent after it is released.
pub struct PendingSend {
    agent_id: Arc<str>,
    solicitation: BidSolicitation,
    /// Route over the external bidder interface.
    external: bool,
}

/// The engine.
pub struct AuctionEngine {
    config: EngineConfig,
    registry: Arc<AgentRegistry>,
    pipeline: FilterPipeline,
    banker: Arc<SlaveBanker>,
    bidder: Arc<dyn BidderInterface>,
    /// Transport for agents flagged `external`; falls back to the default
    /// bidder when none is configured.
    external_bidder: Option<Arc<dyn BidderInterface>>,
    submitted_tx: mpsc::Sender<SubmittedAuction>,
    metrics: Arc<RouterMetrics>,
    shards: Vec<Mutex<HashMap<AuctionId, Auction>>>,
}

impl AuctionEngine {
    pub fn new(
        config: EngineConfig,
        registry: Arc<AgentRegistry>,
        blacklist: Arc<BlacklistStore>,
        banker: Arc<SlaveBanker>,
        bidder: Arc<dyn BidderInterface>,
        submitted_tx: mpsc::Sender<SubmittedAuction>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            config,
            registry,
            pipeline: FilterPipeline::new(blacklist),
            banker,
            bidder,
            external_bidder: None,
            submitted_tx,
            metrics,
            shards,
        }
    }

    /// Install the transport that serves agents flagged `external`.
    pub fn with_external_bidder(mut self, bidder: Arc<dyn BidderInterface>) -> Self {
        self.external_bidder = Some(bidder);
        self
    }

    /// The transport an agent's messages travel over.
    fn transport_for(&self, external: bool) -> Arc<dyn BidderInterface> {
        if external {
            if let Some(bidder) = &self.external_bidder {
                return Arc::clone(bidder);
            }
        }
        Arc::clone(&self.bidder)
    }

    pub fn pipeline(&self) -> &FilterPipeline {
        &self.pipeline
    }

    pub fn in_flight(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn shard(&self, id: &AuctionId) -> &Mutex<HashMap<AuctionId, Auction>> {
        &self.shards[(id.hash64() % self.shards.len() as u64) as usize]
    }

    /// Drive one request start to finish: admit, solicit, wait out the
    /// deadline, and return the outcome the exchange connector answers with.
    pub async fn run_auction(
        self: &Arc<Self>,
        request: BidRequest,
    ) -> Result<AuctionOutcome, AdmitError> {
        let deadline = Instant::now() + self.config.auction_timeout;
        self.run_auction_with_deadline(request, deadline).await
    }

    pub async fn run_auction_with_deadline(
        self: &Arc<Self>,
        request: BidRequest,
        deadline: Instant,
    ) -> Result<AuctionOutcome, AdmitError> {
        let auction_id = request.id.clone();
        let (outcome_rx, sends) = self.admit(request, deadline)?;

        for send in sends {
            self.dispatch(&auction_id, send).await;
        }

        // Force resolution at the deadline regardless of stragglers.
        let engine = Arc::clone(self);
        let timer_id = auction_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            engine.resolve(&timer_id);
        });

        Ok(outcome_rx
            .await
            .unwrap_or_else(|_| AuctionOutcome::no_bid(auction_id)))
    }

    /// Validate and install a new auction; returns the outcome channel and
    /// the solicitations to dispatch. No I/O happens in here.
    pub fn admit(
        self: &Arc<Self>,
        request: BidRequest,
        deadline: Instant,
    ) -> Result<(oneshot::Receiver<AuctionOutcome>, Vec<PendingSend>), AdmitError> {
        if request.spots.is_empty() {
            return Err(AdmitError::NoSpots);
        }
        let auction_id = request.id.clone();
        let request = Arc::new(request);

        // Filter against the current snapshot before taking any lock.
        let snapshot = self.registry.snapshot();
        let eligible = self.pipeline.eligible(&request, &snapshot);
        let eligible = self.apply_round_robin(&request, eligible);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let now = Utc::now();
        let mut sends = Vec::new();

        let resolve_immediately = {
            let mut shard = self.shard(&auction_id).lock();
            if shard.contains_key(&auction_id) {
                RouterMetrics::incr(&self.metrics.duplicate_requests);
                return Err(AdmitError::DuplicateRequest(auction_id));
            }
            RouterMetrics::incr(&self.metrics.auctions_started);

            let mut auction = Auction::new(Arc::clone(&request), deadline, outcome_tx);

            for Eligible { entry, spots } in eligible {
                let stats = &entry.stats;
                if stats.in_flight() >= entry.config.max_in_flight as u64 {
                    RouterMetrics::incr(&self.metrics.max_in_flight_exceeded);
                    continue;
                }
                if !entry.breaker.allows_send() && !entry.breaker.try_half_open() {
                    RouterMetrics::incr(&self.metrics.breaker_open);
                    continue;
                }

                let available = deadline
                    .saturating_duration_since(Instant::now())
                    .min(Duration::from_millis(entry.config.min_time_available_ms));
                let agent_deadline = Instant::now() + available;

                match entry.config.bid_control {
                    BidControl::Fixed { price_micros } => {
                        // The router bids on the agent's behalf; nothing is
                        // relayed.
                        let weight = entry.config.round_robin_weight;
                        let agent_hash = md5_hash64(entry.agent_id.as_bytes());
                        for spot in spots.iter() {
                            if let Some(&creative_id) = spot.creative_ids.first() {
                                auction.bids[spot.spot_index as usize].push(ReceivedBid {
                                    agent_id: Arc::clone(&entry.agent_id),
                                    account: entry.config.account.clone(),
                                    spot_index: spot.spot_index,
                                    creative_id,
                                    price_micros,
                                    weight,
                                    sent_at: now,
                                    agent_hash,
                                    test: entry.config.test,
                                });
                            }
                        }
                        auction.solicited.push(Solicitation {
                            entry: Arc::clone(&entry),
                            spots,
                            sent_at: now,
                            agent_deadline,
                            responded: true,
                        });
                    }
                    BidControl::Relay | BidControl::RelayFixed { .. } => {
                        stats.in_flight.fetch_add(1, Ordering::AcqRel);
                        auction.outstanding += 1;
                        sends.push(PendingSend {
                            agent_id: Arc::clone(&entry.agent_id),
                            solicitation: BidSolicitation {
                                auction_id: auction_id.clone(),
                                request: Arc::clone(&request),
                                spots: spots.clone(),
                                time_available_ms: available.as_millis() as u64,
                            },
                            external: entry.config.external,
                        });
                        auction.solicited.push(Solicitation {
                            entry: Arc::clone(&entry),
                            spots,
                            sent_at: now,
                            agent_deadline,
                            responded: false,
                        });
                    }
                }
            }

            auction.state = AuctionState::Solicited;
            let resolve_immediately = auction.outstanding == 0;
            shard.insert(auction_id.clone(), auction);
            resolve_immediately
        };

        // Zero eligible agents (or only fixed-price ones): resolve on the
        // spot rather than waiting out the deadline.
        if resolve_immediately {
            self.resolve(&auction_id);
        }

        // Destroy the record at deadline + grace no matter what happened.
        let engine = Arc::clone(self);
        let cleanup_id = auction_id.clone();
        let grace = self.config.grace;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline + grace).await;
            engine.shard(&cleanup_id).lock().remove(&cleanup_id);
        });

        Ok((outcome_rx, sends))
    }

    /// Round-robin groups: one member bids per request, picked by a
    /// weighted, request-seeded draw so replays are stable.
    fn apply_round_robin(&self, request: &BidRequest, eligible: Vec<Eligible>) -> Vec<Eligible> {
        let mut group_weights: HashMap<String, u64> = HashMap::new();
        for e in &eligible {
            if let Some(group) = &e.entry.config.round_robin_group {
                *group_weights.entry(group.clone()).or_default() +=
                    e.entry.config.round_robin_weight.max(1) as u64;
            }
        }
        if group_weights.is_empty() {
            return eligible;
        }

        // Pick the winning ticket per group.
        let mut tickets: HashMap<String, u64> = HashMap::new();
        for (group, total_weight) in &group_weights {
            let mut bytes = request.id.as_str().as_bytes().to_vec();
            bytes.extend_from_slice(group.as_bytes());
            tickets.insert(group.clone(), md5_hash64(&bytes) % total_weight);
        }

        // The eligible list is agent-id ordered, so walking the weights in
        // order assigns every group member a stable slot range.
        let mut walked: HashMap<String, u64> = HashMap::new();
        eligible
            .into_iter()
            .filter(|e| {
                let Some(group) = e.entry.config.round_robin_group.clone() else {
                    return true;
                };
                let ticket = tickets[&group];
                let start = *walked.get(&group).unwrap_or(&0);
                let end = start + e.entry.config.round_robin_weight.max(1) as u64;
                walked.insert(group, end);
                let selected = (start..end).contains(&ticket);
                if !selected {
                    RouterMetrics::incr(&self.metrics.round_robin_skipped);
                    e.entry
                        .stats
                        .round_robin_skipped
                        .fetch_add(1, Ordering::Relaxed);
                }
                selected
            })
            .collect()
    }

    /// Deliver one solicitation; transport failures feed the breaker and
    /// never fail the auction. External agents go over the external bidder
    /// interface.
    async fn dispatch(self: &Arc<Self>, auction_id: &AuctionId, send: PendingSend) {
        let PendingSend {
            agent_id,
            solicitation,
            external,
        } = send;
        let transport = self.transport_for(external);
        match transport.send_auction(&agent_id, solicitation).await {
            Ok(()) => {
                if let Some(entry) = self.registry.get(&agent_id) {
                    entry.stats.bids_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                debug!(agent = %agent_id, %err, "solicitation failed");
                RouterMetrics::incr(&self.metrics.agent_unreachable);
                self.note_send_failure(auction_id, &agent_id);
            }
        }
    }

    /// Undo the outstanding-response accounting for an unreachable agent.
    fn note_send_failure(self: &Arc<Self>, auction_id: &AuctionId, agent_id: &str) {
        let resolve_now = {
            let mut shard = self.shard(auction_id).lock();
            let Some(auction) = shard.get_mut(auction_id) else {
                return;
            };
            let Some(solicitation) = auction.solicitation_mut(agent_id) else {
                return;
            };
            if solicitation.responded {
                return;
            }
            solicitation.responded = true;
            solicitation.entry.breaker.record_failure();
            solicitation
                .entry
                .stats
                .in_flight
                .fetch_sub(1, Ordering::AcqRel);
            auction.outstanding -= 1;
            auction.outstanding == 0 && !auction.is_closed()
        };
        if resolve_now {
            self.resolve(auction_id);
        }
    }

    /// Ingest one agent's response. Individual invalid bids are dropped and
    /// counted; envelope-level problems reject the whole response.
    pub fn receive_bid(
        self: &Arc<Self>,
        agent_id: &str,
        response: BidResponse,
    ) -> Result<BidIngest, BidError> {
        let auction_id = response.auction_id.clone();
        let (ingest, resolve_now, entry, rejected_reasons) = {
            let mut shard = self.shard(&auction_id).lock();
            let Some(auction) = shard.get_mut(&auction_id) else {
                RouterMetrics::incr(&self.metrics.late_bids);
                if let Some(entry) = self.registry.get(agent_id) {
                    entry.stats.late_bids.fetch_add(1, Ordering::Relaxed);
                }
                return Err(BidError::UnknownAuction(auction_id));
            };

            if auction.is_closed() {
                RouterMetrics::incr(&self.metrics.late_bids);
                if let Some(s) = auction.solicitation_mut(agent_id) {
                    s.entry.stats.late_bids.fetch_add(1, Ordering::Relaxed);
                }
                return Err(BidError::Late(auction_id));
            }

            let Some(solicitation) = auction
                .solicited
                .iter_mut()
                .find(|s| &*s.entry.agent_id == agent_id)
            else {
                RouterMetrics::incr(&self.metrics.invalid_bids);
                return Err(BidError::NotSolicited);
            };
            if solicitation.responded {
                RouterMetrics::incr(&self.metrics.invalid_bids);
                return Err(BidError::DuplicateResponse);
            }
            solicitation.responded = true;
            solicitation.entry.breaker.record_success();
            let entry = Arc::clone(&solicitation.entry);
            let spots = solicitation.spots.clone();
            let sent_at = solicitation.sent_at;

            entry.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
            auction.outstanding -= 1;
            auction.state = AuctionState::Collecting;

            if response.is_no_bid() {
                entry.stats.no_bids.fetch_add(1, Ordering::Relaxed);
            } else {
                entry.stats.bids_received.fetch_add(1, Ordering::Relaxed);
            }

            let weight = entry.config.round_robin_weight;
            let agent_hash = md5_hash64(entry.agent_id.as_bytes());

            let mut ingest = BidIngest {
                accepted: 0,
                rejected: 0,
            };
            let mut rejected_reasons = Vec::new();
            for bid in response.bids {
                // Fixed and relay-fixed agents get their configured price,
                // whatever they answered.
                let price = entry
                    .config
                    .bid_control
                    .fixed_price()
                    .unwrap_or(bid.price_micros);

                let reason = if !spots.allows(bid.spot_index, bid.creative_id) {
                    Some(format!(
                        "spot {} creative {} is not biddable",
                        bid.spot_index, bid.creative_id
                    ))
                } else if price <= Micros::ZERO {
                    Some(format!("non-positive price {price}"))
                } else if price > self.config.max_bid_price {
                    Some(format!(
                        "price {price} above router maximum {}",
                        self.config.max_bid_price
                    ))
                } else {
                    None
                };
                if let Some(reason) = reason {
                    ingest.rejected += 1;
                    RouterMetrics::incr(&self.metrics.invalid_bids);
                    rejected_reasons.push(reason);
                    continue;
                }
                ingest.accepted += 1;
                RouterMetrics::incr(&self.metrics.bids_received);
                auction.bids[bid.spot_index as usize].push(ReceivedBid {
                    agent_id: Arc::clone(&entry.agent_id),
                    account: entry.config.account.clone(),
                    spot_index: bid.spot_index,
                    creative_id: bid.creative_id,
                    price_micros: price,
                    weight,
                    sent_at,
                    agent_hash,
                    test: entry.config.test,
                });
            }

            (ingest, auction.outstanding == 0, entry, rejected_reasons)
        };

        if !rejected_reasons.is_empty() {
            self.send_rejection_notice(&entry, &auction_id, rejected_reasons);
        }
        if resolve_now {
            self.resolve(&auction_id);
        }
        Ok(ingest)
    }

    /// Tell an agent its bids were rejected, at its configured error
    /// verbosity.
    fn send_rejection_notice(
        self: &Arc<Self>,
        entry: &Arc<crate::registry::AgentEntry>,
        auction_id: &AuctionId,
        reasons: Vec<String>,
    ) {
        let payload = match entry.config.error_format {
            ResultVerbosity::None => return,
            ResultVerbosity::Lightweight => serde_json::json!({"rejected": reasons.len()}),
            ResultVerbosity::Full => {
                serde_json::json!({"rejected": reasons.len(), "reasons": reasons})
            }
        };
        let envelope = Envelope::new(
            MessageKind::Error,
            auction_id.clone(),
            entry.agent_id.to_string(),
            payload,
        );
        let transport = self.transport_for(entry.config.external);
        let agent_id = Arc::clone(&entry.agent_id);
        tokio::spawn(async move {
            if let Err(err) = transport.send_result(&agent_id, envelope).await {
                warn!(agent = %agent_id, %err, "error notice delivery failed");
            }
        });
    }

    /// Resolve the auction: select winners, commit budget, emit. Idempotent;
    /// the deadline timer and the last-response path may race here.
    pub fn resolve(self: &Arc<Self>, auction_id: &AuctionId) -> Option<AuctionOutcome> {
        // Extract everything under the lock, work outside it.
        let (request, bids, outcome_tx, solicited) = {
            let mut shard = self.shard(auction_id).lock();
            let auction = shard.get_mut(auction_id)?;
            if auction.is_closed() {
                return None;
            }
            auction.state = AuctionState::Resolved;
            for s in auction.solicited.iter_mut().filter(|s| !s.responded) {
                s.responded = true;
                s.entry.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            auction.outstanding = 0;

            let request = Arc::clone(&auction.request);
            let bids = std::mem::take(&mut auction.bids);
            let outcome_tx = auction.outcome_tx.take();
            let solicited: Vec<_> = auction
                .solicited
                .iter()
                .map(|s| Arc::clone(&s.entry))
                .collect();
            auction.state = AuctionState::Emitted;
            (request, bids, outcome_tx, solicited)
        };

        // Test agents cannot make real bids: their bids settle on a side
        // channel and never touch the exchange or the budget pools.
        let spot_count = bids.len();
        let mut real_bids: Vec<Vec<ReceivedBid>> = vec![Vec::new(); spot_count];
        let mut test_bids: Vec<Vec<ReceivedBid>> = vec![Vec::new(); spot_count];
        for (spot_index, spot_bids) in bids.into_iter().enumerate() {
            for bid in spot_bids {
                if bid.test {
                    test_bids[spot_index].push(bid);
                } else {
                    real_bids[spot_index].push(bid);
                }
            }
        }

        let selected = winners::select(&request, &real_bids);

        let mut winners = Vec::new();
        let mut losers = Vec::new();
        let win_cost = self
            .config
            .win_cost_models
            .get(&request.exchange)
            .copied()
            .unwrap_or_default();

        for (spot_index, winner) in selected.iter().enumerate() {
            let Some(winner) = winner else { continue };
            let currency = request.spots[spot_index].floor.currency;
            match self
                .banker
                .authorize(&winner.account, currency, winner.price_micros)
            {
                Authorization::Granted => {
                    if let Some(entry) = solicited
                        .iter()
                        .find(|e| e.agent_id == winner.agent_id)
                    {
                        entry.stats.wins.fetch_add(1, Ordering::Relaxed);
                        self.pipeline.blacklist().record_win(
                            &winner.agent_id,
                            &entry.config,
                            &request,
                            Utc::now(),
                        );
                    }
                    winners.push(WinnerRecord {
                        agent_id: Arc::clone(&winner.agent_id),
                        account: winner.account.clone(),
                        spot_index: spot_index as u32,
                        creative_id: winner.creative_id,
                        price_micros: winner.price_micros,
                        currency,
                    });
                }
                Authorization::SlowModeCapped => {
                    RouterMetrics::incr(&self.metrics.slow_mode_demotions);
                    losers.push(LossRecord {
                        agent_id: Arc::clone(&winner.agent_id),
                        spot_index: spot_index as u32,
                        price_micros: winner.price_micros,
                        reason: LossReason::SlowMode,
                    });
                }
                Authorization::Insufficient => {
                    RouterMetrics::incr(&self.metrics.insufficient_budget);
                    losers.push(LossRecord {
                        agent_id: Arc::clone(&winner.agent_id),
                        spot_index: spot_index as u32,
                        price_micros: winner.price_micros,
                        reason: LossReason::InsufficientBudget,
                    });
                }
            }
        }

        // Everything that bid but did not win its spot is an outbid loss.
        for (spot_index, spot_bids) in real_bids.iter().enumerate() {
            for bid in spot_bids {
                let won = winners
                    .iter()
                    .any(|w| w.spot_index == spot_index as u32 && w.agent_id == bid.agent_id);
                let demoted = losers
                    .iter()
                    .any(|l| l.spot_index == spot_index as u32 && l.agent_id == bid.agent_id);
                if !won && !demoted {
                    losers.push(LossRecord {
                        agent_id: Arc::clone(&bid.agent_id),
                        spot_index: spot_index as u32,
                        price_micros: bid.price_micros,
                        reason: LossReason::Outbid,
                    });
                }
            }
        }
        for loss in &losers {
            if let Some(entry) = solicited.iter().find(|e| e.agent_id == loss.agent_id) {
                entry.stats.losses.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Hand the winners to the post-auction loop. If the hand-off fails
        // the holds must not leak: release and demote.
        if !winners.is_empty() {
            let submitted = SubmittedAuction {
                auction_id: auction_id.clone(),
                exchange: request.exchange.clone(),
                submitted_at: Utc::now(),
                win_deadline: Utc::now()
                    + ChronoDuration::from_std(self.config.win_timeout)
                        .unwrap_or_else(|_| ChronoDuration::seconds(300)),
                winners: winners
                    .iter()
                    .map(|w| SubmittedWinner {
                        agent_id: Arc::clone(&w.agent_id),
                        account: w.account.clone(),
                        spot_index: w.spot_index,
                        creative_id: w.creative_id,
                        price_micros: w.price_micros,
                        currency: w.currency,
                        win_cost,
                    })
                    .collect(),
            };
            if let Err(err) = self.submitted_tx.try_send(submitted) {
                error!(%auction_id, %err, "post-auction hand-off failed; releasing holds");
                for w in winners.drain(..) {
                    self.banker.release(&w.account, w.currency, w.price_micros);
                    losers.push(LossRecord {
                        agent_id: w.agent_id,
                        spot_index: w.spot_index,
                        price_micros: w.price_micros,
                        reason: LossReason::InsufficientBudget,
                    });
                }
            }
        }

        if winners.is_empty() {
            RouterMetrics::incr(&self.metrics.auctions_no_bid);
        } else {
            RouterMetrics::incr(&self.metrics.auctions_won);
        }

        self.send_test_results(auction_id, &request, test_bids, &solicited);

        let outcome = AuctionOutcome {
            auction_id: auction_id.clone(),
            winners,
            losers,
        };
        self.send_results(&outcome, &solicited);

        if let Some(tx) = outcome_tx {
            let _ = tx.send(outcome.clone());
        }
        Some(outcome)
    }

    /// Settle test-agent bids: the best test bid per spot gets a synthetic
    /// win, the rest get losses, and no money or exchange payload moves.
    fn send_test_results(
        self: &Arc<Self>,
        auction_id: &AuctionId,
        request: &BidRequest,
        test_bids: Vec<Vec<ReceivedBid>>,
        solicited: &[Arc<crate::registry::AgentEntry>],
    ) {
        if test_bids.iter().all(Vec::is_empty) {
            return;
        }
        let selected = winners::select(request, &test_bids);

        let mut sends = Vec::new();
        for (spot_index, spot_bids) in test_bids.iter().enumerate() {
            let mut winner_taken = false;
            for bid in spot_bids {
                let Some(entry) = solicited.iter().find(|e| e.agent_id == bid.agent_id) else {
                    continue;
                };
                let is_winner = !winner_taken
                    && selected[spot_index].as_ref().is_some_and(|w| {
                        w.agent_id == bid.agent_id
                            && w.creative_id == bid.creative_id
                            && w.price_micros == bid.price_micros
                    });
                let (kind, verbosity) = if is_winner {
                    winner_taken = true;
                    entry.stats.wins.fetch_add(1, Ordering::Relaxed);
                    (MessageKind::Win, entry.config.win_format)
                } else {
                    entry.stats.losses.fetch_add(1, Ordering::Relaxed);
                    (MessageKind::Loss, entry.config.loss_format)
                };
                let payload = match verbosity {
                    ResultVerbosity::None => continue,
                    ResultVerbosity::Lightweight => {
                        serde_json::json!({"test": true, "spot": spot_index as u32})
                    }
                    ResultVerbosity::Full => serde_json::json!({
                        "test": true,
                        "spot": spot_index as u32,
                        "creative": bid.creative_id,
                        "price_micros": bid.price_micros,
                    }),
                };
                sends.push((
                    self.transport_for(entry.config.external),
                    Arc::clone(&bid.agent_id),
                    Envelope::new(
                        kind,
                        auction_id.clone(),
                        bid.agent_id.to_string(),
                        payload,
                    ),
                ));
            }
        }
        if sends.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for (transport, agent_id, envelope) in sends {
                if let Err(err) = transport.send_result(&agent_id, envelope).await {
                    warn!(agent = %agent_id, %err, "test result delivery failed");
                }
            }
        });
    }

    /// Tell agents how they did, honoring each one's verbosity settings.
    fn send_results(
        self: &Arc<Self>,
        outcome: &AuctionOutcome,
        solicited: &[Arc<crate::registry::AgentEntry>],
    ) {
        let mut envelopes = Vec::new();
        for winner in &outcome.winners {
            let Some(entry) = solicited.iter().find(|e| e.agent_id == winner.agent_id) else {
                continue;
            };
            let payload = match entry.config.win_format {
                ResultVerbosity::None => continue,
                ResultVerbosity::Lightweight => serde_json::json!({"spot": winner.spot_index}),
                ResultVerbosity::Full => serde_json::json!({
                    "spot": winner.spot_index,
                    "creative": winner.creative_id,
                    "price_micros": winner.price_micros,
                }),
            };
            envelopes.push((
                self.transport_for(entry.config.external),
                Arc::clone(&winner.agent_id),
                Envelope::new(
                    MessageKind::Win,
                    outcome.auction_id.clone(),
                    winner.agent_id.to_string(),
                    payload,
                ),
            ));
        }
        for loss in &outcome.losers {
            let Some(entry) = solicited.iter().find(|e| e.agent_id == loss.agent_id) else {
                continue;
            };
            let payload = match entry.config.loss_format {
                ResultVerbosity::None => continue,
                ResultVerbosity::Lightweight => serde_json::json!({"spot": loss.spot_index}),
                ResultVerbosity::Full => serde_json::json!({
                    "spot": loss.spot_index,
                    "reason": loss.reason,
                }),
            };
            envelopes.push((
                self.transport_for(entry.config.external),
                Arc::clone(&loss.agent_id),
                Envelope::new(
                    MessageKind::Loss,
                    outcome.auction_id.clone(),
                    loss.agent_id.to_string(),
                    payload,
                ),
            ));
        }
        if envelopes.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for (transport, agent_id, envelope) in envelopes {
                if let Err(err) = transport.send_result(&agent_id, envelope).await {
                    warn!(agent = %agent_id, %err, "result delivery failed");
                }
            }
        });
    }
}
