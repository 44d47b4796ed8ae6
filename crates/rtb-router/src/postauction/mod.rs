//! The post-auction loop.
//!
//! Owns every submitted auction from emission to settlement. Notifications
//! are matched by auction id; each (auction, spot) walks
//! `PendingWin → Won | Lost | LossAssumed → Settled`, with budget committed
//! exactly once on a win and released exactly once on any loss. The table
//! is sharded by auction-id hash; one task owns each shard, so per-auction
//! ordering needs no locking.
//!
//! Out-of-order impressions and clicks buffer per spot until the win
//! arrives or the win timeout trips; duplicates are dropped by
//! (auction, spot, kind); events that never match are emitted as orphans
//! after a bounded late-match window.

pub mod sink;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rtb_common::events::{DeliveryKind, DeliveryRecord, EventKind, PostAuctionEvent};
use rtb_common::ids::AuctionId;

use crate::banker::SlaveBanker;
use crate::engine::{SubmittedAuction, SubmittedWinner};
use crate::metrics::RouterMetrics;
use crate::registry::AgentRegistry;

pub use sink::{ChannelSink, DeliverySink, FileSink, NullSink};

/// Post-auction tuning.
#[derive(Debug, Clone)]
pub struct PostAuctionConfig {
    /// Number of shard tasks.
    pub shards: usize,
    /// After Won, how long to wait for impressions and clicks.
    pub event_window: Duration,
    /// How long unmatched notifications wait for their auction.
    pub orphan_window: Duration,
    /// Cadence of timeout processing.
    pub tick_interval: Duration,
}

impl Default for PostAuctionConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            event_window: Duration::from_secs(900),
            orphan_window: Duration::from_secs(60),
            tick_interval: Duration::from_millis(500),
        }
    }
}

/// Lifecycle of one winning spot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpotPhase {
    PendingWin,
    Won { settle_deadline: DateTime<Utc> },
    Lost,
    LossAssumed,
    Settled,
}

impl SpotPhase {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            SpotPhase::Lost | SpotPhase::LossAssumed | SpotPhase::Settled
        )
    }
}

#[derive(Debug)]
struct TrackedSpot {
    winner: SubmittedWinner,
    phase: SpotPhase,
    /// Event kinds already processed, for idempotence.
    seen: Vec<EventKind>,
    /// Impressions/clicks awaiting the win notice.
    buffered: Vec<PostAuctionEvent>,
    impression_emitted: bool,
}

impl TrackedSpot {
    fn new(winner: SubmittedWinner) -> Self {
        Self {
            winner,
            phase: SpotPhase::PendingWin,
            seen: Vec::new(),
            buffered: Vec::new(),
            impression_emitted: false,
        }
    }

    fn seen_before(&self, kind: EventKind) -> bool {
        self.seen.contains(&kind)
    }

    fn mark_seen(&mut self, kind: EventKind) {
        if !self.seen.contains(&kind) {
            self.seen.push(kind);
        }
    }
}

#[derive(Debug)]
struct TrackedAuction {
    exchange: String,
    win_deadline: DateTime<Utc>,
    spots: HashMap<u32, TrackedSpot>,
}

#[derive(Debug)]
struct OrphanEntry {
    events: Vec<PostAuctionEvent>,
    first_seen: DateTime<Utc>,
}

/// Per-auction event capacity while orphaned; beyond it events are dropped
/// as invalid rather than queued without bound.
const ORPHAN_EVENT_CAP: usize = 16;

/// One shard's state. Single-owner; all methods take `&mut self` and are
/// driven either by the shard task or directly by tests.
pub struct ShardState {
    config: PostAuctionConfig,
    banker: Arc<SlaveBanker>,
    registry: Arc<AgentRegistry>,
    metrics: Arc<RouterMetrics>,
    sink: Arc<dyn DeliverySink>,
    table: HashMap<AuctionId, TrackedAuction>,
    orphans: HashMap<AuctionId, OrphanEntry>,
}

impl ShardState {
    pub fn new(
        config: PostAuctionConfig,
        banker: Arc<SlaveBanker>,
        registry: Arc<AgentRegistry>,
        metrics: Arc<RouterMetrics>,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        Self {
            config,
            banker,
            registry,
            metrics,
            sink,
            table: HashMap::new(),
            orphans: HashMap::new(),
        }
    }

    pub fn tracked(&self) -> usize {
        self.table.len()
    }

    pub fn orphaned(&self) -> usize {
        self.orphans.values().map(|o| o.events.len()).sum()
    }

    /// A submitted auction enters the table; any events that arrived ahead
    /// of it are replayed in arrival order.
    pub fn on_submitted(&mut self, submitted: SubmittedAuction, now: DateTime<Utc>) {
        let auction_id = submitted.auction_id.clone();
        if self.table.contains_key(&auction_id) {
            warn!(%auction_id, "duplicate submission ignored");
            RouterMetrics::incr(&self.metrics.invalid_events);
            return;
        }

        let mut spots = HashMap::new();
        for winner in submitted.winners {
            self.sink.emit(
                DeliveryRecord::new(auction_id.clone(), DeliveryKind::Submitted).with_winner(
                    winner.agent_id.to_string(),
                    winner.account.clone(),
                    winner.spot_index,
                    winner.price_micros,
                ),
            );
            spots.insert(winner.spot_index, TrackedSpot::new(winner));
        }
        self.table.insert(
            auction_id.clone(),
            TrackedAuction {
                exchange: submitted.exchange,
                win_deadline: submitted.win_deadline,
                spots,
            },
        );

        if let Some(orphan) = self.orphans.remove(&auction_id) {
            debug!(%auction_id, n = orphan.events.len(), "replaying early events");
            for event in orphan.events {
                self.on_event(event, now);
            }
        }
    }

    /// A notification from an adserver connector.
    pub fn on_event(&mut self, event: PostAuctionEvent, now: DateTime<Utc>) {
        if self.table.contains_key(&event.auction_id) {
            self.process_matched(event);
        } else {
            let orphan = self
                .orphans
                .entry(event.auction_id.clone())
                .or_insert_with(|| OrphanEntry {
                    events: Vec::new(),
                    first_seen: now,
                });
            if orphan.events.len() >= ORPHAN_EVENT_CAP {
                RouterMetrics::incr(&self.metrics.invalid_events);
                return;
            }
            orphan.events.push(event);
        }
    }

    fn process_matched(&mut self, event: PostAuctionEvent) {
        let metrics = Arc::clone(&self.metrics);
        let banker = Arc::clone(&self.banker);
        let sink = Arc::clone(&self.sink);
        let registry = Arc::clone(&self.registry);
        let event_window = self.config.event_window;

        let auction_id = event.auction_id.clone();
        let auction = self.table.get_mut(&auction_id).expect("matched above");
        let Some(spot) = auction.spots.get_mut(&event.spot()) else {
            RouterMetrics::incr(&metrics.invalid_events);
            return;
        };

        match event.kind {
            EventKind::Win => {
                if spot.seen_before(EventKind::Win) {
                    RouterMetrics::incr(&metrics.duplicate_events);
                    return;
                }
                spot.mark_seen(EventKind::Win);
                if spot.phase != SpotPhase::PendingWin {
                    RouterMetrics::incr(&metrics.invalid_events);
                    return;
                }
                let paid = spot
                    .winner
                    .win_cost
                    .paid(spot.winner.price_micros, event.price_micros);
                banker.commit_spend(
                    &spot.winner.account,
                    spot.winner.currency,
                    spot.winner.price_micros,
                    paid,
                );
                spot.phase = SpotPhase::Won {
                    settle_deadline: event.timestamp
                        + ChronoDuration::from_std(event_window)
                            .unwrap_or_else(|_| ChronoDuration::seconds(900)),
                };
                sink.emit(
                    DeliveryRecord::new(auction_id.clone(), DeliveryKind::Won).with_winner(
                        spot.winner.agent_id.to_string(),
                        spot.winner.account.clone(),
                        spot.winner.spot_index,
                        paid,
                    ),
                );
                // Replay buffered engagement in kind order: impressions,
                // then clicks.
                let mut buffered = std::mem::take(&mut spot.buffered);
                buffered.sort_by_key(|e| match e.kind {
                    EventKind::Impression => 0,
                    _ => 1,
                });
                for buffered_event in buffered {
                    Self::deliver_engagement(&sink, &auction_id, spot, buffered_event);
                }
            }
            EventKind::Loss => {
                if spot.seen_before(EventKind::Loss) {
                    RouterMetrics::incr(&metrics.duplicate_events);
                    return;
                }
                spot.mark_seen(EventKind::Loss);
                if spot.phase != SpotPhase::PendingWin {
                    RouterMetrics::incr(&metrics.invalid_events);
                    return;
                }
                banker.release(
                    &spot.winner.account,
                    spot.winner.currency,
                    spot.winner.price_micros,
                );
                spot.phase = SpotPhase::Lost;
                sink.emit(
                    DeliveryRecord::new(auction_id.clone(), DeliveryKind::Lost).with_winner(
                        spot.winner.agent_id.to_string(),
                        spot.winner.account.clone(),
                        spot.winner.spot_index,
                        spot.winner.price_micros,
                    ),
                );
            }
            EventKind::Impression | EventKind::Click => {
                if spot.seen_before(event.kind) {
                    RouterMetrics::incr(&metrics.duplicate_events);
                    return;
                }
                spot.mark_seen(event.kind);
                match spot.phase {
                    SpotPhase::PendingWin => spot.buffered.push(event),
                    SpotPhase::Won { .. } => {
                        Self::deliver_engagement(&sink, &auction_id, spot, event)
                    }
                    _ => RouterMetrics::incr(&metrics.invalid_events),
                }
            }
            EventKind::Visit => {
                // Delivered only to agents subscribed to a matching channel.
                let subscribed = registry
                    .get(&spot.winner.agent_id)
                    .map(|entry| entry.config.visit_channels.intersects(&event.channels))
                    .unwrap_or(false);
                if subscribed {
                    sink.emit(
                        DeliveryRecord::new(auction_id.clone(), DeliveryKind::Visit).with_winner(
                            spot.winner.agent_id.to_string(),
                            spot.winner.account.clone(),
                            spot.winner.spot_index,
                            spot.winner.price_micros,
                        ),
                    );
                }
            }
        }
    }

    /// Emit an impression or click, keeping Won < Impression < Click order:
    /// clicks wait for the impression (or the settle deadline).
    fn deliver_engagement(
        sink: &Arc<dyn DeliverySink>,
        auction_id: &AuctionId,
        spot: &mut TrackedSpot,
        event: PostAuctionEvent,
    ) {
        let kind = match event.kind {
            EventKind::Impression => DeliveryKind::Impression,
            EventKind::Click => DeliveryKind::Click,
            _ => return,
        };
        if kind == DeliveryKind::Click && !spot.impression_emitted {
            spot.buffered.push(event);
            return;
        }
        if kind == DeliveryKind::Impression {
            spot.impression_emitted = true;
        }
        sink.emit(
            DeliveryRecord::new(auction_id.clone(), kind).with_winner(
                spot.winner.agent_id.to_string(),
                spot.winner.account.clone(),
                spot.winner.spot_index,
                spot.winner.price_micros,
            ),
        );
        // An impression may unblock a buffered click.
        if kind == DeliveryKind::Impression {
            if let Some(pos) = spot
                .buffered
                .iter()
                .position(|e| e.kind == EventKind::Click)
            {
                let click = spot.buffered.remove(pos);
                Self::deliver_engagement(sink, auction_id, spot, click);
            }
        }
    }

    /// Timeout processing: assumed losses, settlement, orphan expiry.
    pub fn on_tick(&mut self, now: DateTime<Utc>) {
        let metrics = Arc::clone(&self.metrics);
        let banker = Arc::clone(&self.banker);
        let sink = Arc::clone(&self.sink);

        for (auction_id, auction) in self.table.iter_mut() {
            for spot in auction.spots.values_mut() {
                match spot.phase {
                    SpotPhase::PendingWin if now > auction.win_deadline => {
                        debug!(
                            %auction_id,
                            exchange = %auction.exchange,
                            spot = spot.winner.spot_index,
                            "win timeout; assuming loss"
                        );
                        banker.release(
                            &spot.winner.account,
                            spot.winner.currency,
                            spot.winner.price_micros,
                        );
                        spot.phase = SpotPhase::LossAssumed;
                        RouterMetrics::incr(&metrics.loss_assumed);
                        sink.emit(
                            DeliveryRecord::new(auction_id.clone(), DeliveryKind::LossAssumed)
                                .with_winner(
                                    spot.winner.agent_id.to_string(),
                                    spot.winner.account.clone(),
                                    spot.winner.spot_index,
                                    spot.winner.price_micros,
                                ),
                        );
                    }
                    SpotPhase::Won { settle_deadline } if now > settle_deadline => {
                        // The event window is over; flush whatever ordering
                        // was still being held back.
                        let leftover = std::mem::take(&mut spot.buffered);
                        for event in leftover {
                            spot.impression_emitted = true;
                            Self::deliver_engagement(&sink, auction_id, spot, event);
                        }
                        spot.phase = SpotPhase::Settled;
                    }
                    _ => {}
                }
            }
        }

        // Forget auctions whose every spot reached a terminal state.
        self.table
            .retain(|_, auction| !auction.spots.values().all(|s| s.phase.is_terminal()));

        // Expired orphans are emitted as such and dropped.
        let orphan_window =
            ChronoDuration::from_std(self.config.orphan_window).unwrap_or_else(|_| {
                ChronoDuration::seconds(60)
            });
        let expired: Vec<AuctionId> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| now - orphan.first_seen > orphan_window)
            .map(|(id, _)| id.clone())
            .collect();
        for auction_id in expired {
            if let Some(orphan) = self.orphans.remove(&auction_id) {
                for _ in &orphan.events {
                    RouterMetrics::incr(&metrics.orphan_events);
                }
                sink.emit(DeliveryRecord::new(auction_id, DeliveryKind::Orphan));
            }
        }

        sink.flush();
    }
}

enum ShardInput {
    Submitted(SubmittedAuction),
    Event(PostAuctionEvent),
}

/// The sharded loop: one task per shard, fed by auction-id hash.
pub struct PostAuctionLoop {
    inputs: Vec<mpsc::Sender<ShardInput>>,
    handles: Vec<JoinHandle<()>>,
}

impl PostAuctionLoop {
    /// Spawn the shard tasks and a forwarder that drains the engine's
    /// submission channel.
    pub fn spawn(
        config: PostAuctionConfig,
        banker: Arc<SlaveBanker>,
        registry: Arc<AgentRegistry>,
        metrics: Arc<RouterMetrics>,
        sink: Arc<dyn DeliverySink>,
        mut submitted_rx: mpsc::Receiver<SubmittedAuction>,
    ) -> Self {
        let shards = config.shards.max(1);
        let mut inputs = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards);

        for _ in 0..shards {
            let (tx, mut rx) = mpsc::channel::<ShardInput>(1024);
            let mut state = ShardState::new(
                config.clone(),
                Arc::clone(&banker),
                Arc::clone(&registry),
                Arc::clone(&metrics),
                Arc::clone(&sink),
            );
            let tick = config.tick_interval;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        input = rx.recv() => match input {
                            Some(ShardInput::Submitted(s)) => state.on_submitted(s, Utc::now()),
                            Some(ShardInput::Event(e)) => state.on_event(e, Utc::now()),
                            None => break,
                        },
                        _ = interval.tick() => state.on_tick(Utc::now()),
                    }
                }
                state.on_tick(Utc::now());
            }));
            inputs.push(tx);
        }

        // Forward the engine's hand-off channel into the shards.
        let loop_inputs = inputs.clone();
        tokio::spawn(async move {
            while let Some(submitted) = submitted_rx.recv().await {
                let index = (submitted.auction_id.hash64() % loop_inputs.len() as u64) as usize;
                if loop_inputs[index]
                    .send(ShardInput::Submitted(submitted))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        Self { inputs, handles }
    }

    fn shard_for(&self, auction_id: &AuctionId) -> usize {
        (auction_id.hash64() % self.inputs.len() as u64) as usize
    }

    /// Feed one normalized notification in.
    pub async fn event(&self, event: PostAuctionEvent) {
        let index = self.shard_for(&event.auction_id);
        let _ = self.inputs[index].send(ShardInput::Event(event)).await;
    }

    /// Close the inputs and wait for the shards to drain.
    pub async fn shutdown(self) {
        drop(self.inputs);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtb_common::money::{CurrencyCode, Micros};
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::banker::BankerConfig;
    use crate::connectors::WinCostModel;

    fn account() -> rtb_common::ids::AccountKey {
        "campaign".parse().unwrap()
    }

    fn winner(spot: u32, price_units: i64) -> SubmittedWinner {
        SubmittedWinner {
            agent_id: Arc::from("agent-1"),
            account: account(),
            spot_index: spot,
            creative_id: 1,
            price_micros: Micros::from_units(price_units),
            currency: CurrencyCode::Usd,
            win_cost: WinCostModel::None,
        }
    }

    fn submitted(id: &str, winners: Vec<SubmittedWinner>, now: DateTime<Utc>) -> SubmittedAuction {
        SubmittedAuction {
            auction_id: AuctionId::from(id),
            exchange: "adx".to_string(),
            submitted_at: now,
            win_deadline: now + ChronoDuration::seconds(30),
            winners,
        }
    }

    struct Fixture {
        state: ShardState,
        banker: Arc<SlaveBanker>,
        metrics: Arc<RouterMetrics>,
        records: UnboundedReceiver<DeliveryRecord>,
    }

    fn fixture() -> Fixture {
        let banker = Arc::new(SlaveBanker::new(BankerConfig::default()));
        banker.add_account(account(), CurrencyCode::Usd, Micros::from_units(10));
        // Hold the winner's price as the engine would have.
        banker.authorize(&account(), CurrencyCode::Usd, Micros::from_units(2));

        let registry = Arc::new(AgentRegistry::default());
        let metrics = Arc::new(RouterMetrics::new());
        let (sink, records) = ChannelSink::new();
        let state = ShardState::new(
            PostAuctionConfig::default(),
            Arc::clone(&banker),
            registry,
            Arc::clone(&metrics),
            Arc::new(sink),
        );
        Fixture {
            state,
            banker,
            metrics,
            records,
        }
    }

    fn drain(records: &mut UnboundedReceiver<DeliveryRecord>) -> Vec<DeliveryKind> {
        let mut kinds = Vec::new();
        while let Ok(record) = records.try_recv() {
            kinds.push(record.kind);
        }
        kinds
    }

    #[test]
    fn test_win_commits_budget_once() {
        let mut f = fixture();
        let now = Utc::now();
        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);

        let win = PostAuctionEvent::new("a-1", EventKind::Win);
        f.state.on_event(win.clone(), now);
        f.state.on_event(win, now);

        let pool = f.banker.pool(&account(), CurrencyCode::Usd).unwrap();
        assert_eq!(pool.spent, Micros::from_units(2));
        assert_eq!(pool.held, Micros::ZERO);
        // authorized − committed = 8.
        assert_eq!(pool.available, Micros::from_units(8));
        assert_eq!(f.metrics.snapshot().duplicate_events, 1);

        let kinds = drain(&mut f.records);
        assert_eq!(kinds, vec![DeliveryKind::Submitted, DeliveryKind::Won]);
    }

    #[test]
    fn test_win_cost_model_settles_event_price() {
        let mut f = fixture();
        let now = Utc::now();
        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);

        let win = PostAuctionEvent::new("a-1", EventKind::Win).with_price(Micros(1_500_000));
        f.state.on_event(win, now);

        let pool = f.banker.pool(&account(), CurrencyCode::Usd).unwrap();
        assert_eq!(pool.spent, Micros(1_500_000));
        assert_eq!(pool.available, Micros(8_500_000));
    }

    #[test]
    fn test_explicit_loss_releases_budget() {
        let mut f = fixture();
        let now = Utc::now();
        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);
        f.state.on_event(PostAuctionEvent::new("a-1", EventKind::Loss), now);

        let pool = f.banker.pool(&account(), CurrencyCode::Usd).unwrap();
        assert_eq!(pool.held, Micros::ZERO);
        assert_eq!(pool.available, Micros::from_units(10));

        let kinds = drain(&mut f.records);
        assert_eq!(kinds, vec![DeliveryKind::Submitted, DeliveryKind::Lost]);
    }

    #[test]
    fn test_win_timeout_assumes_loss() {
        let mut f = fixture();
        let now = Utc::now();
        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);

        f.state.on_tick(now + ChronoDuration::seconds(31));

        let pool = f.banker.pool(&account(), CurrencyCode::Usd).unwrap();
        assert_eq!(pool.held, Micros::ZERO);
        assert_eq!(pool.available, Micros::from_units(10));
        assert_eq!(f.metrics.snapshot().loss_assumed, 1);
        assert_eq!(f.state.tracked(), 0);

        let kinds = drain(&mut f.records);
        assert_eq!(kinds, vec![DeliveryKind::Submitted, DeliveryKind::LossAssumed]);
    }

    #[test]
    fn test_engagement_order_enforced() {
        let mut f = fixture();
        let now = Utc::now();
        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);

        // Click and impression both arrive before the win.
        f.state.on_event(PostAuctionEvent::new("a-1", EventKind::Click), now);
        f.state
            .on_event(PostAuctionEvent::new("a-1", EventKind::Impression), now);
        f.state.on_event(PostAuctionEvent::new("a-1", EventKind::Win), now);

        let kinds = drain(&mut f.records);
        assert_eq!(
            kinds,
            vec![
                DeliveryKind::Submitted,
                DeliveryKind::Won,
                DeliveryKind::Impression,
                DeliveryKind::Click,
            ]
        );
    }

    #[test]
    fn test_click_waits_for_impression_after_win() {
        let mut f = fixture();
        let now = Utc::now();
        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);
        f.state.on_event(PostAuctionEvent::new("a-1", EventKind::Win), now);
        f.state.on_event(PostAuctionEvent::new("a-1", EventKind::Click), now);

        let kinds = drain(&mut f.records);
        assert_eq!(kinds, vec![DeliveryKind::Submitted, DeliveryKind::Won]);

        f.state
            .on_event(PostAuctionEvent::new("a-1", EventKind::Impression), now);
        let kinds = drain(&mut f.records);
        assert_eq!(kinds, vec![DeliveryKind::Impression, DeliveryKind::Click]);
    }

    #[test]
    fn test_duplicate_impression_dropped() {
        let mut f = fixture();
        let now = Utc::now();
        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);
        f.state.on_event(PostAuctionEvent::new("a-1", EventKind::Win), now);
        f.state
            .on_event(PostAuctionEvent::new("a-1", EventKind::Impression), now);
        f.state
            .on_event(PostAuctionEvent::new("a-1", EventKind::Impression), now);

        assert_eq!(f.metrics.snapshot().duplicate_events, 1);
        let kinds = drain(&mut f.records);
        assert_eq!(
            kinds,
            vec![
                DeliveryKind::Submitted,
                DeliveryKind::Won,
                DeliveryKind::Impression,
            ]
        );
    }

    #[test]
    fn test_early_events_replay_on_submission() {
        let mut f = fixture();
        let now = Utc::now();

        // Win arrives before the submission.
        f.state.on_event(PostAuctionEvent::new("a-1", EventKind::Win), now);
        assert_eq!(f.state.orphaned(), 1);

        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);
        assert_eq!(f.state.orphaned(), 0);

        let kinds = drain(&mut f.records);
        assert_eq!(kinds, vec![DeliveryKind::Submitted, DeliveryKind::Won]);
    }

    #[test]
    fn test_orphans_expire_to_orphan_records() {
        let mut f = fixture();
        let now = Utc::now();
        f.state
            .on_event(PostAuctionEvent::new("nobody", EventKind::Win), now);

        f.state.on_tick(now + ChronoDuration::seconds(61));
        assert_eq!(f.state.orphaned(), 0);
        assert_eq!(f.metrics.snapshot().orphan_events, 1);

        let kinds = drain(&mut f.records);
        assert_eq!(kinds, vec![DeliveryKind::Orphan]);
    }

    #[test]
    fn test_win_after_assumed_loss_is_invalid() {
        let mut f = fixture();
        let now = Utc::now();
        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);
        f.state.on_tick(now + ChronoDuration::seconds(31));

        // Too late: budget went back already; nothing moves again.
        f.state
            .on_event(PostAuctionEvent::new("a-1", EventKind::Win), now);
        let pool = f.banker.pool(&account(), CurrencyCode::Usd).unwrap();
        assert_eq!(pool.spent, Micros::ZERO);
    }

    #[test]
    fn test_unknown_spot_is_invalid() {
        let mut f = fixture();
        let now = Utc::now();
        f.state.on_submitted(submitted("a-1", vec![winner(0, 2)], now), now);
        f.state.on_event(
            PostAuctionEvent::new("a-1", EventKind::Win).with_spot(7),
            now,
        );
        assert_eq!(f.metrics.snapshot().invalid_events, 1);
    }

    #[tokio::test]
    async fn test_sharded_loop_end_to_end() {
        let banker = Arc::new(SlaveBanker::new(BankerConfig::default()));
        banker.add_account(account(), CurrencyCode::Usd, Micros::from_units(10));
        banker.authorize(&account(), CurrencyCode::Usd, Micros::from_units(2));

        let registry = Arc::new(AgentRegistry::default());
        let metrics = Arc::new(RouterMetrics::new());
        let (sink, mut records) = ChannelSink::new();
        let (submitted_tx, submitted_rx) = mpsc::channel(16);

        let pal = PostAuctionLoop::spawn(
            PostAuctionConfig {
                shards: 2,
                tick_interval: Duration::from_millis(20),
                ..PostAuctionConfig::default()
            },
            banker,
            registry,
            metrics,
            Arc::new(sink),
            submitted_rx,
        );

        let now = Utc::now();
        submitted_tx
            .send(submitted("a-1", vec![winner(0, 2)], now))
            .await
            .unwrap();
        pal.event(PostAuctionEvent::new("a-1", EventKind::Win)).await;

        let first = records.recv().await.unwrap();
        assert_eq!(first.kind, DeliveryKind::Submitted);
        let second = records.recv().await.unwrap();
        assert_eq!(second.kind, DeliveryKind::Won);

        pal.shutdown().await;
    }
}
