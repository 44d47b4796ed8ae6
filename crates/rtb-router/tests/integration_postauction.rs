//! Full settlement flow: engine hand-off through the sharded post-auction
//! loop, with budget commit/release observable on the banker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use rtb_common::agent_config::{AgentConfig, Creative, IncludeExclude};
use rtb_common::bid_request::{AdSpot, BidRequest, Format};
use rtb_common::events::{DeliveryKind, EventKind, PostAuctionEvent};
use rtb_common::ids::AccountKey;
use rtb_common::money::{Amount, CurrencyCode, Micros};
use rtb_common::protocol::{AgentBid, BidResponse};

use rtb_router::banker::{BankerConfig, SlaveBanker};
use rtb_router::bidder::LocalBidder;
use rtb_router::engine::{AuctionEngine, EngineConfig};
use rtb_router::filter::BlacklistStore;
use rtb_router::metrics::RouterMetrics;
use rtb_router::postauction::{ChannelSink, PostAuctionConfig, PostAuctionLoop};
use rtb_router::registry::AgentRegistry;

fn account() -> AccountKey {
    "campaign".parse().unwrap()
}

struct Stack {
    engine: Arc<AuctionEngine>,
    banker: Arc<SlaveBanker>,
    metrics: Arc<RouterMetrics>,
    postauction: PostAuctionLoop,
    records: mpsc::UnboundedReceiver<rtb_common::events::DeliveryRecord>,
}

async fn stack() -> Stack {
    let metrics = Arc::new(RouterMetrics::new());
    let registry = Arc::new(AgentRegistry::default());
    let banker = Arc::new(SlaveBanker::new(BankerConfig::default()));
    banker.add_account(account(), CurrencyCode::Usd, Micros::from_units(10));
    let bidder = Arc::new(LocalBidder::new());

    registry
        .publish(
            "agent-a",
            AgentConfig {
                account: account(),
                exchange_filter: IncludeExclude::including(["exchange-e"]),
                creatives: vec![Creative::sample_box(1)],
                ..AgentConfig::default()
            },
        )
        .unwrap();

    let (submitted_tx, submitted_rx) = mpsc::channel(64);
    let engine = Arc::new(AuctionEngine::new(
        EngineConfig::default(),
        Arc::clone(&registry),
        Arc::new(BlacklistStore::new()),
        Arc::clone(&banker),
        bidder.clone(),
        submitted_tx,
        Arc::clone(&metrics),
    ));

    // Echoing agent at 2 USD.
    let (mut sol_rx, _res_rx) = bidder.register("agent-a");
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(sol) = sol_rx.recv().await {
                let _ = engine.receive_bid(
                    "agent-a",
                    BidResponse::new(
                        sol.auction_id.clone(),
                        vec![AgentBid::new(0, 1, Micros::from_units(2))],
                    ),
                );
            }
        });
    }

    let (sink, records) = ChannelSink::new();
    let postauction = PostAuctionLoop::spawn(
        PostAuctionConfig {
            shards: 2,
            tick_interval: Duration::from_millis(20),
            ..PostAuctionConfig::default()
        },
        Arc::clone(&banker),
        registry,
        Arc::clone(&metrics),
        Arc::new(sink),
        submitted_rx,
    );

    Stack {
        engine,
        banker,
        metrics,
        postauction,
        records,
    }
}

fn request(id: &str) -> BidRequest {
    BidRequest::new(
        id,
        "exchange-e",
        vec![AdSpot::new(
            "0",
            Format::new(300, 250),
            Amount::new(Micros::from_units(1), CurrencyCode::Usd),
        )],
    )
}

#[tokio::test]
async fn test_win_notification_settles_budget() {
    let mut s = stack().await;

    let outcome = s.engine.run_auction(request("pa-1")).await.unwrap();
    assert_eq!(outcome.winners.len(), 1);

    // Submitted record appears once the loop picks the hand-off up.
    let submitted = s.records.recv().await.unwrap();
    assert_eq!(submitted.kind, DeliveryKind::Submitted);

    // Exchange reports the win.
    s.postauction
        .event(PostAuctionEvent::new("pa-1", EventKind::Win))
        .await;
    let won = s.records.recv().await.unwrap();
    assert_eq!(won.kind, DeliveryKind::Won);
    assert_eq!(won.price_micros, Some(Micros::from_units(2)));

    let pool = s.banker.pool(&account(), CurrencyCode::Usd).unwrap();
    assert_eq!(pool.spent, Micros::from_units(2));
    assert_eq!(pool.held, Micros::ZERO);
    assert_eq!(pool.available, Micros::from_units(8));

    s.postauction.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_win_commits_once() {
    let mut s = stack().await;

    s.engine.run_auction(request("pa-2")).await.unwrap();
    let _submitted = s.records.recv().await.unwrap();

    for _ in 0..2 {
        s.postauction
            .event(PostAuctionEvent::new("pa-2", EventKind::Win))
            .await;
    }
    let won = s.records.recv().await.unwrap();
    assert_eq!(won.kind, DeliveryKind::Won);

    // Give the duplicate a moment to be processed, then check it changed
    // nothing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let pool = s.banker.pool(&account(), CurrencyCode::Usd).unwrap();
    assert_eq!(pool.spent, Micros::from_units(2));
    assert_eq!(s.metrics.snapshot().duplicate_events, 1);
    assert!(s.records.try_recv().is_err());

    s.postauction.shutdown().await;
}

#[tokio::test]
async fn test_full_engagement_sequence() {
    let mut s = stack().await;

    s.engine.run_auction(request("pa-3")).await.unwrap();

    s.postauction
        .event(PostAuctionEvent::new("pa-3", EventKind::Win))
        .await;
    s.postauction
        .event(PostAuctionEvent::new("pa-3", EventKind::Impression))
        .await;
    s.postauction
        .event(PostAuctionEvent::new("pa-3", EventKind::Click))
        .await;

    let mut kinds = Vec::new();
    for _ in 0..4 {
        kinds.push(s.records.recv().await.unwrap().kind);
    }
    assert_eq!(
        kinds,
        vec![
            DeliveryKind::Submitted,
            DeliveryKind::Won,
            DeliveryKind::Impression,
            DeliveryKind::Click,
        ]
    );

    s.postauction.shutdown().await;
}

#[tokio::test]
async fn test_loss_notification_releases_hold() {
    let mut s = stack().await;

    s.engine.run_auction(request("pa-4")).await.unwrap();
    let _submitted = s.records.recv().await.unwrap();

    s.postauction
        .event(PostAuctionEvent::new("pa-4", EventKind::Loss))
        .await;
    let lost = s.records.recv().await.unwrap();
    assert_eq!(lost.kind, DeliveryKind::Lost);

    let pool = s.banker.pool(&account(), CurrencyCode::Usd).unwrap();
    assert_eq!(pool.held, Micros::ZERO);
    assert_eq!(pool.spent, Micros::ZERO);
    assert_eq!(pool.available, Micros::from_units(10));

    s.postauction.shutdown().await;
}
