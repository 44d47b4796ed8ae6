//! Single-process router demo over the loopback connectors.
//!
//! Wires a registry with one agent, an in-process bidding agent that bids a
//! flat 2 USD, and the full engine + post-auction stack; then pushes one
//! request and one win notification through and prints the delivery log.
//!
//! Run with: cargo run --example loopback_demo

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use rtb_common::agent_config::{AgentConfig, Creative, IncludeExclude};
use rtb_common::bid_request::{AdSpot, BidRequest, Format};
use rtb_common::events::{EventKind, PostAuctionEvent};
use rtb_common::money::{Amount, CurrencyCode, Micros};
use rtb_common::protocol::{AgentBid, BidResponse};

use rtb_router::banker::{BankerConfig, SlaveBanker, UnlimitedMaster};
use rtb_router::bidder::LocalBidder;
use rtb_router::connectors::{LoopbackAdServer, LoopbackExchange, WinCostModel};
use rtb_router::engine::{AuctionEngine, EngineConfig};
use rtb_router::filter::BlacklistStore;
use rtb_router::metrics::RouterMetrics;
use rtb_router::postauction::{ChannelSink, PostAuctionConfig, PostAuctionLoop};
use rtb_router::registry::AgentRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let account: rtb_common::ids::AccountKey = "demo-campaign".parse()?;

    let metrics = Arc::new(RouterMetrics::new());
    let registry = Arc::new(AgentRegistry::default());
    let banker = Arc::new(SlaveBanker::new(BankerConfig::default()));
    banker.add_account(account.clone(), CurrencyCode::Usd, Micros::from_units(10));
    let bidder = Arc::new(LocalBidder::new());

    registry.publish(
        "demo-agent",
        AgentConfig {
            account: account.clone(),
            exchange_filter: IncludeExclude::including(["demo-exchange"]),
            creatives: vec![Creative::sample_box(1)],
            ..AgentConfig::default()
        },
    )?;

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

    // The in-process agent: bid 2 USD on everything it is offered.
    let (mut sol_rx, _res_rx) = bidder.register("demo-agent");
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(sol) = sol_rx.recv().await {
                let bids = sol
                    .spots
                    .iter()
                    .map(|s| AgentBid::new(s.spot_index, s.creative_ids[0], Micros::from_units(2)))
                    .collect();
                let _ = engine.receive_bid("demo-agent", BidResponse::new(sol.auction_id.clone(), bids));
            }
        });
    }

    // Post-auction loop with an observable sink.
    let (sink, mut records) = ChannelSink::new();
    let postauction = Arc::new(PostAuctionLoop::spawn(
        PostAuctionConfig::default(),
        Arc::clone(&banker),
        Arc::clone(&registry),
        Arc::clone(&metrics),
        Arc::new(sink),
        submitted_rx,
    ));

    // Banker reconciliation against a grant-everything master.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(Arc::clone(&banker).run(Arc::new(UnlimitedMaster), shutdown_rx.clone()));

    // Loopback transports, as the router binary would wire them.
    let (exchange, connector) = LoopbackExchange::pair("demo-exchange", WinCostModel::None);
    let (ingress_tx, mut ingress_rx) = mpsc::channel(64);
    tokio::spawn(connector.run(ingress_tx, shutdown_rx.clone()));
    let (adserver, source) = LoopbackAdServer::pair("demo-adserver");
    let (events_tx, mut events_rx) = mpsc::channel(64);
    tokio::spawn(source.run(events_tx, shutdown_rx.clone()));
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(request) = ingress_rx.recv().await {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    if let Ok(outcome) = engine.run_auction(request).await {
                        println!(
                            "auction {} resolved with {} winner(s)",
                            outcome.auction_id,
                            outcome.winners.len()
                        );
                    }
                });
            }
        });
    }
    {
        let postauction = Arc::clone(&postauction);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                postauction.event(event).await;
            }
        });
    }

    // One request through the front door.
    exchange
        .submit(BidRequest::new(
            "demo-auction-1",
            "demo-exchange",
            vec![AdSpot::new(
                "0",
                Format::new(300, 250),
                Amount::new(Micros::from_units(1), CurrencyCode::Usd),
            )],
        ))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The exchange reports the win.
    adserver
        .submit(PostAuctionEvent::new("demo-auction-1", EventKind::Win))
        .await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("-- delivery log --");
    while let Ok(record) = records.try_recv() {
        println!("{}", serde_json::to_string(&record)?);
    }

    let pool = banker.pool(&account, CurrencyCode::Usd).expect("pool exists");
    println!(
        "pool: authorized={} spent={} available={}",
        pool.authorized, pool.spent, pool.available
    );
    Ok(())
}
