//! Slow-mode behavior across the banker and the engine: master loss caps
//! spend per second, and the engine demotes winners beyond the cap.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use rtb_common::agent_config::{AgentConfig, Creative, IncludeExclude};
use rtb_common::bid_request::{AdSpot, BidRequest, Format};
use rtb_common::ids::AccountKey;
use rtb_common::money::{Amount, CurrencyCode, Micros};
use rtb_common::protocol::{AgentBid, BidResponse};

use rtb_router::banker::{BankerConfig, BankerError, MasterBankerClient, SlaveBanker};
use rtb_router::bidder::LocalBidder;
use rtb_router::engine::{AuctionEngine, EngineConfig, LossReason};
use rtb_router::filter::BlacklistStore;
use rtb_router::metrics::RouterMetrics;
use rtb_router::registry::AgentRegistry;

struct DeadMaster;

#[async_trait]
impl MasterBankerClient for DeadMaster {
    async fn reauthorize(
        &self,
        _account: &AccountKey,
        _currency: CurrencyCode,
        _requested: Micros,
    ) -> Result<Micros, BankerError> {
        Err(BankerError::MasterUnreachable("dead".into()))
    }

    async fn report_spend(
        &self,
        _account: &AccountKey,
        _currency: CurrencyCode,
        _spent: Micros,
    ) -> Result<(), BankerError> {
        Err(BankerError::MasterUnreachable("dead".into()))
    }
}

fn account() -> AccountKey {
    "campaign".parse().unwrap()
}

fn slow_banker() -> Arc<SlaveBanker> {
    let banker = Arc::new(SlaveBanker::new(BankerConfig {
        slow_mode_timeout: std::time::Duration::from_millis(0),
        slow_mode_money_limit: "100000USD/1M".parse().unwrap(),
        ..BankerConfig::default()
    }));
    banker.add_account(account(), CurrencyCode::Usd, Micros::from_units(10_000_000));
    banker
}

fn agent(creative_format: Format) -> AgentConfig {
    AgentConfig {
        account: account(),
        exchange_filter: IncludeExclude::including(["exchange-e"]),
        creatives: vec![Creative::new(1, "unit", creative_format)],
        ..AgentConfig::default()
    }
}

#[tokio::test]
async fn test_slow_mode_demotes_second_winner() {
    let banker = slow_banker();
    // Master has been unreachable: one failed sync flips slow mode on.
    banker.sync_once(&DeadMaster).await;
    assert!(banker.in_slow_mode());

    let metrics = Arc::new(RouterMetrics::new());
    let registry = Arc::new(AgentRegistry::default());
    let bidder = Arc::new(LocalBidder::new());
    let (submitted_tx, mut submitted_rx) = mpsc::channel(8);
    let engine = Arc::new(AuctionEngine::new(
        EngineConfig::default(),
        Arc::clone(&registry),
        Arc::new(BlacklistStore::new()),
        Arc::clone(&banker),
        bidder.clone(),
        submitted_tx,
        Arc::clone(&metrics),
    ));

    // Two agents, one per spot format, each bidding 60 000 USD against a
    // 100 000 USD/s slow-mode window.
    registry
        .publish("agent-a", agent(Format::new(300, 250)))
        .unwrap();
    registry
        .publish("agent-b", agent(Format::new(728, 90)))
        .unwrap();
    for (agent_id, spot_index) in [("agent-a", 0u32), ("agent-b", 1u32)] {
        let (mut sol_rx, _res) = bidder.register(agent_id);
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(sol) = sol_rx.recv().await {
                let _ = engine.receive_bid(
                    agent_id,
                    BidResponse::new(
                        sol.auction_id.clone(),
                        vec![AgentBid::new(spot_index, 1, Micros::from_units(60_000))],
                    ),
                );
            }
        });
    }

    let request = BidRequest::new(
        "slow-1",
        "exchange-e",
        vec![
            AdSpot::new(
                "0",
                Format::new(300, 250),
                Amount::new(Micros::from_units(1), CurrencyCode::Usd),
            ),
            AdSpot::new(
                "1",
                Format::new(728, 90),
                Amount::new(Micros::from_units(1), CurrencyCode::Usd),
            ),
        ],
    );

    let outcome = engine.run_auction(request).await.unwrap();

    // First winner granted, second demoted with reason SlowMode.
    assert_eq!(outcome.winners.len(), 1);
    assert_eq!(outcome.winners[0].spot_index, 0);
    let slow_losses: Vec<_> = outcome
        .losers
        .iter()
        .filter(|l| l.reason == LossReason::SlowMode)
        .collect();
    assert_eq!(slow_losses.len(), 1);
    assert_eq!(slow_losses[0].spot_index, 1);
    assert_eq!(metrics.snapshot().slow_mode_demotions, 1);

    // Only the granted winner reaches the post-auction loop.
    let submitted = submitted_rx.recv().await.unwrap();
    assert_eq!(submitted.winners.len(), 1);

    // And only its price is held.
    let pool = banker.pool(&account(), CurrencyCode::Usd).unwrap();
    assert_eq!(pool.held, Micros::from_units(60_000));
}

#[tokio::test]
async fn test_grants_stay_within_window_under_load() {
    let banker = slow_banker();
    banker.sync_once(&DeadMaster).await;
    assert!(banker.in_slow_mode());

    // Many 30k grants against a 100k/s window: at most 3 in one second.
    let mut granted = 0;
    for _ in 0..10 {
        if banker.authorize(&account(), CurrencyCode::Usd, Micros::from_units(30_000))
            == rtb_router::banker::Authorization::Granted
        {
            granted += 1;
        }
    }
    assert_eq!(granted, 3);
}
