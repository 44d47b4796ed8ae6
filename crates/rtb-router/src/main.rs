//! rtb-router: the real-time bidding router.
//!
//! Usage:
//!   rtb-router [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Config file path (default: config/router.toml)
//!   --log-level <LEVEL>       trace | debug | info | warn | error
//!   --delivery-log <FILE>     Append-only NDJSON delivery log path
//!   --shards <N>              Override the shard count

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use rtb_common::events::{EventDictionary, EventKind};
use rtb_common::money::CurrencyCode;

use rtb_router::banker::{SlaveBanker, UnlimitedMaster};
use rtb_router::bidder::LocalBidder;
use rtb_router::config::RouterConfig;
use rtb_router::connectors::{self, LoopbackAdServerHandle, LoopbackHandle};
use rtb_router::engine::AuctionEngine;
use rtb_router::filter::BlacklistStore;
use rtb_router::metrics::RouterMetrics;
use rtb_router::postauction::{DeliverySink, FileSink, NullSink, PostAuctionLoop};
use rtb_router::registry::{AgentRegistry, RegistryEvent};
use rtb_router::RouterHealth;

/// CLI arguments for rtb-router.
#[derive(Parser, Debug)]
#[command(name = "rtb-router")]
#[command(about = "Real-time bidding router")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/router.toml")]
    config: PathBuf,

    /// Logging level (overrides config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Delivery log path (overrides config file)
    #[arg(long)]
    delivery_log: Option<PathBuf>,

    /// Shard count (overrides config file)
    #[arg(long)]
    shards: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present).
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        RouterConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        eprintln!(
            "Config file not found at {:?}, using defaults",
            args.config
        );
        RouterConfig::default()
    };
    config.apply_env_overrides();
    if let Some(level) = args.log_level {
        config.log_level = Some(level);
    }
    if let Some(path) = args.delivery_log {
        config.delivery_log = Some(path);
    }
    if let Some(shards) = args.shards {
        config.instance.shards = shards;
    }

    let log_level = match config.log_level.as_deref().unwrap_or("info") {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    config.validate().context("configuration invalid")?;
    info!(shards = config.instance.shards, "starting rtb-router");

    // Core state.
    let metrics = Arc::new(RouterMetrics::new());
    let registry = Arc::new(AgentRegistry::new(config.breaker));
    let blacklist = Arc::new(BlacklistStore::new());
    let banker = Arc::new(SlaveBanker::new(config.banker_config()));
    let bidder = Arc::new(LocalBidder::new());

    // Delivery sink.
    let sink: Arc<dyn DeliverySink> = match &config.delivery_log {
        Some(path) => Arc::new(FileSink::create(path)?),
        None => {
            warn!("no delivery_log configured; post-auction records are discarded");
            Arc::new(NullSink)
        }
    };

    // Event dictionary: defaults plus configured vocabulary.
    let mut dictionary = EventDictionary::default();
    for (name, kind) in &config.event_names {
        let kind: EventKind = serde_json::from_value(serde_json::Value::String(kind.clone()))
            .with_context(|| format!("unknown event kind {kind:?} for {name:?}"))?;
        dictionary.define(name, kind);
    }

    // Connectors from the static registration table.
    let loopback_exchanges: Arc<parking_lot::Mutex<Vec<LoopbackHandle>>> = Arc::default();
    let loopback_adservers: Arc<parking_lot::Mutex<Vec<LoopbackAdServerHandle>>> = Arc::default();
    let connector_registry = connectors::builtin_registry(
        Arc::clone(&loopback_exchanges),
        Arc::clone(&loopback_adservers),
    )
    .context("connector registration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ingress_tx, mut ingress_rx) = mpsc::channel(1024);
    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let (submitted_tx, submitted_rx) = mpsc::channel(1024);

    // Per-exchange win cost models, gathered before the connectors run.
    let mut engine_config = config.engine_config();
    let mut exchange_tasks = Vec::new();
    for entry in &config.exchanges {
        let connector = connector_registry
            .build_exchange(&entry.type_name, &entry.config)
            .with_context(|| format!("building exchange connector {:?}", entry.type_name))?;
        info!(exchange = connector.name(), "exchange connector up");
        engine_config
            .win_cost_models
            .insert(connector.name().to_string(), connector.win_cost_model());
        exchange_tasks.push(tokio::spawn(connector.run(
            ingress_tx.clone(),
            shutdown_rx.clone(),
        )));
    }
    for entry in &config.adservers {
        let source = connector_registry
            .build_adserver(&entry.type_name, &entry.config, &dictionary)
            .with_context(|| format!("building adserver connector {:?}", entry.type_name))?;
        info!(adserver = source.name(), "adserver connector up");
        tokio::spawn(source.run(events_tx.clone(), shutdown_rx.clone()));
    }
    drop(ingress_tx);
    drop(events_tx);

    let engine = Arc::new(AuctionEngine::new(
        engine_config,
        Arc::clone(&registry),
        Arc::clone(&blacklist),
        Arc::clone(&banker),
        bidder.clone(),
        submitted_tx,
        Arc::clone(&metrics),
    ));

    let postauction = PostAuctionLoop::spawn(
        config.postauction_config(),
        Arc::clone(&banker),
        Arc::clone(&registry),
        Arc::clone(&metrics),
        sink,
        submitted_rx,
    );

    // New agents get a spend account; the banker loop funds it.
    {
        let banker = Arc::clone(&banker);
        let registry_events = registry.subscribe();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let mut events = registry_events;
            while let Ok(event) = events.recv().await {
                if let RegistryEvent::Published { agent_id, .. } = event {
                    if let Some(entry) = registry.get(&agent_id) {
                        banker.add_account(
                            entry.config.account.clone(),
                            CurrencyCode::Usd,
                            rtb_common::money::Micros::ZERO,
                        );
                    }
                }
            }
        });
    }

    // Budget reconciliation loop.
    tokio::spawn(
        Arc::clone(&banker).run(Arc::new(UnlimitedMaster), shutdown_rx.clone()),
    );

    // Request pump: every admitted request gets exactly one outcome.
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(request) = ingress_rx.recv().await {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let id = request.id.clone();
                    match engine.run_auction(request).await {
                        Ok(outcome) if outcome.is_no_bid() => {
                            debug!(auction = %id, "no bid");
                        }
                        Ok(outcome) => {
                            debug!(auction = %id, winners = outcome.winners.len(), "auction won");
                        }
                        Err(err) => debug!(auction = %id, %err, "request refused"),
                    }
                });
            }
        });
    }

    // Event pump into the post-auction loop.
    let postauction = Arc::new(postauction);
    {
        let postauction = Arc::clone(&postauction);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                postauction.event(event).await;
            }
        });
    }

    // Periodic health line and blacklist maintenance.
    {
        let engine = Arc::clone(&engine);
        let banker = Arc::clone(&banker);
        let registry = Arc::clone(&registry);
        let blacklist = Arc::clone(&blacklist);
        let metrics = Arc::clone(&metrics);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        blacklist.purge_expired(chrono::Utc::now());
                        let health = RouterHealth::gather(&engine, &banker, &registry);
                        info!(
                            in_flight = health.in_flight,
                            slow_mode = health.slow_mode,
                            agents = health.registered_agents,
                            auctions = metrics.snapshot().auctions_started,
                            "router health"
                        );
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    wait_for_shutdown().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in exchange_tasks {
        if let Ok(Err(err)) = task.await {
            error!(%err, "exchange connector failed");
        }
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let args = Args::try_parse_from(["rtb-router"]).unwrap();
        assert_eq!(args.config.to_str().unwrap(), "config/router.toml");
        assert!(args.log_level.is_none());
        assert!(args.shards.is_none());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "rtb-router",
            "-c",
            "/etc/router.toml",
            "--log-level",
            "debug",
            "--delivery-log",
            "/var/log/delivery.ndjson",
            "--shards",
            "16",
        ])
        .unwrap();
        assert_eq!(args.config.to_str().unwrap(), "/etc/router.toml");
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.shards, Some(16));
    }
}
