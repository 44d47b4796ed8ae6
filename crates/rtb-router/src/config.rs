//! Router configuration.
//!
//! Loads from a TOML file, then applies environment-variable overrides and
//! CLI overrides, then validates. Money-rate fields use the
//! `"<amount><currency>/<period>"` form, e.g. `"100000USD/1M"`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use rtb_common::money::{Amount, MoneyRate};

use crate::banker::BankerConfig;
use crate::breaker::BreakerConfig;
use crate::engine::EngineConfig;
use crate::postauction::PostAuctionConfig;

/// One configured connector: a compiled-in type name plus its blob.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorEntry {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Per-instance router parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Window for assumed losses, orphan retention, and the post-win event
    /// window.
    pub loss_seconds: u64,
    /// Master silence before slow mode.
    pub slow_mode_timeout_secs: u64,
    /// Required stability before slow mode exits.
    pub slow_mode_tolerance_secs: u64,
    /// Grant cap per second while in slow mode.
    pub slow_mode_money_limit: MoneyRate,
    /// Hard ceiling on any single bid.
    pub max_bid_price: Amount,
    /// Float target per account.
    pub spend_rate: MoneyRate,
    /// Default auction deadline.
    pub auction_timeout_ms: u64,
    /// Expected-win deadline after submission.
    pub win_timeout_secs: u64,
    /// Shard count for the engine and the post-auction loop.
    pub shards: usize,
    /// Cadence of banker reconciliation.
    pub reauthorize_interval_ms: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            loss_seconds: 15,
            slow_mode_timeout_secs: 5,
            slow_mode_tolerance_secs: 10,
            slow_mode_money_limit: "100000USD/1M".parse().expect("static rate"),
            max_bid_price: "200USD".parse().expect("static amount"),
            spend_rate: "100000USD/1M".parse().expect("static rate"),
            auction_timeout_ms: 100,
            win_timeout_secs: 300,
            shards: 8,
            reauthorize_interval_ms: 1000,
        }
    }
}

/// Top-level router configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    /// Logging level: trace, debug, info, warn, error.
    pub log_level: Option<String>,

    /// Path of the append-only delivery log; stdout-less sink when unset.
    pub delivery_log: Option<PathBuf>,

    /// Exchange connectors to instantiate, in order.
    pub exchanges: Vec<ConnectorEntry>,

    /// Adserver sources to instantiate.
    pub adservers: Vec<ConnectorEntry>,

    /// Instance parameters.
    pub instance: InstanceConfig,

    /// Per-agent circuit breaker tuning.
    pub breaker: BreakerConfig,

    /// Extra event-kind vocabulary, name → canonical kind.
    pub event_names: HashMap<String, String>,
}

impl RouterConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: RouterConfig =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Environment overrides for deploy-time knobs.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("RTB_LOG_LEVEL") {
            self.log_level = Some(level);
        }
        if let Ok(path) = std::env::var("RTB_DELIVERY_LOG") {
            self.delivery_log = Some(PathBuf::from(path));
        }
        if let Ok(price) = std::env::var("RTB_MAX_BID_PRICE") {
            match price.parse() {
                Ok(amount) => self.instance.max_bid_price = amount,
                Err(err) => tracing::warn!(%err, "ignoring bad RTB_MAX_BID_PRICE"),
            }
        }
    }

    /// Reject configurations that cannot run safely.
    pub fn validate(&self) -> Result<()> {
        let instance = &self.instance;
        if instance.shards == 0 {
            bail!("shards must be positive");
        }
        if instance.max_bid_price.currency != instance.slow_mode_money_limit.amount.currency {
            bail!(
                "max_bid_price currency {} differs from slow_mode_money_limit currency {}",
                instance.max_bid_price.currency,
                instance.slow_mode_money_limit.amount.currency
            );
        }
        if instance.max_bid_price.value > instance.slow_mode_money_limit.amount.value {
            bail!(
                "max_bid_price {} exceeds slow_mode_money_limit {}",
                instance.max_bid_price,
                instance.slow_mode_money_limit
            );
        }
        if instance.win_timeout_secs * 1000 < instance.auction_timeout_ms {
            bail!(
                "win_timeout ({}s) must cover the auction timeout ({}ms)",
                instance.win_timeout_secs,
                instance.auction_timeout_ms
            );
        }
        if instance.auction_timeout_ms == 0 {
            bail!("auction_timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            auction_timeout: Duration::from_millis(self.instance.auction_timeout_ms),
            grace: Duration::from_millis(self.instance.auction_timeout_ms * 2),
            max_bid_price: self.instance.max_bid_price.value,
            win_timeout: Duration::from_secs(self.instance.win_timeout_secs),
            shards: self.instance.shards,
            win_cost_models: HashMap::new(),
        }
    }

    pub fn banker_config(&self) -> BankerConfig {
        BankerConfig {
            spend_rate: self.instance.spend_rate,
            slow_mode_timeout: Duration::from_secs(self.instance.slow_mode_timeout_secs),
            slow_mode_tolerance: Duration::from_secs(self.instance.slow_mode_tolerance_secs),
            slow_mode_money_limit: self.instance.slow_mode_money_limit,
            reauthorize_interval: Duration::from_millis(self.instance.reauthorize_interval_ms),
        }
    }

    pub fn postauction_config(&self) -> PostAuctionConfig {
        PostAuctionConfig {
            shards: self.instance.shards,
            event_window: Duration::from_secs(self.instance.loss_seconds),
            orphan_window: Duration::from_secs(self.instance.loss_seconds),
            tick_interval: Duration::from_millis(500),
        }
    }
}
