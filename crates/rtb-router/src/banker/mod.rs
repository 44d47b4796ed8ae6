//! The budget shard (slave banker).
//!
//! Holds per-(account, currency) pools authorized by a remote master and
//! answers synchronous, in-memory "can I spend X?" questions on the commit
//! path. A background loop periodically reports spend and pulls fresh
//! authorization; when the master goes quiet for too long the shard drops
//! into slow mode and caps grants per one-second window until the master
//! comes back and stays back.
//!
//! Invariant, per pool: `held + spent ≤ authorized` at all times.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use rtb_common::ids::AccountKey;
use rtb_common::money::{CurrencyCode, Micros, MoneyRate};

/// Errors on the master-banker boundary.
#[derive(Debug, Error)]
pub enum BankerError {
    #[error("budget master unreachable: {0}")]
    MasterUnreachable(String),

    #[error("budget master rejected request: {0}")]
    Rejected(String),
}

/// Outcome of a synchronous authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// Funds held; caller must later release or commit.
    Granted,
    /// The pool cannot cover the amount.
    Insufficient,
    /// Slow mode's per-second window is exhausted.
    SlowModeCapped,
}

/// Client contract for the remote master banker.
///
/// Only this contract is consumed here; the master service itself is an
/// external collaborator.
#[async_trait]
pub trait MasterBankerClient: Send + Sync {
    /// Ask for up to `requested` more micros for the account. Returns the
    /// micros actually granted.
    async fn reauthorize(
        &self,
        account: &AccountKey,
        currency: CurrencyCode,
        requested: Micros,
    ) -> Result<Micros, BankerError>;

    /// Report spend committed since the previous report.
    async fn report_spend(
        &self,
        account: &AccountKey,
        currency: CurrencyCode,
        spent: Micros,
    ) -> Result<(), BankerError>;
}

/// Master client that grants every request.
///
/// For standalone deployments and tests that do not run a real master; the
/// local pools still enforce their own invariants.
pub struct UnlimitedMaster;

#[async_trait]
impl MasterBankerClient for UnlimitedMaster {
    async fn reauthorize(
        &self,
        _account: &AccountKey,
        _currency: CurrencyCode,
        requested: Micros,
    ) -> Result<Micros, BankerError> {
        Ok(requested)
    }

    async fn report_spend(
        &self,
        _account: &AccountKey,
        _currency: CurrencyCode,
        _spent: Micros,
    ) -> Result<(), BankerError> {
        Ok(())
    }
}

/// Banker tuning.
#[derive(Debug, Clone)]
pub struct BankerConfig {
    /// Float target per account: how much local authorization to maintain.
    pub spend_rate: MoneyRate,
    /// Master silence before slow mode engages.
    pub slow_mode_timeout: Duration,
    /// Stability required after reconnection before slow mode exits.
    pub slow_mode_tolerance: Duration,
    /// Per-second grant cap while in slow mode.
    pub slow_mode_money_limit: MoneyRate,
    /// Cadence of the report/reauthorize loop.
    pub reauthorize_interval: Duration,
}

impl Default for BankerConfig {
    fn default() -> Self {
        Self {
            spend_rate: "100000USD/1M".parse().expect("static rate"),
            slow_mode_timeout: Duration::from_secs(5),
            slow_mode_tolerance: Duration::from_secs(10),
            slow_mode_money_limit: "100000USD/1M".parse().expect("static rate"),
            reauthorize_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PoolState {
    /// Cumulative micros authorized by the master.
    authorized: Micros,
    /// Currently held for in-flight winners.
    held: Micros,
    /// Cumulative committed spend.
    spent: Micros,
    /// Portion of `spent` already reported upstream.
    reported: Micros,
}

impl PoolState {
    fn available(&self) -> Micros {
        self.authorized - self.spent - self.held
    }
}

/// Point-in-time pool figures for health output and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub authorized: Micros,
    pub held: Micros,
    pub spent: Micros,
    pub available: Micros,
}

#[derive(Debug, Default)]
struct SlowWindow {
    /// Unix second the window covers.
    second: i64,
    granted: Micros,
}

/// The slave banker.
pub struct SlaveBanker {
    config: BankerConfig,
    pools: Mutex<HashMap<(AccountKey, CurrencyCode), PoolState>>,
    slow_mode: AtomicBool,
    /// Last successful master exchange, millis since epoch.
    last_sync_ms: AtomicI64,
    /// First successful exchange since slow mode engaged; zero when none.
    stable_since_ms: AtomicI64,
    slow_window: Mutex<SlowWindow>,
}

impl SlaveBanker {
    pub fn new(config: BankerConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
            slow_mode: AtomicBool::new(false),
            last_sync_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            stable_since_ms: AtomicI64::new(0),
            slow_window: Mutex::new(SlowWindow::default()),
        }
    }

    /// Register a spend account, optionally seeding it with already
    /// authorized budget (tests and warm restarts).
    pub fn add_account(&self, account: AccountKey, currency: CurrencyCode, seed: Micros) {
        let mut pools = self.pools.lock();
        let pool = pools.entry((account, currency)).or_default();
        pool.authorized += seed;
    }

    /// Hot-path check; a single atomic load.
    #[inline(always)]
    pub fn in_slow_mode(&self) -> bool {
        self.slow_mode.load(Ordering::Acquire)
    }

    /// Synchronous, non-blocking authorization. On grant the amount is held
    /// until `release` or `commit_spend`.
    pub fn authorize(
        &self,
        account: &AccountKey,
        currency: CurrencyCode,
        amount: Micros,
    ) -> Authorization {
        if amount.is_negative() || amount.is_zero() {
            return Authorization::Insufficient;
        }

        if self.in_slow_mode() {
            let limit = self.config.slow_mode_money_limit.amount.value;
            let now_second = Utc::now().timestamp();
            let mut window = self.slow_window.lock();
            if window.second != now_second {
                window.second = now_second;
                window.granted = Micros::ZERO;
            }
            if window.granted + amount > limit {
                return Authorization::SlowModeCapped;
            }
            // Reserve the window slice before the pool check; released
            // below if the pool refuses.
            window.granted += amount;
            drop(window);

            let granted = self.try_hold(account, currency, amount);
            if !granted {
                let mut window = self.slow_window.lock();
                if window.second == now_second {
                    window.granted -= amount;
                }
                return Authorization::Insufficient;
            }
            return Authorization::Granted;
        }

        if self.try_hold(account, currency, amount) {
            Authorization::Granted
        } else {
            Authorization::Insufficient
        }
    }

    fn try_hold(&self, account: &AccountKey, currency: CurrencyCode, amount: Micros) -> bool {
        let mut pools = self.pools.lock();
        let Some(pool) = pools.get_mut(&(account.clone(), currency)) else {
            return false;
        };
        if pool.available() < amount {
            return false;
        }
        pool.held += amount;
        true
    }

    /// Return held funds to the pool (loss, timeout).
    pub fn release(&self, account: &AccountKey, currency: CurrencyCode, amount: Micros) {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get_mut(&(account.clone(), currency)) {
            if pool.held < amount {
                warn!(%account, "release exceeds held amount; clamping");
                pool.held = Micros::ZERO;
            } else {
                pool.held -= amount;
            }
        }
    }

    /// Convert a hold into committed spend. `paid` may be below `held_amount`
    /// when the win cost model settles under the bid; the difference returns
    /// to the pool.
    pub fn commit_spend(
        &self,
        account: &AccountKey,
        currency: CurrencyCode,
        held_amount: Micros,
        paid: Micros,
    ) {
        let mut pools = self.pools.lock();
        let Some(pool) = pools.get_mut(&(account.clone(), currency)) else {
            warn!(%account, "commit against unknown pool");
            return;
        };
        let release = held_amount.min(pool.held);
        pool.held -= release;
        pool.spent += paid;
    }

    pub fn pool(&self, account: &AccountKey, currency: CurrencyCode) -> Option<PoolSnapshot> {
        let pools = self.pools.lock();
        pools.get(&(account.clone(), currency)).map(|p| PoolSnapshot {
            authorized: p.authorized,
            held: p.held,
            spent: p.spent,
            available: p.available(),
        })
    }

    /// Age of the last successful master exchange.
    pub fn master_sync_age(&self) -> Duration {
        let last = self.last_sync_ms.load(Ordering::Acquire);
        let elapsed = (Utc::now().timestamp_millis() - last).max(0);
        Duration::from_millis(elapsed as u64)
    }

    fn note_master_success(&self) {
        let now = Utc::now().timestamp_millis();
        self.last_sync_ms.store(now, Ordering::Release);
        if !self.in_slow_mode() {
            return;
        }
        let stable_since = self.stable_since_ms.load(Ordering::Acquire);
        if stable_since == 0 {
            self.stable_since_ms.store(now, Ordering::Release);
            return;
        }
        if now - stable_since >= self.config.slow_mode_tolerance.as_millis() as i64 {
            self.slow_mode.store(false, Ordering::Release);
            self.stable_since_ms.store(0, Ordering::Release);
            info!("exiting slow mode: master stable again");
        }
    }

    fn note_master_failure(&self) {
        self.stable_since_ms.store(0, Ordering::Release);
        let last = self.last_sync_ms.load(Ordering::Acquire);
        let silent_ms = Utc::now().timestamp_millis() - last;
        if silent_ms >= self.config.slow_mode_timeout.as_millis() as i64
            && !self.slow_mode.swap(true, Ordering::AcqRel)
        {
            warn!(silent_ms, "entering slow mode: master unreachable");
        }
    }

    /// One report/reauthorize pass over every account.
    ///
    /// Split out of [`run`] so tests can drive the loop without timers.
    pub async fn sync_once(&self, master: &dyn MasterBankerClient) {
        let accounts: Vec<(AccountKey, CurrencyCode)> =
            self.pools.lock().keys().cloned().collect();

        let mut all_ok = true;
        for (account, currency) in accounts {
            // Report spend since the last successful report.
            let unreported = {
                let pools = self.pools.lock();
                let pool = pools
                    .get(&(account.clone(), currency))
                    .copied()
                    .unwrap_or_default();
                pool.spent - pool.reported
            };
            if !unreported.is_zero() {
                match master.report_spend(&account, currency, unreported).await {
                    Ok(()) => {
                        let mut pools = self.pools.lock();
                        if let Some(pool) = pools.get_mut(&(account.clone(), currency)) {
                            pool.reported += unreported;
                        }
                    }
                    Err(err) => {
                        debug!(%account, %err, "spend report failed");
                        all_ok = false;
                        continue;
                    }
                }
            }

            // Top the float back up toward the configured target. The pull
            // happens every pass even with no shortfall; it doubles as the
            // master liveness probe.
            let target = self.config.spend_rate.amount.value;
            let shortfall = {
                let pools = self.pools.lock();
                let pool = pools
                    .get(&(account.clone(), currency))
                    .copied()
                    .unwrap_or_default();
                let shortfall = target.saturating_sub(pool.available());
                if shortfall.is_negative() {
                    Micros::ZERO
                } else {
                    shortfall
                }
            };
            match master.reauthorize(&account, currency, shortfall).await {
                Ok(granted) => {
                    let mut pools = self.pools.lock();
                    if let Some(pool) = pools.get_mut(&(account.clone(), currency)) {
                        pool.authorized += granted;
                    }
                }
                Err(err) => {
                    debug!(%account, %err, "reauthorization failed");
                    all_ok = false;
                }
            }
        }

        if all_ok {
            self.note_master_success();
        } else {
            self.note_master_failure();
        }
    }

    /// Background loop: report and reauthorize on a fixed cadence until
    /// shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        master: Arc<dyn MasterBankerClient>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.config.reauthorize_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sync_once(master.as_ref()).await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("banker loop shutting down");
                        return;
                    }
                }
            }
        }
    }
}
