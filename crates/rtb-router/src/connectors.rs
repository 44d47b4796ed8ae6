//! Exchange and adserver connector seams.
//!
//! Wire codecs live outside the core. A connector normalizes its upstream
//! into [`BidRequest`]s or [`PostAuctionEvent`]s and pushes them into the
//! router's channels. Connectors are compiled in and registered in a static
//! table at startup from the configured list; there is no dynamic loading.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};

use rtb_common::bid_request::BidRequest;
use rtb_common::events::{EventDictionary, PostAuctionEvent};
use rtb_common::money::Micros;

/// How the price actually paid on a win is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum WinCostModel {
    /// Pay what the win notification reports; fall back to the bid price
    /// when the notification carries none.
    #[default]
    None,
    /// Pay a fixed fraction of the bid price, in permille.
    Majority { permille: u32 },
}

impl WinCostModel {
    /// Clearing price for a win.
    pub fn paid(&self, bid: Micros, event_price: Option<Micros>) -> Micros {
        match self {
            WinCostModel::None => event_price.unwrap_or(bid),
            WinCostModel::Majority { permille } => Micros(bid.0 * *permille as i64 / 1000),
        }
    }
}

/// A source of normalized bid requests.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn name(&self) -> &str;

    fn win_cost_model(&self) -> WinCostModel {
        WinCostModel::None
    }

    /// Pump requests into `ingress` until shutdown flips to true.
    async fn run(
        self: Box<Self>,
        ingress: mpsc::Sender<BidRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}

/// A source of normalized win/loss/impression/click events.
#[async_trait]
pub trait AdServerSource: Send + Sync {
    fn name(&self) -> &str;

    /// Pump events into `events` until shutdown flips to true.
    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<PostAuctionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}

type ExchangeFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn ExchangeConnector>> + Send + Sync>;
type AdServerFactory = Box<
    dyn Fn(&serde_json::Value, &EventDictionary) -> Result<Box<dyn AdServerSource>> + Send + Sync,
>;

/// The static registration table.
///
/// Built once at startup; duplicate registration of a connector type is a
/// programming error and is treated as fatal by the caller.
#[derive(Default)]
pub struct ConnectorRegistry {
    exchanges: HashMap<String, ExchangeFactory>,
    adservers: HashMap<String, AdServerFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_exchange<F>(&mut self, type_name: &str, factory: F) -> Result<()>
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn ExchangeConnector>> + Send + Sync + 'static,
    {
        if self
            .exchanges
            .insert(type_name.to_string(), Box::new(factory))
            .is_some()
        {
            bail!("duplicate exchange connector registration: {type_name}");
        }
        Ok(())
    }

    /// Adserver factories also receive the configured event dictionary so
    /// exchange-specific event vocabulary is absorbed at the edge.
    pub fn register_adserver<F>(&mut self, type_name: &str, factory: F) -> Result<()>
    where
        F: Fn(&serde_json::Value, &EventDictionary) -> Result<Box<dyn AdServerSource>>
            + Send
            + Sync
            + 'static,
    {
        if self
            .adservers
            .insert(type_name.to_string(), Box::new(factory))
            .is_some()
        {
            bail!("duplicate adserver connector registration: {type_name}");
        }
        Ok(())
    }

    pub fn build_exchange(
        &self,
        type_name: &str,
        config: &serde_json::Value,
    ) -> Result<Box<dyn ExchangeConnector>> {
        let factory = self
            .exchanges
            .get(type_name)
            .ok_or_else(|| anyhow!("unknown exchange connector type: {type_name}"))?;
        factory(config)
    }

    pub fn build_adserver(
        &self,
        type_name: &str,
        config: &serde_json::Value,
        dictionary: &EventDictionary,
    ) -> Result<Box<dyn AdServerSource>> {
        let factory = self
            .adservers
            .get(type_name)
            .ok_or_else(|| anyhow!("unknown adserver connector type: {type_name}"))?;
        factory(config, dictionary)
    }

    pub fn exchange_types(&self) -> Vec<&str> {
        self.exchanges.keys().map(String::as_str).collect()
    }
}

/// Push handle for a [`LoopbackExchange`].
#[derive(Clone)]
pub struct LoopbackHandle {
    tx: mpsc::Sender<BidRequest>,
}

impl LoopbackHandle {
    /// Inject a request as if it had arrived from the wire.
    pub async fn submit(&self, request: BidRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| anyhow!("loopback exchange is gone"))
    }
}

/// In-process exchange connector for tests, demos, and single-binary runs.
pub struct LoopbackExchange {
    name: String,
    win_cost: WinCostModel,
    rx: Mutex<mpsc::Receiver<BidRequest>>,
}

impl LoopbackExchange {
    pub fn pair(name: &str, win_cost: WinCostModel) -> (LoopbackHandle, Box<dyn ExchangeConnector>) {
        let (tx, rx) = mpsc::channel(1024);
        (
            LoopbackHandle { tx },
            Box::new(Self {
                name: name.to_string(),
                win_cost,
                rx: Mutex::new(rx),
            }),
        )
    }
}

#[async_trait]
impl ExchangeConnector for LoopbackExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn win_cost_model(&self) -> WinCostModel {
        self.win_cost
    }

    async fn run(
        self: Box<Self>,
        ingress: mpsc::Sender<BidRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => {
                        if ingress.send(request).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// In-process adserver source; events are pushed through its handle.
pub struct LoopbackAdServer {
    name: String,
    rx: Mutex<mpsc::Receiver<PostAuctionEvent>>,
}

/// Push handle for a [`LoopbackAdServer`].
#[derive(Clone)]
pub struct LoopbackAdServerHandle {
    tx: mpsc::Sender<PostAuctionEvent>,
}

impl LoopbackAdServerHandle {
    pub async fn submit(&self, event: PostAuctionEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("loopback adserver is gone"))
    }
}

impl LoopbackAdServer {
    pub fn pair(name: &str) -> (LoopbackAdServerHandle, Box<dyn AdServerSource>) {
        let (tx, rx) = mpsc::channel(1024);
        (
            LoopbackAdServerHandle { tx },
            Box::new(Self {
                name: name.to_string(),
                rx: Mutex::new(rx),
            }),
        )
    }
}

#[async_trait]
impl AdServerSource for LoopbackAdServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<PostAuctionEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if events.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Register the connectors this binary compiles in.
pub fn builtin_registry(
    loopback_exchanges: Arc<parking_lot::Mutex<Vec<LoopbackHandle>>>,
    loopback_adservers: Arc<parking_lot::Mutex<Vec<LoopbackAdServerHandle>>>,
) -> Result<ConnectorRegistry> {
    let mut registry = ConnectorRegistry::new();
    registry.register_exchange("loopback", move |config| {
        let name = config
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("loopback");
        let win_cost = config
            .get("win_cost")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();
        let (handle, connector) = LoopbackExchange::pair(name, win_cost);
        loopback_exchanges.lock().push(handle);
        Ok(connector)
    })?;
    registry.register_adserver("loopback", move |config, _dictionary| {
        let name = config
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("loopback");
        let (handle, source) = LoopbackAdServer::pair(name);
        loopback_adservers.lock().push(handle);
        Ok(source)
    })?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win_cost_none_prefers_event_price() {
        let model = WinCostModel::None;
        assert_eq!(
            model.paid(Micros::from_units(2), Some(Micros::from_units(1))),
            Micros::from_units(1)
        );
        assert_eq!(model.paid(Micros::from_units(2), None), Micros::from_units(2));
    }

    #[test]
    fn test_win_cost_majority_fraction() {
        let model = WinCostModel::Majority { permille: 850 };
        assert_eq!(
            model.paid(Micros::from_units(2), Some(Micros::from_units(1))),
            Micros(1_700_000)
        );
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = ConnectorRegistry::new();
        registry
            .register_exchange("mock", |_| bail!("unbuildable"))
            .unwrap();
        assert!(registry.register_exchange("mock", |_| bail!("again")).is_err());
    }

    #[test]
    fn test_unknown_type_fails_to_build() {
        let registry = ConnectorRegistry::new();
        assert!(registry
            .build_exchange("nope", &serde_json::Value::Null)
            .is_err());
    }

    #[tokio::test]
    async fn test_loopback_exchange_forwards() {
        let (handle, connector) = LoopbackExchange::pair("test", WinCostModel::None);
        let (ingress_tx, mut ingress_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(connector.run(ingress_tx, shutdown_rx));

        let request = BidRequest::new("a-1", "loopback", vec![]);
        handle.submit(request.clone()).await.unwrap();
        let received = ingress_rx.recv().await.unwrap();
        assert_eq!(received.id, request.id);
    }

    #[tokio::test]
    async fn test_builtin_registry_builds_loopback() {
        let exchange_handles = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let adserver_handles = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry =
            builtin_registry(Arc::clone(&exchange_handles), Arc::clone(&adserver_handles))
                .unwrap();
        let connector = registry
            .build_exchange("loopback", &serde_json::json!({"name": "lb-1"}))
            .unwrap();
        assert_eq!(connector.name(), "lb-1");
        assert_eq!(exchange_handles.lock().len(), 1);

        let source = registry
            .build_adserver(
                "loopback",
                &serde_json::json!({"name": "ads-1"}),
                &EventDictionary::default(),
            )
            .unwrap();
        assert_eq!(source.name(), "ads-1");
        assert_eq!(adserver_handles.lock().len(), 1);
    }
}
