// Simulated exchange
//
// `SimExchange` is the deterministic matching core used by backtests: resting
// limits sit in a `CrossingBook`, market orders fill at the last price, and a
// hedge-mode wallet tracks margin and PnL. `SimulatedGateway` wraps it behind
// the async `ExecutionGateway` interface for paper trading.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::position::SymbolState;
use crate::core::types::{
    AccountSnapshot, AssetBalance, Bar, ConnectionStatus, FillEvent, GatewayEvent, OpenOrder, Order,
    OrderHandle, OrderType, PositionSnapshot, TickUpdate,
};
use crate::gateway::crossing::{bar_path, CrossingBook, CrossingFill, RestingOrder};
use crate::gateway::{event_stream, ExecutionGateway, GatewayError};

const DEFAULT_LEVERAGE: f64 = 1.0;

#[derive(Debug, Clone)]
struct SimOrderRecord {
    handle: OrderHandle,
    reduce_only: bool,
    leverage: f64,
    price: f64,
    quantity: f64,
}

pub struct SimExchange {
    settlement_asset: String,
    fee_rate: f64,
    wallet: f64,
    fees_paid: f64,
    leverage: HashMap<String, f64>,
    books: HashMap<String, CrossingBook>,
    records: HashMap<String, SimOrderRecord>,
    positions: BTreeMap<String, SymbolState>,
    last_prices: HashMap<String, f64>,
    queued: VecDeque<FillEvent>,
    fill_seq: u64,
    order_seq: u64,
    clock: DateTime<Utc>,
}

impl SimExchange {
    pub fn new(initial_capital: f64, fee_rate: f64, settlement_asset: &str) -> Self {
        Self {
            settlement_asset: settlement_asset.to_string(),
            fee_rate,
            wallet: initial_capital,
            fees_paid: 0.0,
            leverage: HashMap::new(),
            books: HashMap::new(),
            records: HashMap::new(),
            positions: BTreeMap::new(),
            last_prices: HashMap::new(),
            queued: VecDeque::new(),
            fill_seq: 0,
            order_seq: 0,
            clock: DateTime::<Utc>::default(),
        }
    }

    pub fn set_leverage(&mut self, symbol: &str, leverage: f64) {
        self.leverage.insert(symbol.to_string(), leverage.max(1.0));
    }

    pub fn set_clock(&mut self, now: DateTime<Utc>) {
        self.clock = now;
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).copied()
    }

    pub fn fees_paid(&self) -> f64 {
        self.fees_paid
    }

    fn leverage_for(&self, symbol: &str) -> f64 {
        self.leverage.get(symbol).copied().unwrap_or(DEFAULT_LEVERAGE)
    }

    pub fn equity(&self) -> f64 {
        self.wallet + self.positions.values().map(|p| p.unrealized_pnl).sum::<f64>()
    }

    fn position_margin(&self) -> f64 {
        self.positions
            .iter()
            .map(|(symbol, p)| p.margin_used(self.leverage_for(symbol)))
            .sum()
    }

    fn order_margin(&self) -> f64 {
        self.books
            .values()
            .flat_map(|b| b.orders().iter())
            .filter_map(|o| self.records.get(&o.client_id))
            .filter(|r| !r.reduce_only)
            .map(|r| r.price * r.quantity / r.leverage)
            .sum()
    }

    pub fn available_balance(&self) -> f64 {
        self.equity() - self.position_margin() - self.order_margin()
    }

    /// Accept an order. Resubmitting a known client id returns the original handle.
    pub fn submit(&mut self, order: &Order) -> Result<OrderHandle, GatewayError> {
        if let Some(record) = self.records.get(&order.client_id) {
            return Ok(record.handle.clone());
        }
        if !(order.quantity > 0.0 && order.quantity.is_finite()) {
            return Err(GatewayError::Rejected(format!("invalid quantity {}", order.quantity)));
        }

        let leverage = self.leverage_for(&order.symbol);
        let price = match order.order_type {
            OrderType::Limit => match order.price {
                Some(p) if p > 0.0 && p.is_finite() => p,
                other => return Err(GatewayError::InvalidPrice(format!("limit price {:?}", other))),
            },
            OrderType::Market => self
                .last_price(&order.symbol)
                .ok_or_else(|| GatewayError::Rejected(format!("no market price for {}", order.symbol)))?,
        };

        if !order.reduce_only {
            let required = price * order.quantity / leverage;
            let available = self.available_balance();
            if required > available {
                return Err(GatewayError::InsufficientBalance(format!(
                    "required {:.4}, available {:.4}",
                    required, available
                )));
            }
        }

        self.order_seq += 1;
        let handle = OrderHandle {
            client_id: order.client_id.clone(),
            exchange_id: format!("sim-{}", self.order_seq),
            symbol: order.symbol.clone(),
        };
        self.records.insert(
            order.client_id.clone(),
            SimOrderRecord {
                handle: handle.clone(),
                reduce_only: order.reduce_only,
                leverage,
                price,
                quantity: order.quantity,
            },
        );

        match order.order_type {
            OrderType::Limit => {
                self.books.entry(order.symbol.clone()).or_default().insert(RestingOrder {
                    client_id: order.client_id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    position_side: order.position_side,
                    price,
                    quantity: order.quantity,
                    seq: 0,
                });
            }
            OrderType::Market => {
                let fill = self.execute(CrossingFill {
                    order: RestingOrder {
                        client_id: order.client_id.clone(),
                        symbol: order.symbol.clone(),
                        side: order.side,
                        position_side: order.position_side,
                        price,
                        quantity: order.quantity,
                        seq: 0,
                    },
                    price,
                });
                self.queued.push_back(fill);
            }
        }
        Ok(handle)
    }

    /// Remove a resting order. Unknown or already filled orders are fine.
    pub fn cancel(&mut self, symbol: &str, client_id: &str) -> bool {
        self.books
            .get_mut(symbol)
            .and_then(|book| book.remove(client_id))
            .is_some()
    }

    /// Move the market to `price` and fill whatever it crosses
    pub fn on_price(&mut self, symbol: &str, price: f64) -> Vec<FillEvent> {
        self.last_prices.insert(symbol.to_string(), price);
        let crossed = self.books.entry(symbol.to_string()).or_default().on_tick(price);
        let fills: Vec<FillEvent> = crossed.into_iter().map(|c| self.execute(c)).collect();
        if let Some(position) = self.positions.get_mut(symbol) {
            position.mark(price);
        }
        fills
    }

    /// Intrabar path for `bar` given the current resting orders
    pub fn path_for(&self, symbol: &str, bar: &Bar) -> Vec<f64> {
        match self.books.get(symbol) {
            Some(book) => bar_path(bar, book),
            None => bar_path(bar, &CrossingBook::new()),
        }
    }

    /// Run a whole bar without giving anyone a chance to react between points
    pub fn replay_bar(&mut self, symbol: &str, bar: &Bar) -> Vec<FillEvent> {
        self.clock = bar.timestamp;
        let path = self.path_for(symbol, bar);
        path.into_iter().flat_map(|p| self.on_price(symbol, p)).collect()
    }

    /// Market-order fills produced at submit time
    pub fn take_queued_fills(&mut self) -> Vec<FillEvent> {
        self.queued.drain(..).collect()
    }

    fn execute(&mut self, crossing: CrossingFill) -> FillEvent {
        self.fill_seq += 1;
        let order = crossing.order;
        let fee = crossing.price * order.quantity * self.fee_rate;
        let fill = FillEvent {
            fill_id: format!("simfill-{}", self.fill_seq),
            client_id: order.client_id,
            symbol: order.symbol.clone(),
            side: order.side,
            position_side: order.position_side,
            price: crossing.price,
            quantity: order.quantity,
            fee,
            is_final: true,
            timestamp: self.clock,
        };

        let position = self
            .positions
            .entry(order.symbol.clone())
            .or_insert_with(|| SymbolState::new(&order.symbol));
        let outcome = position.apply_fill(&fill);
        let mark = self.last_prices.get(&order.symbol).copied().unwrap_or(crossing.price);
        position.mark(mark);

        self.wallet += outcome.gross_pnl - fee;
        self.fees_paid += fee;
        debug!(symbol = %fill.symbol, price = fill.price, qty = fill.quantity, "sim fill");
        fill
    }

    pub fn account_snapshot(&self) -> AccountSnapshot {
        let equity = self.equity();
        let margin_used = self.position_margin() + self.order_margin();
        let mut assets = BTreeMap::new();
        assets.insert(
            self.settlement_asset.clone(),
            AssetBalance {
                asset: self.settlement_asset.clone(),
                wallet_balance: self.wallet,
                unrealized_pnl: equity - self.wallet,
                equity,
                available_balance: equity - margin_used,
                margin_used,
            },
        );
        AccountSnapshot {
            assets,
            timestamp: Some(self.clock),
        }
    }

    pub fn position_snapshots(&self) -> Vec<PositionSnapshot> {
        self.positions.values().map(|p| p.to_snapshot()).collect()
    }

    pub fn position(&self, symbol: &str) -> Option<&SymbolState> {
        self.positions.get(symbol)
    }

    pub fn open_orders(&self) -> Vec<OpenOrder> {
        self.books
            .values()
            .flat_map(|b| b.orders().iter())
            .map(|o| OpenOrder {
                symbol: o.symbol.clone(),
                client_id: o.client_id.clone(),
                exchange_id: self
                    .records
                    .get(&o.client_id)
                    .map(|r| r.handle.exchange_id.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }
}

/// `SimExchange` behind the async gateway interface.
///
/// Prices come from `feed_tick` (paper trading against a live ticker) or from
/// `replay` (bars). The event stream ends once the gateway is dropped.
pub struct SimulatedGateway {
    exchange: Arc<Mutex<SimExchange>>,
    events: broadcast::Sender<GatewayEvent>,
}

impl SimulatedGateway {
    pub fn new(exchange: SimExchange) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            exchange: Arc::new(Mutex::new(exchange)),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimExchange> {
        self.exchange.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: GatewayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Price update for one symbol: emit the tick, then any fills it caused
    pub fn feed_tick(&self, tick: TickUpdate) {
        let fills = {
            let mut exchange = self.lock();
            exchange.set_clock(tick.timestamp);
            exchange.on_price(&tick.symbol, tick.last)
        };
        self.publish(GatewayEvent::Tick(tick));
        for fill in fills {
            self.publish(GatewayEvent::Fill(fill));
        }
    }

    /// Replay bars for `symbol`, one intrabar point every `pace`
    pub fn replay(self: &Arc<Self>, symbol: String, bars: Vec<Bar>, pace: Duration) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            gateway.publish(GatewayEvent::Connection(ConnectionStatus::Connected));
            for bar in bars {
                let path = gateway.lock().path_for(&symbol, &bar);
                for price in path {
                    gateway.feed_tick(TickUpdate::at_price(&symbol, price, bar.volume / 4.0, bar.timestamp));
                    tokio::time::sleep(pace).await;
                }
            }
            gateway.publish(GatewayEvent::Connection(ConnectionStatus::Disconnected {
                reason: "replay finished".to_string(),
            }));
        })
    }

    /// Drive the simulator from another event stream, typically a live public ticker
    pub fn attach_feed(self: &Arc<Self>, mut feed: BoxStream<'static, GatewayEvent>) -> JoinHandle<()> {
        use futures_util::StreamExt;
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = feed.next().await {
                match event {
                    GatewayEvent::Tick(tick) => gateway.feed_tick(tick),
                    GatewayEvent::Connection(status) => gateway.publish(GatewayEvent::Connection(status)),
                    _ => {}
                }
            }
            warn!("📡 Paper feed ended");
        })
    }

    pub fn set_leverage(&self, symbol: &str, leverage: f64) {
        self.lock().set_leverage(symbol, leverage);
    }

    pub fn with_exchange<R>(&self, f: impl FnOnce(&SimExchange) -> R) -> R {
        f(&self.lock())
    }
}

#[async_trait]
impl ExecutionGateway for SimulatedGateway {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn submit(&self, order: &Order) -> Result<OrderHandle, GatewayError> {
        let (handle, fills) = {
            let mut exchange = self.lock();
            let handle = exchange.submit(order)?;
            (handle, exchange.take_queued_fills())
        };
        for fill in fills {
            self.publish(GatewayEvent::Fill(fill));
        }
        Ok(handle)
    }

    async fn cancel(&self, handle: &OrderHandle) -> Result<(), GatewayError> {
        self.lock().cancel(&handle.symbol, &handle.client_id);
        Ok(())
    }

    fn stream(&self) -> BoxStream<'static, GatewayEvent> {
        event_stream(self.events.subscribe(), "simulated")
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
        Ok(self.lock().account_snapshot())
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        Ok(self.lock().position_snapshots())
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        Ok(self.lock().open_orders())
    }

    async fn funding_rate(&self, _symbol: &str) -> Result<Option<f64>, GatewayError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PositionSide, Side};
    use futures_util::StreamExt;

    fn exchange() -> SimExchange {
        let mut ex = SimExchange::new(1000.0, 0.0, "USDT");
        ex.set_leverage("XRPUSDC", 20.0);
        ex
    }

    fn buy(id: &str, price: f64, qty: f64) -> Order {
        Order::limit(id.into(), "XRPUSDC", Side::Buy, PositionSide::Long, price, qty)
    }

    #[test]
    fn test_submit_is_idempotent() {
        let mut ex = exchange();
        let first = ex.submit(&buy("a", 0.5, 10.0)).unwrap();
        let second = ex.submit(&buy("a", 0.5, 10.0)).unwrap();
        assert_eq!(first, second);
        assert_eq!(ex.open_orders().len(), 1);
    }

    #[test]
    fn test_invalid_price_rejected() {
        let mut ex = exchange();
        let err = ex.submit(&buy("a", -1.0, 10.0)).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPrice(_)));
    }

    #[test]
    fn test_margin_check() {
        let mut ex = exchange();
        // 100_000 * 0.5 / 20 = 2500 > 1000
        let err = ex.submit(&buy("big", 0.5, 100_000.0)).unwrap_err();
        assert!(matches!(err, GatewayError::InsufficientBalance(_)));
    }

    #[test]
    fn test_crossing_fills_and_accounts() {
        let mut ex = exchange();
        ex.on_price("XRPUSDC", 0.51);
        ex.submit(&buy("a", 0.5, 100.0)).unwrap();
        assert!(ex.on_price("XRPUSDC", 0.505).is_empty());

        let fills = ex.on_price("XRPUSDC", 0.49);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 0.5);
        assert_eq!(ex.position("XRPUSDC").unwrap().long_qty, 100.0);

        let snapshot = ex.account_snapshot();
        let asset = &snapshot.assets["USDT"];
        assert!((asset.equity - (asset.available_balance + asset.margin_used)).abs() < 1e-9);
        assert!((asset.equity - 999.0).abs() < 1e-9);
    }

    #[test]
    fn test_market_close_fills_at_last_price() {
        let mut ex = exchange();
        ex.on_price("XRPUSDC", 0.5);
        ex.submit(&buy("a", 0.5, 10.0)).unwrap();
        ex.on_price("XRPUSDC", 0.5);
        ex.on_price("XRPUSDC", 0.52);

        ex.submit(&Order::market_close("c".into(), "XRPUSDC", PositionSide::Long, 10.0)).unwrap();
        let fills = ex.take_queued_fills();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, 0.52);
        assert!(ex.position("XRPUSDC").unwrap().is_flat());
        assert!((ex.equity() - 1000.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_gateway_streams_ticks_and_fills() {
        let gateway = SimulatedGateway::new(exchange());
        let mut events = gateway.stream();

        gateway.feed_tick(TickUpdate::at_price("XRPUSDC", 0.51, 0.0, Utc::now()));
        gateway.submit(&buy("g", 0.5, 10.0)).await.unwrap();
        gateway.feed_tick(TickUpdate::at_price("XRPUSDC", 0.49, 0.0, Utc::now()));

        assert!(matches!(events.next().await, Some(GatewayEvent::Tick(_))));
        assert!(matches!(events.next().await, Some(GatewayEvent::Tick(_))));
        match events.next().await {
            Some(GatewayEvent::Fill(fill)) => assert_eq!(fill.client_id, "g"),
            other => panic!("expected fill, got {:?}", other),
        }
    }
}
