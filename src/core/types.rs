// Common types shared by controllers, gateways, the accountant and the backtester

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Quantities below this are treated as flat
pub const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// Which book of a hedge-mode account an order touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens this book
    pub fn open_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Order side that reduces this book
    pub fn close_side(self) -> Side {
        self.open_side().opposite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LevelKind {
    LongEntry,
    ShortEntry,
    TakeProfit,
}

impl LevelKind {
    pub fn is_entry(self) -> bool {
        !matches!(self, LevelKind::TakeProfit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelStatus {
    Pending,  // submitted, not yet acknowledged
    Working,  // resting on the book
    Filled,
    Canceled,
}

impl LevelStatus {
    pub fn is_active(self) -> bool {
        matches!(self, LevelStatus::Pending | LevelStatus::Working)
    }
}

pub type LevelId = u64;

/// One rung of the ladder, or a take-profit hanging off a filled rung
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub id: LevelId,
    pub kind: LevelKind,
    pub position_side: PositionSide,
    pub price: f64,
    pub quantity: f64,
    pub filled_qty: f64,
    pub order_id: String,
    pub status: LevelStatus,
    pub parent: Option<LevelId>,
    pub generation: u32,
}

impl GridLevel {
    pub fn order_side(&self) -> Side {
        match self.kind {
            LevelKind::TakeProfit => self.position_side.close_side(),
            _ => self.position_side.open_side(),
        }
    }

    pub fn remaining(&self) -> f64 {
        (self.quantity - self.filled_qty).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// An order as created by a controller. `client_id` doubles as the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub price: Option<f64>,
    pub quantity: f64,
    pub reduce_only: bool,
    pub status: OrderStatus,
}

impl Order {
    pub fn limit(client_id: String, symbol: &str, side: Side, position_side: PositionSide, price: f64, quantity: f64) -> Self {
        Self {
            client_id,
            symbol: symbol.to_string(),
            side,
            position_side,
            order_type: OrderType::Limit,
            price: Some(price),
            quantity,
            reduce_only: side == position_side.close_side(),
            status: OrderStatus::New,
        }
    }

    pub fn market_close(client_id: String, symbol: &str, position_side: PositionSide, quantity: f64) -> Self {
        Self {
            client_id,
            symbol: symbol.to_string(),
            side: position_side.close_side(),
            position_side,
            order_type: OrderType::Market,
            price: None,
            quantity,
            reduce_only: true,
            status: OrderStatus::New,
        }
    }
}

/// Returned by the gateway once an order is accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub client_id: String,
    pub exchange_id: String,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickUpdate {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: f64, // traded since the previous tick, 0 when unknown
    pub funding_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl TickUpdate {
    /// Tick with a zero-width spread, as synthesized from bars
    pub fn at_price(symbol: &str, price: f64, volume: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            bid: price,
            ask: price,
            last: price,
            volume,
            funding_rate: None,
            timestamp,
        }
    }

    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.last
        }
    }
}

/// One OHLCV bar of historical data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite() && *p > 0.0)
            && self.volume.is_finite()
            && self.volume >= 0.0
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub fill_id: String,
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub is_final: bool, // order has no remaining quantity
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
}

/// Balances for one settlement asset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub wallet_balance: f64,
    pub unrealized_pnl: f64,
    pub equity: f64,
    pub available_balance: f64,
    pub margin_used: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub assets: BTreeMap<String, AssetBalance>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl AccountSnapshot {
    pub fn equity(&self) -> f64 {
        self.assets.values().map(|a| a.equity).sum()
    }

    pub fn available_balance(&self) -> f64 {
        self.assets.values().map(|a| a.available_balance).sum()
    }

    pub fn margin_used(&self) -> f64 {
        self.assets.values().map(|a| a.margin_used).sum()
    }

    pub fn margin_ratio(&self) -> f64 {
        let equity = self.equity();
        if equity > 0.0 {
            self.margin_used() / equity
        } else if self.margin_used() > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }
}

/// Exchange view of one symbol's hedge-mode position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub long_qty: f64,
    pub long_avg_price: f64,
    pub short_qty: f64,
    pub short_avg_price: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub symbol: String,
    pub client_id: String,
    pub exchange_id: String,
}

/// Authoritative state replayed after (re)connecting so no fill is silently lost
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileSnapshot {
    pub account: AccountSnapshot,
    pub positions: Vec<PositionSnapshot>,
    pub open_orders: Vec<OpenOrder>,
}

impl ReconcileSnapshot {
    pub fn position(&self, symbol: &str) -> Option<&PositionSnapshot> {
        self.positions.iter().find(|p| p.symbol == symbol)
    }

    pub fn has_open_order(&self, client_id: &str) -> bool {
        self.open_orders.iter().any(|o| o.client_id == client_id)
    }
}

/// Everything the streaming side of a gateway can emit
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Tick(TickUpdate),
    Fill(FillEvent),
    /// Exchange-side cancel or expiry of a resting order
    OrderClosed { symbol: String, client_id: String },
    Connection(ConnectionStatus),
    Reconciled(ReconcileSnapshot),
}

impl GatewayEvent {
    pub fn symbol(&self) -> Option<&str> {
        match self {
            GatewayEvent::Tick(t) => Some(&t.symbol),
            GatewayEvent::Fill(f) => Some(&f.symbol),
            GatewayEvent::OrderClosed { symbol, .. } => Some(symbol),
            GatewayEvent::Connection(_) | GatewayEvent::Reconciled(_) => None,
        }
    }
}
