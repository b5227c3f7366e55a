// Crossing detection shared by live paper trading and bar replay
//
// A resting buy fills once price trades at or below its limit, a resting sell
// once price trades at or above it. Price moves are processed as segments
// from the previous price to the next one; orders crossed by the same segment
// fill in order of distance from the segment start, then submission order.
// The segment start is the last traded price, which the ladder is anchored
// near, so for rungs on one side this is proximity to the anchor.

use serde::{Deserialize, Serialize};

use crate::core::types::{Bar, PositionSide, Side};

/// Limit order waiting to be crossed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestingOrder {
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub price: f64,
    pub quantity: f64,
    /// Submission order, assigned by the book
    pub seq: u64,
}

impl RestingOrder {
    fn is_crossed(&self, low: f64, high: f64) -> bool {
        match self.side {
            Side::Buy => low <= self.price,
            Side::Sell => high >= self.price,
        }
    }

    fn is_marketable(&self, price: f64) -> bool {
        match self.side {
            Side::Buy => price <= self.price,
            Side::Sell => price >= self.price,
        }
    }
}

/// An order crossed by a price segment
#[derive(Debug, Clone, PartialEq)]
pub struct CrossingFill {
    pub order: RestingOrder,
    pub price: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CrossingBook {
    orders: Vec<RestingOrder>,
    next_seq: u64,
    last_price: Option<f64>,
}

impl CrossingBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn orders(&self) -> &[RestingOrder] {
        &self.orders
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.orders.iter().any(|o| o.client_id == client_id)
    }

    /// Add an order. The book assigns its submission sequence.
    pub fn insert(&mut self, mut order: RestingOrder) {
        order.seq = self.next_seq;
        self.next_seq += 1;
        self.orders.push(order);
    }

    pub fn remove(&mut self, client_id: &str) -> Option<RestingOrder> {
        let idx = self.orders.iter().position(|o| o.client_id == client_id)?;
        Some(self.orders.remove(idx))
    }

    /// Fill every order crossed while price moves from `from` to `to`.
    /// Marketable orders fill at `from`, the rest at their limit.
    pub fn sweep(&mut self, from: f64, to: f64) -> Vec<CrossingFill> {
        let (low, high) = if from <= to { (from, to) } else { (to, from) };

        let mut crossed: Vec<(f64, u64, usize)> = self
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_crossed(low, high))
            .map(|(i, o)| {
                // nearest the previous price first, i.e. the inner rungs
                let distance = if o.is_marketable(from) { 0.0 } else { (o.price - from).abs() };
                (distance, o.seq, i)
            })
            .collect();

        if crossed.is_empty() {
            self.last_price = Some(to);
            return Vec::new();
        }

        crossed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let fills: Vec<CrossingFill> = crossed
            .iter()
            .map(|&(_, _, i)| {
                let order = self.orders[i].clone();
                let price = if order.is_marketable(from) { from } else { order.price };
                CrossingFill { order, price }
            })
            .collect();

        let mut indexes: Vec<usize> = crossed.iter().map(|c| c.2).collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        for i in indexes {
            self.orders.remove(i);
        }

        self.last_price = Some(to);
        fills
    }

    /// Process one observed price
    pub fn on_tick(&mut self, price: f64) -> Vec<CrossingFill> {
        let from = self.last_price.unwrap_or(price);
        self.sweep(from, price)
    }

    /// Process several observed prices in order
    pub fn on_path(&mut self, path: &[f64]) -> Vec<CrossingFill> {
        path.iter().flat_map(|&p| self.on_tick(p)).collect()
    }
}

/// Intrabar price path used for replay: open, first extreme, second extreme, close.
///
/// When both sides of the book are crossed by the bar, the side whose nearest
/// crossed order is closer to the open is visited first. With nothing crossed
/// the nearer extreme comes first, low on ties.
pub fn bar_path(bar: &Bar, book: &CrossingBook) -> Vec<f64> {
    let nearest = |side: Side| -> Option<f64> {
        book.orders
            .iter()
            .filter(|o| o.side == side && o.is_crossed(bar.low, bar.high))
            .map(|o| if o.is_marketable(bar.open) { 0.0 } else { (o.price - bar.open).abs() })
            .min_by(|a, b| a.total_cmp(b))
    };

    let low_first = match (nearest(Side::Buy), nearest(Side::Sell)) {
        (Some(buy), Some(sell)) => buy <= sell,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => (bar.open - bar.low) <= (bar.high - bar.open),
    };

    let points = if low_first {
        [bar.open, bar.low, bar.high, bar.close]
    } else {
        [bar.open, bar.high, bar.low, bar.close]
    };

    let mut path: Vec<f64> = Vec::with_capacity(4);
    for p in points {
        if path.last() != Some(&p) {
            path.push(p);
        }
    }
    path
}
