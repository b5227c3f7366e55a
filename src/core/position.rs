// Hedge-mode position accounting for a single symbol

use serde::{Deserialize, Serialize};

use crate::core::types::{FillEvent, PositionSide, PositionSnapshot, Side, QTY_EPSILON};

/// Position and PnL view owned by one controller.
///
/// Long and short books are kept independently. A reduce larger than the
/// held quantity flips the excess into the opposite book, so
/// `long_qty - short_qty` always equals net bought minus net sold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolState {
    pub symbol: String,
    pub long_qty: f64,
    pub short_qty: f64,
    pub long_avg_price: f64,
    pub short_avg_price: f64,
    pub realized_pnl: f64, // net of fees
    pub unrealized_pnl: f64,
    pub fees_paid: f64,
    pub mark_price: f64,
    pub is_paused: bool,
    pub is_trading: bool,
}

/// What a single fill did to the books
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FillOutcome {
    pub opened: f64,
    pub closed: f64,
    pub gross_pnl: f64,
    pub fee: f64,
}

impl FillOutcome {
    pub fn net_pnl(&self) -> f64 {
        self.gross_pnl - self.fee
    }
}

impl SymbolState {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            ..Default::default()
        }
    }

    pub fn net_position(&self) -> f64 {
        self.long_qty - self.short_qty
    }

    pub fn total_position(&self) -> f64 {
        self.long_qty + self.short_qty
    }

    pub fn qty(&self, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => self.long_qty,
            PositionSide::Short => self.short_qty,
        }
    }

    pub fn avg_price(&self, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => self.long_avg_price,
            PositionSide::Short => self.short_avg_price,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.long_qty <= QTY_EPSILON && self.short_qty <= QTY_EPSILON
    }

    pub fn apply_fill(&mut self, fill: &FillEvent) -> FillOutcome {
        let mut outcome = FillOutcome {
            fee: fill.fee,
            ..Default::default()
        };

        let book = fill.position_side;
        if fill.side == book.open_side() {
            self.open(book, fill.price, fill.quantity);
            outcome.opened = fill.quantity;
        } else {
            let held = self.qty(book);
            let closed = fill.quantity.min(held);
            outcome.gross_pnl = self.close(book, fill.price, closed);
            outcome.closed = closed;

            let excess = fill.quantity - closed;
            if excess > QTY_EPSILON {
                // Reduce overshoot lands in the other book
                let other = match book {
                    PositionSide::Long => PositionSide::Short,
                    PositionSide::Short => PositionSide::Long,
                };
                self.open(other, fill.price, excess);
                outcome.opened = excess;
            }
        }

        self.realized_pnl += outcome.gross_pnl - outcome.fee;
        self.fees_paid += outcome.fee;
        if self.mark_price > 0.0 {
            self.mark(self.mark_price);
        }
        outcome
    }

    fn open(&mut self, book: PositionSide, price: f64, qty: f64) {
        let (held, avg) = match book {
            PositionSide::Long => (&mut self.long_qty, &mut self.long_avg_price),
            PositionSide::Short => (&mut self.short_qty, &mut self.short_avg_price),
        };
        let total = *held + qty;
        if total > QTY_EPSILON {
            *avg = (*avg * *held + price * qty) / total;
        }
        *held = total;
    }

    fn close(&mut self, book: PositionSide, price: f64, qty: f64) -> f64 {
        if qty <= 0.0 {
            return 0.0;
        }
        let (held, avg, direction) = match book {
            PositionSide::Long => (&mut self.long_qty, &mut self.long_avg_price, 1.0),
            PositionSide::Short => (&mut self.short_qty, &mut self.short_avg_price, -1.0),
        };
        let pnl = (price - *avg) * qty * direction;
        *held -= qty;
        if *held <= QTY_EPSILON {
            *held = 0.0;
            *avg = 0.0;
        }
        pnl
    }

    /// Mark open inventory to `price`
    pub fn mark(&mut self, price: f64) {
        self.mark_price = price;
        self.unrealized_pnl = self.long_qty * (price - self.long_avg_price)
            + self.short_qty * (self.short_avg_price - price);
    }

    /// Initial margin locked by open inventory
    pub fn margin_used(&self, leverage: f64) -> f64 {
        if leverage <= 0.0 {
            return 0.0;
        }
        (self.long_qty * self.long_avg_price + self.short_qty * self.short_avg_price) / leverage
    }

    /// Replace local quantities with the exchange's view. Realized PnL is kept.
    pub fn replace_position(&mut self, snapshot: &PositionSnapshot) {
        self.long_qty = snapshot.long_qty;
        self.long_avg_price = if snapshot.long_qty > QTY_EPSILON { snapshot.long_avg_price } else { 0.0 };
        self.short_qty = snapshot.short_qty;
        self.short_avg_price = if snapshot.short_qty > QTY_EPSILON { snapshot.short_avg_price } else { 0.0 };
        if self.mark_price > 0.0 {
            self.mark(self.mark_price);
        } else {
            self.unrealized_pnl = snapshot.unrealized_pnl;
        }
    }

    /// Clear inventory and session PnL
    pub fn reset(&mut self) {
        *self = Self {
            symbol: std::mem::take(&mut self.symbol),
            mark_price: self.mark_price,
            ..Default::default()
        };
    }

    pub fn to_snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            symbol: self.symbol.clone(),
            long_qty: self.long_qty,
            long_avg_price: self.long_avg_price,
            short_qty: self.short_qty,
            short_avg_price: self.short_avg_price,
            unrealized_pnl: self.unrealized_pnl,
        }
    }
}

/// Signed quantity a fill adds to `long - short`
pub fn signed_quantity(side: Side, qty: f64) -> f64 {
    side.sign() * qty
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fill(side: Side, position_side: PositionSide, price: f64, qty: f64) -> FillEvent {
        FillEvent {
            fill_id: format!("{:?}-{}-{}", side, price, qty),
            client_id: "c".into(),
            symbol: "XRPUSDC".into(),
            side,
            position_side,
            price,
            quantity: qty,
            fee: 0.0,
            is_final: true,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_long_round_trip_realizes_profit() {
        let mut state = SymbolState::new("XRPUSDC");
        state.apply_fill(&fill(Side::Buy, PositionSide::Long, 1.0, 30.0));
        assert_eq!(state.long_qty, 30.0);
        assert_eq!(state.long_avg_price, 1.0);

        let outcome = state.apply_fill(&fill(Side::Sell, PositionSide::Long, 1.004, 30.0));
        assert!((outcome.gross_pnl - 0.12).abs() < 1e-9);
        assert_eq!(state.long_qty, 0.0);
        assert_eq!(state.long_avg_price, 0.0);
        assert!((state.realized_pnl - 0.12).abs() < 1e-9);
    }

    #[test]
    fn test_short_round_trip_realizes_profit() {
        let mut state = SymbolState::new("XRPUSDC");
        state.apply_fill(&fill(Side::Sell, PositionSide::Short, 2.0, 10.0));
        let outcome = state.apply_fill(&fill(Side::Buy, PositionSide::Short, 1.9, 10.0));
        assert!((outcome.gross_pnl - 1.0).abs() < 1e-9);
        assert!(state.is_flat());
    }

    #[test]
    fn test_average_price_is_weighted() {
        let mut state = SymbolState::new("XRPUSDC");
        state.apply_fill(&fill(Side::Buy, PositionSide::Long, 1.0, 10.0));
        state.apply_fill(&fill(Side::Buy, PositionSide::Long, 2.0, 30.0));
        assert!((state.long_avg_price - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_reduce_overshoot_flips_into_other_book() {
        let mut state = SymbolState::new("XRPUSDC");
        state.apply_fill(&fill(Side::Buy, PositionSide::Long, 1.0, 5.0));
        state.apply_fill(&fill(Side::Sell, PositionSide::Long, 1.1, 8.0));
        assert_eq!(state.long_qty, 0.0);
        assert!((state.short_qty - 3.0).abs() < 1e-12);
        assert!((state.net_position() - (-3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_fees_reduce_realized_pnl() {
        let mut state = SymbolState::new("XRPUSDC");
        let mut f = fill(Side::Buy, PositionSide::Long, 1.0, 10.0);
        f.fee = 0.004;
        state.apply_fill(&f);
        assert!((state.realized_pnl + 0.004).abs() < 1e-12);
        assert!((state.fees_paid - 0.004).abs() < 1e-12);
    }

    #[test]
    fn test_mark_and_margin() {
        let mut state = SymbolState::new("XRPUSDC");
        state.apply_fill(&fill(Side::Buy, PositionSide::Long, 1.0, 20.0));
        state.apply_fill(&fill(Side::Sell, PositionSide::Short, 1.0, 10.0));
        state.mark(1.1);
        assert!((state.unrealized_pnl - (2.0 - 1.0)).abs() < 1e-9);
        assert!((state.margin_used(10.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_replace_position_keeps_realized() {
        let mut state = SymbolState::new("XRPUSDC");
        state.realized_pnl = 5.0;
        state.replace_position(&PositionSnapshot {
            symbol: "XRPUSDC".into(),
            long_qty: 7.0,
            long_avg_price: 0.5,
            short_qty: 0.0,
            short_avg_price: 0.9,
            unrealized_pnl: 0.1,
        });
        assert_eq!(state.long_qty, 7.0);
        assert_eq!(state.short_avg_price, 0.0);
        assert_eq!(state.realized_pnl, 5.0);
    }
}
