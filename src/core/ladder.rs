// Ladder generation around an anchor price

use crate::core::types::{LevelKind, PositionSide};

/// A level the controller intends to place, before it has an order id
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedLevel {
    pub kind: LevelKind,
    pub position_side: PositionSide,
    pub price: f64,
    pub quantity: f64,
    pub step: usize, // 1 = nearest the anchor
}

/// Deterministic ladder shape for one activation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LadderSpec {
    pub anchor: f64,
    pub grid_spacing: f64,
    pub depth: usize,
    pub long_quantity: f64,
    pub short_quantity: f64,
}

impl LadderSpec {
    /// Absolute distance between adjacent rungs
    pub fn step_size(&self) -> f64 {
        self.anchor * self.grid_spacing
    }

    /// Long entries below the anchor, short entries above it, `depth` each.
    /// A side with zero quantity is left out.
    pub fn build(&self) -> Vec<PlannedLevel> {
        let step = self.step_size();
        if !(step > 0.0) || self.depth == 0 {
            return Vec::new();
        }

        let mut levels = Vec::with_capacity(self.depth * 2);
        for k in 1..=self.depth {
            let offset = k as f64 * step;
            if self.long_quantity > 0.0 && self.anchor - offset > 0.0 {
                levels.push(PlannedLevel {
                    kind: LevelKind::LongEntry,
                    position_side: PositionSide::Long,
                    price: self.anchor - offset,
                    quantity: self.long_quantity,
                    step: k,
                });
            }
            if self.short_quantity > 0.0 {
                levels.push(PlannedLevel {
                    kind: LevelKind::ShortEntry,
                    position_side: PositionSide::Short,
                    price: self.anchor + offset,
                    quantity: self.short_quantity,
                    step: k,
                });
            }
        }
        levels
    }
}

/// Take-profit price for a fill on `side` at `fill_price`
pub fn take_profit_price(side: PositionSide, fill_price: f64, take_profit_spacing: f64) -> f64 {
    match side {
        PositionSide::Long => fill_price * (1.0 + take_profit_spacing),
        PositionSide::Short => fill_price * (1.0 - take_profit_spacing),
    }
}

/// Two active levels of the same kind closer than this are duplicates
pub fn uniqueness_tolerance(step_size: f64) -> f64 {
    step_size * 0.5
}

/// Whether an entry at `price` would cross immediately against `mid`
pub fn crosses_mid(side: PositionSide, price: f64, mid: f64) -> bool {
    match side {
        PositionSide::Long => price >= mid,
        PositionSide::Short => price <= mid,
    }
}

/// Round to the exchange tick. `decimals` of `None` leaves the price untouched.
pub fn round_to_places(value: f64, decimals: Option<u32>) -> f64 {
    match decimals {
        Some(places) => {
            let factor = 10f64.powi(places as i32);
            (value * factor).round() / factor
        }
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(depth: usize) -> LadderSpec {
        LadderSpec {
            anchor: 0.5,
            grid_spacing: 0.006,
            depth,
            long_quantity: 30.0,
            short_quantity: 30.0,
        }
    }

    #[test]
    fn test_ladder_is_symmetric() {
        let levels = spec(3).build();
        assert_eq!(levels.len(), 6);

        let longs: Vec<f64> = levels.iter().filter(|l| l.kind == LevelKind::LongEntry).map(|l| l.price).collect();
        let shorts: Vec<f64> = levels.iter().filter(|l| l.kind == LevelKind::ShortEntry).map(|l| l.price).collect();
        assert_eq!(longs.len(), 3);
        assert_eq!(shorts.len(), 3);
        for (l, s) in longs.iter().zip(shorts.iter()) {
            assert!(((0.5 - l) - (s - 0.5)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_adjacent_levels_spaced_by_grid_spacing() {
        let ladder = spec(4);
        let step = ladder.step_size();
        let mut longs: Vec<f64> = ladder.build().iter().filter(|l| l.kind == LevelKind::LongEntry).map(|l| l.price).collect();
        longs.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert!((0.5 - longs[0] - step).abs() < 1e-12);
        for pair in longs.windows(2) {
            assert!((pair[0] - pair[1] - step).abs() < 1e-12);
        }
    }

    #[test]
    fn test_zero_quantity_side_skipped() {
        let mut ladder = spec(2);
        ladder.short_quantity = 0.0;
        assert!(ladder.build().iter().all(|l| l.position_side == PositionSide::Long));
    }

    #[test]
    fn test_take_profit_direction() {
        assert!((take_profit_price(PositionSide::Long, 1.0, 0.004) - 1.004).abs() < 1e-12);
        assert!((take_profit_price(PositionSide::Short, 1.0, 0.004) - 0.996).abs() < 1e-12);
    }

    #[test]
    fn test_round_to_places() {
        assert_eq!(round_to_places(0.123456, Some(4)), 0.1235);
        assert_eq!(round_to_places(0.123456, None), 0.123456);
    }
}
