// Inventory skew and funding-rate bias
//
// Shifts the ladder anchor away from the side that would add risk and scales
// per-side quantities so the ladder quotes harder on the side that reduces it.

use crate::config::StrategyConfig;
use crate::core::types::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewAdjustment {
    pub anchor_shift: f64, // fraction of the mid price, signed
    pub long_multiplier: f64,
    pub short_multiplier: f64,
}

impl Default for SkewAdjustment {
    fn default() -> Self {
        Self {
            anchor_shift: 0.0,
            long_multiplier: 1.0,
            short_multiplier: 1.0,
        }
    }
}

impl SkewAdjustment {
    pub fn multiplier(&self, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => self.long_multiplier,
            PositionSide::Short => self.short_multiplier,
        }
    }

    pub fn skewed_anchor(&self, mid: f64) -> f64 {
        mid * (1.0 + self.anchor_shift)
    }
}

const MIN_QTY_MULTIPLIER: f64 = 0.5;
const MAX_QTY_MULTIPLIER: f64 = 1.5;

/// (L - S) / (L + S), zero when flat
pub fn inventory_ratio(long_qty: f64, short_qty: f64) -> f64 {
    let total = long_qty + short_qty;
    if total <= f64::EPSILON {
        0.0
    } else {
        (long_qty - short_qty) / total
    }
}

/// +1 when longs pay funding, -1 when shorts pay, 0 below threshold
pub fn funding_direction(funding_rate: Option<f64>, threshold: f64) -> f64 {
    match funding_rate {
        Some(rate) if rate.abs() >= threshold && rate != 0.0 => rate.signum(),
        _ => 0.0,
    }
}

pub fn compute_skew(
    strategy: &StrategyConfig,
    grid_spacing: f64,
    long_qty: f64,
    short_qty: f64,
    funding_rate: Option<f64>,
) -> SkewAdjustment {
    let ratio = inventory_ratio(long_qty, short_qty);
    let funding = funding_direction(funding_rate, strategy.funding_threshold);

    // Net long or longs paying funding: move the anchor down
    let max_shift = strategy.max_skew_steps * grid_spacing;
    let raw_shift = -(ratio * strategy.inventory_gamma + funding * strategy.funding_bias) * grid_spacing;
    let anchor_shift = raw_shift.clamp(-max_shift, max_shift);

    let long_multiplier = (1.0 - ratio * strategy.quantity_gamma) * (1.0 - funding * strategy.funding_bias);
    let short_multiplier = (1.0 + ratio * strategy.quantity_gamma) * (1.0 + funding * strategy.funding_bias);

    SkewAdjustment {
        anchor_shift,
        long_multiplier: long_multiplier.clamp(MIN_QTY_MULTIPLIER, MAX_QTY_MULTIPLIER),
        short_multiplier: short_multiplier.clamp(MIN_QTY_MULTIPLIER, MAX_QTY_MULTIPLIER),
    }
}

/// Dead-zone cap: no new entries on a side holding more than this
pub fn position_cap(initial_quantity: f64, threshold_multiplier: f64) -> f64 {
    initial_quantity * threshold_multiplier
}
