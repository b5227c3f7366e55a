// Leading indicators computed from the tick stream

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::core::types::TickUpdate;

const OFI_LOOKBACK: usize = 20;
const VOLUME_LOOKBACK: usize = 20;
const VOLUME_RECENT: usize = 5;
const SPREAD_LOOKBACK: usize = 20;

const OFI_EXTREME: f64 = 0.7;
const VOLUME_SPIKE: f64 = 3.0;
const SPREAD_SPIKE: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValues {
    pub order_flow_imbalance: f64, // -1 (all sells) .. 1 (all buys)
    pub volume_ratio: f64,
    pub spread_ratio: f64,
}

impl Default for IndicatorValues {
    fn default() -> Self {
        Self {
            order_flow_imbalance: 0.0,
            volume_ratio: 1.0,
            spread_ratio: 1.0,
        }
    }
}

impl IndicatorValues {
    /// Conditions under which new entries are withheld when the guard is on
    pub fn is_extreme(&self) -> bool {
        self.order_flow_imbalance.abs() > OFI_EXTREME
            || self.volume_ratio > VOLUME_SPIKE
            || self.spread_ratio > SPREAD_SPIKE
    }
}

#[derive(Debug, Clone, Copy)]
struct FlowSample {
    value: f64,
    signed: f64,
}

/// Rolling windows over recent ticks. Trade direction comes from the tick rule.
#[derive(Debug, Clone, Default)]
pub struct LeadingIndicators {
    flow: VecDeque<FlowSample>,
    spreads_bps: VecDeque<f64>,
    last_price: Option<f64>,
    last_direction: f64,
}

impl LeadingIndicators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, tick: &TickUpdate) {
        let price = tick.last;
        if price > 0.0 {
            let direction = match self.last_price {
                Some(prev) if price > prev => 1.0,
                Some(prev) if price < prev => -1.0,
                _ => self.last_direction,
            };
            self.last_direction = direction;
            self.last_price = Some(price);

            if tick.volume > 0.0 {
                let value = tick.volume * price;
                push_bounded(&mut self.flow, FlowSample { value, signed: value * direction }, OFI_LOOKBACK.max(VOLUME_LOOKBACK));
            }
        }

        let mid = tick.mid();
        if tick.bid > 0.0 && tick.ask >= tick.bid && mid > 0.0 {
            let spread_bps = (tick.ask - tick.bid) / mid * 10_000.0;
            push_bounded(&mut self.spreads_bps, spread_bps, SPREAD_LOOKBACK);
        }
    }

    pub fn order_flow_imbalance(&self) -> f64 {
        if self.flow.len() < OFI_LOOKBACK {
            return 0.0;
        }
        let recent = self.flow.iter().rev().take(OFI_LOOKBACK);
        let (total, signed) = recent.fold((0.0, 0.0), |(t, s), f| (t + f.value, s + f.signed));
        if total <= 0.0 {
            0.0
        } else {
            signed / total
        }
    }

    pub fn volume_ratio(&self) -> f64 {
        if self.flow.len() < VOLUME_LOOKBACK {
            return 1.0;
        }
        let historical: f64 = self.flow.iter().rev().take(VOLUME_LOOKBACK).map(|f| f.value).sum::<f64>()
            / VOLUME_LOOKBACK as f64;
        let recent: f64 = self.flow.iter().rev().take(VOLUME_RECENT).map(|f| f.value).sum::<f64>()
            / VOLUME_RECENT as f64;
        if historical <= 0.0 {
            1.0
        } else {
            recent / historical
        }
    }

    pub fn spread_ratio(&self) -> f64 {
        if self.spreads_bps.len() < SPREAD_LOOKBACK {
            return 1.0;
        }
        let avg = self.spreads_bps.iter().sum::<f64>() / self.spreads_bps.len() as f64;
        match self.spreads_bps.back() {
            Some(current) if avg > 0.0 => current / avg,
            _ => 1.0,
        }
    }

    pub fn values(&self) -> IndicatorValues {
        IndicatorValues {
            order_flow_imbalance: self.order_flow_imbalance(),
            volume_ratio: self.volume_ratio(),
            spread_ratio: self.spread_ratio(),
        }
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn tick(price: f64, volume: f64, spread: f64) -> TickUpdate {
        TickUpdate {
            symbol: "XRPUSDT".into(),
            bid: price - spread / 2.0,
            ask: price + spread / 2.0,
            last: price,
            volume,
            funding_rate: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_defaults_until_warm() {
        let mut ind = LeadingIndicators::new();
        ind.update(&tick(1.0, 10.0, 0.001));
        assert_eq!(ind.values(), IndicatorValues::default());
    }

    #[test]
    fn test_rising_prices_give_positive_imbalance() {
        let mut ind = LeadingIndicators::new();
        for i in 0..25 {
            ind.update(&tick(1.0 + i as f64 * 0.001, 10.0, 0.001));
        }
        assert!(ind.order_flow_imbalance() > 0.9);
        assert!(ind.values().is_extreme());
    }

    #[test]
    fn test_volume_spike() {
        let mut ind = LeadingIndicators::new();
        for i in 0..20 {
            let p = if i % 2 == 0 { 1.0 } else { 1.001 };
            ind.update(&tick(p, 1.0, 0.001));
        }
        for i in 0..5 {
            let p = if i % 2 == 0 { 1.0 } else { 1.001 };
            ind.update(&tick(p, 20.0, 0.001));
        }
        assert!(ind.volume_ratio() > 3.0);
    }

    #[test]
    fn test_spread_ratio_flat_market() {
        let mut ind = LeadingIndicators::new();
        for _ in 0..20 {
            ind.update(&tick(1.0, 0.0, 0.002));
        }
        assert!((ind.spread_ratio() - 1.0).abs() < 1e-9);
    }
}
