//! Status snapshots for external consumers.
//!
//! A [`StatusSnapshot`] is an immutable, versioned value composed from the
//! controllers and the risk accountant. Every field is always present;
//! missing inputs fall back to defaults when deserializing older payloads.

pub mod broadcaster;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::controller::{ControllerSnapshot, ControllerState};
use crate::risk::AccountantSnapshot;

pub use broadcaster::{StatusBroadcaster, StatusSource};

pub const STATUS_SCHEMA_VERSION: u32 = 1;

fn default_version() -> u32 {
    STATUS_SCHEMA_VERSION
}

fn default_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionStatus {
    pub symbol: String,
    #[serde(default)]
    pub long_qty: f64,
    #[serde(default)]
    pub short_qty: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub state: Option<ControllerState>,
    #[serde(default)]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorStatus {
    #[serde(default)]
    pub funding_rate: f64,
    #[serde(default)]
    pub order_flow_imbalance: f64,
    #[serde(default = "default_ratio")]
    pub volume_ratio: f64,
    #[serde(default = "default_ratio")]
    pub spread_ratio: f64,
    #[serde(default)]
    pub total_positions: f64,
}

impl Default for IndicatorStatus {
    fn default() -> Self {
        Self {
            funding_rate: 0.0,
            order_flow_imbalance: 0.0,
            volume_ratio: 1.0,
            spread_ratio: 1.0,
            total_positions: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub equity: f64,
    #[serde(default)]
    pub available_balance: f64,
    #[serde(default)]
    pub positions: Vec<PositionStatus>,
    #[serde(default)]
    pub is_trading: bool,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub indicators: IndicatorStatus,
    #[serde(default)]
    pub drawdown: f64,
    #[serde(default)]
    pub margin_ratio: f64,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            version: STATUS_SCHEMA_VERSION,
            sequence: 0,
            timestamp: Utc::now(),
            equity: 0.0,
            available_balance: 0.0,
            positions: Vec::new(),
            is_trading: false,
            is_paused: false,
            indicators: IndicatorStatus::default(),
            drawdown: 0.0,
            margin_ratio: 0.0,
        }
    }
}

impl StatusSnapshot {
    /// Merge the accountant's aggregate view with each controller's own state
    pub fn compose(account: &AccountantSnapshot, controllers: &[ControllerSnapshot]) -> Self {
        let positions: Vec<PositionStatus> = controllers
            .iter()
            .map(|c| PositionStatus {
                symbol: c.symbol.clone(),
                long_qty: c.position.long_qty,
                short_qty: c.position.short_qty,
                unrealized_pnl: c.position.unrealized_pnl,
                realized_pnl: c.position.realized_pnl,
                state: Some(c.state),
                degraded: c.degraded.clone(),
            })
            .collect();

        let count = controllers.len().max(1) as f64;
        let funding: Vec<f64> = controllers.iter().filter_map(|c| c.funding_rate).collect();
        let indicators = IndicatorStatus {
            funding_rate: if funding.is_empty() {
                0.0
            } else {
                funding.iter().sum::<f64>() / funding.len() as f64
            },
            order_flow_imbalance: controllers.iter().map(|c| c.indicators.order_flow_imbalance).sum::<f64>() / count,
            volume_ratio: if controllers.is_empty() {
                1.0
            } else {
                controllers.iter().map(|c| c.indicators.volume_ratio).fold(0.0, f64::max)
            },
            spread_ratio: if controllers.is_empty() {
                1.0
            } else {
                controllers.iter().map(|c| c.indicators.spread_ratio).fold(0.0, f64::max)
            },
            total_positions: positions.iter().map(|p| p.long_qty + p.short_qty).sum(),
        };

        Self {
            equity: account.equity,
            available_balance: account.available_balance,
            is_trading: controllers.iter().any(|c| c.position.is_trading),
            is_paused: !controllers.is_empty() && controllers.iter().all(|c| c.state == ControllerState::Paused),
            positions,
            indicators,
            drawdown: account.drawdown,
            margin_ratio: account.margin_ratio,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_payload_fills_defaults() {
        let snapshot: StatusSnapshot = serde_json::from_str(r#"{"equity": 1200.5}"#).unwrap();
        assert_eq!(snapshot.version, STATUS_SCHEMA_VERSION);
        assert_eq!(snapshot.equity, 1200.5);
        assert!(snapshot.positions.is_empty());
        assert_eq!(snapshot.indicators.volume_ratio, 1.0);
    }

    #[test]
    fn test_compose_without_controllers() {
        let account = AccountantSnapshot { equity: 1000.0, available_balance: 900.0, ..Default::default() };
        let status = StatusSnapshot::compose(&account, &[]);
        assert_eq!(status.equity, 1000.0);
        assert!(!status.is_trading);
        assert!(!status.is_paused);
        assert_eq!(status.indicators.total_positions, 0.0);
    }
}
