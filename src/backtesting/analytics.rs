// Performance analytics for completed replays

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::backtesting::TradeRecord;

const MINUTES_PER_YEAR: f64 = 365.0 * 24.0 * 60.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: Option<f64>,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub risk_ratio: f64,
}

pub struct PerformanceAnalyzer {
    risk_free_rate: f64, // annual
}

impl PerformanceAnalyzer {
    pub fn new() -> Self {
        Self { risk_free_rate: 0.0 }
    }

    pub fn with_risk_free_rate(risk_free_rate: f64) -> Self {
        Self { risk_free_rate }
    }

    /// Trade statistics from closing fills plus curve statistics
    pub fn calculate(
        &self,
        trades: &[TradeRecord],
        equity_curve: &[f64],
        roi: f64,
        interval_minutes: u32,
    ) -> PerformanceMetrics {
        let closing: Vec<f64> = trades
            .iter()
            .filter(|t| t.is_closing())
            .map(|t| t.realized_pnl)
            .collect();
        let winning_trades = closing.iter().filter(|&&p| p > 0.0).count();
        let gross_profit: f64 = closing.iter().filter(|&&p| p > 0.0).sum();
        let gross_loss: f64 = closing.iter().filter(|&&p| p < 0.0).map(|p| p.abs()).sum();

        let max_drawdown = Self::max_drawdown(equity_curve);
        PerformanceMetrics {
            total_trades: closing.len(),
            winning_trades,
            win_rate: if closing.is_empty() {
                0.0
            } else {
                winning_trades as f64 / closing.len() as f64
            },
            gross_profit,
            gross_loss,
            profit_factor: if gross_loss > 0.0 {
                Some(gross_profit / gross_loss)
            } else {
                None
            },
            max_drawdown,
            sharpe_ratio: self.sharpe_ratio(equity_curve, interval_minutes),
            sortino_ratio: self.sortino_ratio(equity_curve, interval_minutes),
            risk_ratio: Self::risk_ratio(roi, max_drawdown),
        }
    }

    /// Largest peak-to-trough decline as a fraction of the peak, in [0, 1]
    pub fn max_drawdown(equity_curve: &[f64]) -> f64 {
        let mut peak = f64::MIN;
        let mut worst: f64 = 0.0;
        for &equity in equity_curve {
            peak = peak.max(equity);
            if peak > 0.0 {
                worst = worst.max((peak - equity) / peak);
            }
        }
        worst.clamp(0.0, 1.0)
    }

    /// Return over drawdown; with no drawdown the return is scaled up instead
    pub fn risk_ratio(roi: f64, max_drawdown: f64) -> f64 {
        if max_drawdown > 0.0 {
            roi / max_drawdown
        } else {
            roi * 10.0
        }
    }

    /// Annualized Sharpe of per-bar equity returns
    pub fn sharpe_ratio(&self, equity_curve: &[f64], interval_minutes: u32) -> f64 {
        let returns = Self::returns(equity_curve);
        if returns.len() < 2 {
            return 0.0;
        }
        let periods_per_year = MINUTES_PER_YEAR / interval_minutes.max(1) as f64;
        let excess = &returns - self.risk_free_rate / periods_per_year;
        let mean = excess.mean().unwrap_or(0.0);
        let std = excess.std(1.0);
        if std > 0.0 && std.is_finite() {
            mean / std * periods_per_year.sqrt()
        } else {
            0.0
        }
    }

    /// Annualized Sortino: like Sharpe, but only losing bars count as risk
    pub fn sortino_ratio(&self, equity_curve: &[f64], interval_minutes: u32) -> f64 {
        let returns = Self::returns(equity_curve);
        if returns.len() < 2 {
            return 0.0;
        }
        let periods_per_year = MINUTES_PER_YEAR / interval_minutes.max(1) as f64;
        let excess = &returns - self.risk_free_rate / periods_per_year;
        let mean = excess.mean().unwrap_or(0.0);
        let downside = excess.mapv(|r| r.min(0.0).powi(2)).mean().unwrap_or(0.0).sqrt();
        if downside > 0.0 && downside.is_finite() {
            mean / downside * periods_per_year.sqrt()
        } else {
            0.0
        }
    }

    fn returns(equity_curve: &[f64]) -> Array1<f64> {
        equity_curve
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect()
    }
}

impl Default for PerformanceAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PositionSide, Side};
    use chrono::Utc;

    fn closing(pnl: f64) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now(),
            side: Side::Sell,
            position_side: PositionSide::Long,
            price: 1.0,
            quantity: 1.0,
            fee: 0.0,
            closed_qty: 1.0,
            realized_pnl: pnl,
        }
    }

    fn opening() -> TradeRecord {
        TradeRecord { closed_qty: 0.0, realized_pnl: -0.01, ..closing(0.0) }
    }

    #[test]
    fn test_only_closing_trades_count() {
        let trades = vec![opening(), closing(2.0), opening(), closing(-1.0), closing(3.0)];
        let metrics = PerformanceAnalyzer::new().calculate(&trades, &[100.0, 104.0], 0.04, 15);
        assert_eq!(metrics.total_trades, 3);
        assert_eq!(metrics.winning_trades, 2);
        assert!((metrics.win_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(metrics.profit_factor, Some(5.0));
    }

    #[test]
    fn test_no_losses_has_no_profit_factor() {
        let metrics = PerformanceAnalyzer::new().calculate(&[closing(1.0)], &[100.0, 101.0], 0.01, 15);
        assert_eq!(metrics.profit_factor, None);
    }

    #[test]
    fn test_max_drawdown_from_running_peak() {
        let dd = PerformanceAnalyzer::max_drawdown(&[100.0, 120.0, 90.0, 130.0, 117.0]);
        assert!((dd - 0.25).abs() < 1e-12);
        assert_eq!(PerformanceAnalyzer::max_drawdown(&[100.0, 101.0, 102.0]), 0.0);
    }

    #[test]
    fn test_drawdown_is_capped_at_one() {
        assert_eq!(PerformanceAnalyzer::max_drawdown(&[100.0, -20.0]), 1.0);
    }

    #[test]
    fn test_risk_ratio_without_drawdown() {
        assert!((PerformanceAnalyzer::risk_ratio(0.05, 0.0) - 0.5).abs() < 1e-12);
        assert!((PerformanceAnalyzer::risk_ratio(0.05, 0.1) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_flat_curve_has_zero_sharpe() {
        let analyzer = PerformanceAnalyzer::new();
        assert_eq!(analyzer.sharpe_ratio(&[100.0; 10], 15), 0.0);
        assert!(analyzer.sharpe_ratio(&[100.0, 101.0, 101.5, 103.0], 15) > 0.0);
    }

    #[test]
    fn test_sortino_ignores_upside_swings() {
        let analyzer = PerformanceAnalyzer::new();
        // No losing bar: no downside risk to divide by
        assert_eq!(analyzer.sortino_ratio(&[100.0, 101.0, 103.0, 104.0], 15), 0.0);

        let choppy = [100.0, 103.0, 102.0, 105.0, 104.0, 107.0];
        let sortino = analyzer.sortino_ratio(&choppy, 15);
        assert!(sortino > analyzer.sharpe_ratio(&choppy, 15));
        assert!(analyzer.sortino_ratio(&[100.0, 99.0, 98.0, 97.5], 15) < 0.0);
    }
}
