// Backtesting data structures and types

pub mod analytics;
pub mod data;
pub mod engine;

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::config::{BacktestSettings, GridConfig, StrategyConfig};
use crate::core::types::{Bar, PositionSide, Side};
use engine::BacktestError;

pub use analytics::{PerformanceAnalyzer, PerformanceMetrics};
pub use data::{load_csv, BarRequest, HistoricalClient};
pub use engine::{BacktestBuilder, BacktestEngine};

/// Ordered OHLCV bars for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalData {
    pub symbol: String,
    pub interval_minutes: u32,
    pub bars: Vec<Bar>,
}

impl HistoricalData {
    pub fn new(symbol: &str, interval_minutes: u32, bars: Vec<Bar>) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval_minutes,
            bars,
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|b| b.timestamp)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.timestamp)
    }

    pub fn closes(&self) -> Array1<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn highs(&self) -> Array1<f64> {
        self.bars.iter().map(|b| b.high).collect()
    }

    pub fn lows(&self) -> Array1<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    pub fn volumes(&self) -> Array1<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }

    /// Bars must be well formed and strictly increasing in time
    pub fn validate(&self) -> Result<(), BacktestError> {
        if let Some((i, bar)) = self.bars.iter().enumerate().find(|(_, b)| !b.is_well_formed()) {
            return Err(BacktestError::MalformedData(format!(
                "{} bar {} at {} has inconsistent OHLC values",
                self.symbol, i, bar.timestamp
            )));
        }
        if let Some(i) = self
            .bars
            .windows(2)
            .position(|w| w[1].timestamp <= w[0].timestamp)
        {
            return Err(BacktestError::MalformedData(format!(
                "{} bars out of order at index {}",
                self.symbol,
                i + 1
            )));
        }
        Ok(())
    }

    /// Bars with `start <= timestamp < end`
    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            symbol: self.symbol.clone(),
            interval_minutes: self.interval_minutes,
            bars: self
                .bars
                .iter()
                .filter(|b| b.timestamp >= start && b.timestamp < end)
                .cloned()
                .collect(),
        }
    }

    /// The most recent `days` of data
    pub fn last_days(&self, days: i64) -> Self {
        match self.end() {
            Some(end) => {
                let start = end - chrono::Duration::days(days);
                let mut window = self.window(start, end);
                if let Some(last) = self.bars.last() {
                    window.bars.push(last.clone());
                }
                window
            }
            None => self.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub grid: GridConfig,
    pub strategy: StrategyConfig,
    pub initial_capital: f64,
    pub fee_rate: f64,
    pub settlement_asset: String,
    pub close_at_end: bool,
}

impl BacktestConfig {
    pub fn new(grid: GridConfig, settings: &BacktestSettings) -> Self {
        Self {
            grid,
            strategy: StrategyConfig::default(),
            initial_capital: settings.initial_capital,
            fee_rate: settings.fee_rate,
            settlement_asset: settings.settlement_asset.clone(),
            close_at_end: true,
        }
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        self.grid
            .validate()
            .map_err(|e| BacktestError::Configuration(e.to_string()))?;
        if !(self.initial_capital > 0.0 && self.initial_capital.is_finite()) {
            return Err(BacktestError::Configuration(format!(
                "initial capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if !(0.0..0.1).contains(&self.fee_rate) {
            return Err(BacktestError::Configuration(format!("fee rate {} out of range", self.fee_rate)));
        }
        if self.strategy.ladder_depth == 0 {
            return Err(BacktestError::Configuration("ladder depth must be positive".to_string()));
        }
        Ok(())
    }
}

/// One simulated execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub position_side: PositionSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub closed_qty: f64,
    pub realized_pnl: f64, // net of this fill's fee, 0 for pure opens
}

impl TradeRecord {
    /// Closing trades are the ones that count toward trade statistics
    pub fn is_closing(&self) -> bool {
        self.closed_qty > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbol: String,
    pub take_profit_spacing: f64,
    pub grid_spacing: f64,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub total_pnl: f64,
    pub roi: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub risk_ratio: f64,
    pub sharpe_ratio: f64,
    #[serde(default)]
    pub sortino_ratio: f64,
    pub profit_factor: Option<f64>, // None when there were no losing trades
    pub fees_paid: f64,
    pub executions: usize,
    pub liquidated: bool,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equity_curve: Vec<f64>,
}

impl BacktestResult {
    /// Print a short human-readable report
    pub fn print_summary(&self) {
        println!("📊 {} tp={:.4} gs={:.4}", self.symbol, self.take_profit_spacing, self.grid_spacing);
        println!("   💰 Final capital:  {:.2} (initial {:.2})", self.final_capital, self.initial_capital);
        println!("   📈 Total PnL:      {:+.2} ({:+.2}%)", self.total_pnl, self.roi * 100.0);
        println!("   🔄 Trades:         {} closing / {} fills", self.total_trades, self.executions);
        println!("   🎯 Win rate:       {:.1}%", self.win_rate * 100.0);
        println!("   📉 Max drawdown:   {:.2}%", self.max_drawdown * 100.0);
        println!("   ⚖️  Risk ratio:     {:.3}", self.risk_ratio);
        println!("   📐 Sharpe:         {:.3}", self.sharpe_ratio);
        println!("   📐 Sortino:        {:.3}", self.sortino_ratio);
        match self.profit_factor {
            Some(pf) => println!("   💹 Profit factor:  {:.3}", pf),
            None => println!("   💹 Profit factor:  no losing trades"),
        }
        println!("   💸 Fees paid:      {:.4}", self.fees_paid);
        if self.liquidated {
            println!("   ☠️  Account liquidated during replay");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(minute: i64, close: f64) -> Bar {
        Bar {
            timestamp: Utc.timestamp_opt(1_700_000_000 + minute * 60, 0).unwrap(),
            open: close,
            high: close + 0.01,
            low: close - 0.01,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn test_columns_follow_bars() {
        let data = HistoricalData::new("XRPUSDT", 1, vec![bar(0, 1.0), bar(1, 1.1)]);
        assert_eq!(data.closes().to_vec(), vec![1.0, 1.1]);
        assert_eq!(data.volumes().sum(), 20.0);
        assert!(data.validate().is_ok());
    }

    #[test]
    fn test_out_of_order_bars_are_malformed() {
        let data = HistoricalData::new("XRPUSDT", 1, vec![bar(1, 1.0), bar(0, 1.1)]);
        assert!(matches!(data.validate(), Err(BacktestError::MalformedData(_))));
    }

    #[test]
    fn test_inconsistent_ohlc_is_malformed() {
        let mut broken = bar(0, 1.0);
        broken.high = 0.5;
        let data = HistoricalData::new("XRPUSDT", 1, vec![broken]);
        assert!(matches!(data.validate(), Err(BacktestError::MalformedData(_))));
    }

    #[test]
    fn test_window_is_half_open() {
        let data = HistoricalData::new("XRPUSDT", 1, (0..10).map(|i| bar(i, 1.0)).collect());
        let window = data.window(data.bars[2].timestamp, data.bars[5].timestamp);
        assert_eq!(window.len(), 3);
    }
}
