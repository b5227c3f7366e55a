// Deterministic replay of one grid controller against the simulated exchange
//
// The controller sees exactly the events it would see live: fills as the
// intrabar path crosses its levels, then a tick at every path point. Nothing
// here reads the wall clock or a random source, so the same bars and
// parameters always produce the same result.

use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::backtesting::analytics::PerformanceAnalyzer;
use crate::backtesting::{BacktestConfig, BacktestResult, HistoricalData, TradeRecord};
use crate::config::{BacktestSettings, GridConfig, StrategyConfig};
use crate::core::controller::{ControllerAction, GridController};
use crate::core::position::SymbolState;
use crate::core::types::{FillEvent, TickUpdate};
use crate::gateway::simulated::SimExchange;
use crate::gateway::GatewayError;

const REPLAY_ID_PREFIX: &str = "bt";
// Guards against a controller that keeps answering its own actions forever
const MAX_ACTIONS_PER_EVENT: usize = 10_000;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BacktestError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    #[error("Malformed data: {0}")]
    MalformedData(String),
    #[error("Range rejected: {0}")]
    RangeRejected(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Gateway error: {0}")]
    Gateway(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<GatewayError> for BacktestError {
    fn from(err: GatewayError) -> Self {
        BacktestError::Gateway(err.to_string())
    }
}

impl From<std::io::Error> for BacktestError {
    fn from(err: std::io::Error) -> Self {
        BacktestError::Io(err.to_string())
    }
}

pub struct BacktestEngine {
    config: BacktestConfig,
    analyzer: PerformanceAnalyzer,
}

/// Mutable state of one replay
struct Replay {
    sim: SimExchange,
    controller: GridController,
    ledger: SymbolState,
    trades: Vec<TradeRecord>,
}

impl Replay {
    fn apply_fill(&mut self, fill: &FillEvent, work: &mut VecDeque<ControllerAction>) {
        let outcome = self.ledger.apply_fill(fill);
        self.trades.push(TradeRecord {
            timestamp: fill.timestamp,
            side: fill.side,
            position_side: fill.position_side,
            price: fill.price,
            quantity: fill.quantity,
            fee: fill.fee,
            closed_qty: outcome.closed,
            realized_pnl: if outcome.closed > 0.0 { outcome.net_pnl() } else { 0.0 },
        });
        work.extend(self.controller.on_fill(fill));
    }

    /// Run controller actions against the exchange until nothing is left to do
    fn execute(&mut self, actions: Vec<ControllerAction>) -> Result<(), BacktestError> {
        let mut work: VecDeque<ControllerAction> = actions.into();
        let mut steps = 0usize;

        while let Some(action) = work.pop_front() {
            steps += 1;
            if steps > MAX_ACTIONS_PER_EVENT {
                return Err(BacktestError::Configuration(format!(
                    "{} controller did not settle after {} actions",
                    self.controller.symbol(),
                    MAX_ACTIONS_PER_EVENT
                )));
            }

            match action {
                ControllerAction::Submit(order) => match self.sim.submit(&order) {
                    Ok(_) => {
                        work.extend(self.controller.on_ack(&order.client_id));
                        for fill in self.sim.take_queued_fills() {
                            self.apply_fill(&fill, &mut work);
                        }
                    }
                    Err(err) => {
                        debug!(client_id = %order.client_id, %err, "simulated submit refused");
                        work.extend(self.controller.on_submit_failed(&order.client_id, &err));
                    }
                },
                ControllerAction::Cancel { symbol, client_id } => {
                    self.sim.cancel(&symbol, &client_id);
                }
            }
        }
        Ok(())
    }
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Result<Self, BacktestError> {
        config.validate()?;
        Ok(Self {
            config,
            analyzer: PerformanceAnalyzer::new(),
        })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Replay `data` bar by bar and report the outcome
    pub fn run(&self, data: &HistoricalData) -> Result<BacktestResult, BacktestError> {
        if data.len() < 2 {
            return Err(BacktestError::InsufficientData(format!(
                "{} has {} bars, need at least 2",
                data.symbol,
                data.len()
            )));
        }
        data.validate()?;

        let grid = &self.config.grid;
        let symbol = grid.symbol.as_str();
        let initial_capital = self.config.initial_capital;

        let mut sim = SimExchange::new(initial_capital, self.config.fee_rate, &self.config.settlement_asset);
        sim.set_leverage(symbol, grid.leverage as f64);

        let mut replay = Replay {
            sim,
            controller: GridController::with_id_prefix(grid.clone(), self.config.strategy.clone(), REPLAY_ID_PREFIX),
            ledger: SymbolState::new(symbol),
            trades: Vec::new(),
        };

        let first = &data.bars[0];
        replay.sim.set_clock(first.timestamp);
        replay.sim.on_price(symbol, first.open);
        let opening = replay.controller.start(first.open, replay.sim.available_balance());
        replay.execute(opening)?;

        let mut equity_curve = Vec::with_capacity(data.len() + 2);
        equity_curve.push(initial_capital);
        let mut liquidated = false;

        for bar in &data.bars {
            replay.sim.set_clock(bar.timestamp);
            let path = replay.sim.path_for(symbol, bar);
            let volume_per_point = bar.volume / path.len().max(1) as f64;

            for price in path {
                let mut work = VecDeque::new();
                for fill in replay.sim.on_price(symbol, price) {
                    replay.apply_fill(&fill, &mut work);
                }
                replay.execute(work.into())?;

                let tick = TickUpdate::at_price(symbol, price, volume_per_point, bar.timestamp);
                let actions = replay.controller.on_tick(&tick);
                replay.execute(actions)?;
            }

            let equity = replay.sim.equity();
            equity_curve.push(equity);
            if equity <= 0.0 {
                warn!(symbol, at = %bar.timestamp, equity, "☠️  Account liquidated during replay");
                liquidated = true;
                break;
            }
        }

        if self.config.close_at_end || liquidated {
            let closing = replay.controller.close_all();
            replay.execute(closing)?;
        }
        if let Some(last) = replay.sim.last_price(symbol) {
            replay.ledger.mark(last);
        }

        let total_pnl = replay.ledger.realized_pnl + replay.ledger.unrealized_pnl;
        let final_capital = initial_capital + total_pnl;
        equity_curve.push(final_capital);

        let roi = total_pnl / initial_capital;
        let metrics = self
            .analyzer
            .calculate(&replay.trades, &equity_curve, roi, data.interval_minutes);

        debug!(
            symbol,
            sim_equity = replay.sim.equity(),
            ledger_equity = final_capital,
            "replay settled"
        );
        info!(
            symbol,
            tp = grid.take_profit_spacing,
            gs = grid.grid_spacing,
            trades = metrics.total_trades,
            roi,
            "🧪 Backtest finished"
        );

        Ok(BacktestResult {
            symbol: symbol.to_string(),
            take_profit_spacing: grid.take_profit_spacing,
            grid_spacing: grid.grid_spacing,
            initial_capital,
            final_capital,
            total_pnl,
            roi,
            total_trades: metrics.total_trades,
            winning_trades: metrics.winning_trades,
            win_rate: metrics.win_rate,
            max_drawdown: metrics.max_drawdown,
            risk_ratio: metrics.risk_ratio,
            sharpe_ratio: metrics.sharpe_ratio,
            sortino_ratio: metrics.sortino_ratio,
            profit_factor: metrics.profit_factor,
            fees_paid: replay.ledger.fees_paid,
            executions: replay.trades.len(),
            liquidated,
            start: data.start(),
            end: data.end(),
            equity_curve,
        })
    }
}

/// Builder pattern for easy backtest configuration
pub struct BacktestBuilder {
    grid: Option<GridConfig>,
    strategy: StrategyConfig,
    settings: BacktestSettings,
    close_at_end: bool,
}

impl BacktestBuilder {
    pub fn new() -> Self {
        Self {
            grid: None,
            strategy: StrategyConfig::default(),
            settings: BacktestSettings::default(),
            close_at_end: true,
        }
    }

    pub fn with_grid(mut self, grid: GridConfig) -> Self {
        self.grid = Some(grid);
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_settings(mut self, settings: BacktestSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_initial_capital(mut self, capital: f64) -> Self {
        self.settings.initial_capital = capital;
        self
    }

    pub fn with_fee_rate(mut self, fee_rate: f64) -> Self {
        self.settings.fee_rate = fee_rate;
        self
    }

    pub fn with_settlement_asset(mut self, asset: &str) -> Self {
        self.settings.settlement_asset = asset.to_string();
        self
    }

    /// Flatten any remaining inventory at the last price
    pub fn close_at_end(mut self, enabled: bool) -> Self {
        self.close_at_end = enabled;
        self
    }

    pub fn build(self) -> Result<BacktestEngine, BacktestError> {
        let grid = self
            .grid
            .ok_or_else(|| BacktestError::Configuration("no grid configured".to_string()))?;
        let mut config = BacktestConfig::new(grid, &self.settings);
        config.strategy = self.strategy;
        config.close_at_end = self.close_at_end;
        BacktestEngine::new(config)
    }
}

impl Default for BacktestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Bar;
    use chrono::{TimeZone, Utc};

    fn oscillating(n: usize) -> HistoricalData {
        let bars = (0..n)
            .map(|i| {
                let close = 1.0 + 0.02 * ((i as f64) * 0.7).sin();
                let open = 1.0 + 0.02 * (((i as f64) - 1.0) * 0.7).sin();
                Bar {
                    timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 900, 0).unwrap(),
                    open,
                    high: open.max(close) + 0.002,
                    low: open.min(close) - 0.002,
                    close,
                    volume: 1_000.0,
                }
            })
            .collect();
        HistoricalData::new("XRPUSDT", 15, bars)
    }

    fn engine() -> BacktestEngine {
        BacktestBuilder::new()
            .with_grid(GridConfig::new("XRPUSDT", 0.004, 0.006, 30.0, 20))
            .with_initial_capital(1000.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_final_capital_is_initial_plus_pnl() {
        let result = engine().run(&oscillating(200)).unwrap();
        assert_eq!(result.final_capital, result.initial_capital + result.total_pnl);
        assert!((0.0..=1.0).contains(&result.max_drawdown));
        assert!(result.total_trades > 0);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let data = oscillating(150);
        let a = engine().run(&data).unwrap();
        let b = engine().run(&data).unwrap();
        assert_eq!(a.total_pnl, b.total_pnl);
        assert_eq!(a.total_trades, b.total_trades);
        assert_eq!(a.equity_curve, b.equity_curve);
    }

    #[test]
    fn test_single_bar_is_insufficient() {
        let data = oscillating(1);
        assert!(matches!(engine().run(&data), Err(BacktestError::InsufficientData(_))));
    }

    #[test]
    fn test_builder_requires_grid() {
        assert!(matches!(BacktestBuilder::new().build(), Err(BacktestError::Configuration(_))));
    }

    #[test]
    fn test_builder_rejects_bad_capital() {
        let built = BacktestBuilder::new()
            .with_grid(GridConfig::new("XRPUSDT", 0.004, 0.006, 30.0, 20))
            .with_initial_capital(0.0)
            .build();
        assert!(matches!(built, Err(BacktestError::Configuration(_))));
    }
}
