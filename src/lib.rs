// Grid Trading Engine Library
//
// Per-symbol grid controllers for perpetual futures, a shared execution
// gateway (live Bitget or simulated), aggregate risk accounting, and a
// backtest/optimizer that replays history through the same controller logic.

pub mod core;
pub mod clients;
pub mod config;
pub mod error;       // Unified error handling
pub mod gateway;
pub mod risk;
pub mod engine;
pub mod status;
pub mod backtesting;
pub mod optimization;
pub mod selection;
pub mod progress;

// Re-export core trading types
pub use core::{ControllerState, GridController, SymbolState};

// Re-export error types
pub use error::{TradingError, TradingResult};

// Re-export configuration
pub use config::{ConfigError, EngineConfig, GridConfig, LoggingConfig, RiskConfig, StrategyConfig};

// Re-export runtime components
pub use engine::{Engine, EngineCommand};
pub use gateway::{ExecutionGateway, GatewayError, LiveGateway, SimExchange, SimulatedGateway};
pub use risk::{RiskAccountant, RiskAction};
pub use status::{StatusBroadcaster, StatusSnapshot};

// Re-export backtesting components
pub use backtesting::{
    BacktestBuilder, BacktestConfig, BacktestEngine, BacktestResult, HistoricalData, PerformanceAnalyzer,
    engine::BacktestError,
};

// Re-export optimization components
pub use optimization::{GridSearch, OptimizationRun, ParamRange, RankMetric, TrialOutcome};

// Re-export selection components
pub use selection::{CoinRanker, CoinRotator, CoinScorer, Recommendation};
