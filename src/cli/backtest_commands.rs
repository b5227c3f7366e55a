// Backtest and optimize command implementations
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use grid_engine::backtesting::{load_csv, BarRequest, HistoricalClient};
use grid_engine::clients::BitgetRestClient;
use grid_engine::progress::{OptimizationProgress, Spinner};
use grid_engine::{
    BacktestBuilder, EngineConfig, GridConfig, GridSearch, HistoricalData, RankMetric, TradingError, TradingResult,
};

use crate::DataSource;

const DEFAULT_HISTORY_DAYS: i64 = 30;

fn grid_for(config: &EngineConfig, symbol: &str) -> TradingResult<GridConfig> {
    config
        .symbol(symbol)
        .cloned()
        .ok_or_else(|| TradingError::SymbolNotFound(symbol.to_string()))
}

/// Bars from a CSV file, or from the exchange history endpoint
pub async fn load_history(config: &EngineConfig, symbol: &str, source: &DataSource) -> TradingResult<HistoricalData> {
    let interval = source.interval.unwrap_or(config.backtest.interval_minutes);

    if let Some(path) = &source.csv {
        return Ok(load_csv(path, symbol, interval)?);
    }

    let days = source.days.unwrap_or(DEFAULT_HISTORY_DAYS);
    let request = BarRequest::last_days(symbol, interval, days, Utc::now());
    let client = HistoricalClient::new(
        BitgetRestClient::from_config(&config.exchange, None),
        config.backtest.max_bars_per_fetch,
    );

    let spinner = Spinner::new(&format!("Fetching {} days of {} history...", days, symbol));
    match client.fetch_range(&request).await {
        Ok(data) => {
            spinner.finish(&format!("Loaded {} bars", data.len()));
            Ok(data)
        }
        Err(err) => {
            spinner.finish_with_error(&err.to_string());
            Err(err.into())
        }
    }
}

pub async fn run_backtest(
    config: &EngineConfig,
    symbol: &str,
    source: &DataSource,
    tp: Option<f64>,
    gs: Option<f64>,
    output: Option<PathBuf>,
) -> TradingResult<()> {
    let base = grid_for(config, symbol)?;
    let grid = base.with_spacings(
        tp.unwrap_or(base.take_profit_spacing),
        gs.unwrap_or(base.grid_spacing),
    );
    grid.validate()?;

    let data = load_history(config, symbol, source).await?;
    info!(
        "🚀 Backtesting {} over {} bars (tp {:.4}, gs {:.4})",
        symbol,
        data.len(),
        grid.take_profit_spacing,
        grid.grid_spacing
    );

    let engine = BacktestBuilder::new()
        .with_grid(grid)
        .with_strategy(config.strategy.clone())
        .with_settings(config.backtest.clone())
        .build()?;
    let result = engine.run(&data)?;
    result.print_summary();

    if let Some(path) = output {
        fs::write(&path, serde_json::to_string_pretty(&result)?)?;
        info!("💾 Result written to {}", path.display());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn run_optimization(
    config: &EngineConfig,
    symbol: &str,
    source: &DataSource,
    max_drawdown: Option<f64>,
    workers: Option<usize>,
    metric: Option<RankMetric>,
    top: usize,
    output: Option<PathBuf>,
) -> TradingResult<()> {
    let base = grid_for(config, symbol)?;
    let data = load_history(config, symbol, source).await?;

    let mut search = GridSearch::from_settings(base, config.strategy.clone(), config.backtest.clone(), &config.optimizer);
    if let Some(max_drawdown) = max_drawdown {
        search = search.with_max_drawdown(max_drawdown);
    }
    if let Some(workers) = workers {
        search = search.with_workers(workers);
    }
    if let Some(metric) = metric {
        search = search.with_metric(metric);
    }

    let total = search.combinations().len();
    info!("🔍 Optimizing {}: {} combinations over {} bars", symbol, total, data.len());

    let progress = OptimizationProgress::new(total);
    let run = match search.run_with_progress(&data, |trial| progress.on_trial(trial)) {
        Ok(run) => run,
        Err(err) => {
            progress.finish_with_error(&err.to_string());
            return Err(err.into());
        }
    };
    progress.finish(run.best.as_ref().map(|best| best.roi));
    run.print_summary(top);

    if let Some(path) = output {
        run.save_json(&path)?;
        info!("💾 Optimization run written to {}", path.display());
    }
    Ok(())
}
