//! Parameter sweeps over historical data.
//!
//! [`GridSearch`] runs one full replay per `(take_profit_spacing, grid_spacing)`
//! pair on a rayon pool. Trials share nothing but the read-only bars, and a
//! trial that fails is recorded as such while the rest of the sweep carries on.
//!
//! The best trial is always chosen on ROI. A [`RankMetric`] adds a second
//! ranking for reports, and [`param_importance`] shows which parameter moved
//! the chosen metric more.

use chrono::{DateTime, Utc};
use ndarray::Array1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::backtesting::{BacktestBuilder, BacktestResult, HistoricalData};
use crate::config::{BacktestSettings, GridConfig, OptimizerSettings, StrategyConfig};

#[derive(Debug, Clone, thiserror::Error)]
pub enum OptimizationError {
    #[error("Invalid parameter range: {0}")]
    InvalidRange(String),
    #[error("Worker pool error: {0}")]
    Pool(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Unknown ranking metric: {0} (expected roi, sharpe, sortino, calmar or profit_factor)")]
    UnknownMetric(String),
}

const MAX_RANGE_VALUES: usize = 10_000;
const MAX_TRIALS: usize = 250_000;

/// Inclusive `[min, max]` range walked in `step` increments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParamRange {
    pub fn new(min: f64, max: f64, step: f64) -> Self {
        Self { min, max, step }
    }

    pub fn validate(&self, name: &str) -> Result<(), OptimizationError> {
        if !(self.min.is_finite() && self.max.is_finite() && self.step.is_finite()) {
            return Err(OptimizationError::InvalidRange(format!("{}: bounds must be finite", name)));
        }
        if self.min < 0.0 || self.max < self.min {
            return Err(OptimizationError::InvalidRange(format!(
                "{}: need 0 <= min <= max, got [{}, {}]",
                name, self.min, self.max
            )));
        }
        if self.step <= 0.0 {
            return Err(OptimizationError::InvalidRange(format!("{}: step must be positive", name)));
        }
        if (self.max - self.min) / self.step >= MAX_RANGE_VALUES as f64 {
            return Err(OptimizationError::InvalidRange(format!(
                "{}: step {} gives more than {} values",
                name, self.step, MAX_RANGE_VALUES
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        if self.step <= 0.0 || self.max < self.min {
            return 0;
        }
        // epsilon keeps 0.008 in [0.002, 0.008] step 0.001 despite float error
        ((self.max - self.min) / self.step + 1e-9).floor() as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every value in the range, computed from integer indices so error does not accumulate
    pub fn values(&self) -> Vec<f64> {
        (0..self.len())
            .map(|i| round_to(self.min + i as f64 * self.step, 10))
            .collect()
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    Completed(BacktestResult),
    Failed {
        take_profit_spacing: f64,
        grid_spacing: f64,
        error: String,
    },
}

impl TrialOutcome {
    pub fn result(&self) -> Option<&BacktestResult> {
        match self {
            TrialOutcome::Completed(result) => Some(result),
            TrialOutcome::Failed { .. } => None,
        }
    }

    pub fn params(&self) -> (f64, f64) {
        match self {
            TrialOutcome::Completed(r) => (r.take_profit_spacing, r.grid_spacing),
            TrialOutcome::Failed { take_profit_spacing, grid_spacing, .. } => (*take_profit_spacing, *grid_spacing),
        }
    }
}

/// Ranking used for selection: higher ROI, then lower drawdown, then fewer
/// trades, then the smaller parameters so the choice is always unique.
pub fn compare_results(a: &BacktestResult, b: &BacktestResult) -> Ordering {
    b.roi
        .total_cmp(&a.roi)
        .then_with(|| a.max_drawdown.total_cmp(&b.max_drawdown))
        .then_with(|| a.total_trades.cmp(&b.total_trades))
        .then_with(|| a.take_profit_spacing.total_cmp(&b.take_profit_spacing))
        .then_with(|| a.grid_spacing.total_cmp(&b.grid_spacing))
}

/// Secondary ranking for sweep reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankMetric {
    Roi,
    Sharpe,
    Sortino,
    /// Return over drawdown
    Calmar,
    ProfitFactor,
}

impl RankMetric {
    /// Higher is better for every metric
    pub fn value(&self, result: &BacktestResult) -> f64 {
        match self {
            RankMetric::Roi => result.roi,
            RankMetric::Sharpe => result.sharpe_ratio,
            RankMetric::Sortino => result.sortino_ratio,
            RankMetric::Calmar => result.risk_ratio,
            RankMetric::ProfitFactor => match result.profit_factor {
                Some(pf) => pf,
                // no losing trade at all
                None if result.winning_trades > 0 => f64::MAX,
                None => 0.0,
            },
        }
    }
}

impl FromStr for RankMetric {
    type Err = OptimizationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "roi" | "return" | "return_pct" => Ok(RankMetric::Roi),
            "sharpe" | "sharpe_ratio" => Ok(RankMetric::Sharpe),
            "sortino" | "sortino_ratio" => Ok(RankMetric::Sortino),
            "calmar" | "risk_ratio" => Ok(RankMetric::Calmar),
            "profit_factor" => Ok(RankMetric::ProfitFactor),
            other => Err(OptimizationError::UnknownMetric(other.to_string())),
        }
    }
}

impl fmt::Display for RankMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RankMetric::Roi => "roi",
            RankMetric::Sharpe => "sharpe",
            RankMetric::Sortino => "sortino",
            RankMetric::Calmar => "calmar",
            RankMetric::ProfitFactor => "profit_factor",
        };
        f.write_str(label)
    }
}

/// Completed trials ordered by `metric`, best first. Equal values fall back
/// to the selection order.
pub fn rank_by_metric(trials: &[TrialOutcome], metric: RankMetric) -> Vec<&BacktestResult> {
    let mut ranked: Vec<&BacktestResult> = trials.iter().filter_map(TrialOutcome::result).collect();
    ranked.sort_by(|a, b| {
        metric
            .value(b)
            .total_cmp(&metric.value(a))
            .then_with(|| compare_results(a, b))
    });
    ranked
}

/// Share of the metric's variation explained by each parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamImportance {
    pub metric: Option<RankMetric>,
    pub take_profit: f64,
    pub grid_spacing: f64,
}

/// Standard deviation of the mean metric per parameter value, normalized so
/// both shares sum to one. All zero when neither parameter moves the metric.
pub fn param_importance(trials: &[TrialOutcome], metric: RankMetric) -> ParamImportance {
    let completed: Vec<&BacktestResult> = trials.iter().filter_map(TrialOutcome::result).collect();
    let tp = group_spread(&completed, metric, |r| r.take_profit_spacing);
    let gs = group_spread(&completed, metric, |r| r.grid_spacing);
    let total = tp + gs;
    if total > 0.0 && total.is_finite() {
        ParamImportance {
            metric: Some(metric),
            take_profit: tp / total,
            grid_spacing: gs / total,
        }
    } else {
        ParamImportance {
            metric: Some(metric),
            ..ParamImportance::default()
        }
    }
}

fn group_spread<F>(results: &[&BacktestResult], metric: RankMetric, key: F) -> f64
where
    F: Fn(&BacktestResult) -> f64,
{
    // parameter values come from `ParamRange::values`, so bit equality groups them
    let mut groups: BTreeMap<u64, (f64, usize)> = BTreeMap::new();
    for &result in results {
        let value = metric.value(result);
        if value.is_finite() && value != f64::MAX {
            let group = groups.entry(key(result).to_bits()).or_insert((0.0, 0));
            group.0 += value;
            group.1 += 1;
        }
    }
    let means: Array1<f64> = groups.values().map(|&(sum, n)| sum / n as f64).collect();
    if means.len() < 2 {
        return 0.0;
    }
    means.std(1.0)
}

/// One row of the secondary ranking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRank {
    pub take_profit_spacing: f64,
    pub grid_spacing: f64,
    pub value: f64,
}

/// Best completed trial whose drawdown stays within `max_drawdown`
pub fn select_best(trials: &[TrialOutcome], max_drawdown: f64) -> Option<&BacktestResult> {
    trials
        .iter()
        .filter_map(TrialOutcome::result)
        .filter(|r| !r.liquidated && r.max_drawdown <= max_drawdown)
        .min_by(|a, b| compare_results(a, b))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationRun {
    pub symbol: String,
    pub take_profit: ParamRange,
    pub grid_spacing: ParamRange,
    pub max_drawdown: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed: usize,
    pub failed: usize,
    pub best: Option<BacktestResult>,
    #[serde(default)]
    pub param_importance: ParamImportance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<RankMetric>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_ranking: Vec<MetricRank>,
    pub trials: Vec<TrialOutcome>, // completed trials ranked best first, then failures
}

impl OptimizationRun {
    pub fn to_json(&self) -> Result<String, OptimizationError> {
        serde_json::to_string_pretty(self).map_err(|e| OptimizationError::Serialization(e.to_string()))
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), OptimizationError> {
        let json = self.to_json()?;
        fs::write(path.as_ref(), json).map_err(|e| OptimizationError::Io(e.to_string()))?;
        info!("💾 Optimization results written to {}", path.as_ref().display());
        Ok(())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TrialOutcome> {
        self.trials.iter().filter(|t| t.result().is_none())
    }

    /// Print the top `n` trials and any failures
    pub fn print_summary(&self, n: usize) {
        println!(
            "\n🏆 {} sweep: {} completed, {} failed",
            self.symbol, self.completed, self.failed
        );
        println!("{:<4} {:>8} {:>8} {:>10} {:>9} {:>7}", "rank", "tp", "gs", "roi %", "dd %", "trades");
        for (i, result) in self.trials.iter().filter_map(TrialOutcome::result).take(n).enumerate() {
            println!(
                "{:<4} {:>8.4} {:>8.4} {:>10.2} {:>9.2} {:>7}",
                i + 1,
                result.take_profit_spacing,
                result.grid_spacing,
                result.roi * 100.0,
                result.max_drawdown * 100.0,
                result.total_trades
            );
        }
        if let Some(metric) = self.metric {
            println!("\n🏅 Top {} by {}", n.min(self.metric_ranking.len()), metric);
            for (i, row) in self.metric_ranking.iter().take(n).enumerate() {
                println!(
                    "{:<4} {:>8.4} {:>8.4} {:>12.4}",
                    i + 1,
                    row.take_profit_spacing,
                    row.grid_spacing,
                    row.value
                );
            }
        }
        for failure in self.failures() {
            if let TrialOutcome::Failed { take_profit_spacing, grid_spacing, error } = failure {
                println!("❌ tp={:.4} gs={:.4}: {}", take_profit_spacing, grid_spacing, error);
            }
        }
        let importance = &self.param_importance;
        if importance.take_profit + importance.grid_spacing > 0.0 {
            println!(
                "\n📊 Parameter importance ({}): tp {:.0}% / gs {:.0}%",
                importance.metric.unwrap_or(RankMetric::Roi),
                importance.take_profit * 100.0,
                importance.grid_spacing * 100.0
            );
        }
        match &self.best {
            Some(best) => println!(
                "\n✅ Best: tp={:.4} gs={:.4} roi={:+.2}% dd={:.2}%",
                best.take_profit_spacing,
                best.grid_spacing,
                best.roi * 100.0,
                best.max_drawdown * 100.0
            ),
            None => println!("\n⚠️  No trial stayed under the {:.0}% drawdown ceiling", self.max_drawdown * 100.0),
        }
    }
}

pub struct GridSearch {
    base: GridConfig,
    strategy: StrategyConfig,
    settings: BacktestSettings,
    take_profit: ParamRange,
    grid_spacing: ParamRange,
    max_drawdown: f64,
    workers: usize,
    metric: Option<RankMetric>,
}

impl GridSearch {
    pub fn new(base: GridConfig, take_profit: ParamRange, grid_spacing: ParamRange) -> Self {
        let defaults = OptimizerSettings::default();
        Self {
            base,
            strategy: StrategyConfig::default(),
            settings: BacktestSettings::default(),
            take_profit,
            grid_spacing,
            max_drawdown: defaults.max_drawdown,
            workers: defaults.workers,
            metric: defaults.metric,
        }
    }

    pub fn from_settings(
        base: GridConfig,
        strategy: StrategyConfig,
        backtest: BacktestSettings,
        optimizer: &OptimizerSettings,
    ) -> Self {
        Self {
            base,
            strategy,
            settings: backtest,
            take_profit: optimizer.take_profit.clone(),
            grid_spacing: optimizer.grid_spacing.clone(),
            max_drawdown: optimizer.max_drawdown,
            workers: optimizer.workers,
            metric: optimizer.metric,
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_settings(mut self, settings: BacktestSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_max_drawdown(mut self, max_drawdown: f64) -> Self {
        self.max_drawdown = max_drawdown;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Also rank trials by `metric` in the report. Selection stays on ROI.
    pub fn with_metric(mut self, metric: RankMetric) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Every `(take_profit_spacing, grid_spacing)` pair, tp-major
    pub fn combinations(&self) -> Vec<(f64, f64)> {
        let gs_values = self.grid_spacing.values();
        self.take_profit
            .values()
            .into_iter()
            .flat_map(|tp| gs_values.iter().map(move |&gs| (tp, gs)))
            .collect()
    }

    pub fn run(&self, data: &HistoricalData) -> Result<OptimizationRun, OptimizationError> {
        self.run_with_progress(data, |_| {})
    }

    /// Run the sweep, calling `on_trial` as each trial finishes
    pub fn run_with_progress<F>(&self, data: &HistoricalData, on_trial: F) -> Result<OptimizationRun, OptimizationError>
    where
        F: Fn(&TrialOutcome) + Sync,
    {
        self.take_profit.validate("take_profit")?;
        self.grid_spacing.validate("grid_spacing")?;
        let trials = self.take_profit.len().saturating_mul(self.grid_spacing.len());
        if trials > MAX_TRIALS {
            return Err(OptimizationError::InvalidRange(format!(
                "{} combinations exceed the limit of {}",
                trials, MAX_TRIALS
            )));
        }

        let combinations = self.combinations();
        let started_at = Utc::now();
        info!(
            symbol = %self.base.symbol,
            trials = combinations.len(),
            bars = data.len(),
            "🔍 Starting parameter sweep"
        );

        let mut pool = rayon::ThreadPoolBuilder::new();
        if self.workers > 0 {
            pool = pool.num_threads(self.workers);
        }
        let pool = pool.build().map_err(|e| OptimizationError::Pool(e.to_string()))?;

        let outcomes: Vec<TrialOutcome> = pool.install(|| {
            combinations
                .par_iter()
                .map(|&(tp, gs)| {
                    let outcome = self.trial(data, tp, gs);
                    on_trial(&outcome);
                    outcome
                })
                .collect()
        });

        Ok(self.assemble(outcomes, started_at))
    }

    fn trial(&self, data: &HistoricalData, tp: f64, gs: f64) -> TrialOutcome {
        let result = BacktestBuilder::new()
            .with_grid(self.base.with_spacings(tp, gs))
            .with_strategy(self.strategy.clone())
            .with_settings(self.settings.clone())
            .build()
            .and_then(|engine| engine.run(data));

        match result {
            Ok(mut result) => {
                result.equity_curve.clear();
                debug!(tp, gs, roi = result.roi, dd = result.max_drawdown, "trial complete");
                TrialOutcome::Completed(result)
            }
            Err(err) => {
                warn!(tp, gs, %err, "⚠️  Trial failed");
                TrialOutcome::Failed {
                    take_profit_spacing: tp,
                    grid_spacing: gs,
                    error: err.to_string(),
                }
            }
        }
    }

    fn assemble(&self, mut outcomes: Vec<TrialOutcome>, started_at: DateTime<Utc>) -> OptimizationRun {
        outcomes.sort_by(|a, b| match (a.result(), b.result()) {
            (Some(x), Some(y)) => compare_results(x, y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => {
                let (ta, ga) = a.params();
                let (tb, gb) = b.params();
                ta.total_cmp(&tb).then_with(|| ga.total_cmp(&gb))
            }
        });

        let completed = outcomes.iter().filter(|t| t.result().is_some()).count();
        let best = select_best(&outcomes, self.max_drawdown).cloned();
        if let Some(best) = &best {
            info!(
                tp = best.take_profit_spacing,
                gs = best.grid_spacing,
                roi = best.roi,
                "🏆 Best parameters found"
            );
        }

        let metric_ranking = match self.metric {
            Some(metric) => rank_by_metric(&outcomes, metric)
                .into_iter()
                .map(|r| MetricRank {
                    take_profit_spacing: r.take_profit_spacing,
                    grid_spacing: r.grid_spacing,
                    value: metric.value(r),
                })
                .collect(),
            None => Vec::new(),
        };
        let param_importance = param_importance(&outcomes, self.metric.unwrap_or(RankMetric::Roi));

        OptimizationRun {
            symbol: self.base.symbol.clone(),
            take_profit: self.take_profit.clone(),
            grid_spacing: self.grid_spacing.clone(),
            max_drawdown: self.max_drawdown,
            started_at,
            finished_at: Utc::now(),
            completed,
            failed: outcomes.len() - completed,
            best,
            param_importance,
            metric: self.metric,
            metric_ranking,
            trials: outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(tp: f64, gs: f64, roi: f64, dd: f64, trades: usize) -> BacktestResult {
        BacktestResult {
            symbol: "XRPUSDT".into(),
            take_profit_spacing: tp,
            grid_spacing: gs,
            initial_capital: 1000.0,
            final_capital: 1000.0 * (1.0 + roi),
            total_pnl: 1000.0 * roi,
            roi,
            total_trades: trades,
            winning_trades: trades,
            win_rate: 1.0,
            max_drawdown: dd,
            risk_ratio: 0.0,
            sharpe_ratio: 0.0,
            sortino_ratio: 0.0,
            profit_factor: None,
            fees_paid: 0.0,
            executions: trades * 2,
            liquidated: false,
            start: None,
            end: None,
            equity_curve: Vec::new(),
        }
    }

    #[test]
    fn test_range_values_include_both_ends() {
        let tp = ParamRange::new(0.002, 0.008, 0.001);
        let gs = ParamRange::new(0.003, 0.010, 0.001);
        assert_eq!(tp.len(), 7);
        assert_eq!(gs.len(), 8);
        assert_eq!(tp.values().last().copied(), Some(0.008));
        assert_eq!(tp.values()[3], 0.005);
    }

    #[test]
    fn test_degenerate_range_has_one_value() {
        assert_eq!(ParamRange::new(0.004, 0.004, 0.001).values(), vec![0.004]);
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(ParamRange::new(0.01, 0.002, 0.001).validate("tp").is_err());
        assert!(ParamRange::new(0.002, 0.01, 0.0).validate("tp").is_err());
        assert!(ParamRange::new(-0.1, 0.01, 0.001).validate("tp").is_err());
    }

    #[test]
    fn test_tiny_step_is_refused_before_allocating() {
        let err = ParamRange::new(0.002, 0.008, 1e-12).validate("tp").unwrap_err();
        assert!(matches!(err, OptimizationError::InvalidRange(_)));
        assert!(ParamRange::new(0.0, 0.9999, 0.0001).validate("tp").is_ok());
    }

    #[test]
    fn test_metric_names() {
        assert_eq!("sharpe_ratio".parse::<RankMetric>().unwrap(), RankMetric::Sharpe);
        assert_eq!("Profit-Factor".parse::<RankMetric>().unwrap(), RankMetric::ProfitFactor);
        assert_eq!("return_pct".parse::<RankMetric>().unwrap(), RankMetric::Roi);
        assert!(matches!("luck".parse::<RankMetric>(), Err(OptimizationError::UnknownMetric(_))));
        assert_eq!(RankMetric::Calmar.to_string(), "calmar");
    }

    #[test]
    fn test_metric_ranking_keeps_roi_selection() {
        let mut steady = result(0.002, 0.003, 0.10, 0.05, 10);
        steady.sharpe_ratio = 3.0;
        let mut wild = result(0.004, 0.003, 0.30, 0.40, 10);
        wild.sharpe_ratio = 1.0;
        let trials = vec![TrialOutcome::Completed(wild), TrialOutcome::Completed(steady)];

        let ranked = rank_by_metric(&trials, RankMetric::Sharpe);
        assert_eq!(ranked[0].take_profit_spacing, 0.002);
        assert_eq!(select_best(&trials, 0.5).unwrap().take_profit_spacing, 0.004);
    }

    #[test]
    fn test_importance_follows_the_parameter_that_matters() {
        // ROI depends on tp only
        let trials: Vec<TrialOutcome> = [0.002, 0.004]
            .iter()
            .flat_map(|&tp| [0.003, 0.006].map(|gs| TrialOutcome::Completed(result(tp, gs, tp * 10.0, 0.1, 5))))
            .collect();
        let importance = param_importance(&trials, RankMetric::Roi);
        assert!((importance.take_profit - 1.0).abs() < 1e-12);
        assert_eq!(importance.grid_spacing, 0.0);

        let flat = vec![TrialOutcome::Completed(result(0.002, 0.003, 0.1, 0.1, 5))];
        let none = param_importance(&flat, RankMetric::Roi);
        assert_eq!(none.take_profit + none.grid_spacing, 0.0);
    }

    #[test]
    fn test_best_prefers_roi_under_ceiling() {
        let trials = vec![
            TrialOutcome::Completed(result(0.002, 0.003, 0.30, 0.60, 10)),
            TrialOutcome::Completed(result(0.004, 0.006, 0.20, 0.10, 10)),
            TrialOutcome::Completed(result(0.005, 0.006, 0.10, 0.05, 10)),
        ];
        let best = select_best(&trials, 0.5).unwrap();
        assert_eq!((best.take_profit_spacing, best.grid_spacing), (0.004, 0.006));
    }

    #[test]
    fn test_ties_break_on_drawdown_then_trades() {
        let trials = vec![
            TrialOutcome::Completed(result(0.002, 0.003, 0.20, 0.20, 5)),
            TrialOutcome::Completed(result(0.003, 0.003, 0.20, 0.10, 9)),
            TrialOutcome::Completed(result(0.004, 0.003, 0.20, 0.10, 4)),
        ];
        let best = select_best(&trials, 0.5).unwrap();
        assert_eq!(best.take_profit_spacing, 0.004);
    }

    #[test]
    fn test_failed_trials_never_win() {
        let trials = vec![TrialOutcome::Failed {
            take_profit_spacing: 0.0,
            grid_spacing: 0.003,
            error: "bad".into(),
        }];
        assert!(select_best(&trials, 1.0).is_none());
    }

    #[test]
    fn test_combinations_are_tp_major() {
        let search = GridSearch::new(
            GridConfig::new("XRPUSDT", 0.004, 0.006, 30.0, 20),
            ParamRange::new(0.002, 0.003, 0.001),
            ParamRange::new(0.004, 0.006, 0.001),
        );
        let combos = search.combinations();
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0], (0.002, 0.004));
        assert_eq!(combos[3], (0.003, 0.004));
    }
}
