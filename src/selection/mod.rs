//! Candidate symbol scoring, ranking and rotation.
//!
//! The scorer turns recent bars into a 0-100 grid-suitability score, the
//! ranker orders candidates and attaches a HOLD/WATCH/AVOID recommendation,
//! and the rotator decides whether swapping the active symbol is worth it.
//! None of this touches the trading loop; its output is configuration.

pub mod ranker;
pub mod rotator;
pub mod scorer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use ranker::CoinRanker;
pub use rotator::CoinRotator;
pub use scorer::CoinScorer;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SelectionError {
    #[error("Insufficient data for {symbol}: {bars} bars, need {required}")]
    InsufficientData { symbol: String, bars: usize, required: usize },
    #[error("Invalid score weights: {0}")]
    InvalidWeights(String),
}

/// Relative weight of each score component. Normalized to sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub volatility: f64,
    pub liquidity: f64,
    pub mean_revert: f64,
    pub momentum: f64,
    pub stability: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            volatility: 0.15,
            liquidity: 0.20,
            mean_revert: 0.40,
            momentum: 0.15,
            stability: 0.10,
        }
    }
}

impl ScoreWeights {
    fn total(&self) -> f64 {
        self.volatility + self.liquidity + self.mean_revert + self.momentum + self.stability
    }

    pub fn normalized(&self) -> Result<Self, SelectionError> {
        let parts = [self.volatility, self.liquidity, self.mean_revert, self.momentum, self.stability];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SelectionError::InvalidWeights("weights must be finite and non-negative".into()));
        }
        let total = self.total();
        if total <= 0.0 {
            return Err(SelectionError::InvalidWeights("weights sum to zero".into()));
        }
        Ok(Self {
            volatility: self.volatility / total,
            liquidity: self.liquidity / total,
            mean_revert: self.mean_revert / total,
            momentum: self.momentum / total,
            stability: self.stability / total,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Hold,
    Watch,
    Avoid,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Recommendation::Hold => "HOLD",
            Recommendation::Watch => "WATCH",
            Recommendation::Avoid => "AVOID",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    pub fn arrow(self) -> &'static str {
        match self {
            Trend::Up => "↑",
            Trend::Down => "↓",
            Trend::Stable => "→",
        }
    }
}

/// Component scores (0-100) and the raw measurements behind them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinScore {
    pub symbol: String,
    pub volatility_score: f64,
    pub liquidity_score: f64,
    pub mean_revert_score: f64,
    pub momentum_score: f64,
    pub stability_score: f64,
    pub final_score: f64,
    pub atr_pct: f64,
    pub quote_volume_24h: f64,
    pub hurst_exponent: f64,
    pub adf_pvalue: f64,
    pub adx: f64,
    pub volume_cv: f64,
    pub scored_at: DateTime<Utc>,
}

impl fmt::Display for CoinScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {:.1} (vol {:.0} liq {:.0} mr {:.0} mom {:.0} stab {:.0})",
            self.symbol,
            self.final_score,
            self.volatility_score,
            self.liquidity_score,
            self.mean_revert_score,
            self.momentum_score,
            self.stability_score
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinRank {
    pub rank: usize, // 1 = best
    pub symbol: String,
    pub score: CoinScore,
    pub trend: Trend,
    pub recommendation: Recommendation,
    pub score_change_24h: f64,
}

impl fmt::Display for CoinRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {}: {:.1} [{}]",
            self.rank,
            self.trend.arrow(),
            self.symbol,
            self.score.final_score,
            self.recommendation
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationSignal {
    pub from_symbol: String,
    pub to_symbol: String,
    pub score_diff: f64,
    pub reason: String,
    pub from_score: f64,
    pub to_score: f64,
    pub estimated_slippage: f64,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for RotationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rotate {} → {} (+{:.1} points): {}",
            self.from_symbol, self.to_symbol, self.score_diff, self.reason
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = ScoreWeights::default().normalized().unwrap();
        assert!((w.total() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_weights_are_rescaled() {
        let w = ScoreWeights {
            volatility: 1.0,
            liquidity: 1.0,
            mean_revert: 1.0,
            momentum: 1.0,
            stability: 0.0,
        }
        .normalized()
        .unwrap();
        assert!((w.volatility - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_zero_weights_rejected() {
        let w = ScoreWeights {
            volatility: 0.0,
            liquidity: 0.0,
            mean_revert: 0.0,
            momentum: 0.0,
            stability: 0.0,
        };
        assert!(matches!(w.normalized(), Err(SelectionError::InvalidWeights(_))));
    }

    #[test]
    fn test_recommendation_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Recommendation::Watch).unwrap(), "\"WATCH\"");
    }
}
