// Candidate ranking with score history and trend hints

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::warn;

use crate::backtesting::HistoricalData;
use crate::core::types::Bar;
use crate::selection::scorer::{quote_volume_24h, CoinScorer};
use crate::selection::{CoinRank, Recommendation, Trend};

const TREND_THRESHOLD: f64 = 2.0;
const HOLD_MIN_SCORE: f64 = 80.0;
const WATCH_MIN_SCORE: f64 = 50.0;
const HOLD_MAX_RANK: usize = 3;
const HISTORY_RETENTION_DAYS: i64 = 7;

/// Input for one candidate symbol
#[derive(Debug, Clone)]
pub struct Candidate {
    pub symbol: String,
    pub bars: Vec<Bar>,
    pub quote_volume_24h: f64,
}

impl Candidate {
    pub fn new(symbol: &str, bars: Vec<Bar>, quote_volume_24h: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            bars,
            quote_volume_24h,
        }
    }

    /// Candidate whose 24h volume is taken from its own bars
    pub fn from_history(data: &HistoricalData) -> Self {
        Self {
            symbol: data.symbol.clone(),
            quote_volume_24h: quote_volume_24h(&data.bars),
            bars: data.bars.clone(),
        }
    }
}

pub struct CoinRanker {
    scorer: CoinScorer,
    history: HashMap<String, VecDeque<(DateTime<Utc>, f64)>>,
    last_rankings: Vec<CoinRank>,
}

impl CoinRanker {
    pub fn new(scorer: CoinScorer) -> Self {
        Self {
            scorer,
            history: HashMap::new(),
            last_rankings: Vec::new(),
        }
    }

    pub fn last_rankings(&self) -> &[CoinRank] {
        &self.last_rankings
    }

    pub fn rank_of(&self, symbol: &str) -> Option<&CoinRank> {
        self.last_rankings.iter().find(|r| r.symbol == symbol)
    }

    /// Score every candidate and order them best first. Candidates that cannot
    /// be scored are left out.
    pub fn rank(&mut self, candidates: &[Candidate], now: DateTime<Utc>) -> Vec<CoinRank> {
        let mut scores: Vec<_> = candidates
            .iter()
            .filter_map(|c| match self.scorer.score(&c.symbol, &c.bars, c.quote_volume_24h, now) {
                Ok(score) => Some(score),
                Err(err) => {
                    warn!(symbol = %c.symbol, %err, "⚠️  Candidate skipped");
                    None
                }
            })
            .collect();
        scores.sort_by(|a, b| {
            b.final_score
                .total_cmp(&a.final_score)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        for score in &scores {
            self.record(&score.symbol, score.final_score, now);
        }

        let rankings: Vec<CoinRank> = scores
            .into_iter()
            .enumerate()
            .map(|(i, score)| {
                let trend = self.trend(&score.symbol);
                CoinRank {
                    rank: i + 1,
                    symbol: score.symbol.clone(),
                    recommendation: recommend(score.final_score, i, trend),
                    score_change_24h: self.change_24h(&score.symbol, now),
                    trend,
                    score,
                }
            })
            .collect();

        self.last_rankings = rankings.clone();
        rankings
    }

    fn record(&mut self, symbol: &str, score: f64, now: DateTime<Utc>) {
        let history = self.history.entry(symbol.to_string()).or_default();
        history.push_back((now, score));
        let cutoff = now - Duration::days(HISTORY_RETENTION_DAYS);
        while history.front().map_or(false, |(ts, _)| *ts <= cutoff) {
            history.pop_front();
        }
    }

    fn trend(&self, symbol: &str) -> Trend {
        let Some(history) = self.history.get(symbol) else {
            return Trend::Stable;
        };
        let n = history.len();
        if n < 2 {
            return Trend::Stable;
        }
        let diff = history[n - 1].1 - history[n - 2].1;
        if diff > TREND_THRESHOLD {
            Trend::Up
        } else if diff < -TREND_THRESHOLD {
            Trend::Down
        } else {
            Trend::Stable
        }
    }

    fn change_24h(&self, symbol: &str, now: DateTime<Utc>) -> f64 {
        let cutoff = now - Duration::hours(24);
        let recent: Vec<f64> = self
            .history
            .get(symbol)
            .into_iter()
            .flatten()
            .filter(|(ts, _)| *ts > cutoff)
            .map(|(_, s)| *s)
            .collect();
        match (recent.first(), recent.last()) {
            (Some(first), Some(last)) if recent.len() >= 2 => last - first,
            _ => 0.0,
        }
    }
}

/// HOLD for a top-ranked high score that is not falling, AVOID below the
/// watch floor, WATCH otherwise
pub fn recommend(final_score: f64, index: usize, trend: Trend) -> Recommendation {
    if final_score >= HOLD_MIN_SCORE && index < HOLD_MAX_RANK && trend != Trend::Down {
        Recommendation::Hold
    } else if final_score >= WATCH_MIN_SCORE {
        Recommendation::Watch
    } else {
        Recommendation::Avoid
    }
}

/// Fixed-width table for the terminal
pub fn format_table(rankings: &[CoinRank]) -> String {
    if rankings.is_empty() {
        return "No rankings available".to_string();
    }
    let mut lines = vec![format!(
        "{:<6} {:<12} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}  {}",
        "rank", "symbol", "score", "vol", "liq", "mr", "mom", "stab", "action"
    )];
    for r in rankings {
        let s = &r.score;
        lines.push(format!(
            "{:<3} {:<2} {:<12} {:>6.1} {:>6.1} {:>6.1} {:>6.1} {:>6.1} {:>6.1}  {}",
            r.rank,
            r.trend.arrow(),
            r.symbol,
            s.final_score,
            s.volatility_score,
            s.liquidity_score,
            s.mean_revert_score,
            s.momentum_score,
            s.stability_score,
            r.recommendation
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::ScoreWeights;
    use chrono::TimeZone;

    fn bars(n: usize, amplitude: f64, drift: f64) -> Vec<Bar> {
        let closes: Vec<f64> = (0..n)
            .map(|i| (1.0 + amplitude * ((i as f64) * 1.3).sin()) * (1.0 + drift).powi(i as i32))
            .collect();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i == 0 { close } else { closes[i - 1] };
                Bar {
                    timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 3600, 0).unwrap(),
                    open,
                    high: open.max(close) * 1.01,
                    low: open.min(close) * 0.99,
                    close,
                    volume: 1_000.0,
                }
            })
            .collect()
    }

    fn ranker() -> CoinRanker {
        CoinRanker::new(CoinScorer::new(&ScoreWeights::default()).unwrap())
    }

    #[test]
    fn test_recommendation_rules() {
        assert_eq!(recommend(85.0, 0, Trend::Stable), Recommendation::Hold);
        assert_eq!(recommend(85.0, 0, Trend::Down), Recommendation::Watch);
        assert_eq!(recommend(85.0, 5, Trend::Up), Recommendation::Watch);
        assert_eq!(recommend(60.0, 0, Trend::Up), Recommendation::Watch);
        assert_eq!(recommend(30.0, 0, Trend::Stable), Recommendation::Avoid);
    }

    #[test]
    fn test_rank_orders_and_skips_short_history() {
        let candidates = vec![
            Candidate::new("TREND", bars(168, 0.0, 0.01), 2e8),
            Candidate::new("RANGE", bars(168, 0.03, 0.0), 2e8),
            Candidate::new("SHORT", bars(10, 0.03, 0.0), 2e8),
        ];
        let now = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        let rankings = ranker().rank(&candidates, now);
        assert_eq!(rankings.len(), 2);
        assert_eq!(rankings[0].symbol, "RANGE");
        assert_eq!(rankings[0].rank, 1);
        assert_eq!(rankings[1].rank, 2);
    }

    #[test]
    fn test_trend_follows_consecutive_scores() {
        let mut ranker = ranker();
        let t0 = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        ranker.record("XRPUSDT", 70.0, t0);
        ranker.record("XRPUSDT", 75.0, t0 + Duration::hours(1));
        assert_eq!(ranker.trend("XRPUSDT"), Trend::Up);
        assert_eq!(ranker.change_24h("XRPUSDT", t0 + Duration::hours(1)), 5.0);

        ranker.record("XRPUSDT", 74.0, t0 + Duration::hours(2));
        assert_eq!(ranker.trend("XRPUSDT"), Trend::Stable);
    }

    #[test]
    fn test_history_is_pruned() {
        let mut ranker = ranker();
        let t0 = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        ranker.record("XRPUSDT", 70.0, t0);
        ranker.record("XRPUSDT", 71.0, t0 + Duration::days(8));
        assert_eq!(ranker.history["XRPUSDT"].len(), 1);
    }
}
