// Symbol rotation with hysteresis, cooldowns and a weekly cap

use chrono::{DateTime, Datelike, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::SelectionConfig;
use crate::selection::{CoinRank, Recommendation, RotationSignal, Trend};

const BASE_SLIPPAGE: f64 = 0.0005;
const REASON_COMPONENT_DIFF: f64 = 10.0;

pub struct CoinRotator {
    config: SelectionConfig,
    last_rotation: Option<DateTime<Utc>>,
    week_start: Option<DateTime<Utc>>,
    rotations_this_week: u32,
    rejected: HashMap<String, DateTime<Utc>>,
}

impl CoinRotator {
    pub fn new(config: SelectionConfig) -> Self {
        Self {
            config,
            last_rotation: None,
            week_start: None,
            rotations_this_week: 0,
            rejected: HashMap::new(),
        }
    }

    pub fn rotations_this_week(&self) -> u32 {
        self.rotations_this_week
    }

    /// Time left before another rotation is allowed; zero when free
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.last_rotation {
            Some(last) => {
                let ready = last + Duration::hours(self.config.cooldown_hours);
                (ready - now).max(Duration::zero())
            }
            None => Duration::zero(),
        }
    }

    pub fn can_rotate(&mut self, now: DateTime<Utc>) -> bool {
        self.roll_week(now);
        if self.cooldown_remaining(now) > Duration::zero() {
            debug!(remaining = %self.cooldown_remaining(now), "rotation cooling down");
            return false;
        }
        self.rotations_this_week < self.config.max_rotations_per_week
    }

    /// Suggest replacing `current` with the top-ranked symbol when the gap
    /// clears the hysteresis margin
    pub fn check(&mut self, current: &str, rankings: &[CoinRank], now: DateTime<Utc>) -> Option<RotationSignal> {
        if !self.can_rotate(now) {
            return None;
        }
        let top = rankings.first()?;
        if top.symbol == current {
            return None;
        }
        let from = rankings.iter().find(|r| r.symbol == current)?;
        if top.recommendation == Recommendation::Avoid {
            return None;
        }

        let score_diff = top.score.final_score - from.score.final_score;
        if score_diff < self.config.score_threshold {
            debug!(from = current, to = %top.symbol, score_diff, "score gap below threshold");
            return None;
        }

        let key = rejection_key(current, &top.symbol);
        if let Some(rejected_at) = self.rejected.get(&key) {
            if now - *rejected_at < Duration::hours(self.config.rejection_cooldown_hours) {
                debug!(key, "rotation recently rejected");
                return None;
            }
        }

        let signal = RotationSignal {
            from_symbol: current.to_string(),
            to_symbol: top.symbol.clone(),
            score_diff,
            reason: rotation_reason(from, top),
            from_score: from.score.final_score,
            to_score: top.score.final_score,
            estimated_slippage: estimate_slippage(from, top),
            created_at: now,
        };
        info!("🔄 {}", signal);
        Some(signal)
    }

    pub fn record_rotation(&mut self, signal: &RotationSignal, now: DateTime<Utc>) {
        self.roll_week(now);
        self.last_rotation = Some(now);
        self.rotations_this_week += 1;
        self.rejected.remove(&rejection_key(&signal.from_symbol, &signal.to_symbol));
        info!(
            from = %signal.from_symbol,
            to = %signal.to_symbol,
            this_week = self.rotations_this_week,
            "✅ Rotation recorded"
        );
    }

    pub fn record_rejection(&mut self, signal: &RotationSignal, now: DateTime<Utc>) {
        self.rejected
            .insert(rejection_key(&signal.from_symbol, &signal.to_symbol), now);
        let horizon = Duration::hours(self.config.rejection_cooldown_hours);
        self.rejected.retain(|_, at| now - *at < horizon);
    }

    // Weeks start Monday 00:00 UTC
    fn roll_week(&mut self, now: DateTime<Utc>) {
        let days_from_monday = now.weekday().num_days_from_monday() as i64;
        let monday = (now - Duration::days(days_from_monday))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc());
        if monday != self.week_start {
            self.week_start = monday;
            self.rotations_this_week = 0;
        }
    }
}

fn rejection_key(from: &str, to: &str) -> String {
    format!("{}→{}", from, to)
}

fn rotation_reason(from: &CoinRank, to: &CoinRank) -> String {
    let (a, b) = (&from.score, &to.score);
    let components = [
        ("volatility", b.volatility_score - a.volatility_score),
        ("liquidity", b.liquidity_score - a.liquidity_score),
        ("mean reversion", b.mean_revert_score - a.mean_revert_score),
        ("momentum", b.momentum_score - a.momentum_score),
        ("stability", b.stability_score - a.stability_score),
    ];
    let mut parts: Vec<String> = components
        .iter()
        .filter(|(_, diff)| *diff > REASON_COMPONENT_DIFF)
        .map(|(name, diff)| format!("better {} (+{:.0})", name, diff))
        .collect();
    if to.trend == Trend::Up {
        parts.push(format!("{} trending up", to.symbol));
    }
    if from.trend == Trend::Down {
        parts.push(format!("{} trending down", from.symbol));
    }
    if parts.is_empty() {
        format!("higher overall score (+{:.1})", b.final_score - a.final_score)
    } else {
        parts.join(", ")
    }
}

/// Round-trip cost of closing one symbol and opening another, as a fraction
fn estimate_slippage(from: &CoinRank, to: &CoinRank) -> f64 {
    let avg_liquidity = (from.score.liquidity_score + to.score.liquidity_score) / 2.0;
    let avg_atr = (from.score.atr_pct + to.score.atr_pct) / 2.0;

    let mut slippage = BASE_SLIPPAGE;
    if avg_liquidity < 50.0 {
        slippage *= 2.0;
    } else if avg_liquidity < 70.0 {
        slippage *= 1.5;
    }
    if avg_atr > 0.05 {
        slippage *= 1.2;
    }
    (slippage * 10_000.0).round() / 10_000.0
}
