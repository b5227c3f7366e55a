// Grid-suitability scoring from recent bars
//
// Components, each 0-100:
//   volatility   ATR/price, best between 2% and 5%
//   liquidity    24h quote volume, full marks above 500M
//   mean_revert  Hurst exponent (R/S) with a bonus for a stationary ADF result
//   momentum     ADX, range-bound below 20 scores highest
//   stability    volume coefficient of variation plus the ADF p-value

use chrono::{DateTime, Duration, Utc};
use ndarray::{s, Array1};
use tracing::debug;

use crate::core::types::Bar;
use crate::selection::{CoinScore, ScoreWeights, SelectionError};

pub const MIN_BARS: usize = 50;

const OPTIMAL_ATR_MIN: f64 = 0.02;
const OPTIMAL_ATR_MAX: f64 = 0.05;
const MIN_VOLUME_24H: f64 = 50_000_000.0;
const GOOD_VOLUME_24H: f64 = 100_000_000.0;
const HIGH_VOLUME_24H: f64 = 500_000_000.0;
const GOOD_VOLUME_CV: f64 = 0.5;
const MAX_VOLUME_CV: f64 = 1.0;
const ADF_SIGNIFICANCE: f64 = 0.05;
const INDICATOR_PERIOD: usize = 14;
const HURST_MAX_LAG: usize = 20;

pub struct CoinScorer {
    weights: ScoreWeights,
}

impl CoinScorer {
    pub fn new(weights: &ScoreWeights) -> Result<Self, SelectionError> {
        Ok(Self {
            weights: weights.normalized()?,
        })
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Score one symbol from its recent bars and 24h quote volume
    pub fn score(
        &self,
        symbol: &str,
        bars: &[Bar],
        quote_volume_24h: f64,
        now: DateTime<Utc>,
    ) -> Result<CoinScore, SelectionError> {
        if bars.len() < MIN_BARS {
            return Err(SelectionError::InsufficientData {
                symbol: symbol.to_string(),
                bars: bars.len(),
                required: MIN_BARS,
            });
        }

        let closes: Array1<f64> = bars.iter().map(|b| b.close).collect();
        let highs: Array1<f64> = bars.iter().map(|b| b.high).collect();
        let lows: Array1<f64> = bars.iter().map(|b| b.low).collect();
        let volumes: Array1<f64> = bars.iter().map(|b| b.volume).collect();

        let atr_pct = atr_pct(&highs, &lows, &closes, INDICATOR_PERIOD);
        let hurst = hurst_exponent(&closes, HURST_MAX_LAG);
        let adf_pvalue = adf_pvalue(&closes);
        let adx = adx(&highs, &lows, &closes, INDICATOR_PERIOD);
        let volume_cv = volume_cv(&volumes);

        let volatility_score = volatility_score(atr_pct);
        let liquidity_score = liquidity_score(quote_volume_24h);
        let mean_revert_score = mean_revert_score(hurst, adf_pvalue);
        let momentum_score = momentum_score(adx);
        let stability_score = stability_score(volume_cv, adf_pvalue);

        let w = &self.weights;
        let final_score = volatility_score * w.volatility
            + liquidity_score * w.liquidity
            + mean_revert_score * w.mean_revert
            + momentum_score * w.momentum
            + stability_score * w.stability;

        debug!(symbol, final_score, atr_pct, hurst, adx, "scored");
        Ok(CoinScore {
            symbol: symbol.to_string(),
            volatility_score,
            liquidity_score,
            mean_revert_score,
            momentum_score,
            stability_score,
            final_score,
            atr_pct,
            quote_volume_24h,
            hurst_exponent: hurst,
            adf_pvalue,
            adx,
            volume_cv,
            scored_at: now,
        })
    }
}

/// Quote volume traded in the 24h ending at the last bar
pub fn quote_volume_24h(bars: &[Bar]) -> f64 {
    let Some(last) = bars.last() else {
        return 0.0;
    };
    let cutoff = last.timestamp - Duration::hours(24);
    bars.iter()
        .filter(|b| b.timestamp > cutoff)
        .map(|b| b.close * b.volume)
        .sum()
}

// ---- component scores ----

pub fn volatility_score(atr_pct: f64) -> f64 {
    if (OPTIMAL_ATR_MIN..=OPTIMAL_ATR_MAX).contains(&atr_pct) {
        let mid = (OPTIMAL_ATR_MIN + OPTIMAL_ATR_MAX) / 2.0;
        let deviation = (atr_pct - mid).abs() / (OPTIMAL_ATR_MAX - OPTIMAL_ATR_MIN) * 2.0;
        80.0 + (1.0 - deviation) * 20.0
    } else if (0.01..OPTIMAL_ATR_MIN).contains(&atr_pct) {
        60.0 + 20.0 * (atr_pct - 0.01) / (OPTIMAL_ATR_MIN - 0.01)
    } else if atr_pct > OPTIMAL_ATR_MAX && atr_pct <= 0.10 {
        80.0 - 20.0 * (atr_pct - OPTIMAL_ATR_MAX) / (0.10 - OPTIMAL_ATR_MAX)
    } else if atr_pct < 0.01 {
        (60.0 * atr_pct / 0.01).max(0.0)
    } else {
        (60.0 - 60.0 * (atr_pct - 0.10) / 0.10).max(0.0)
    }
}

pub fn liquidity_score(volume_24h: f64) -> f64 {
    if volume_24h >= HIGH_VOLUME_24H {
        100.0
    } else if volume_24h >= GOOD_VOLUME_24H {
        80.0 + 20.0 * (volume_24h - GOOD_VOLUME_24H) / (HIGH_VOLUME_24H - GOOD_VOLUME_24H)
    } else if volume_24h >= MIN_VOLUME_24H {
        60.0 + 20.0 * (volume_24h - MIN_VOLUME_24H) / (GOOD_VOLUME_24H - MIN_VOLUME_24H)
    } else {
        (60.0 * volume_24h / MIN_VOLUME_24H).max(0.0)
    }
}

pub fn mean_revert_score(hurst: f64, adf_pvalue: f64) -> f64 {
    let hurst_score = if hurst < 0.4 {
        80.0 + 15.0 * (0.4 - hurst) / 0.4
    } else if hurst < 0.5 {
        60.0 + 20.0 * (0.5 - hurst) / 0.1
    } else if hurst == 0.5 {
        50.0
    } else {
        (50.0 - 50.0 * (hurst - 0.5) / 0.5).max(0.0)
    };

    let adf_bonus = if adf_pvalue < ADF_SIGNIFICANCE {
        10.0 * (1.0 - adf_pvalue / ADF_SIGNIFICANCE)
    } else if adf_pvalue < 0.1 {
        5.0 * (0.1 - adf_pvalue) / 0.05
    } else {
        0.0
    };
    (hurst_score + adf_bonus).min(100.0)
}

pub fn momentum_score(adx: f64) -> f64 {
    if adx < 20.0 {
        80.0 + 20.0 * (20.0 - adx) / 20.0
    } else if adx <= 25.0 {
        60.0 + 20.0 * (25.0 - adx) / 5.0
    } else {
        (60.0 - 2.0 * (adx - 25.0)).max(0.0)
    }
}

pub fn stability_score(volume_cv: f64, adf_pvalue: f64) -> f64 {
    let volume_part = if volume_cv <= GOOD_VOLUME_CV {
        80.0 + 20.0 * (GOOD_VOLUME_CV - volume_cv) / GOOD_VOLUME_CV
    } else if volume_cv <= MAX_VOLUME_CV {
        60.0 + 20.0 * (MAX_VOLUME_CV - volume_cv) / (MAX_VOLUME_CV - GOOD_VOLUME_CV)
    } else {
        (60.0 - 30.0 * (volume_cv - MAX_VOLUME_CV)).max(0.0)
    };

    let adf_part = if adf_pvalue < 0.05 {
        90.0 + 10.0 * (0.05 - adf_pvalue) / 0.05
    } else if adf_pvalue < 0.10 {
        70.0 + 20.0 * (0.10 - adf_pvalue) / 0.05
    } else {
        (70.0 - 40.0 * (adf_pvalue - 0.10) / 0.40).max(30.0)
    };
    0.6 * volume_part + 0.4 * adf_part
}

// ---- indicators ----

fn true_range(highs: &Array1<f64>, lows: &Array1<f64>, closes: &Array1<f64>) -> Array1<f64> {
    let n = closes.len();
    (1..n)
        .map(|i| {
            let hl = highs[i] - lows[i];
            let hc = (highs[i] - closes[i - 1]).abs();
            let lc = (lows[i] - closes[i - 1]).abs();
            hl.max(hc).max(lc)
        })
        .collect()
}

/// Wilder-smoothed ATR as a fraction of the last close
pub fn atr_pct(highs: &Array1<f64>, lows: &Array1<f64>, closes: &Array1<f64>, period: usize) -> f64 {
    if closes.len() < period + 1 {
        return 0.0;
    }
    let tr = true_range(highs, lows, closes);
    let mut atr = tr.slice(s![..period]).mean().unwrap_or(0.0);
    for &value in tr.slice(s![period..]).iter() {
        atr = (atr * (period - 1) as f64 + value) / period as f64;
    }
    let price = closes[closes.len() - 1];
    if price > 0.0 {
        atr / price
    } else {
        0.0
    }
}

/// Hurst exponent by rescaled-range analysis, clipped to [0, 1]; 0.5 when undetermined
pub fn hurst_exponent(prices: &Array1<f64>, max_lag: usize) -> f64 {
    if prices.len() < max_lag * 2 || prices.iter().any(|p| *p <= 0.0) {
        return 0.5;
    }
    let log_returns = log_diff(prices);

    let mut points: Vec<(f64, f64)> = Vec::new();
    for lag in 2..=max_lag {
        let chunks = log_returns.len() / lag;
        if chunks < 1 {
            continue;
        }
        let mut rs_sum = 0.0;
        for chunk in log_returns.chunks_exact(lag).take(chunks) {
            let chunk = Array1::from_vec(chunk.to_vec());
            let mean = chunk.mean().unwrap_or(0.0);
            let mut cumulative = 0.0;
            let (mut lo, mut hi) = (f64::MAX, f64::MIN);
            for &x in chunk.iter() {
                cumulative += x - mean;
                lo = lo.min(cumulative);
                hi = hi.max(cumulative);
            }
            let sd = chunk.std(1.0);
            if sd > 0.0 {
                rs_sum += (hi - lo) / sd;
            }
        }
        let rs = rs_sum / chunks as f64;
        if rs > 0.0 {
            points.push(((lag as f64).ln(), rs.ln()));
        }
    }
    if points.len() < 3 {
        return 0.5;
    }
    linear_slope(&points).clamp(0.0, 1.0)
}

fn log_diff(prices: &Array1<f64>) -> Vec<f64> {
    let p = prices.to_vec();
    p.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

fn linear_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let mx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let my = points.iter().map(|p| p.1).sum::<f64>() / n;
    let num: f64 = points.iter().map(|(x, y)| (x - mx) * (y - my)).sum();
    let den: f64 = points.iter().map(|(x, _)| (x - mx).powi(2)).sum();
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Simplified Dickey-Fuller p-value bucket for the log-return series
pub fn adf_pvalue(prices: &Array1<f64>) -> f64 {
    if prices.len() < 30 || prices.iter().any(|p| *p <= 0.0) {
        return 1.0;
    }
    let diff = log_diff(prices);
    let y = Array1::from_vec(diff[1..].to_vec());
    let x = Array1::from_vec(diff[..diff.len() - 1].to_vec());
    if y.len() < 20 {
        return 1.0;
    }

    let n = y.len() as f64;
    let x_mean = x.mean().unwrap_or(0.0);
    let y_mean = y.mean().unwrap_or(0.0);
    let dx = &x - x_mean;
    let num = (&dx * &(&y - y_mean)).sum();
    let den = dx.mapv(|v| v * v).sum();
    if den == 0.0 {
        return 1.0;
    }
    let beta = num / den;
    let alpha = y_mean - beta * x_mean;
    let residuals = &y - &(x.mapv(|v| alpha + beta * v));
    let mse = residuals.mapv(|r| r * r).sum() / (n - 2.0);
    let se_beta = (mse / den).sqrt();
    if se_beta == 0.0 || !se_beta.is_finite() {
        return 1.0;
    }

    let t_stat = beta / se_beta;
    if t_stat < -3.43 {
        0.01
    } else if t_stat < -2.86 {
        0.05
    } else if t_stat < -2.57 {
        0.10
    } else if t_stat < -1.94 {
        0.20
    } else {
        0.50
    }
}

fn wilder_smooth(data: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; data.len()];
    if data.len() < period || period == 0 {
        return out;
    }
    let mut value = data[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(value);
    for i in period..data.len() {
        value = (value * (period - 1) as f64 + data[i]) / period as f64;
        out[i] = Some(value);
    }
    out
}

/// Average directional index with Wilder smoothing; 25 when undetermined
pub fn adx(highs: &Array1<f64>, lows: &Array1<f64>, closes: &Array1<f64>, period: usize) -> f64 {
    let n = closes.len();
    if n < period * 2 {
        return 25.0;
    }

    let mut plus_dm = Vec::with_capacity(n - 1);
    let mut minus_dm = Vec::with_capacity(n - 1);
    for i in 1..n {
        let up = highs[i] - highs[i - 1];
        let down = lows[i - 1] - lows[i];
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
    }
    let tr = true_range(highs, lows, closes).to_vec();

    let atr = wilder_smooth(&tr, period);
    let plus = wilder_smooth(&plus_dm, period);
    let minus = wilder_smooth(&minus_dm, period);

    // positions before the first smoothed value contribute a zero DX
    let dx: Vec<f64> = (0..tr.len())
        .map(|i| match (atr[i], plus[i], minus[i]) {
            (Some(a), Some(p), Some(m)) if a > 0.0 => {
                let plus_di = 100.0 * p / a;
                let minus_di = 100.0 * m / a;
                let sum = plus_di + minus_di;
                if sum > 0.0 {
                    100.0 * (plus_di - minus_di).abs() / sum
                } else {
                    0.0
                }
            }
            _ => 0.0,
        })
        .collect();

    wilder_smooth(&dx, period)
        .into_iter()
        .rev()
        .flatten()
        .next()
        .unwrap_or(25.0)
}

/// Population coefficient of variation; 1.0 when undetermined
pub fn volume_cv(volumes: &Array1<f64>) -> f64 {
    if volumes.len() < 10 {
        return 1.0;
    }
    let mean = volumes.mean().unwrap_or(0.0);
    if mean <= 0.0 {
        return 1.0;
    }
    volumes.std(0.0) / mean
}
