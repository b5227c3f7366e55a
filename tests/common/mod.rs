// Common test utilities and helpers
#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

use grid_engine::backtesting::HistoricalData;
use grid_engine::core::types::Bar;
use grid_engine::{EngineConfig, GridConfig};

/// The reference XRPUSDC grid
pub fn xrp_grid() -> GridConfig {
    GridConfig::new("XRPUSDC", 0.004, 0.006, 30.0, 20)
}

/// Engine configuration with one symbol and fast timers
pub fn create_test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.symbols = vec![xrp_grid()];
    config.gateway.account_snapshot_secs = 1;
    config.gateway.stop_drain_timeout_ms = 200;
    config.gateway.retry_base_delay_ms = 1;
    config.gateway.retry_max_delay_ms = 2;
    config.status.interval_ms = 20;
    config
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap()
}

/// Seeded mean-reverting random walk, so every run sees the same bars
pub fn synthetic_bars(base_price: f64, count: usize, interval_minutes: i64, seed: u64) -> Vec<Bar> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bars = Vec::with_capacity(count);
    let mut close = base_price;

    for i in 0..count {
        let open = close;
        let pull = (base_price - open) / base_price * 0.05;
        let shock: f64 = rng.gen_range(-0.006..0.006);
        close = (open * (1.0 + pull + shock)).max(base_price * 0.2);
        let wick_up: f64 = rng.gen_range(0.0..0.003);
        let wick_down: f64 = rng.gen_range(0.0..0.003);
        bars.push(Bar {
            timestamp: start_time() + Duration::minutes(i as i64 * interval_minutes),
            open,
            high: open.max(close) * (1.0 + wick_up),
            low: open.min(close) * (1.0 - wick_down),
            close,
            volume: rng.gen_range(50_000.0..150_000.0),
        });
    }
    bars
}

/// Steady decline, for drawdown scenarios
pub fn falling_bars(base_price: f64, count: usize, interval_minutes: i64, step: f64) -> Vec<Bar> {
    (0..count)
        .map(|i| {
            let open = base_price * (1.0 - step).powi(i as i32);
            let close = open * (1.0 - step);
            Bar {
                timestamp: start_time() + Duration::minutes(i as i64 * interval_minutes),
                open,
                high: open * 1.0005,
                low: close * 0.9995,
                close,
                volume: 100_000.0,
            }
        })
        .collect()
}

/// 30 days of 15-minute XRPUSDC bars
pub fn xrp_month() -> HistoricalData {
    HistoricalData::new("XRPUSDC", 15, synthetic_bars(0.52, 30 * 96, 15, 7))
}

/// Write bars as a CSV file inside a fresh temp dir
pub fn write_csv(bars: &[Bar], name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).expect("Failed to create csv");
    writeln!(file, "timestamp,open,high,low,close,volume").unwrap();
    for bar in bars {
        writeln!(
            file,
            "{},{},{},{},{},{}",
            bar.timestamp.timestamp_millis(),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume
        )
        .unwrap();
    }
    (dir, path)
}

pub fn create_temp_config_path() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let path = temp_dir.path().join("config.toml");
    (temp_dir, path)
}
