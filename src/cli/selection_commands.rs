// Score command: rank candidate symbols from CSV history
use chrono::Utc;
use tracing::{info, warn};

use grid_engine::backtesting::load_csv;
use grid_engine::selection::ranker::{format_table, Candidate};
use grid_engine::{CoinRanker, CoinRotator, CoinScorer, EngineConfig, TradingError, TradingResult};

fn parse_candidate(spec: &str) -> TradingResult<(String, String)> {
    match spec.split_once('=') {
        Some((symbol, path)) if !symbol.trim().is_empty() && !path.trim().is_empty() => {
            Ok((symbol.trim().to_uppercase(), path.trim().to_string()))
        }
        _ => Err(TradingError::Selection(format!(
            "expected SYMBOL=path.csv, got {:?}",
            spec
        ))),
    }
}

pub fn score_candidates(
    config: &EngineConfig,
    specs: &[String],
    current: Option<&str>,
    interval_minutes: u32,
) -> TradingResult<()> {
    let mut candidates = Vec::with_capacity(specs.len());
    for spec in specs {
        let (symbol, path) = parse_candidate(spec)?;
        match load_csv(&path, &symbol, interval_minutes) {
            Ok(data) => candidates.push(Candidate::from_history(&data)),
            Err(err) => warn!(%symbol, %err, "⚠️  Skipping candidate"),
        }
    }

    let now = Utc::now();
    let scorer = CoinScorer::new(&config.selection.weights)?;
    let mut ranker = CoinRanker::new(scorer);
    let rankings = ranker.rank(&candidates, now);
    info!("🏅 Ranked {} of {} candidates", rankings.len(), specs.len());
    println!("{}", format_table(&rankings));

    if let Some(current) = current {
        let current = current.to_uppercase();
        let mut rotator = CoinRotator::new(config.selection.clone());
        match rotator.check(&current, &rankings, now) {
            Some(signal) => println!(
                "\n🔄 {}\n   estimated slippage {:.2}%",
                signal,
                signal.estimated_slippage * 100.0
            ),
            None => println!("\n✅ Keep {}: no candidate clears the rotation threshold", current),
        }
    }
    Ok(())
}
