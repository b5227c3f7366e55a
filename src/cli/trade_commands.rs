// Run command: live or paper trading
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use grid_engine::clients::WsFeed;
use grid_engine::gateway::{event_stream, Backoff};
use grid_engine::{
    Engine, EngineConfig, ExecutionGateway, GridConfig, LiveGateway, RiskAccountant, SimExchange, SimulatedGateway,
    StatusBroadcaster, TradingError, TradingResult,
};

/// Log one status line in this many published snapshots
const STATUS_LOG_EVERY: u64 = 30;

fn selected_symbols(config: &EngineConfig, filter: Option<String>) -> TradingResult<Vec<GridConfig>> {
    let wanted: Option<Vec<String>> =
        filter.map(|f| f.split(',').map(|s| s.trim().to_uppercase()).filter(|s| !s.is_empty()).collect());
    let grids: Vec<GridConfig> = config
        .enabled_symbols()
        .filter(|g| wanted.as_ref().map_or(true, |w| w.contains(&g.symbol)))
        .cloned()
        .collect();
    if grids.is_empty() {
        return Err(TradingError::ConfigValidation("no enabled symbols selected".to_string()));
    }
    Ok(grids)
}

pub async fn run_engine(
    config: &EngineConfig,
    paper: bool,
    capital: Option<f64>,
    symbols: Option<String>,
    minutes: Option<f64>,
) -> TradingResult<()> {
    let grids = selected_symbols(config, symbols)?;
    let names: Vec<String> = grids.iter().map(|g| g.symbol.clone()).collect();
    let (feed_stop_tx, feed_stop_rx) = watch::channel(false);

    let mut live: Option<Arc<LiveGateway>> = None;
    let mut engine = if paper {
        let capital = capital.unwrap_or(config.backtest.initial_capital);
        info!("🧪 PAPER mode, capital {:.2} {}", capital, config.backtest.settlement_asset);

        let exchange = SimExchange::new(capital, config.backtest.fee_rate, &config.backtest.settlement_asset);
        let gateway = Arc::new(SimulatedGateway::new(exchange));
        for grid in &grids {
            gateway.set_leverage(&grid.symbol, grid.leverage as f64);
        }

        // Public tickers drive the simulated book
        let (ticker_tx, ticker_rx) = broadcast::channel(1024);
        let public = WsFeed::public(
            &config.exchange.public_ws_url,
            &config.exchange.product_type,
            names.clone(),
            Backoff::new(
                Duration::from_millis(config.gateway.reconnect_base_ms),
                Duration::from_millis(config.gateway.reconnect_max_ms),
            ),
        );
        tokio::spawn(public.run(ticker_tx, None, feed_stop_rx));
        gateway.attach_feed(event_stream(ticker_rx, "bitget-public"));

        let accountant = RiskAccountant::with_initial_equity(config.risk.clone(), capital);
        let gateway: Arc<dyn ExecutionGateway> = gateway;
        Engine::with_accountant(config, gateway, accountant)
    } else {
        info!("🚀 LIVE TRADING");
        warn!("⚠️  Real money!");
        let credentials = config.exchange.credentials()?;
        let gateway = Arc::new(LiveGateway::new(&config.exchange, &config.gateway, credentials));
        gateway.connect(names.clone());
        live = Some(Arc::clone(&gateway));
        let gateway: Arc<dyn ExecutionGateway> = gateway;
        Engine::start(config, gateway)
    };

    let broadcaster = StatusBroadcaster::new(&config.status);
    let mut status_rx = broadcaster.subscribe();
    engine.spawn_status(&broadcaster);
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(status) => {
                    debug!(sequence = status.sequence, equity = status.equity, "status");
                    if status.sequence % STATUS_LOG_EVERY == 1 {
                        info!(
                            "📊 Equity {:.2} | available {:.2} | drawdown {:.2}% | positions {:.4}",
                            status.equity,
                            status.available_balance,
                            status.drawdown * 100.0,
                            status.indicators.total_positions
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    for grid in grids {
        engine.start_symbol(grid).await?;
    }

    let deadline = minutes.map(|m| Duration::from_secs_f64(m.max(0.0) * 60.0));
    match deadline {
        Some(limit) => {
            info!("⏱️  Running for {:.1} minutes (Ctrl+C to stop early)", limit.as_secs_f64() / 60.0);
            tokio::select! {
                _ = tokio::time::sleep(limit) => info!("⏱️  Time limit reached"),
                _ = tokio::signal::ctrl_c() => info!("🛑 Interrupted"),
            }
        }
        None => {
            info!("⌨️  Press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            info!("🛑 Interrupted");
        }
    }

    let account = engine.account();
    engine.shutdown().await?;
    let _ = feed_stop_tx.send(true);
    if let Some(gateway) = live {
        gateway.shutdown().await;
    }

    info!(
        "💰 Session: equity {:.2}, realized {:.2}, fees {:.2}, fills {}",
        account.equity, account.realized_pnl, account.fees_paid, account.fills_recorded
    );
    Ok(())
}
