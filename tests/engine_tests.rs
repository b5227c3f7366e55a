// Integration tests for the live runtime against the simulated gateway

mod common;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use common::{create_test_config, xrp_grid};
use grid_engine::core::controller::ControllerSnapshot;
use grid_engine::core::types::{
    AccountSnapshot, FillEvent, GatewayEvent, OpenOrder, Order, OrderHandle, PositionSide, PositionSnapshot, Side,
    TickUpdate,
};
use grid_engine::{
    ControllerState, Engine, EngineCommand, EngineConfig, ExecutionGateway, GatewayError, GridConfig, RiskAccountant,
    SimExchange, SimulatedGateway, StatusBroadcaster, TradingError,
};

const WAIT: Duration = Duration::from_secs(5);

fn gateway(capital: f64) -> Arc<SimulatedGateway> {
    let mut exchange = SimExchange::new(capital, 0.0002, "USDC");
    exchange.set_leverage("XRPUSDC", 20.0);
    exchange.set_leverage("DOGEUSDC", 10.0);
    Arc::new(SimulatedGateway::new(exchange))
}

fn doge_grid() -> GridConfig {
    GridConfig::new("DOGEUSDC", 0.005, 0.008, 400.0, 10)
}

fn start_engine(config: &EngineConfig, gateway: &Arc<SimulatedGateway>) -> Engine {
    let accountant = RiskAccountant::with_initial_equity(config.risk.clone(), 10_000.0);
    Engine::with_accountant(config, gateway.clone(), accountant)
}

fn tick(gateway: &SimulatedGateway, symbol: &str, price: f64) {
    gateway.feed_tick(TickUpdate::at_price(symbol, price, 1_000.0, Utc::now()));
}

/// Keep ticking `price` until the symbol's snapshot satisfies `predicate`.
/// The feed pump subscribes asynchronously, so a single early tick can be missed.
async fn tick_until<F>(
    engine: &Engine,
    gateway: &SimulatedGateway,
    symbol: &str,
    price: f64,
    predicate: F,
) -> Option<ControllerSnapshot>
where
    F: Fn(&ControllerSnapshot) -> bool,
{
    for _ in 0..100 {
        tick(gateway, symbol, price);
        if let Some(snapshot) = engine.wait_for(symbol, Duration::from_millis(50), &predicate).await {
            return Some(snapshot);
        }
    }
    None
}

async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Simulated exchange whose account endpoint answers slowly, like a REST
/// round-trip at startup
struct SlowAccountGateway {
    inner: Arc<SimulatedGateway>,
    delay: Duration,
}

#[async_trait]
impl ExecutionGateway for SlowAccountGateway {
    fn name(&self) -> &str {
        "slow-account"
    }

    async fn submit(&self, order: &Order) -> Result<OrderHandle, GatewayError> {
        self.inner.submit(order).await
    }

    async fn cancel(&self, handle: &OrderHandle) -> Result<(), GatewayError> {
        self.inner.cancel(handle).await
    }

    fn stream(&self) -> BoxStream<'static, GatewayEvent> {
        self.inner.stream()
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
        tokio::time::sleep(self.delay).await;
        self.inner.account_snapshot().await
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        self.inner.positions().await
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        self.inner.open_orders().await
    }

    async fn funding_rate(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        self.inner.funding_rate(symbol).await
    }
}

fn is_active(s: &ControllerSnapshot) -> bool {
    s.state == ControllerState::Active
}

fn open_orders(gateway: &SimulatedGateway, symbol: &str) -> usize {
    gateway.with_exchange(|ex| ex.open_orders().iter().filter(|o| o.symbol == symbol).count())
}

#[tokio::test]
async fn test_symbol_waits_for_price_then_places_ladder() {
    let config = create_test_config();
    let gateway = gateway(10_000.0);
    let engine = start_engine(&config, &gateway);

    engine.start_symbol(xrp_grid()).await.unwrap();
    assert_eq!(engine.symbols(), vec!["XRPUSDC".to_string()]);
    let waiting = engine.snapshot("XRPUSDC").unwrap();
    assert_ne!(waiting.state, ControllerState::Active);

    let active = tick_until(&engine, &gateway, "XRPUSDC", 0.52, is_active)
        .await
        .expect("grid becomes active");
    assert!(active.anchor.is_some());
    assert!(active.active_entries() > 0);
    assert_eq!(open_orders(&gateway, "XRPUSDC"), config.strategy.ladder_depth * 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_waits_for_account_baseline() {
    let config = create_test_config();
    let sim = gateway(10_000.0);
    let slow = Arc::new(SlowAccountGateway {
        inner: sim.clone(),
        delay: Duration::from_millis(400),
    });
    let engine = Engine::start(&config, slow);
    assert!(!engine.account().has_baseline);

    engine.start_symbol(xrp_grid()).await.unwrap();
    let active = tick_until(&engine, &sim, "XRPUSDC", 0.52, |s| is_active(s) && s.active_entries() > 0)
        .await
        .expect("ladder placed once the account is known");
    assert!(active.degraded.is_none());
    assert!(engine.account().has_baseline);
    assert_eq!(open_orders(&sim, "XRPUSDC"), config.strategy.ladder_depth * 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restarting_unchanged_symbol_is_noop() {
    let config = create_test_config();
    let gateway = gateway(10_000.0);
    let engine = start_engine(&config, &gateway);

    engine.start_symbol(xrp_grid()).await.unwrap();
    let first = tick_until(&engine, &gateway, "XRPUSDC", 0.52, is_active).await.unwrap();

    engine.start_symbol(xrp_grid()).await.unwrap();
    assert_eq!(engine.symbols().len(), 1);
    let again = engine.wait_for("XRPUSDC", WAIT, is_active).await.unwrap();
    assert_eq!(again.generation, first.generation);
    assert_eq!(open_orders(&gateway, "XRPUSDC"), config.strategy.ladder_depth * 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_grid_is_refused() {
    let config = create_test_config();
    let gateway = gateway(10_000.0);
    let engine = start_engine(&config, &gateway);

    let err = engine
        .start_symbol(GridConfig::new("XRPUSDC", 0.0, 0.006, 30.0, 20))
        .await
        .unwrap_err();
    assert_eq!(err.category(), "config");
    assert!(engine.symbols().is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_symbol_command_fails() {
    let config = create_test_config();
    let gateway = gateway(10_000.0);
    let engine = start_engine(&config, &gateway);

    match engine.command(Some("BTCUSDC"), EngineCommand::Pause) {
        Err(TradingError::SymbolNotFound(symbol)) => assert_eq!(symbol, "BTCUSDC"),
        other => panic!("expected SymbolNotFound, got {:?}", other),
    }
    // Broadcasting to nobody is not an error
    assert_eq!(engine.command(None, EngineCommand::Pause).unwrap(), 0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_and_resume_are_idempotent() {
    let config = create_test_config();
    let gateway = gateway(10_000.0);
    let engine = start_engine(&config, &gateway);

    engine.start_symbol(xrp_grid()).await.unwrap();
    tick_until(&engine, &gateway, "XRPUSDC", 0.52, is_active).await.unwrap();

    assert_eq!(engine.command(Some("XRPUSDC"), EngineCommand::Pause).unwrap(), 1);
    assert_eq!(engine.command(Some("XRPUSDC"), EngineCommand::Pause).unwrap(), 1);
    let paused = engine
        .wait_for("XRPUSDC", WAIT, |s| s.state == ControllerState::Paused)
        .await
        .expect("paused");
    assert_eq!(paused.state, ControllerState::Paused);
    // No inventory yet, so pausing leaves nothing resting
    assert!(eventually(|| open_orders(&gateway, "XRPUSDC") == 0).await);

    assert_eq!(engine.command(Some("XRPUSDC"), EngineCommand::Resume).unwrap(), 1);
    assert_eq!(engine.command(Some("XRPUSDC"), EngineCommand::Resume).unwrap(), 1);
    engine.wait_for("XRPUSDC", WAIT, is_active).await.expect("active again");
    assert!(eventually(|| open_orders(&gateway, "XRPUSDC") > 0).await);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fills_reach_controller_and_accountant() {
    let config = create_test_config();
    let gateway = gateway(10_000.0);
    let engine = start_engine(&config, &gateway);

    engine.start_symbol(xrp_grid()).await.unwrap();
    tick_until(&engine, &gateway, "XRPUSDC", 0.52, is_active).await.unwrap();

    // Just through the first buy level at 0.52 * (1 - 0.006)
    tick(&gateway, "XRPUSDC", 0.5165);
    let filled = engine
        .wait_for("XRPUSDC", WAIT, |s| s.position.long_qty > 0.0)
        .await
        .expect("long entry filled");
    assert_eq!(filled.position.long_qty, 30.0);
    assert!(filled.active_take_profits() >= 1);

    assert!(eventually(|| engine.account().fills_recorded >= 1).await);
    let account = engine.account();
    assert!(account.fees_paid > 0.0);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_close_all_broadcast_is_idempotent() {
    let config = create_test_config();
    let gateway = gateway(10_000.0);
    let engine = start_engine(&config, &gateway);

    engine.start_symbol(xrp_grid()).await.unwrap();
    engine.start_symbol(doge_grid()).await.unwrap();
    tick_until(&engine, &gateway, "XRPUSDC", 0.52, is_active).await.unwrap();
    tick_until(&engine, &gateway, "DOGEUSDC", 0.12, is_active).await.unwrap();

    assert_eq!(engine.command(None, EngineCommand::CloseAll).unwrap(), 2);
    let closing = |s: &ControllerSnapshot| matches!(s.state, ControllerState::Closing | ControllerState::Stopped);
    for symbol in ["XRPUSDC", "DOGEUSDC"] {
        let snapshot = engine.wait_for(symbol, WAIT, closing).await.expect("closing");
        assert!(snapshot.position.is_flat());
    }

    // Still accepted, but nothing new happens
    assert_eq!(engine.command(None, EngineCommand::CloseAll).unwrap(), 2);
    assert!(eventually(|| open_orders(&gateway, "XRPUSDC") == 0 && open_orders(&gateway, "DOGEUSDC") == 0).await);
    for symbol in ["XRPUSDC", "DOGEUSDC"] {
        assert!(closing(&engine.snapshot(symbol).unwrap()));
    }

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_cancels_orders_and_keeps_runner() {
    let config = create_test_config();
    let gateway = gateway(10_000.0);
    let engine = start_engine(&config, &gateway);

    engine.start_symbol(xrp_grid()).await.unwrap();
    tick_until(&engine, &gateway, "XRPUSDC", 0.52, is_active).await.unwrap();

    assert_eq!(engine.command(Some("XRPUSDC"), EngineCommand::Stop).unwrap(), 1);
    engine
        .wait_for("XRPUSDC", WAIT, |s| s.state == ControllerState::Stopped)
        .await
        .expect("stopped");
    assert!(eventually(|| open_orders(&gateway, "XRPUSDC") == 0).await);

    // A stopped runner takes Start again on the next price
    assert_eq!(engine.command(Some("XRPUSDC"), EngineCommand::Start).unwrap(), 1);
    tick_until(&engine, &gateway, "XRPUSDC", 0.52, is_active)
        .await
        .expect("restarted");

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_drawdown_pauses_every_symbol_once() {
    let mut config = create_test_config();
    config.risk.max_drawdown = 0.10;
    // One sync at startup only, so the position below is not reconciled away
    config.gateway.account_snapshot_secs = 600;
    let gateway = gateway(10_000.0);

    let mut accountant = RiskAccountant::with_initial_equity(config.risk.clone(), 10_000.0);
    accountant.record_fill(&FillEvent {
        fill_id: "carried".to_string(),
        client_id: "carried".to_string(),
        symbol: "XRPUSDC".to_string(),
        side: Side::Buy,
        position_side: PositionSide::Long,
        price: 0.52,
        quantity: 10_000.0,
        fee: 0.0,
        is_final: true,
        timestamp: Utc::now(),
    });
    accountant.mark("XRPUSDC", 0.52);
    let engine = Engine::with_accountant(&config, gateway.clone(), accountant);

    engine.start_symbol(xrp_grid()).await.unwrap();
    engine.start_symbol(doge_grid()).await.unwrap();
    tick_until(&engine, &gateway, "XRPUSDC", 0.52, is_active).await.unwrap();
    tick_until(&engine, &gateway, "DOGEUSDC", 0.12, is_active).await.unwrap();
    assert!(!engine.account().drawdown_tripped);

    // 10_000 * 0.12 = 1_200 lost on 10_000
    let paused = |s: &ControllerSnapshot| s.state == ControllerState::Paused;
    tick_until(&engine, &gateway, "XRPUSDC", 0.40, paused)
        .await
        .expect("risk supervisor pauses XRP");
    engine.wait_for("DOGEUSDC", WAIT, paused).await.expect("and DOGE");
    assert!(engine.account().drawdown_tripped);

    // Deeper losses over several risk evaluations deliver nothing new
    for _ in 0..25 {
        tick(&gateway, "XRPUSDC", 0.30);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(engine.account().drawdown > 0.2);
    for symbol in ["XRPUSDC", "DOGEUSDC"] {
        let snapshot = engine.snapshot(symbol).unwrap();
        assert_eq!(snapshot.state, ControllerState::Paused);
        assert_eq!(snapshot.pause_requests, 1, "{} paused more than once", symbol);
    }

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_broadcast_reports_symbols() {
    let config = create_test_config();
    let gateway = gateway(10_000.0);
    let mut engine = start_engine(&config, &gateway);

    engine.start_symbol(xrp_grid()).await.unwrap();
    tick_until(&engine, &gateway, "XRPUSDC", 0.52, is_active).await.unwrap();

    let broadcaster = StatusBroadcaster::new(&config.status);
    let mut rx = broadcaster.subscribe();
    engine.spawn_status(&broadcaster);

    let snapshot = tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("status within timeout")
        .expect("channel open");
    assert!(snapshot.sequence >= 1);
    assert!(snapshot.is_trading);
    assert_eq!(snapshot.positions.len(), 1);
    assert_eq!(snapshot.positions[0].symbol, "XRPUSDC");
    assert_eq!(snapshot.positions[0].state, Some(ControllerState::Active));

    let once = broadcaster.publish_once(engine.status_source().as_ref());
    assert!(once.sequence > snapshot.sequence);
    assert!((once.equity - 10_000.0).abs() < 1.0);

    engine.shutdown().await.unwrap();
}

#[test]
fn test_command_names_parse() {
    assert_eq!("close-all".parse::<EngineCommand>().unwrap(), EngineCommand::CloseAll);
    assert_eq!(" Pause ".parse::<EngineCommand>().unwrap(), EngineCommand::Pause);
    assert!("explode".parse::<EngineCommand>().is_err());
    assert_eq!(EngineCommand::CloseAll.to_string(), "close_all");
}
