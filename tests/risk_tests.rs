// Integration tests for aggregate accounting and the protective triggers

mod common;

use chrono::Utc;

use common::synthetic_bars;
use grid_engine::core::types::{FillEvent, Order, PositionSide, ReconcileSnapshot, Side};
use grid_engine::engine::{risk_command, SymbolCommand};
use grid_engine::risk::SyncOutcome;
use grid_engine::{RiskAccountant, RiskAction, RiskConfig, SimExchange};

fn fill(id: &str, symbol: &str, side: Side, position_side: PositionSide, price: f64, qty: f64) -> FillEvent {
    FillEvent {
        fill_id: id.to_string(),
        client_id: format!("c-{}", id),
        symbol: symbol.to_string(),
        side,
        position_side,
        price,
        quantity: qty,
        fee: 0.0,
        is_final: true,
        timestamp: Utc::now(),
    }
}

fn sim_snapshot(sim: &SimExchange) -> ReconcileSnapshot {
    ReconcileSnapshot {
        account: sim.account_snapshot(),
        positions: sim.position_snapshots(),
        open_orders: sim.open_orders(),
    }
}

#[test]
fn test_drawdown_pauses_every_symbol_exactly_once() {
    let config = RiskConfig {
        max_drawdown: 0.10,
        ..RiskConfig::default()
    };
    let mut accountant = RiskAccountant::with_initial_equity(config, 1000.0);
    accountant.record_fill(&fill("x1", "XRPUSDC", Side::Buy, PositionSide::Long, 0.5, 1000.0));
    accountant.record_fill(&fill("d1", "DOGEUSDC", Side::Sell, PositionSide::Short, 0.1, 2000.0));

    // -25 on XRP and -20 on DOGE: 4.5% down
    accountant.mark("XRPUSDC", 0.475);
    accountant.mark("DOGEUSDC", 0.11);
    assert!(accountant.evaluate().is_empty());

    // -70 and -40: 11% down
    accountant.mark("XRPUSDC", 0.43);
    accountant.mark("DOGEUSDC", 0.12);
    let actions = accountant.evaluate();
    assert_eq!(actions.len(), 1);
    let (target, command) = risk_command(&actions[0]);
    assert!(target.is_none(), "pause goes to every controller");
    assert_eq!(command, SymbolCommand::Pause);

    // Deeper beyond the same threshold: no duplicate
    accountant.mark("XRPUSDC", 0.38);
    assert!(accountant.evaluate().is_empty());
    assert!(accountant.snapshot().drawdown_tripped);
}

#[test]
fn test_drawdown_trigger_rearms_after_recovery() {
    let config = RiskConfig {
        max_drawdown: 0.10,
        drawdown_rearm_fraction: 0.5,
        ..RiskConfig::default()
    };
    let mut accountant = RiskAccountant::with_initial_equity(config, 1000.0);
    accountant.record_fill(&fill("1", "XRPUSDC", Side::Buy, PositionSide::Long, 1.0, 1000.0));

    accountant.mark("XRPUSDC", 0.89);
    assert_eq!(accountant.evaluate().len(), 1);

    // 7% is below the trigger but above the 5% re-arm level: still tripped
    accountant.mark("XRPUSDC", 0.93);
    assert!(accountant.evaluate().is_empty());
    accountant.mark("XRPUSDC", 0.89);
    assert!(accountant.evaluate().is_empty());

    // 3% re-arms, the next crossing fires again
    accountant.mark("XRPUSDC", 0.97);
    assert!(accountant.evaluate().is_empty());
    assert!(!accountant.snapshot().drawdown_tripped);
    accountant.mark("XRPUSDC", 0.88);
    assert!(matches!(&accountant.evaluate()[..], [RiskAction::PauseAll { .. }]));
}

#[test]
fn test_margin_threshold_closes_everything() {
    let mut sim = SimExchange::new(1000.0, 0.0, "USDC");
    sim.set_leverage("XRPUSDC", 2.0);
    sim.on_price("XRPUSDC", 0.5);
    let order = Order::limit("open-1".to_string(), "XRPUSDC", Side::Buy, PositionSide::Long, 0.5, 2400.0);
    sim.submit(&order).unwrap();
    let fills = sim.on_price("XRPUSDC", 0.5);
    assert_eq!(fills.len(), 1);

    let mut accountant = RiskAccountant::new(RiskConfig::default());
    for f in &fills {
        accountant.record_fill(f);
    }
    accountant.apply_account_snapshot(&sim_snapshot(&sim));

    // 600 margin on 1000 equity
    let actions = accountant.evaluate();
    assert_eq!(actions.len(), 1);
    let (target, command) = risk_command(&actions[0]);
    assert!(target.is_none());
    assert_eq!(command, SymbolCommand::CloseAll);
    assert!(accountant.evaluate().is_empty());
}

#[test]
fn test_trailing_stop_targets_one_symbol() {
    let config = RiskConfig {
        trailing_enabled: true,
        trailing_start_profit: 5.0,
        trailing_drawdown_pct: 0.2,
        trailing_min_drawdown: 1.0,
        ..RiskConfig::default()
    };
    let mut accountant = RiskAccountant::with_initial_equity(config, 1000.0);
    accountant.record_fill(&fill("1", "XRPUSDC", Side::Buy, PositionSide::Long, 0.5, 100.0));
    accountant.record_fill(&fill("2", "DOGEUSDC", Side::Buy, PositionSide::Long, 0.1, 100.0));

    accountant.mark("XRPUSDC", 0.58); // +8, arms
    assert!(accountant.evaluate().is_empty());
    accountant.mark("XRPUSDC", 0.56); // gave back 2 >= max(1, 1.6)
    let actions = accountant.evaluate();
    assert_eq!(actions.len(), 1);
    let (target, command) = risk_command(&actions[0]);
    assert_eq!(target, Some("XRPUSDC"));
    assert_eq!(command, SymbolCommand::CloseAll);
}

#[test]
fn test_accountant_tracks_simulated_exchange() {
    let symbol = "XRPUSDC";
    let mut sim = SimExchange::new(1000.0, 0.0004, "USDC");
    sim.set_leverage(symbol, 20.0);
    let mut accountant = RiskAccountant::with_initial_equity(RiskConfig::default(), 1000.0);

    let bars = synthetic_bars(0.52, 200, 15, 21);
    sim.on_price(symbol, bars[0].open);

    // Resting buys and sells around the open; take-profits follow each fill
    let mut next_id = 0;
    for k in 1..=3 {
        for (side, position_side, price) in [
            (Side::Buy, PositionSide::Long, 0.52 * (1.0 - 0.006 * k as f64)),
            (Side::Sell, PositionSide::Short, 0.52 * (1.0 + 0.006 * k as f64)),
        ] {
            next_id += 1;
            let order = Order::limit(format!("o{}", next_id), symbol, side, position_side, price, 30.0);
            sim.submit(&order).unwrap();
        }
    }

    for bar in &bars {
        for f in sim.replay_bar(symbol, bar) {
            assert!(accountant.record_fill(&f));
            if f.side == f.position_side.open_side() {
                next_id += 1;
                let tp = match f.position_side {
                    PositionSide::Long => f.price * 1.004,
                    PositionSide::Short => f.price * 0.996,
                };
                let close = Order::limit(
                    format!("o{}", next_id),
                    symbol,
                    f.position_side.close_side(),
                    f.position_side,
                    tp,
                    f.quantity,
                );
                sim.submit(&close).unwrap();
            }
        }
        accountant.mark(symbol, bar.close);
    }

    let local = accountant.snapshot();
    assert!(local.fills_recorded > 0);
    assert!((local.equity - sim.equity()).abs() < 1e-6, "{} vs {}", local.equity, sim.equity());
    assert!((local.fees_paid - sim.fees_paid()).abs() < 1e-9);

    let position = sim.position(symbol).unwrap();
    let tracked = accountant.symbol(symbol).unwrap();
    assert!((tracked.net_position() - position.net_position()).abs() < 1e-9);

    // Agreeing views stay in sync and keep local positions
    match accountant.apply_account_snapshot(&sim_snapshot(&sim)) {
        SyncOutcome::InSync { drift } => assert!(drift < 1e-6),
        other => panic!("expected InSync, got {:?}", other),
    }
    assert!((accountant.equity() - sim.equity()).abs() < 1e-6);
}

#[test]
fn test_resync_replaces_local_positions() {
    let mut sim = SimExchange::new(1000.0, 0.0, "USDC");
    let mut accountant = RiskAccountant::new(RiskConfig::default());
    accountant.apply_account_snapshot(&sim_snapshot(&sim));

    // A fill the exchange never saw
    accountant.record_fill(&fill("ghost", "XRPUSDC", Side::Buy, PositionSide::Long, 0.5, 1000.0));
    accountant.mark("XRPUSDC", 0.6);
    sim.on_price("XRPUSDC", 0.6);

    let outcome = accountant.apply_account_snapshot(&sim_snapshot(&sim));
    assert!(matches!(outcome, SyncOutcome::Resynced { .. }));
    assert_eq!(accountant.symbol("XRPUSDC").map(|s| s.long_qty), Some(0.0));
    assert!((accountant.equity() - 1000.0).abs() < 1e-9);
}

#[test]
fn test_snapshot_balances_between_account_syncs() {
    let mut sim = SimExchange::new(1000.0, 0.0, "USDC");
    sim.set_leverage("XRPUSDC", 10.0);
    sim.on_price("XRPUSDC", 1.0);
    let order = Order::limit("open-1".to_string(), "XRPUSDC", Side::Buy, PositionSide::Long, 1.0, 1000.0);
    sim.submit(&order).unwrap();

    let mut accountant = RiskAccountant::new(RiskConfig::default());
    for f in sim.on_price("XRPUSDC", 1.0) {
        accountant.record_fill(&f);
    }
    accountant.apply_account_snapshot(&sim_snapshot(&sim));

    let synced = accountant.snapshot();
    assert!((synced.equity - (synced.available_balance + synced.margin_used)).abs() < 1e-9);
    assert!((synced.margin_used - 100.0).abs() < 1e-9);

    // The mark moves before the next account sync
    accountant.mark("XRPUSDC", 0.95);
    sim.on_price("XRPUSDC", 0.95);
    let marked = accountant.snapshot();
    assert!((marked.equity - 950.0).abs() < 1e-9);
    assert!((marked.equity - (marked.available_balance + marked.margin_used)).abs() < 1e-9);

    let exchange = sim.account_snapshot();
    assert!((marked.equity - exchange.equity()).abs() < 1e-9);
    assert!((marked.available_balance - exchange.available_balance()).abs() < 1e-9);
}

#[test]
fn test_baseline_requires_capital_or_sync() {
    let sim = SimExchange::new(1000.0, 0.0, "USDC");
    let mut accountant = RiskAccountant::new(RiskConfig::default());
    assert!(!accountant.snapshot().has_baseline);
    accountant.apply_account_snapshot(&sim_snapshot(&sim));
    assert!(accountant.snapshot().has_baseline);

    assert!(RiskAccountant::with_initial_equity(RiskConfig::default(), 1000.0).has_baseline());
}
