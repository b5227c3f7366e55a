// Aggregate equity/PnL accounting and protective triggers
//
// The accountant is the only writer of the aggregate view. Controllers report
// fills and position snapshots; the exchange supplies periodic full account
// snapshots. Both protective triggers are edge-triggered: they fire once when
// the threshold is crossed and re-arm only after the metric has recovered
// below `threshold * drawdown_rearm_fraction`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::core::position::SymbolState;
use crate::core::types::{AccountSnapshot, FillEvent, ReconcileSnapshot};

const FILL_MEMORY: usize = 8192;

/// Protective action requested from the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RiskAction {
    /// Pause every controller
    PauseAll { drawdown: f64 },
    /// Flatten every symbol
    CloseAll { margin_ratio: f64 },
    /// Trailing profit stop hit on one symbol
    CloseSymbol { symbol: String, peak_pnl: f64, pnl: f64 },
}

/// Result of comparing local state to an exchange snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    InSync { drift: f64 },
    /// Local positions were replaced by the exchange's; controllers must reconcile too
    Resynced { drift: f64 },
}

#[derive(Debug, Clone, Copy, Default)]
struct TrailingState {
    active: bool,
    peak: f64,
}

/// Consistent read-only view of the aggregate account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountantSnapshot {
    pub equity: f64,
    pub available_balance: f64,
    pub margin_used: f64,
    pub margin_ratio: f64,
    pub peak_equity: f64,
    pub drawdown: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub fees_paid: f64,
    pub fills_recorded: u64,
    pub drawdown_tripped: bool,
    pub margin_tripped: bool,
    pub positions: Vec<SymbolState>,
    pub last_sync: Option<DateTime<Utc>>,
    /// An equity baseline exists, from a known capital or an exchange snapshot
    #[serde(default)]
    pub has_baseline: bool,
}

impl AccountantSnapshot {
    pub fn total_positions(&self) -> f64 {
        self.positions.iter().map(|p| p.total_position()).sum()
    }
}

#[derive(Debug)]
pub struct RiskAccountant {
    config: RiskConfig,
    symbols: BTreeMap<String, SymbolState>,
    account: AccountSnapshot,
    has_snapshot: bool,
    has_initial_equity: bool,
    // equity = wallet at last snapshot + realized since then + open unrealized
    wallet_baseline: f64,
    realized_baseline: f64,
    peak_equity: f64,
    drawdown_tripped: bool,
    margin_tripped: bool,
    trailing: HashMap<String, TrailingState>,
    fills_recorded: u64,
    seen_fills: HashSet<String>,
    fill_order: VecDeque<String>,
}

impl RiskAccountant {
    /// Accountant whose baseline comes from the first account snapshot
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            symbols: BTreeMap::new(),
            account: AccountSnapshot::default(),
            has_snapshot: false,
            has_initial_equity: false,
            wallet_baseline: 0.0,
            realized_baseline: 0.0,
            peak_equity: 0.0,
            drawdown_tripped: false,
            margin_tripped: false,
            trailing: HashMap::new(),
            fills_recorded: 0,
            seen_fills: HashSet::new(),
            fill_order: VecDeque::new(),
        }
    }

    /// Accountant starting from a known capital, as in paper trading
    pub fn with_initial_equity(config: RiskConfig, equity: f64) -> Self {
        let mut accountant = Self::new(config);
        accountant.has_initial_equity = true;
        accountant.wallet_baseline = equity;
        accountant.peak_equity = equity;
        accountant
    }

    /// Equity is meaningful: either a starting capital was given or the
    /// exchange has been queried at least once
    pub fn has_baseline(&self) -> bool {
        self.has_initial_equity || self.has_snapshot
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn symbol(&self, symbol: &str) -> Option<&SymbolState> {
        self.symbols.get(symbol)
    }

    fn realized_total(&self) -> f64 {
        self.symbols.values().map(|s| s.realized_pnl).sum()
    }

    fn unrealized_total(&self) -> f64 {
        self.symbols.values().map(|s| s.unrealized_pnl).sum()
    }

    pub fn equity(&self) -> f64 {
        self.wallet_baseline + (self.realized_total() - self.realized_baseline) + self.unrealized_total()
    }

    pub fn drawdown(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity()) / self.peak_equity).clamp(0.0, 1.0)
    }

    pub fn margin_ratio(&self) -> f64 {
        let equity = self.equity();
        let margin = self.account.margin_used();
        if equity > 0.0 {
            margin / equity
        } else if margin > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    /// Apply one fill to the aggregate view. Replayed fills are ignored.
    pub fn record_fill(&mut self, fill: &FillEvent) -> bool {
        if !self.seen_fills.insert(fill.fill_id.clone()) {
            return false;
        }
        self.fill_order.push_back(fill.fill_id.clone());
        if self.fill_order.len() > FILL_MEMORY {
            if let Some(oldest) = self.fill_order.pop_front() {
                self.seen_fills.remove(&oldest);
            }
        }

        let state = self
            .symbols
            .entry(fill.symbol.clone())
            .or_insert_with(|| SymbolState::new(&fill.symbol));
        let outcome = state.apply_fill(fill);
        if state.mark_price <= 0.0 {
            state.mark(fill.price);
        } else {
            let mark = state.mark_price;
            state.mark(mark);
        }
        self.fills_recorded += 1;
        debug!(symbol = %fill.symbol, pnl = outcome.net_pnl(), "fill recorded");
        true
    }

    /// Replace a symbol's position with its controller's view
    pub fn update_symbol(&mut self, state: SymbolState) {
        self.symbols.insert(state.symbol.clone(), state);
    }

    pub fn mark(&mut self, symbol: &str, price: f64) {
        if let Some(state) = self.symbols.get_mut(symbol) {
            state.mark(price);
        }
    }

    /// Compare local state with the exchange. Beyond the tolerance the local
    /// positions are replaced wholesale. The wallet baseline always moves to
    /// the snapshot.
    pub fn apply_account_snapshot(&mut self, snapshot: &ReconcileSnapshot) -> SyncOutcome {
        let exchange_equity = snapshot.account.equity();
        let local_equity = self.equity();
        let drift = if self.has_snapshot || self.wallet_baseline > 0.0 {
            (local_equity - exchange_equity).abs() / exchange_equity.abs().max(1.0)
        } else {
            0.0
        };

        let resync = self.has_snapshot && drift > self.config.resync_tolerance;
        if resync {
            warn!(
                local = local_equity,
                exchange = exchange_equity,
                drift,
                "🔄 Equity drift beyond tolerance, forcing resync"
            );
            for state in self.symbols.values_mut() {
                match snapshot.position(&state.symbol) {
                    Some(position) => state.replace_position(position),
                    None => state.replace_position(&Default::default()),
                }
            }
            for position in &snapshot.positions {
                if !self.symbols.contains_key(&position.symbol) {
                    let mut state = SymbolState::new(&position.symbol);
                    state.replace_position(position);
                    self.symbols.insert(position.symbol.clone(), state);
                }
            }
        }

        self.account = snapshot.account.clone();
        self.wallet_baseline = exchange_equity - self.unrealized_total();
        self.realized_baseline = self.realized_total();
        if !self.has_snapshot {
            info!(equity = exchange_equity, "💰 Account baseline established");
            self.peak_equity = self.peak_equity.max(exchange_equity);
        }
        self.has_snapshot = true;

        if resync {
            SyncOutcome::Resynced { drift }
        } else {
            SyncOutcome::InSync { drift }
        }
    }

    /// Check the protective triggers and trailing stops
    pub fn evaluate(&mut self) -> Vec<RiskAction> {
        let mut actions = Vec::new();
        let equity = self.equity();
        self.peak_equity = self.peak_equity.max(equity);

        let drawdown = self.drawdown();
        let drawdown_rearm = self.config.max_drawdown * self.config.drawdown_rearm_fraction;
        if !self.drawdown_tripped && drawdown >= self.config.max_drawdown {
            self.drawdown_tripped = true;
            warn!(
                drawdown = format!("{:.2}%", drawdown * 100.0),
                equity,
                peak = self.peak_equity,
                "🚨 Drawdown limit crossed, pausing all grids"
            );
            actions.push(RiskAction::PauseAll { drawdown });
        } else if self.drawdown_tripped && drawdown < drawdown_rearm {
            self.drawdown_tripped = false;
            info!(drawdown, "✅ Drawdown recovered, trigger re-armed");
        }

        let margin_ratio = self.margin_ratio();
        let margin_rearm = self.config.margin_threshold * self.config.drawdown_rearm_fraction;
        if !self.margin_tripped && margin_ratio >= self.config.margin_threshold {
            self.margin_tripped = true;
            warn!(margin_ratio, "🚨 Margin usage above safety threshold, closing everything");
            actions.push(RiskAction::CloseAll { margin_ratio });
        } else if self.margin_tripped && margin_ratio < margin_rearm {
            self.margin_tripped = false;
            info!(margin_ratio, "✅ Margin usage recovered, trigger re-armed");
        }

        if self.config.trailing_enabled {
            self.evaluate_trailing(&mut actions);
        }
        actions
    }

    fn evaluate_trailing(&mut self, actions: &mut Vec<RiskAction>) {
        for (symbol, state) in &self.symbols {
            let trailing = self.trailing.entry(symbol.clone()).or_default();
            if state.is_flat() {
                *trailing = TrailingState::default();
                continue;
            }
            let pnl = state.unrealized_pnl;

            if trailing.active {
                if pnl > trailing.peak {
                    trailing.peak = pnl;
                    debug!(%symbol, pnl, "trailing stop new high");
                }
                let trigger = self.config.trailing_min_drawdown.max(trailing.peak * self.config.trailing_drawdown_pct);
                if trailing.peak - pnl >= trigger {
                    info!(%symbol, peak = trailing.peak, pnl, "🎯 Trailing profit stop triggered");
                    actions.push(RiskAction::CloseSymbol {
                        symbol: symbol.clone(),
                        peak_pnl: trailing.peak,
                        pnl,
                    });
                    *trailing = TrailingState::default();
                }
            } else if pnl >= self.config.trailing_start_profit {
                info!(%symbol, pnl, "🎯 Trailing profit stop armed");
                *trailing = TrailingState { active: true, peak: pnl };
            }
        }
    }

    /// Consistent view: `equity == available_balance + margin_used` whenever
    /// equity covers the committed margin.
    pub fn snapshot(&self) -> AccountantSnapshot {
        let equity = self.equity();
        let margin_used = self.account.margin_used();
        AccountantSnapshot {
            equity,
            available_balance: (equity - margin_used).max(0.0),
            margin_used,
            margin_ratio: self.margin_ratio(),
            peak_equity: self.peak_equity,
            drawdown: self.drawdown(),
            realized_pnl: self.realized_total(),
            unrealized_pnl: self.unrealized_total(),
            fees_paid: self.symbols.values().map(|s| s.fees_paid).sum(),
            fills_recorded: self.fills_recorded,
            drawdown_tripped: self.drawdown_tripped,
            margin_tripped: self.margin_tripped,
            positions: self.symbols.values().cloned().collect(),
            last_sync: self.account.timestamp,
            has_baseline: self.has_baseline(),
        }
    }
}
