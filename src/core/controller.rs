// Per-symbol grid controller
//
// A synchronous state machine. It consumes ticks, fills, acknowledgements and
// reconciliation snapshots and answers with order intents. The live runner and
// the backtester drive the same instance type, so both see identical decisions
// for identical inputs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, error, info, warn};

use crate::config::{GridConfig, StrategyConfig};
use crate::core::indicators::{IndicatorValues, LeadingIndicators};
use crate::core::inventory::{compute_skew, position_cap};
use crate::core::ladder::{crosses_mid, round_to_places, take_profit_price, uniqueness_tolerance, LadderSpec};
use crate::core::position::SymbolState;
use crate::core::types::{
    FillEvent, GridLevel, LevelId, LevelKind, LevelStatus, Order, PositionSide, PositionSnapshot,
    ReconcileSnapshot, TickUpdate, QTY_EPSILON,
};
use crate::gateway::GatewayError;

/// Inactive levels kept around so late fills still resolve to their level
const RETAINED_INACTIVE_LEVELS: usize = 512;
const FILL_MEMORY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    Init,
    PlacingLadder,
    Active,
    Paused,
    Closing,
    Stopped,
}

/// Order intent produced by the controller for its gateway
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    Submit(Order),
    Cancel { symbol: String, client_id: String },
}

impl ControllerAction {
    pub fn client_id(&self) -> &str {
        match self {
            ControllerAction::Submit(order) => &order.client_id,
            ControllerAction::Cancel { client_id, .. } => client_id,
        }
    }
}

/// Read-only view of one controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub symbol: String,
    pub state: ControllerState,
    pub degraded: Option<String>,
    pub position: SymbolState,
    pub anchor: Option<f64>,
    pub generation: u32,
    pub last_price: Option<f64>,
    pub funding_rate: Option<f64>,
    pub indicators: IndicatorValues,
    pub levels: Vec<GridLevel>,
    /// Pause requests received, including ones that changed nothing
    #[serde(default)]
    pub pause_requests: u32,
}

impl ControllerSnapshot {
    pub fn active_entries(&self) -> usize {
        self.levels.iter().filter(|l| l.kind.is_entry()).count()
    }

    pub fn active_take_profits(&self) -> usize {
        self.levels.iter().filter(|l| l.kind == LevelKind::TakeProfit).count()
    }
}

#[derive(Debug, Clone, Copy)]
struct CloseOrder {
    remaining: f64,
}

pub struct GridController {
    config: GridConfig,
    strategy: StrategyConfig,
    id_prefix: String,
    state: ControllerState,
    position: SymbolState,
    levels: BTreeMap<LevelId, GridLevel>,
    by_order: HashMap<String, LevelId>,
    close_orders: HashMap<String, CloseOrder>,
    replaced_by: HashMap<LevelId, LevelId>,
    next_level_id: LevelId,
    order_seq: u64,
    anchor: Option<f64>,
    generation: u32,
    last_mid: Option<f64>,
    funding_rate: Option<f64>,
    indicators: LeadingIndicators,
    degraded: Option<String>,
    stop_requested: bool,
    awaiting_reconcile: bool,
    seen_fills: HashSet<String>,
    fill_order: VecDeque<String>,
    price_decimals: Option<u32>,
    quantity_decimals: Option<u32>,
    pause_requests: u32,
}

impl GridController {
    /// Controller with a random client-id prefix, for live sessions
    pub fn new(config: GridConfig, strategy: StrategyConfig) -> Self {
        let prefix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        Self::with_id_prefix(config, strategy, &prefix)
    }

    /// Controller with a fixed client-id prefix, so replays are reproducible
    pub fn with_id_prefix(config: GridConfig, strategy: StrategyConfig, prefix: &str) -> Self {
        let position = SymbolState::new(&config.symbol);
        Self {
            config,
            strategy,
            id_prefix: prefix.to_string(),
            state: ControllerState::Init,
            position,
            levels: BTreeMap::new(),
            by_order: HashMap::new(),
            close_orders: HashMap::new(),
            replaced_by: HashMap::new(),
            next_level_id: 1,
            order_seq: 0,
            anchor: None,
            generation: 0,
            last_mid: None,
            funding_rate: None,
            indicators: LeadingIndicators::new(),
            degraded: None,
            stop_requested: false,
            awaiting_reconcile: false,
            seen_fills: HashSet::new(),
            fill_order: VecDeque::new(),
            price_decimals: None,
            quantity_decimals: None,
            pause_requests: 0,
        }
    }

    /// Exchange tick and lot precision
    pub fn with_precision(mut self, price_decimals: Option<u32>, quantity_decimals: Option<u32>) -> Self {
        self.price_decimals = price_decimals;
        self.quantity_decimals = quantity_decimals;
        self
    }

    pub fn symbol(&self) -> &str {
        &self.config.symbol
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn position(&self) -> &SymbolState {
        &self.position
    }

    pub fn anchor(&self) -> Option<f64> {
        self.anchor
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_mid
    }

    pub fn degraded_reason(&self) -> Option<&str> {
        self.degraded.as_deref()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    pub fn active_levels(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.values().filter(|l| l.status.is_active())
    }

    /// No submission is still waiting for its acknowledgement
    pub fn is_drained(&self) -> bool {
        !self.levels.values().any(|l| l.status == LevelStatus::Pending)
    }

    pub fn set_funding_rate(&mut self, rate: f64) {
        self.funding_rate = Some(rate);
    }

    pub fn indicators(&self) -> IndicatorValues {
        self.indicators.values()
    }

    // ---- commands ----

    /// Lay the initial ladder around `mid`. No-op unless INIT or STOPPED.
    pub fn start(&mut self, mid: f64, available_margin: f64) -> Vec<ControllerAction> {
        if !matches!(self.state, ControllerState::Init | ControllerState::Stopped) {
            debug!(symbol = %self.config.symbol, state = ?self.state, "start ignored");
            return Vec::new();
        }
        if !(mid > 0.0 && mid.is_finite()) {
            warn!(symbol = %self.config.symbol, mid, "⚠️  Cannot start without a valid price");
            return Vec::new();
        }

        if self.state == ControllerState::Stopped {
            self.reset_session();
        }

        let mut out = Vec::new();
        self.last_mid = Some(mid);
        self.position.mark(mid);
        self.generation += 1;
        self.state = ControllerState::PlacingLadder;

        let spec = self.ladder_spec(mid);
        self.anchor = Some(spec.anchor);

        let required: f64 = spec
            .build()
            .iter()
            .filter(|l| !crosses_mid(l.position_side, l.price, mid))
            .map(|l| l.price * l.quantity)
            .sum::<f64>()
            / self.config.leverage.max(1) as f64;

        if required > available_margin {
            self.mark_degraded(format!(
                "ladder needs {:.2} margin but only {:.2} is available",
                required, available_margin
            ));
        } else {
            self.place_ladder(&spec, &mut out);
        }

        self.ensure_take_profit_coverage(&mut out);
        self.maybe_activate();

        info!(
            symbol = %self.config.symbol,
            anchor = spec.anchor,
            levels = out.len(),
            "🎯 Grid started (gs {:.4}, tp {:.4})",
            self.config.grid_spacing,
            self.config.take_profit_spacing
        );
        out
    }

    /// Block new entries. Resting entries are withdrawn; take-profits stay.
    pub fn pause(&mut self) -> Vec<ControllerAction> {
        self.pause_requests += 1;
        if !matches!(self.state, ControllerState::Active | ControllerState::PlacingLadder) {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.state = ControllerState::Paused;
        self.cancel_entries(&mut out);
        info!(symbol = %self.config.symbol, "⏸️  Grid paused");
        out
    }

    /// Re-arm entries around the latest price
    pub fn resume(&mut self) -> Vec<ControllerAction> {
        if self.state != ControllerState::Paused {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.state = ControllerState::Active;
        if let Some(mid) = self.last_mid {
            self.recenter(mid, &mut out);
        }
        info!(symbol = %self.config.symbol, "▶️  Grid resumed");
        out
    }

    /// Cancel everything and flatten both books at market. Terminal for the session.
    pub fn close_all(&mut self) -> Vec<ControllerAction> {
        if matches!(self.state, ControllerState::Closing | ControllerState::Stopped) {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.cancel_where(|_| true, &mut out);
        self.stop_requested = false;
        self.state = ControllerState::Closing;

        warn!(
            symbol = %self.config.symbol,
            long = self.position.long_qty,
            short = self.position.short_qty,
            "🛑 Closing all positions"
        );
        self.advance_closing(&mut out);
        out
    }

    /// Cancel resting orders and stop once in-flight submissions are acknowledged.
    /// Inventory is left in place.
    pub fn stop(&mut self) -> Vec<ControllerAction> {
        match self.state {
            ControllerState::Stopped => return Vec::new(),
            ControllerState::Init => {
                self.state = ControllerState::Stopped;
                return Vec::new();
            }
            _ => {}
        }
        let mut out = Vec::new();
        self.stop_requested = true;
        self.cancel_where(|l| l.status == LevelStatus::Working, &mut out);
        self.maybe_finish_stop(&mut out);
        out
    }

    /// Stop without waiting for acknowledgements
    pub fn force_stop(&mut self) -> Vec<ControllerAction> {
        if self.state == ControllerState::Stopped {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.cancel_where(|_| true, &mut out);
        self.close_orders.clear();
        self.stop_requested = false;
        self.state = ControllerState::Stopped;
        warn!(symbol = %self.config.symbol, "⏹️  Grid force-stopped");
        out
    }

    // ---- gateway events ----

    pub fn on_tick(&mut self, tick: &TickUpdate) -> Vec<ControllerAction> {
        if tick.symbol != self.config.symbol {
            return Vec::new();
        }
        self.indicators.update(tick);
        if let Some(rate) = tick.funding_rate {
            self.funding_rate = Some(rate);
        }

        let mid = tick.mid();
        if !(mid > 0.0 && mid.is_finite()) {
            return Vec::new();
        }
        self.last_mid = Some(mid);
        self.position.mark(mid);

        let mut out = Vec::new();
        match self.state {
            ControllerState::Closing => self.advance_closing(&mut out),
            ControllerState::Active if self.entries_allowed() => {
                if let Some(anchor) = self.anchor {
                    let threshold = self.strategy.recenter_steps * self.config.grid_spacing * anchor;
                    if (mid - anchor).abs() >= threshold {
                        debug!(symbol = %self.config.symbol, mid, anchor, "recentering ladder");
                        self.recenter(mid, &mut out);
                    }
                }
            }
            _ => {}
        }
        out
    }

    pub fn on_ack(&mut self, client_id: &str) -> Vec<ControllerAction> {
        let mut out = Vec::new();
        if let Some(&id) = self.by_order.get(client_id) {
            if let Some(level) = self.levels.get_mut(&id) {
                if level.status == LevelStatus::Pending {
                    level.status = LevelStatus::Working;
                }
            }
            if self.stop_requested {
                self.cancel_level(id, &mut out);
            }
        }
        self.maybe_activate();
        self.maybe_finish_stop(&mut out);
        out
    }

    /// A submission failed after the gateway's own retries
    pub fn on_submit_failed(&mut self, client_id: &str, err: &GatewayError) -> Vec<ControllerAction> {
        let mut out = Vec::new();

        if self.close_orders.remove(client_id).is_some() {
            error!(symbol = %self.config.symbol, %err, "❌ Close order failed, retrying on next tick");
            self.mark_degraded(format!("close order failed: {}", err));
            return out;
        }

        if let Some(&id) = self.by_order.get(client_id) {
            if let Some(level) = self.levels.get_mut(&id) {
                if level.status.is_active() {
                    level.status = LevelStatus::Canceled;
                }
                warn!(
                    symbol = %self.config.symbol,
                    kind = ?level.kind,
                    price = level.price,
                    %err,
                    "⚠️  Order placement failed"
                );
            }
        }

        if degrades_symbol(err) {
            self.mark_degraded(err.to_string());
        }
        self.maybe_activate();
        self.maybe_finish_stop(&mut out);
        out
    }

    /// The exchange closed a resting order we did not fill
    pub fn on_cancel_ack(&mut self, client_id: &str) -> Vec<ControllerAction> {
        let mut out = Vec::new();
        let Some(&id) = self.by_order.get(client_id) else {
            return out;
        };
        let Some(level) = self.levels.get_mut(&id) else {
            return out;
        };
        if !level.status.is_active() {
            return out;
        }
        level.status = LevelStatus::Canceled;
        let was_take_profit = level.kind == LevelKind::TakeProfit;

        if was_take_profit {
            self.ensure_take_profit_coverage(&mut out);
        }
        self.maybe_activate();
        self.maybe_finish_stop(&mut out);
        out
    }

    pub fn on_fill(&mut self, fill: &FillEvent) -> Vec<ControllerAction> {
        let mut out = Vec::new();
        if fill.symbol != self.config.symbol || !self.remember_fill(&fill.fill_id) {
            debug!(fill_id = %fill.fill_id, "duplicate or foreign fill ignored");
            return out;
        }

        let outcome = self.position.apply_fill(fill);
        debug!(
            symbol = %self.config.symbol,
            side = ?fill.side,
            price = fill.price,
            qty = fill.quantity,
            pnl = outcome.net_pnl(),
            "fill applied"
        );

        if let Some(close) = self.close_orders.get_mut(&fill.client_id) {
            close.remaining -= fill.quantity;
            if close.remaining <= QTY_EPSILON || fill.is_final {
                self.close_orders.remove(&fill.client_id);
            }
            self.advance_closing(&mut out);
            return out;
        }

        match self.by_order.get(&fill.client_id).copied() {
            Some(id) => self.handle_level_fill(id, fill, &mut out),
            None => {
                warn!(
                    symbol = %self.config.symbol,
                    client_id = %fill.client_id,
                    "⚠️  Fill for an unknown order, covering inventory"
                );
                self.ensure_take_profit_coverage(&mut out);
            }
        }

        self.advance_closing(&mut out);
        self.prune();
        out
    }

    /// Stream dropped: no new entries until the next reconciliation
    pub fn on_disconnect(&mut self) {
        if !self.awaiting_reconcile {
            warn!(symbol = %self.config.symbol, "📡 Feed lost, holding entries until resync");
        }
        self.awaiting_reconcile = true;
    }

    /// Replace local position and order state with the exchange's view
    pub fn reconcile(&mut self, snapshot: &ReconcileSnapshot) -> Vec<ControllerAction> {
        let mut out = Vec::new();

        let exchange_view = snapshot.position(&self.config.symbol).cloned().unwrap_or_else(|| PositionSnapshot {
            symbol: self.config.symbol.clone(),
            ..Default::default()
        });
        self.position.replace_position(&exchange_view);

        let mut vanished = 0usize;
        for level in self.levels.values_mut() {
            if level.status == LevelStatus::Working && !snapshot.has_open_order(&level.order_id) {
                level.status = LevelStatus::Canceled;
                vanished += 1;
            }
        }
        self.close_orders.retain(|id, _| snapshot.has_open_order(id));
        self.awaiting_reconcile = false;

        info!(
            symbol = %self.config.symbol,
            long = self.position.long_qty,
            short = self.position.short_qty,
            vanished,
            "🔄 Reconciled with exchange"
        );

        match self.state {
            ControllerState::Closing => self.advance_closing(&mut out),
            ControllerState::PlacingLadder | ControllerState::Active | ControllerState::Paused => {
                self.trim_excess_take_profits(&mut out);
                self.ensure_take_profit_coverage(&mut out);
                if let Some(anchor) = self.anchor {
                    let spec = self.ladder_spec_at(anchor);
                    self.place_ladder(&spec, &mut out);
                }
            }
            _ => {}
        }
        self.maybe_activate();
        self.maybe_finish_stop(&mut out);
        out
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let mut position = self.position.clone();
        position.is_paused = self.state == ControllerState::Paused;
        position.is_trading = self.degraded.is_none()
            && matches!(
                self.state,
                ControllerState::PlacingLadder | ControllerState::Active | ControllerState::Paused | ControllerState::Closing
            );

        ControllerSnapshot {
            symbol: self.config.symbol.clone(),
            state: self.state,
            degraded: self.degraded.clone(),
            position,
            anchor: self.anchor,
            generation: self.generation,
            last_price: self.last_mid,
            funding_rate: self.funding_rate,
            indicators: self.indicators.values(),
            levels: self.active_levels().cloned().collect(),
            pause_requests: self.pause_requests,
        }
    }

    // ---- internals ----

    fn entries_allowed(&self) -> bool {
        matches!(self.state, ControllerState::PlacingLadder | ControllerState::Active)
            && self.degraded.is_none()
            && !self.awaiting_reconcile
            && !self.stop_requested
            && !(self.strategy.indicator_guard && self.indicators.values().is_extreme())
    }

    fn mark_degraded(&mut self, reason: String) {
        if self.degraded.is_none() {
            error!(symbol = %self.config.symbol, %reason, "🚫 Symbol degraded, entries halted");
            self.degraded = Some(reason);
        }
    }

    fn reset_session(&mut self) {
        self.levels.clear();
        self.by_order.clear();
        self.close_orders.clear();
        self.replaced_by.clear();
        self.anchor = None;
        self.degraded = None;
        self.stop_requested = false;
    }

    fn next_client_id(&mut self) -> String {
        self.order_seq += 1;
        format!("{}-{}-{:06}", self.config.symbol, self.id_prefix, self.order_seq)
    }

    fn round_quantity(&self, qty: f64) -> f64 {
        match self.quantity_decimals {
            Some(places) => {
                let factor = 10f64.powi(places as i32);
                (qty * factor + 1e-9).floor() / factor
            }
            None => qty,
        }
    }

    fn ladder_spec(&self, mid: f64) -> LadderSpec {
        let skew = compute_skew(
            &self.strategy,
            self.config.grid_spacing,
            self.position.long_qty,
            self.position.short_qty,
            self.funding_rate,
        );
        self.ladder_spec_at(skew.skewed_anchor(mid))
    }

    fn ladder_spec_at(&self, anchor: f64) -> LadderSpec {
        LadderSpec {
            anchor,
            grid_spacing: self.config.grid_spacing,
            depth: self.strategy.ladder_depth,
            long_quantity: self.entry_quantity(PositionSide::Long),
            short_quantity: self.entry_quantity(PositionSide::Short),
        }
    }

    fn entry_quantity(&self, side: PositionSide) -> f64 {
        let skew = compute_skew(
            &self.strategy,
            self.config.grid_spacing,
            self.position.long_qty,
            self.position.short_qty,
            self.funding_rate,
        );
        self.round_quantity(self.config.initial_quantity * skew.multiplier(side))
    }

    fn step_size(&self) -> f64 {
        self.anchor.or(self.last_mid).unwrap_or(0.0) * self.config.grid_spacing
    }

    fn side_capped(&self, side: PositionSide) -> bool {
        let cap = position_cap(self.config.initial_quantity, self.strategy.position_threshold_multiplier);
        self.position.qty(side) >= cap
    }

    fn has_active_level(&self, kind: LevelKind, side: PositionSide, price: f64, tolerance: f64) -> bool {
        self.levels.values().any(|l| {
            l.status.is_active() && l.kind == kind && l.position_side == side && (l.price - price).abs() < tolerance
        })
    }

    /// Submit every rung of `spec` that is allowed and not already resting
    fn place_ladder(&mut self, spec: &LadderSpec, out: &mut Vec<ControllerAction>) {
        let tolerance = uniqueness_tolerance(spec.step_size());
        for planned in spec.build() {
            if !self.entries_allowed() {
                break;
            }
            if let Some(mid) = self.last_mid {
                if crosses_mid(planned.position_side, planned.price, mid) {
                    continue;
                }
            }
            if self.side_capped(planned.position_side) {
                continue;
            }
            if self.has_active_level(planned.kind, planned.position_side, planned.price, tolerance) {
                continue;
            }
            self.submit_level(planned.kind, planned.position_side, planned.price, planned.quantity, None, out);
        }
    }

    fn recenter(&mut self, mid: f64, out: &mut Vec<ControllerAction>) {
        self.cancel_entries(out);
        self.generation += 1;
        let spec = self.ladder_spec(mid);
        self.anchor = Some(spec.anchor);
        self.place_ladder(&spec, out);
    }

    fn submit_level(
        &mut self,
        kind: LevelKind,
        position_side: PositionSide,
        price: f64,
        quantity: f64,
        parent: Option<LevelId>,
        out: &mut Vec<ControllerAction>,
    ) -> LevelId {
        let price = round_to_places(price, self.price_decimals);
        let id = self.next_level_id;
        self.next_level_id += 1;
        let client_id = self.next_client_id();

        let level = GridLevel {
            id,
            kind,
            position_side,
            price,
            quantity,
            filled_qty: 0.0,
            order_id: client_id.clone(),
            status: LevelStatus::Pending,
            parent,
            generation: self.generation,
        };
        let order = Order::limit(client_id.clone(), &self.config.symbol, level.order_side(), position_side, price, quantity);

        self.by_order.insert(client_id, id);
        self.levels.insert(id, level);
        out.push(ControllerAction::Submit(order));
        id
    }

    fn cancel_level(&mut self, id: LevelId, out: &mut Vec<ControllerAction>) {
        if let Some(level) = self.levels.get_mut(&id) {
            if level.status.is_active() {
                level.status = LevelStatus::Canceled;
                out.push(ControllerAction::Cancel {
                    symbol: self.config.symbol.clone(),
                    client_id: level.order_id.clone(),
                });
            }
        }
    }

    fn cancel_where<F>(&mut self, predicate: F, out: &mut Vec<ControllerAction>)
    where
        F: Fn(&GridLevel) -> bool,
    {
        let ids: Vec<LevelId> = self
            .levels
            .values()
            .filter(|l| l.status.is_active() && predicate(l))
            .map(|l| l.id)
            .collect();
        for id in ids {
            self.cancel_level(id, out);
        }
    }

    fn cancel_entries(&mut self, out: &mut Vec<ControllerAction>) {
        self.cancel_where(|l| l.kind.is_entry(), out);
    }

    fn handle_level_fill(&mut self, id: LevelId, fill: &FillEvent, out: &mut Vec<ControllerAction>) {
        let Some(level) = self.levels.get_mut(&id) else {
            return;
        };
        let was_canceled = level.status == LevelStatus::Canceled;
        level.filled_qty += fill.quantity;
        let done = fill.is_final || level.filled_qty >= level.quantity - QTY_EPSILON;
        if done {
            level.status = LevelStatus::Filled;
        }
        let (kind, side, parent) = (level.kind, level.position_side, level.parent);

        if kind.is_entry() {
            if matches!(self.state, ControllerState::Closing | ControllerState::Stopped) {
                return;
            }
            self.place_take_profit(id, side, fill.price, fill.quantity, out);
        } else {
            if was_canceled {
                self.shrink_replacement(id, fill.quantity, out);
            }
            if done {
                if let Some(parent_id) = parent {
                    self.maybe_rearm(parent_id, out);
                }
            }
        }
    }

    /// Opposing order for an entry fill. A resting untouched take-profit of the
    /// same entry is replaced by one covering both quantities.
    fn place_take_profit(
        &mut self,
        entry_id: LevelId,
        side: PositionSide,
        fill_price: f64,
        quantity: f64,
        out: &mut Vec<ControllerAction>,
    ) {
        let price = take_profit_price(side, fill_price, self.config.take_profit_spacing);
        let resting = self
            .levels
            .values()
            .find(|l| {
                l.parent == Some(entry_id)
                    && l.kind == LevelKind::TakeProfit
                    && l.status == LevelStatus::Working
                    && l.filled_qty <= QTY_EPSILON
            })
            .map(|l| (l.id, l.price, l.quantity));

        match resting {
            Some((child_id, child_price, child_qty)) => {
                let total = child_qty + quantity;
                let merged_price = (child_price * child_qty + price * quantity) / total;
                self.cancel_level(child_id, out);
                let new_id = self.submit_level(LevelKind::TakeProfit, side, merged_price, total, Some(entry_id), out);
                self.replaced_by.insert(child_id, new_id);
            }
            None => {
                self.submit_level(LevelKind::TakeProfit, side, price, quantity, Some(entry_id), out);
            }
        }
    }

    /// A canceled take-profit filled anyway; its replacement now covers too much
    fn shrink_replacement(&mut self, old_id: LevelId, filled: f64, out: &mut Vec<ControllerAction>) {
        let Some(new_id) = self.replaced_by.remove(&old_id) else {
            return;
        };
        let Some(replacement) = self.levels.get(&new_id) else {
            return;
        };
        if !replacement.status.is_active() {
            return;
        }
        let remaining = replacement.remaining() - filled;
        let (side, price, parent) = (replacement.position_side, replacement.price, replacement.parent);

        self.cancel_level(new_id, out);
        if remaining > QTY_EPSILON {
            let next = self.submit_level(LevelKind::TakeProfit, side, price, remaining, parent, out);
            self.replaced_by.insert(new_id, next);
        }
    }

    /// Put a fully round-tripped entry back on the book
    fn maybe_rearm(&mut self, parent_id: LevelId, out: &mut Vec<ControllerAction>) {
        let Some(parent) = self.levels.get(&parent_id) else {
            return;
        };
        if parent.status != LevelStatus::Filled || parent.generation != self.generation {
            return;
        }
        if self.levels.values().any(|l| l.parent == Some(parent_id) && l.status.is_active()) {
            return;
        }
        let (kind, side, price) = (parent.kind, parent.position_side, parent.price);

        if !self.entries_allowed() || self.side_capped(side) {
            return;
        }
        if let Some(mid) = self.last_mid {
            if crosses_mid(side, price, mid) {
                return;
            }
        }
        let tolerance = uniqueness_tolerance(self.step_size());
        if self.has_active_level(kind, side, price, tolerance) {
            return;
        }
        let quantity = self.entry_quantity(side);
        if quantity <= QTY_EPSILON {
            return;
        }
        self.submit_level(kind, side, price, quantity, None, out);
    }

    /// Place take-profits for inventory no resting take-profit covers
    fn ensure_take_profit_coverage(&mut self, out: &mut Vec<ControllerAction>) {
        if !matches!(
            self.state,
            ControllerState::PlacingLadder | ControllerState::Active | ControllerState::Paused
        ) {
            return;
        }
        for side in [PositionSide::Long, PositionSide::Short] {
            let held = self.position.qty(side);
            let covered: f64 = self
                .levels
                .values()
                .filter(|l| l.status.is_active() && l.kind == LevelKind::TakeProfit && l.position_side == side)
                .map(|l| l.remaining())
                .sum();
            let uncovered = self.round_quantity(held - covered);
            let avg = self.position.avg_price(side);
            if uncovered <= QTY_EPSILON.max(held * 1e-6) || avg <= 0.0 {
                continue;
            }
            let price = take_profit_price(side, avg, self.config.take_profit_spacing);
            info!(
                symbol = %self.config.symbol,
                side = ?side,
                qty = uncovered,
                price,
                "🎯 Covering inventory with take-profit"
            );
            self.submit_level(LevelKind::TakeProfit, side, price, uncovered, None, out);
        }
    }

    /// After a resync, cancel take-profits beyond the held quantity, farthest first
    fn trim_excess_take_profits(&mut self, out: &mut Vec<ControllerAction>) {
        for side in [PositionSide::Long, PositionSide::Short] {
            let held = self.position.qty(side);
            let mut resting: Vec<(LevelId, f64, f64)> = self
                .levels
                .values()
                .filter(|l| l.status.is_active() && l.kind == LevelKind::TakeProfit && l.position_side == side)
                .map(|l| (l.id, l.price, l.remaining()))
                .collect();
            let mut covered: f64 = resting.iter().map(|r| r.2).sum();
            if covered <= held + QTY_EPSILON {
                continue;
            }
            let reference = self.position.avg_price(side).max(self.last_mid.unwrap_or(0.0));
            resting.sort_by(|a, b| {
                let da = (a.1 - reference).abs();
                let db = (b.1 - reference).abs();
                db.total_cmp(&da)
            });
            for (id, _, qty) in resting {
                if covered <= held + QTY_EPSILON {
                    break;
                }
                self.cancel_level(id, out);
                covered -= qty;
            }
        }
    }

    fn submit_closes(&mut self, out: &mut Vec<ControllerAction>) {
        for side in [PositionSide::Long, PositionSide::Short] {
            let qty = self.position.qty(side);
            if qty <= QTY_EPSILON {
                continue;
            }
            let client_id = self.next_client_id();
            self.close_orders.insert(client_id.clone(), CloseOrder { remaining: qty });
            out.push(ControllerAction::Submit(Order::market_close(client_id, &self.config.symbol, side, qty)));
        }
    }

    fn advance_closing(&mut self, out: &mut Vec<ControllerAction>) {
        if self.state != ControllerState::Closing || !self.close_orders.is_empty() {
            return;
        }
        if self.position.is_flat() {
            self.state = ControllerState::Stopped;
            info!(
                symbol = %self.config.symbol,
                realized = self.position.realized_pnl,
                "✅ Positions closed, grid stopped"
            );
        } else {
            self.submit_closes(out);
        }
    }

    fn maybe_activate(&mut self) {
        if self.state == ControllerState::PlacingLadder && self.is_drained() {
            self.state = ControllerState::Active;
            debug!(symbol = %self.config.symbol, "ladder acknowledged, active");
        }
    }

    fn maybe_finish_stop(&mut self, out: &mut Vec<ControllerAction>) {
        if !self.stop_requested || !self.is_drained() {
            return;
        }
        self.cancel_where(|_| true, out);
        self.stop_requested = false;
        self.state = ControllerState::Stopped;
        info!(symbol = %self.config.symbol, "⏹️  Grid stopped");
    }

    fn remember_fill(&mut self, fill_id: &str) -> bool {
        if !self.seen_fills.insert(fill_id.to_string()) {
            return false;
        }
        self.fill_order.push_back(fill_id.to_string());
        if self.fill_order.len() > FILL_MEMORY {
            if let Some(oldest) = self.fill_order.pop_front() {
                self.seen_fills.remove(&oldest);
            }
        }
        true
    }

    /// Drop the oldest inactive levels nothing refers to any more
    fn prune(&mut self) {
        let inactive: Vec<LevelId> = self
            .levels
            .values()
            .filter(|l| !l.status.is_active())
            .map(|l| l.id)
            .collect();
        if inactive.len() <= RETAINED_INACTIVE_LEVELS {
            return;
        }
        let excess = inactive.len() - RETAINED_INACTIVE_LEVELS;
        for id in inactive.into_iter().take(excess) {
            let has_active_child = self.levels.values().any(|l| l.parent == Some(id) && l.status.is_active());
            if has_active_child || self.replaced_by.contains_key(&id) {
                continue;
            }
            if let Some(level) = self.levels.remove(&id) {
                self.by_order.remove(&level.order_id);
            }
        }
    }
}

/// Errors after which a symbol stops opening new inventory
fn degrades_symbol(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::InsufficientBalance(_)
            | GatewayError::Authentication(_)
            | GatewayError::Unsupported(_)
            | GatewayError::Transient(_)
            | GatewayError::RateLimited(_)
    )
}
