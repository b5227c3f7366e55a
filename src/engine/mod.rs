//! Live runtime: one runner task per symbol, a shared feed and a risk supervisor.
//!
//! The gateway stream is consumed once by a pump task and fanned out over a
//! broadcast channel. Each symbol's [`GridController`] lives inside its own
//! runner task and is reached only through the [`SymbolRegistry`]. The
//! supervisor task owns the [`RiskAccountant`]; runners report fills to it and
//! read its latest [`AccountantSnapshot`] through a watch channel.

pub mod registry;
pub mod runner;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, GatewayConfig, GridConfig, StrategyConfig};
use crate::core::controller::{ControllerSnapshot, GridController};
use crate::core::types::{ConnectionStatus, GatewayEvent};
use crate::error::{TradingError, TradingResult};
use crate::gateway::ExecutionGateway;
use crate::risk::{AccountantSnapshot, RiskAccountant, RiskAction, SyncOutcome};
use crate::status::{StatusBroadcaster, StatusSnapshot, StatusSource};

pub use registry::{SymbolHandle, SymbolRegistry};
pub use runner::{RunnerReport, SymbolCommand};

const FEED_CAPACITY: usize = 4096;
const RISK_EVAL_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// External control commands. Sending one twice has the same effect as once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineCommand {
    Start,
    Stop,
    Pause,
    Resume,
    CloseAll,
}

impl From<EngineCommand> for SymbolCommand {
    fn from(command: EngineCommand) -> Self {
        match command {
            EngineCommand::Start => SymbolCommand::Start,
            EngineCommand::Stop => SymbolCommand::Stop,
            EngineCommand::Pause => SymbolCommand::Pause,
            EngineCommand::Resume => SymbolCommand::Resume,
            EngineCommand::CloseAll => SymbolCommand::CloseAll,
        }
    }
}

impl FromStr for EngineCommand {
    type Err = TradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "start" => Ok(EngineCommand::Start),
            "stop" => Ok(EngineCommand::Stop),
            "pause" => Ok(EngineCommand::Pause),
            "resume" => Ok(EngineCommand::Resume),
            "close_all" => Ok(EngineCommand::CloseAll),
            other => Err(TradingError::Internal(format!("unknown command: {}", other))),
        }
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineCommand::Start => "start",
            EngineCommand::Stop => "stop",
            EngineCommand::Pause => "pause",
            EngineCommand::Resume => "resume",
            EngineCommand::CloseAll => "close_all",
        };
        f.write_str(label)
    }
}

/// Which symbols a protective action addresses, and with what
pub fn risk_command(action: &RiskAction) -> (Option<&str>, SymbolCommand) {
    match action {
        RiskAction::PauseAll { .. } => (None, SymbolCommand::Pause),
        RiskAction::CloseAll { .. } => (None, SymbolCommand::CloseAll),
        RiskAction::CloseSymbol { symbol, .. } => (Some(symbol.as_str()), SymbolCommand::CloseAll),
    }
}

type SharedRegistry = Arc<RwLock<SymbolRegistry>>;

fn read(registry: &SharedRegistry) -> RwLockReadGuard<'_, SymbolRegistry> {
    registry.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(registry: &SharedRegistry) -> RwLockWriteGuard<'_, SymbolRegistry> {
    registry.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Composes status snapshots from the registry and the accountant
pub struct EngineStatus {
    registry: SharedRegistry,
    account: watch::Receiver<AccountantSnapshot>,
}

impl StatusSource for EngineStatus {
    fn compose(&self) -> StatusSnapshot {
        let account = self.account.borrow().clone();
        let controllers = read(&self.registry).snapshots();
        StatusSnapshot::compose(&account, &controllers)
    }
}

pub struct Engine {
    strategy: StrategyConfig,
    gateway_config: GatewayConfig,
    gateway: Arc<dyn ExecutionGateway>,
    feed: broadcast::Sender<GatewayEvent>,
    registry: SharedRegistry,
    account: watch::Receiver<AccountantSnapshot>,
    reports: mpsc::UnboundedSender<RunnerReport>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Start the feed pump and the risk supervisor. Symbols are added with
    /// [`Engine::start_symbol`].
    pub fn start(config: &EngineConfig, gateway: Arc<dyn ExecutionGateway>) -> Self {
        Self::with_accountant(config, gateway, RiskAccountant::new(config.risk.clone()))
    }

    pub fn with_accountant(config: &EngineConfig, gateway: Arc<dyn ExecutionGateway>, accountant: RiskAccountant) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let (account_tx, account_rx) = watch::channel(accountant.snapshot());
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let registry: SharedRegistry = Arc::new(RwLock::new(SymbolRegistry::new()));

        let pump = tokio::spawn(pump_feed(Arc::clone(&gateway), feed.clone(), shutdown.subscribe()));
        let supervisor = Supervisor {
            accountant,
            gateway: Arc::clone(&gateway),
            registry: Arc::clone(&registry),
            reports: reports_rx,
            account: account_tx,
            sync_every: Duration::from_secs(config.gateway.account_snapshot_secs.max(1)),
            funding_every: Duration::from_secs(config.gateway.funding_refresh_secs.max(1)),
        };
        let supervisor = tokio::spawn(supervisor.run(shutdown.subscribe()));

        info!(gateway = gateway.name(), "🚀 Engine started");
        Self {
            strategy: config.strategy.clone(),
            gateway_config: config.gateway.clone(),
            gateway,
            feed,
            registry,
            account: account_rx,
            reports: reports_tx,
            shutdown,
            tasks: vec![pump, supervisor],
        }
    }

    fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_config.stop_drain_timeout_ms)
    }

    /// Activate a symbol. Starting a running symbol with the same config is a
    /// no-op; a changed config stops the old runner before the new one starts.
    pub async fn start_symbol(&self, grid: GridConfig) -> TradingResult<()> {
        grid.validate()?;

        let previous = {
            let mut registry = write(&self.registry);
            let unchanged = registry
                .get(&grid.symbol)
                .map(|handle| handle.config == grid && !handle.is_finished());
            match unchanged {
                Some(true) => {
                    if let Some(handle) = registry.get(&grid.symbol) {
                        handle.send(SymbolCommand::Start);
                    }
                    return Ok(());
                }
                Some(false) => registry.remove(&grid.symbol),
                None => None,
            }
        };
        if let Some(old) = previous {
            info!(symbol = %grid.symbol, "♻️  Configuration changed, restarting symbol");
            self.retire(old).await;
        }

        let (price_decimals, quantity_decimals) = match self.gateway.precision(&grid.symbol).await {
            Ok(precision) => precision,
            Err(err) => {
                warn!(symbol = %grid.symbol, %err, "⚠️  Precision lookup failed, using unrounded prices");
                (None, None)
            }
        };
        let controller =
            GridController::new(grid.clone(), self.strategy.clone()).with_precision(price_decimals, quantity_decimals);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(controller.snapshot());
        let runner = runner::SymbolRunner::new(
            controller,
            Arc::clone(&self.gateway),
            commands_rx,
            self.feed.subscribe(),
            self.account.clone(),
            snapshot_tx,
            self.reports.clone(),
            self.drain_timeout(),
        );
        let task = tokio::spawn(runner.run());
        let handle = SymbolHandle::new(grid.clone(), commands_tx, snapshot_rx, task);
        handle.send(SymbolCommand::Start);
        write(&self.registry).insert(handle);

        info!(
            symbol = %grid.symbol,
            tp = grid.take_profit_spacing,
            gs = grid.grid_spacing,
            qty = grid.initial_quantity,
            leverage = grid.leverage,
            "✅ Symbol registered"
        );
        Ok(())
    }

    /// Send a control command to one symbol, or to all when `symbol` is None.
    /// Returns how many runners accepted it.
    pub fn command(&self, symbol: Option<&str>, command: EngineCommand) -> TradingResult<usize> {
        let registry = read(&self.registry);
        let command = SymbolCommand::from(command);
        match symbol {
            Some(symbol) => {
                let handle = registry
                    .get(symbol)
                    .ok_or_else(|| TradingError::SymbolNotFound(symbol.to_string()))?;
                if handle.send(command) {
                    Ok(1)
                } else {
                    Err(TradingError::ChannelClosed(format!("runner for {} has exited", symbol)))
                }
            }
            None => Ok(registry.broadcast(&command)),
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        read(&self.registry).symbols()
    }

    pub fn snapshot(&self, symbol: &str) -> Option<ControllerSnapshot> {
        read(&self.registry).get(symbol).map(SymbolHandle::snapshot)
    }

    /// Wait until a symbol's snapshot satisfies `predicate`, up to `timeout`
    pub async fn wait_for<F>(&self, symbol: &str, timeout: Duration, predicate: F) -> Option<ControllerSnapshot>
    where
        F: Fn(&ControllerSnapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(snapshot) = self.snapshot(symbol) {
                if predicate(&snapshot) {
                    return Some(snapshot);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn account(&self) -> AccountantSnapshot {
        self.account.borrow().clone()
    }

    pub fn status_source(&self) -> Arc<dyn StatusSource> {
        Arc::new(EngineStatus {
            registry: Arc::clone(&self.registry),
            account: self.account.clone(),
        })
    }

    /// Run `broadcaster` until the engine shuts down
    pub fn spawn_status(&mut self, broadcaster: &StatusBroadcaster) {
        let broadcaster = broadcaster.clone();
        let source = self.status_source();
        let shutdown = self.shutdown.subscribe();
        self.tasks
            .push(tokio::spawn(async move { broadcaster.run(source, shutdown).await }));
    }

    async fn retire(&self, handle: SymbolHandle) {
        let symbol = handle.config.symbol.clone();
        handle.send(SymbolCommand::Shutdown);
        let mut task = handle.into_task();
        let wait = self.drain_timeout() + SHUTDOWN_GRACE;
        if tokio::time::timeout(wait, &mut task).await.is_err() {
            error!(%symbol, "❌ Runner did not stop in time, aborting");
            task.abort();
        }
    }

    /// Stop every symbol (draining in-flight acknowledgements), then the
    /// supervisor and feed. Open inventory is left on the exchange.
    pub async fn shutdown(mut self) -> TradingResult<()> {
        info!("🛑 Engine shutting down");
        let handles = write(&self.registry).drain();
        for handle in handles {
            self.retire(handle).await;
        }

        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    return Err(TradingError::Internal(format!("engine task failed: {}", err)));
                }
            }
        }
        info!("👋 Engine stopped");
        Ok(())
    }
}

/// Single consumer of the gateway stream. A disconnect is followed by a
/// forced reconciliation so runners never resume on stale state.
async fn pump_feed(
    gateway: Arc<dyn ExecutionGateway>,
    feed: broadcast::Sender<GatewayEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream = gateway.stream();
    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else {
                    warn!("📡 Gateway stream ended");
                    break;
                };
                let disconnected = matches!(event, GatewayEvent::Connection(ConnectionStatus::Disconnected { .. }));
                let _ = feed.send(event);
                if disconnected {
                    match gateway.reconciliation().await {
                        Ok(snapshot) => {
                            let _ = feed.send(GatewayEvent::Reconciled(snapshot));
                        }
                        Err(err) => warn!(%err, "⚠️  Reconciliation after disconnect failed"),
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

struct Supervisor {
    accountant: RiskAccountant,
    gateway: Arc<dyn ExecutionGateway>,
    registry: SharedRegistry,
    reports: mpsc::UnboundedReceiver<RunnerReport>,
    account: watch::Sender<AccountantSnapshot>,
    sync_every: Duration,
    funding_every: Duration,
}

impl Supervisor {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut sync = tokio::time::interval(self.sync_every);
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut risk = tokio::time::interval(RISK_EVAL_INTERVAL);
        risk.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut funding = tokio::time::interval(self.funding_every);
        funding.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                report = self.reports.recv() => match report {
                    Some(report) => self.handle_report(report),
                    None => break,
                },
                _ = sync.tick() => self.sync().await,
                _ = risk.tick() => self.evaluate(),
                _ = funding.tick() => self.refresh_funding().await,
            }
        }
        debug!("supervisor stopped");
    }

    fn publish(&self) {
        self.account.send_replace(self.accountant.snapshot());
    }

    fn handle_report(&mut self, report: RunnerReport) {
        match report {
            RunnerReport::Fill(fill) => {
                self.accountant.record_fill(&fill);
            }
            RunnerReport::Position(state) => self.accountant.update_symbol(state),
            RunnerReport::Degraded { symbol, reason } => {
                error!(%symbol, %reason, "❌ Symbol degraded, trading halted");
            }
        }
        self.publish();
    }

    async fn sync(&mut self) {
        match self.gateway.reconciliation().await {
            Ok(snapshot) => {
                if let SyncOutcome::Resynced { drift } = self.accountant.apply_account_snapshot(&snapshot) {
                    let delivered = read(&self.registry).broadcast(&SymbolCommand::Reconcile(snapshot));
                    info!(drift, delivered, "🔄 Controllers resynced to exchange state");
                }
                self.publish();
            }
            Err(err) => warn!(%err, "⚠️  Account snapshot failed"),
        }
    }

    fn evaluate(&mut self) {
        let marks: Vec<(String, f64)> = read(&self.registry)
            .snapshots()
            .into_iter()
            .filter_map(|s| s.last_price.map(|p| (s.symbol, p)))
            .collect();
        for (symbol, price) in marks {
            self.accountant.mark(&symbol, price);
        }

        for action in self.accountant.evaluate() {
            let (target, command) = risk_command(&action);
            let registry = read(&self.registry);
            let delivered = match target {
                Some(symbol) => registry.get(symbol).map_or(0, |h| usize::from(h.send(command))),
                None => registry.broadcast(&command),
            };
            warn!(?action, delivered, "🛡️  Risk action dispatched");
        }
        self.publish();
    }

    async fn refresh_funding(&mut self) {
        let symbols = read(&self.registry).symbols();
        for symbol in symbols {
            match self.gateway.funding_rate(&symbol).await {
                Ok(Some(rate)) => {
                    if let Some(handle) = read(&self.registry).get(&symbol) {
                        handle.send(SymbolCommand::SetFundingRate(rate));
                    }
                }
                Ok(None) => {}
                Err(err) => debug!(%symbol, %err, "funding rate unavailable"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        assert_eq!("close-all".parse::<EngineCommand>().unwrap(), EngineCommand::CloseAll);
        assert_eq!("PAUSE".parse::<EngineCommand>().unwrap(), EngineCommand::Pause);
        assert!("explode".parse::<EngineCommand>().is_err());
        assert_eq!(EngineCommand::CloseAll.to_string(), "close_all");
    }

    #[test]
    fn test_risk_actions_map_to_commands() {
        let (target, command) = risk_command(&RiskAction::PauseAll { drawdown: 0.25 });
        assert!(target.is_none());
        assert_eq!(command, SymbolCommand::Pause);

        let action = RiskAction::CloseSymbol { symbol: "XRPUSDT".into(), peak_pnl: 10.0, pnl: 7.0 };
        let (target, command) = risk_command(&action);
        assert_eq!(target, Some("XRPUSDT"));
        assert_eq!(command, SymbolCommand::CloseAll);
    }
}
