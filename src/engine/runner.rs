// Per-symbol runner task
//
// Owns one GridController and drives it from engine commands, the shared
// gateway feed, account updates while a start is pending and a drain deadline
// while stopping. Commands are polled first so a pause lands before the next
// tick is handled. A start waits for both a price and an account baseline.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::controller::{ControllerAction, ControllerSnapshot, ControllerState, GridController};
use crate::core::position::SymbolState;
use crate::core::types::{ConnectionStatus, FillEvent, GatewayEvent, OrderHandle, ReconcileSnapshot};
use crate::gateway::ExecutionGateway;
use crate::risk::AccountantSnapshot;

const MAX_ACTIONS_PER_EVENT: usize = 10_000;

/// Commands a runner accepts. All of them are idempotent.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolCommand {
    Start,
    Stop,
    Pause,
    Resume,
    CloseAll,
    Reconcile(ReconcileSnapshot),
    SetFundingRate(f64),
    /// Stop, then end the task
    Shutdown,
}

/// What a runner tells the supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerReport {
    Fill(FillEvent),
    Position(SymbolState),
    Degraded { symbol: String, reason: String },
}

pub(crate) struct SymbolRunner {
    controller: GridController,
    gateway: Arc<dyn ExecutionGateway>,
    commands: mpsc::UnboundedReceiver<SymbolCommand>,
    feed: broadcast::Receiver<GatewayEvent>,
    account: watch::Receiver<AccountantSnapshot>,
    snapshots: watch::Sender<ControllerSnapshot>,
    reports: mpsc::UnboundedSender<RunnerReport>,
    drain_timeout: Duration,
    drain_deadline: Option<Instant>,
    pending_start: bool,
    exit_when_stopped: bool,
    reported_degraded: bool,
}

impl SymbolRunner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        controller: GridController,
        gateway: Arc<dyn ExecutionGateway>,
        commands: mpsc::UnboundedReceiver<SymbolCommand>,
        feed: broadcast::Receiver<GatewayEvent>,
        account: watch::Receiver<AccountantSnapshot>,
        snapshots: watch::Sender<ControllerSnapshot>,
        reports: mpsc::UnboundedSender<RunnerReport>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            gateway,
            commands,
            feed,
            account,
            snapshots,
            reports,
            drain_timeout,
            drain_deadline: None,
            pending_start: false,
            exit_when_stopped: false,
            reported_degraded: false,
        }
    }

    fn symbol(&self) -> String {
        self.controller.symbol().to_string()
    }

    pub(crate) async fn run(mut self) {
        info!(symbol = %self.symbol(), "🧵 Symbol runner started");
        loop {
            let deadline = self.drain_deadline;
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Engine dropped; leave inventory as is
                        let actions = self.controller.force_stop();
                        self.execute(actions).await;
                        break;
                    }
                },

                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    warn!(symbol = %self.symbol(), "⏱️  Drain timeout, forcing stop");
                    self.drain_deadline = None;
                    let actions = self.controller.force_stop();
                    self.execute(actions).await;
                }

                changed = self.account.changed(), if self.pending_start => match changed {
                    Ok(()) => {
                        let actions = self.try_start();
                        self.execute(actions).await;
                    }
                    Err(_) => {
                        warn!(symbol = %self.symbol(), "⚠️  Account view closed, start abandoned");
                        self.pending_start = false;
                    }
                },

                event = self.feed.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(symbol = %self.symbol(), skipped, "⚠️  Feed lagged, resyncing");
                        self.controller.on_disconnect();
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(symbol = %self.symbol(), "📡 Feed closed");
                        let actions = self.controller.force_stop();
                        self.execute(actions).await;
                        break;
                    }
                },
            }

            self.after_step();
            if self.exit_when_stopped && self.controller.state() == ControllerState::Stopped {
                break;
            }
        }
        self.publish();
        info!(symbol = %self.symbol(), "🧵 Symbol runner finished");
    }

    async fn handle_command(&mut self, command: SymbolCommand) {
        debug!(symbol = %self.symbol(), ?command, "command");
        let actions = match command {
            SymbolCommand::Start => {
                self.exit_when_stopped = false;
                self.try_start()
            }
            SymbolCommand::Pause => self.controller.pause(),
            SymbolCommand::Resume => self.controller.resume(),
            SymbolCommand::CloseAll => {
                self.pending_start = false;
                self.controller.close_all()
            }
            SymbolCommand::Stop => self.begin_stop(),
            SymbolCommand::Shutdown => {
                self.exit_when_stopped = true;
                self.begin_stop()
            }
            SymbolCommand::Reconcile(snapshot) => {
                let actions = self.controller.reconcile(&snapshot);
                let _ = self.reports.send(RunnerReport::Position(self.controller.position().clone()));
                actions
            }
            SymbolCommand::SetFundingRate(rate) => {
                self.controller.set_funding_rate(rate);
                Vec::new()
            }
        };
        self.execute(actions).await;
    }

    fn try_start(&mut self) -> Vec<ControllerAction> {
        if !matches!(self.controller.state(), ControllerState::Init | ControllerState::Stopped) {
            return Vec::new();
        }
        let (has_baseline, available) = {
            let account = self.account.borrow();
            (account.has_baseline, account.available_balance)
        };
        match self.controller.last_price() {
            Some(_) if !has_baseline => {
                if !self.pending_start {
                    info!(symbol = %self.symbol(), "⏳ Waiting for the first account snapshot before starting");
                }
                self.pending_start = true;
                Vec::new()
            }
            Some(mid) => {
                self.pending_start = false;
                self.controller.start(mid, available)
            }
            None => {
                if !self.pending_start {
                    info!(symbol = %self.symbol(), "⏳ Waiting for a first price before starting");
                }
                self.pending_start = true;
                Vec::new()
            }
        }
    }

    fn begin_stop(&mut self) -> Vec<ControllerAction> {
        self.pending_start = false;
        let actions = self.controller.stop();
        if self.controller.state() != ControllerState::Stopped && self.drain_deadline.is_none() {
            self.drain_deadline = Some(Instant::now() + self.drain_timeout);
        }
        actions
    }

    async fn handle_event(&mut self, event: GatewayEvent) {
        if let Some(symbol) = event.symbol() {
            if symbol != self.controller.symbol() {
                return;
            }
        }
        let actions = match event {
            GatewayEvent::Tick(tick) => {
                let mut actions = self.controller.on_tick(&tick);
                if self.pending_start {
                    actions.extend(self.try_start());
                }
                actions
            }
            GatewayEvent::Fill(fill) => self.apply_fill(&fill),
            GatewayEvent::OrderClosed { client_id, .. } => self.controller.on_cancel_ack(&client_id),
            GatewayEvent::Connection(ConnectionStatus::Disconnected { reason }) => {
                debug!(symbol = %self.symbol(), %reason, "disconnected");
                self.controller.on_disconnect();
                Vec::new()
            }
            GatewayEvent::Connection(_) => Vec::new(),
            GatewayEvent::Reconciled(snapshot) => {
                let actions = self.controller.reconcile(&snapshot);
                let _ = self.reports.send(RunnerReport::Position(self.controller.position().clone()));
                actions
            }
        };
        self.execute(actions).await;
    }

    // The accountant drops fills it has already seen
    fn apply_fill(&mut self, fill: &FillEvent) -> Vec<ControllerAction> {
        let actions = self.controller.on_fill(fill);
        let _ = self.reports.send(RunnerReport::Fill(fill.clone()));
        actions
    }

    /// Pull an authoritative snapshot after losing feed continuity
    async fn resync(&mut self) {
        match self.gateway.reconciliation().await {
            Ok(snapshot) => {
                let actions = self.controller.reconcile(&snapshot);
                let _ = self.reports.send(RunnerReport::Position(self.controller.position().clone()));
                self.execute(actions).await;
            }
            Err(err) => warn!(symbol = %self.symbol(), %err, "⚠️  Resync failed, entries stay on hold"),
        }
    }

    /// Send intents to the gateway, feeding acknowledgements back into the controller
    async fn execute(&mut self, actions: Vec<ControllerAction>) {
        let mut queue: VecDeque<ControllerAction> = actions.into();
        let mut processed = 0usize;

        while let Some(action) = queue.pop_front() {
            processed += 1;
            if processed > MAX_ACTIONS_PER_EVENT {
                error!(symbol = %self.symbol(), "❌ Action cascade did not settle, dropping the rest");
                break;
            }
            match action {
                ControllerAction::Submit(order) => match self.gateway.submit(&order).await {
                    Ok(handle) => queue.extend(self.controller.on_ack(&handle.client_id)),
                    Err(err) => {
                        warn!(symbol = %order.symbol, client_id = %order.client_id, %err, "⚠️  Submit failed");
                        queue.extend(self.controller.on_submit_failed(&order.client_id, &err));
                    }
                },
                ControllerAction::Cancel { symbol, client_id } => {
                    let handle = OrderHandle {
                        client_id: client_id.clone(),
                        exchange_id: String::new(),
                        symbol,
                    };
                    if let Err(err) = self.gateway.cancel(&handle).await {
                        // The order may still rest; the next reconciliation settles it
                        warn!(symbol = %handle.symbol, %client_id, %err, "⚠️  Cancel failed");
                    }
                }
            }
        }
    }

    fn after_step(&mut self) {
        if self.controller.state() == ControllerState::Stopped {
            self.drain_deadline = None;
        }
        match self.controller.degraded_reason() {
            Some(reason) if !self.reported_degraded => {
                self.reported_degraded = true;
                let _ = self.reports.send(RunnerReport::Degraded {
                    symbol: self.symbol(),
                    reason: reason.to_string(),
                });
            }
            None => self.reported_degraded = false,
            _ => {}
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.controller.snapshot());
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
