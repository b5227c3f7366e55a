// Keyed registry of running symbols

use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::GridConfig;
use crate::core::controller::ControllerSnapshot;
use crate::engine::runner::SymbolCommand;

/// Handle to one symbol's runner task
pub struct SymbolHandle {
    pub config: GridConfig,
    commands: mpsc::UnboundedSender<SymbolCommand>,
    snapshot: watch::Receiver<ControllerSnapshot>,
    task: JoinHandle<()>,
}

impl SymbolHandle {
    pub(crate) fn new(
        config: GridConfig,
        commands: mpsc::UnboundedSender<SymbolCommand>,
        snapshot: watch::Receiver<ControllerSnapshot>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            config,
            commands,
            snapshot,
            task,
        }
    }

    /// False once the runner has exited
    pub fn send(&self, command: SymbolCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

/// One handle per symbol, ordered by symbol for stable output
#[derive(Default)]
pub struct SymbolRegistry {
    handles: BTreeMap<String, SymbolHandle>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.handles.contains_key(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolHandle> {
        self.handles.get(symbol)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn insert(&mut self, handle: SymbolHandle) -> Option<SymbolHandle> {
        self.handles.insert(handle.config.symbol.clone(), handle)
    }

    pub fn remove(&mut self, symbol: &str) -> Option<SymbolHandle> {
        self.handles.remove(symbol)
    }

    pub fn drain(&mut self) -> Vec<SymbolHandle> {
        std::mem::take(&mut self.handles).into_values().collect()
    }

    /// Send to every runner, returning how many accepted it
    pub fn broadcast(&self, command: &SymbolCommand) -> usize {
        self.handles.values().filter(|h| h.send(command.clone())).count()
    }

    pub fn snapshots(&self) -> Vec<ControllerSnapshot> {
        self.handles.values().map(SymbolHandle::snapshot).collect()
    }
}
