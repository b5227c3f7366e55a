// Periodic status fan-out
//
// Subscribers get `Arc<StatusSnapshot>` values over a broadcast channel. A
// slow subscriber only lags its own receiver; publishing never waits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::config::StatusConfig;
use crate::status::StatusSnapshot;

/// Anything that can compose a current status snapshot
pub trait StatusSource: Send + Sync {
    fn compose(&self) -> StatusSnapshot;
}

impl<F> StatusSource for F
where
    F: Fn() -> StatusSnapshot + Send + Sync,
{
    fn compose(&self) -> StatusSnapshot {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<Arc<StatusSnapshot>>,
    interval: Duration,
    sequence: Arc<AtomicU64>,
}

impl StatusBroadcaster {
    pub fn new(config: &StatusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            tx,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StatusSnapshot>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Compose and publish one snapshot, returning it
    pub fn publish_once(&self, source: &dyn StatusSource) -> Arc<StatusSnapshot> {
        let mut snapshot = source.compose();
        snapshot.sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(snapshot);
        // No subscribers is fine
        let _ = self.tx.send(Arc::clone(&snapshot));
        snapshot
    }

    /// Publish on a fixed interval until `shutdown` flips to true
    pub async fn run(&self, source: Arc<dyn StatusSource>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = self.interval.as_millis() as u64, "📊 Status broadcaster started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.publish_once(source.as_ref());
                    debug!(
                        sequence = snapshot.sequence,
                        equity = snapshot.equity,
                        subscribers = self.subscriber_count(),
                        "status published"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("📊 Status broadcaster stopped");
    }
}
