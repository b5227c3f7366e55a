//! Execution gateway abstraction
//!
//! Controllers never talk to an exchange directly. They produce order intents
//! that a runner hands to an [`ExecutionGateway`]; fills, ticks and connection
//! changes come back through [`ExecutionGateway::stream`]. The live Bitget
//! implementation and the bar-replay simulator share the crossing rules in
//! [`crossing`].

pub mod crossing;
pub mod live;
pub mod rate_limit;
pub mod retry;
pub mod simulated;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use tokio::sync::broadcast;
use tracing::warn;

use crate::core::types::{
    AccountSnapshot, ConnectionStatus, GatewayEvent, OpenOrder, Order, OrderHandle, PositionSnapshot, ReconcileSnapshot,
};

pub use crossing::{bar_path, CrossingBook, RestingOrder};
pub use live::LiveGateway;
pub use rate_limit::{SharedRateLimiter, TokenBucket};
pub use retry::{Backoff, RetryPolicy};
pub use simulated::{SimExchange, SimulatedGateway};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl GatewayError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::RateLimited(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.as_u16() == 429 => GatewayError::RateLimited(err.to_string()),
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                GatewayError::Authentication(err.to_string())
            }
            Some(status) if status.is_client_error() => GatewayError::Rejected(err.to_string()),
            _ => GatewayError::Transient(err.to_string()),
        }
    }
}

/// Turn a broadcast subscription into an event stream that ends when the sender is dropped.
/// A lagged receiver yields a `Disconnected` marker so the consumer reconciles.
pub fn event_stream(rx: broadcast::Receiver<GatewayEvent>, source: &'static str) -> BoxStream<'static, GatewayEvent> {
    Box::pin(stream::unfold(rx, move |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(source, skipped, "⚠️  Gateway stream lagged");
                    let reason = format!("{} stream lagged by {} events", source, skipped);
                    return Some((GatewayEvent::Connection(ConnectionStatus::Disconnected { reason }), rx));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}

/// Everything a controller runner needs from an exchange
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Place an order. Resubmitting the same `client_id` returns the original handle.
    async fn submit(&self, order: &Order) -> Result<OrderHandle, GatewayError>;

    /// Cancel a resting order. Canceling an unknown or closed order succeeds.
    async fn cancel(&self, handle: &OrderHandle) -> Result<(), GatewayError>;

    /// Ticks, fills and connection changes. Reconnects internally and emits a
    /// `Reconciled` event after every reconnect.
    fn stream(&self) -> BoxStream<'static, GatewayEvent>;

    async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError>;

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError>;

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError>;

    async fn funding_rate(&self, symbol: &str) -> Result<Option<f64>, GatewayError>;

    /// Exchange-side price and lot precision, when known
    async fn precision(&self, _symbol: &str) -> Result<(Option<u32>, Option<u32>), GatewayError> {
        Ok((None, None))
    }

    async fn reconciliation(&self) -> Result<ReconcileSnapshot, GatewayError> {
        Ok(ReconcileSnapshot {
            account: self.account_snapshot().await?,
            positions: self.positions().await?,
            open_orders: self.open_orders().await?,
        })
    }
}
