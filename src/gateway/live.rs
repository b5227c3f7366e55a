// Live Bitget gateway
//
// Every REST call takes a token from the shared bucket and is retried with
// backoff on transient failures. Streaming comes from two reconnecting
// WebSocket feeds; each private (re)connect triggers a REST reconciliation
// that is published as a `Reconciled` event.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clients::{BitgetRestClient, WsFeed};
use crate::config::{Credentials, ExchangeConfig, GatewayConfig};
use crate::core::types::{AccountSnapshot, GatewayEvent, OpenOrder, Order, OrderHandle, PositionSnapshot};
use crate::gateway::{event_stream, Backoff, ExecutionGateway, GatewayError, RetryPolicy, SharedRateLimiter};

pub struct LiveGateway {
    rest: Arc<BitgetRestClient>,
    limiter: SharedRateLimiter,
    retry: RetryPolicy,
    exchange: ExchangeConfig,
    gateway: GatewayConfig,
    credentials: Credentials,
    events: broadcast::Sender<GatewayEvent>,
    shutdown: watch::Sender<bool>,
    precision: Mutex<HashMap<String, (Option<u32>, Option<u32>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveGateway {
    pub fn new(exchange: &ExchangeConfig, gateway: &GatewayConfig, credentials: Credentials) -> Self {
        let rest = BitgetRestClient::from_config(exchange, Some(credentials.clone()));
        let (events, _) = broadcast::channel(4096);
        let (shutdown, _) = watch::channel(false);
        Self {
            rest: Arc::new(rest),
            limiter: SharedRateLimiter::new(gateway.rate_limit_capacity, gateway.rate_limit_refill_per_sec),
            retry: RetryPolicy::from_config(gateway),
            exchange: exchange.clone(),
            gateway: gateway.clone(),
            credentials,
            events,
            shutdown,
            precision: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn rest(&self) -> &BitgetRestClient {
        &self.rest
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.gateway.reconnect_base_ms),
            Duration::from_millis(self.gateway.reconnect_max_ms),
        )
    }

    /// Rate-limited, retried REST call
    async fn limited<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let limiter = self.limiter.clone();
        self.retry
            .run(what, || {
                let limiter = limiter.clone();
                let call = operation();
                async move {
                    limiter.acquire().await;
                    call.await
                }
            })
            .await
    }

    /// Start the ticker and private feeds for `symbols`
    pub fn connect(self: &Arc<Self>, symbols: Vec<String>) {
        let (connected_tx, mut connected_rx) = mpsc::unbounded_channel();

        let public = WsFeed::public(&self.exchange.public_ws_url, &self.exchange.product_type, symbols, self.backoff());
        let private = WsFeed::private(
            &self.exchange.private_ws_url,
            &self.exchange.product_type,
            self.credentials.clone(),
            self.backoff(),
        );

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(public.run(self.events.clone(), None, self.shutdown.subscribe())));
        tasks.push(tokio::spawn(private.run(
            self.events.clone(),
            Some(connected_tx),
            self.shutdown.subscribe(),
        )));

        let gateway = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while connected_rx.recv().await.is_some() {
                match gateway.reconciliation().await {
                    Ok(snapshot) => {
                        info!(
                            positions = snapshot.positions.len(),
                            open_orders = snapshot.open_orders.len(),
                            "🔄 Reconciled after connect"
                        );
                        let _ = gateway.events.send(GatewayEvent::Reconciled(snapshot));
                    }
                    Err(err) => warn!(%err, "⚠️  Reconciliation failed, waiting for next connect"),
                }
            }
        }));

        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(tasks);
        info!(exchange = "bitget", "🔌 Live gateway connecting");
    }

    /// Stop the feeds. The event stream ends once the gateway is dropped.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

#[async_trait]
impl ExecutionGateway for LiveGateway {
    fn name(&self) -> &str {
        "bitget"
    }

    async fn submit(&self, order: &Order) -> Result<OrderHandle, GatewayError> {
        self.limited("submit", || self.rest.place_order(order)).await
    }

    async fn cancel(&self, handle: &OrderHandle) -> Result<(), GatewayError> {
        self.limited("cancel", || self.rest.cancel_order(&handle.symbol, &handle.client_id))
            .await
    }

    fn stream(&self) -> BoxStream<'static, GatewayEvent> {
        event_stream(self.events.subscribe(), "bitget")
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
        self.limited("account", || self.rest.accounts()).await
    }

    async fn positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        self.limited("positions", || self.rest.positions()).await
    }

    async fn open_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        self.limited("open_orders", || self.rest.pending_orders()).await
    }

    async fn funding_rate(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        self.limited("funding_rate", || self.rest.funding_rate(symbol)).await
    }

    async fn precision(&self, symbol: &str) -> Result<(Option<u32>, Option<u32>), GatewayError> {
        let cached = self
            .precision
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(symbol)
            .copied();
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let fetched = self.limited("precision", || self.rest.contract_precision(symbol)).await?;
        self.precision
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(symbol.to_string(), fetched);
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PositionSide, Side};

    fn gateway_for(server: &mockito::ServerGuard) -> LiveGateway {
        let exchange = ExchangeConfig {
            rest_url: server.url(),
            ..ExchangeConfig::default()
        };
        let gateway = GatewayConfig {
            retry_attempts: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            rate_limit_capacity: 100,
            rate_limit_refill_per_sec: 100.0,
            ..GatewayConfig::default()
        };
        let credentials = Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
            passphrase: "phrase".into(),
        };
        LiveGateway::new(&exchange, &gateway, credentials)
    }

    #[tokio::test]
    async fn test_rate_limited_submit_is_retried_to_budget() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v2/mix/order/place-order")
            .with_status(429)
            .with_body(r#"{"code":"429","msg":"Too Many Requests","data":null}"#)
            .expect(3)
            .create_async()
            .await;

        let order = Order::limit("c-1".into(), "XRPUSDT", Side::Buy, PositionSide::Long, 0.5, 10.0);
        let result = gateway_for(&server).submit(&order).await;
        assert!(matches!(result, Err(GatewayError::RateLimited(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v2/mix/order/place-order")
            .with_status(400)
            .with_body(r#"{"code":"40762","msg":"The order amount exceeds the balance","data":null}"#)
            .expect(1)
            .create_async()
            .await;

        let order = Order::limit("c-2".into(), "XRPUSDT", Side::Buy, PositionSide::Long, 0.5, 10.0);
        let result = gateway_for(&server).submit(&order).await;
        assert!(matches!(result, Err(GatewayError::InsufficientBalance(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_precision_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v2/mix/market/contracts")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"code":"00000","msg":"success","data":[{"symbol":"XRPUSDT","pricePlace":"4","volumePlace":"0"}]}"#)
            .expect(1)
            .create_async()
            .await;

        let gateway = gateway_for(&server);
        assert_eq!(gateway.precision("XRPUSDT").await.unwrap(), (Some(4), Some(0)));
        assert_eq!(gateway.precision("XRPUSDT").await.unwrap(), (Some(4), Some(0)));
        mock.assert_async().await;
    }
}
