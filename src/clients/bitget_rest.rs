// Bitget v2 USDT-margined futures REST client

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{Credentials, ExchangeConfig};
use crate::core::types::{
    AccountSnapshot, AssetBalance, Bar, OpenOrder, Order, OrderHandle, OrderType, PositionSnapshot,
};
use crate::gateway::GatewayError;

const SUCCESS_CODE: &str = "00000";

/// Most candles Bitget returns per history request
pub const MAX_CANDLES_PER_CALL: usize = 200;

/// base64(HMAC-SHA256(secret, timestamp + METHOD + path + body))
pub fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> Result<String, GatewayError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Authentication(format!("bad secret: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(body.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Bitget candle granularity for a bar interval in minutes
pub fn granularity(interval_minutes: u32) -> Result<&'static str, GatewayError> {
    match interval_minutes {
        1 => Ok("1m"),
        3 => Ok("3m"),
        5 => Ok("5m"),
        15 => Ok("15m"),
        30 => Ok("30m"),
        60 => Ok("1H"),
        240 => Ok("4H"),
        360 => Ok("6H"),
        720 => Ok("12H"),
        1440 => Ok("1D"),
        other => Err(GatewayError::Unsupported(format!("{}m candles", other))),
    }
}

/// Map a Bitget error envelope onto the gateway error taxonomy
pub fn classify_error(http_status: u16, code: &str, msg: &str) -> GatewayError {
    let lower = msg.to_lowercase();
    let detail = format!("{} {}", code, msg);

    if http_status == 429 || code == "429" || lower.contains("too many requests") {
        return GatewayError::RateLimited(detail);
    }
    if http_status == 401
        || http_status == 403
        || matches!(code, "40006" | "40009" | "40012" | "40037")
        || lower.contains("sign")
        || lower.contains("apikey")
        || lower.contains("passphrase")
    {
        return GatewayError::Authentication(detail);
    }
    if matches!(code, "40754" | "40762" | "43012") || lower.contains("balance") {
        return GatewayError::InsufficientBalance(detail);
    }
    if matches!(code, "40808" | "40815" | "45110") || lower.contains("price") {
        return GatewayError::InvalidPrice(detail);
    }
    if http_status >= 500 {
        return GatewayError::Transient(detail);
    }
    GatewayError::Rejected(detail)
}

fn is_duplicate_client_id(err: &GatewayError) -> bool {
    match err {
        GatewayError::Rejected(detail) => {
            let lower = detail.to_lowercase();
            lower.contains("duplicate") && lower.contains("clientoid")
        }
        _ => false,
    }
}

fn is_missing_order(err: &GatewayError) -> bool {
    match err {
        GatewayError::Rejected(detail) => {
            let lower = detail.to_lowercase();
            detail.starts_with("40768") || detail.starts_with("43001") || lower.contains("does not exist")
        }
        _ => false,
    }
}

/// Bitget sends numbers as strings; accept both
fn num(value: &Value, key: &str) -> f64 {
    match &value[key] {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn text(value: &Value, key: &str) -> String {
    match &value[key] {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_candle(row: &Value) -> Option<Bar> {
    let cells = row.as_array()?;
    if cells.len() < 6 {
        return None;
    }
    let field = |i: usize| -> Option<f64> {
        match &cells[i] {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    };
    let millis = field(0)? as i64;
    Some(Bar {
        timestamp: Utc.timestamp_millis_opt(millis).single()?,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}

#[derive(Debug, Clone)]
pub struct BitgetRestClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    product_type: String,
    margin_coin: String,
}

impl BitgetRestClient {
    pub fn new(base_url: &str, credentials: Option<Credentials>, product_type: &str, margin_coin: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            product_type: product_type.to_string(),
            margin_coin: margin_coin.to_string(),
        }
    }

    pub fn from_config(config: &ExchangeConfig, credentials: Option<Credentials>) -> Self {
        Self::new(&config.rest_url, credentials, &config.product_type, &config.margin_coin)
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        signed: bool,
    ) -> Result<Value, GatewayError> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let request_path = if query_string.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query_string)
        };
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();

        let mut builder = self
            .client
            .request(method.clone(), format!("{}{}", self.base_url, request_path))
            .header("Content-Type", "application/json")
            .header("locale", "en-US");

        if signed {
            let creds = self
                .credentials
                .as_ref()
                .ok_or_else(|| GatewayError::Authentication("no API credentials configured".to_string()))?;
            let timestamp = Utc::now().timestamp_millis().to_string();
            let signature = sign(&creds.api_secret, &timestamp, method.as_str(), &request_path, &body_text)?;
            builder = builder
                .header("ACCESS-KEY", &creds.api_key)
                .header("ACCESS-SIGN", signature)
                .header("ACCESS-TIMESTAMP", timestamp)
                .header("ACCESS-PASSPHRASE", &creds.passphrase);
        }
        if body.is_some() {
            builder = builder.body(body_text);
        }

        let response = builder.send().await.map_err(GatewayError::from)?;
        let status = response.status().as_u16();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Transient(format!("undecodable response ({}): {}", status, e)))?;

        let code = text(&payload, "code");
        if status == 200 && code == SUCCESS_CODE {
            return Ok(payload["data"].clone());
        }
        Err(classify_error(status, &code, &text(&payload, "msg")))
    }

    /// Place an order. A duplicate client id resolves to the existing order.
    pub async fn place_order(&self, order: &Order) -> Result<OrderHandle, GatewayError> {
        let mut body = json!({
            "symbol": order.symbol,
            "productType": self.product_type,
            "marginMode": "crossed",
            "marginCoin": self.margin_coin,
            "size": order.quantity.to_string(),
            // hedge mode: side names the book, tradeSide says open or close
            "side": order.position_side.open_side(),
            "tradeSide": if order.reduce_only { "close" } else { "open" },
            "clientOid": order.client_id,
        });
        match order.order_type {
            OrderType::Limit => {
                let price = order
                    .price
                    .ok_or_else(|| GatewayError::InvalidPrice("limit order without price".to_string()))?;
                body["orderType"] = json!("limit");
                body["force"] = json!("gtc");
                body["price"] = json!(price.to_string());
            }
            OrderType::Market => {
                body["orderType"] = json!("market");
            }
        }

        match self
            .request(Method::POST, "/api/v2/mix/order/place-order", &[], Some(&body), true)
            .await
        {
            Ok(data) => {
                debug!(client_id = %order.client_id, "📤 Order accepted");
                Ok(OrderHandle {
                    client_id: order.client_id.clone(),
                    exchange_id: text(&data, "orderId"),
                    symbol: order.symbol.clone(),
                })
            }
            Err(err) if is_duplicate_client_id(&err) => {
                info!(client_id = %order.client_id, "♻️ Duplicate submit, resolving existing order");
                self.order_detail(&order.symbol, &order.client_id).await
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel by client id. An order that no longer exists counts as canceled.
    pub async fn cancel_order(&self, symbol: &str, client_id: &str) -> Result<(), GatewayError> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "clientOid": client_id,
        });
        match self
            .request(Method::POST, "/api/v2/mix/order/cancel-order", &[], Some(&body), true)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_missing_order(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn order_detail(&self, symbol: &str, client_id: &str) -> Result<OrderHandle, GatewayError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("productType", self.product_type.clone()),
            ("clientOid", client_id.to_string()),
        ];
        let data = self
            .request(Method::GET, "/api/v2/mix/order/detail", &query, None, true)
            .await?;
        Ok(OrderHandle {
            client_id: client_id.to_string(),
            exchange_id: text(&data, "orderId"),
            symbol: symbol.to_string(),
        })
    }

    pub async fn accounts(&self) -> Result<AccountSnapshot, GatewayError> {
        let query = [("productType", self.product_type.clone())];
        let data = self
            .request(Method::GET, "/api/v2/mix/account/accounts", &query, None, true)
            .await?;

        let mut assets = BTreeMap::new();
        for row in data.as_array().into_iter().flatten() {
            let asset = text(row, "marginCoin");
            let equity = num(row, "accountEquity");
            let available = num(row, "available");
            let unrealized = num(row, "unrealizedPL");
            assets.insert(
                asset.clone(),
                AssetBalance {
                    asset,
                    wallet_balance: equity - unrealized,
                    unrealized_pnl: unrealized,
                    equity,
                    available_balance: available,
                    margin_used: (equity - available).max(0.0),
                },
            );
        }
        Ok(AccountSnapshot { assets, timestamp: Some(Utc::now()) })
    }

    pub async fn positions(&self) -> Result<Vec<PositionSnapshot>, GatewayError> {
        let query = [
            ("productType", self.product_type.clone()),
            ("marginCoin", self.margin_coin.clone()),
        ];
        let data = self
            .request(Method::GET, "/api/v2/mix/position/all-position", &query, None, true)
            .await?;

        let mut by_symbol: BTreeMap<String, PositionSnapshot> = BTreeMap::new();
        for row in data.as_array().into_iter().flatten() {
            let symbol = text(row, "symbol");
            let entry = by_symbol.entry(symbol.clone()).or_insert_with(|| PositionSnapshot {
                symbol,
                ..Default::default()
            });
            let qty = num(row, "total");
            let avg = num(row, "openPriceAvg");
            match text(row, "holdSide").as_str() {
                "long" => {
                    entry.long_qty = qty;
                    entry.long_avg_price = avg;
                }
                "short" => {
                    entry.short_qty = qty;
                    entry.short_avg_price = avg;
                }
                _ => continue,
            }
            entry.unrealized_pnl += num(row, "unrealizedPL");
        }
        Ok(by_symbol.into_values().collect())
    }

    pub async fn pending_orders(&self) -> Result<Vec<OpenOrder>, GatewayError> {
        let query = [("productType", self.product_type.clone())];
        let data = self
            .request(Method::GET, "/api/v2/mix/order/orders-pending", &query, None, true)
            .await?;

        Ok(data["entrustedList"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|row| OpenOrder {
                symbol: text(row, "symbol"),
                client_id: text(row, "clientOid"),
                exchange_id: text(row, "orderId"),
            })
            .collect())
    }

    pub async fn funding_rate(&self, symbol: &str) -> Result<Option<f64>, GatewayError> {
        let query = [("symbol", symbol.to_string()), ("productType", self.product_type.clone())];
        let data = self
            .request(Method::GET, "/api/v2/mix/market/current-fund-rate", &query, None, false)
            .await?;
        Ok(data
            .as_array()
            .and_then(|rows| rows.first())
            .map(|row| num(row, "fundingRate")))
    }

    /// (price decimals, quantity decimals) for a contract
    pub async fn contract_precision(&self, symbol: &str) -> Result<(Option<u32>, Option<u32>), GatewayError> {
        let query = [("symbol", symbol.to_string()), ("productType", self.product_type.clone())];
        let data = self
            .request(Method::GET, "/api/v2/mix/market/contracts", &query, None, false)
            .await?;
        let Some(row) = data.as_array().and_then(|rows| rows.first()) else {
            return Ok((None, None));
        };
        let places = |key: &str| text(row, key).parse::<u32>().ok();
        Ok((places("pricePlace"), places("volumePlace")))
    }

    /// One page of historical candles in `[start, end)`, oldest first
    pub async fn history_candles(
        &self,
        symbol: &str,
        interval_minutes: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>, GatewayError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("productType", self.product_type.clone()),
            ("granularity", granularity(interval_minutes)?.to_string()),
            ("startTime", start.timestamp_millis().to_string()),
            ("endTime", end.timestamp_millis().to_string()),
            ("limit", limit.min(MAX_CANDLES_PER_CALL).to_string()),
        ];
        let data = self
            .request(Method::GET, "/api/v2/mix/market/history-candles", &query, None, false)
            .await?;

        let mut bars: Vec<Bar> = data
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(parse_candle)
            .filter(|bar| bar.timestamp >= start && bar.timestamp < end)
            .collect();
        bars.sort_by_key(|bar| bar.timestamp);
        bars.dedup_by_key(|bar| bar.timestamp);
        Ok(bars)
    }
}
