// Bitget v2 WebSocket feeds: public tickers and the private orders channel

use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::clients::bitget_rest::sign;
use crate::config::Credentials;
use crate::core::types::{ConnectionStatus, FillEvent, GatewayEvent, PositionSide, Side, TickUpdate};
use crate::gateway::{Backoff, GatewayError};

const PING_INTERVAL: Duration = Duration::from_secs(25);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct BitgetWsClient {
    ws_sender: SplitSink<WsStream, Message>,
    ws_receiver: SplitStream<WsStream>,
}

impl BitgetWsClient {
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| GatewayError::Transient(format!("connect {}: {}", url, e)))?;
        let (ws_sender, ws_receiver) = ws_stream.split();
        Ok(Self { ws_sender, ws_receiver })
    }

    async fn send_json(&mut self, message: Value) -> Result<(), GatewayError> {
        self.ws_sender
            .send(Message::Text(message.to_string()))
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))
    }

    pub async fn ping(&mut self) -> Result<(), GatewayError> {
        self.ws_sender
            .send(Message::Text("ping".to_string()))
            .await
            .map_err(|e| GatewayError::Transient(e.to_string()))
    }

    /// Authenticate and wait for the login acknowledgement
    pub async fn login(&mut self, credentials: &Credentials) -> Result<(), GatewayError> {
        self.send_json(login_message(credentials, Utc::now().timestamp())?).await?;

        let ack = tokio::time::timeout(LOGIN_TIMEOUT, async {
            while let Some(message) = self.ws_receiver.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(_) => continue,
                    Err(e) => return Err(GatewayError::Transient(e.to_string())),
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                match value["event"].as_str() {
                    Some("login") => return Ok(()),
                    Some("error") => {
                        return Err(GatewayError::Authentication(format!(
                            "{} {}",
                            value["code"], value["msg"]
                        )))
                    }
                    _ => continue,
                }
            }
            Err(GatewayError::Transient("socket closed during login".to_string()))
        })
        .await;

        match ack {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transient("login timed out".to_string())),
        }
    }

    pub async fn subscribe_tickers(&mut self, product_type: &str, symbols: &[String]) -> Result<(), GatewayError> {
        let args: Vec<Value> = symbols
            .iter()
            .map(|s| json!({ "instType": product_type, "channel": "ticker", "instId": s }))
            .collect();
        self.send_json(json!({ "op": "subscribe", "args": args })).await?;
        info!("📡 Subscribed to {} ticker(s)", symbols.len());
        Ok(())
    }

    pub async fn subscribe_orders(&mut self, product_type: &str) -> Result<(), GatewayError> {
        self.send_json(json!({
            "op": "subscribe",
            "args": [{ "instType": product_type, "channel": "orders", "instId": "default" }]
        }))
        .await?;
        info!("📡 Subscribed to private order updates");
        Ok(())
    }
}

/// Login payload. The timestamp is in seconds.
pub fn login_message(credentials: &Credentials, timestamp_secs: i64) -> Result<Value, GatewayError> {
    let timestamp = timestamp_secs.to_string();
    let signature = sign(&credentials.api_secret, &timestamp, "GET", "/user/verify", "")?;
    Ok(json!({
        "op": "login",
        "args": [{
            "apiKey": credentials.api_key,
            "passphrase": credentials.passphrase,
            "timestamp": timestamp,
            "sign": signature,
        }]
    }))
}

fn num(value: &Value, key: &str) -> Option<f64> {
    match &value[key] {
        Value::String(s) if !s.is_empty() => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn millis(value: &Value, key: &str) -> DateTime<Utc> {
    num(value, key)
        .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single())
        .unwrap_or_else(Utc::now)
}

/// Decodes channel pushes into gateway events. Tickers carry a rolling 24h
/// volume, so per-tick volume is the positive change since the last push.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    last_volume: HashMap<String, f64>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, text: &str) -> Vec<GatewayEvent> {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Vec::new();
        };
        match value["arg"]["channel"].as_str() {
            Some("ticker") => self.decode_tickers(&value),
            Some("orders") => decode_orders(&value),
            _ => Vec::new(),
        }
    }

    fn decode_tickers(&mut self, value: &Value) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        for row in value["data"].as_array().into_iter().flatten() {
            let Some(symbol) = row["instId"].as_str() else { continue };
            let Some(last) = num(row, "lastPr") else { continue };

            let volume_24h = num(row, "baseVolume").unwrap_or(0.0);
            let volume = match self.last_volume.insert(symbol.to_string(), volume_24h) {
                Some(previous) => (volume_24h - previous).max(0.0),
                None => 0.0,
            };

            events.push(GatewayEvent::Tick(TickUpdate {
                symbol: symbol.to_string(),
                bid: num(row, "bidPr").unwrap_or(last),
                ask: num(row, "askPr").unwrap_or(last),
                last,
                volume,
                funding_rate: num(row, "fundingRate"),
                timestamp: millis(row, "ts"),
            }));
        }
        events
    }
}

fn position_side(row: &Value, side: Side) -> PositionSide {
    match row["posSide"].as_str() {
        Some("long") => PositionSide::Long,
        Some("short") => PositionSide::Short,
        // hedge mode reports the book's side, not the trade direction
        _ => match side {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        },
    }
}

fn decode_orders(value: &Value) -> Vec<GatewayEvent> {
    let mut events = Vec::new();
    for row in value["data"].as_array().into_iter().flatten() {
        let symbol = row["instId"].as_str().unwrap_or_default().to_string();
        let client_id = row["clientOid"].as_str().unwrap_or_default().to_string();
        if symbol.is_empty() || client_id.is_empty() {
            continue;
        }
        let status = row["status"].as_str().unwrap_or_default();

        let trade_id = row["tradeId"].as_str().filter(|id| !id.is_empty());
        if let Some(trade_id) = trade_id {
            let reported_side = match row["side"].as_str() {
                Some("sell") => Side::Sell,
                _ => Side::Buy,
            };
            let closing = row["tradeSide"].as_str().map_or(false, |t| t.contains("close"));
            let book = position_side(row, reported_side);
            let side = if closing { book.close_side() } else { book.open_side() };

            let (Some(price), Some(quantity)) = (num(row, "fillPrice"), num(row, "baseVolume")) else {
                warn!(%client_id, "⚠️  Fill push without price or size");
                continue;
            };
            let filled = num(row, "accBaseVolume").unwrap_or(quantity);
            let size = num(row, "size").unwrap_or(filled);

            events.push(GatewayEvent::Fill(FillEvent {
                fill_id: trade_id.to_string(),
                client_id: client_id.clone(),
                symbol: symbol.clone(),
                side,
                position_side: book,
                price,
                quantity,
                fee: num(row, "fillFee").unwrap_or(0.0).abs(),
                is_final: status == "filled" || filled + 1e-12 >= size,
                timestamp: millis(row, "uTime"),
            }));
        } else if status == "canceled" || status == "cancelled" {
            events.push(GatewayEvent::OrderClosed { symbol, client_id });
        }
    }
    events
}

/// One reconnecting WebSocket subscription feeding a broadcast channel.
///
/// Emits `Connected` once subscribed (and logged in, for private feeds),
/// `Disconnected` and `Reconnecting` on failure, and notifies `connected`
/// after every successful (re)connect so the owner can reconcile.
pub struct WsFeed {
    pub url: String,
    pub product_type: String,
    pub symbols: Vec<String>,
    pub credentials: Option<Credentials>,
    pub backoff: Backoff,
}

impl WsFeed {
    pub fn public(url: &str, product_type: &str, symbols: Vec<String>, backoff: Backoff) -> Self {
        Self {
            url: url.to_string(),
            product_type: product_type.to_string(),
            symbols,
            credentials: None,
            backoff,
        }
    }

    pub fn private(url: &str, product_type: &str, credentials: Credentials, backoff: Backoff) -> Self {
        Self {
            url: url.to_string(),
            product_type: product_type.to_string(),
            symbols: Vec::new(),
            credentials: Some(credentials),
            backoff,
        }
    }

    fn label(&self) -> &'static str {
        if self.credentials.is_some() {
            "private"
        } else {
            "public"
        }
    }

    async fn open(&self) -> Result<BitgetWsClient, GatewayError> {
        let mut client = BitgetWsClient::connect(&self.url).await?;
        match &self.credentials {
            Some(credentials) => {
                client.login(credentials).await?;
                client.subscribe_orders(&self.product_type).await?;
            }
            None => client.subscribe_tickers(&self.product_type, &self.symbols).await?,
        }
        Ok(client)
    }

    pub async fn run(
        mut self,
        events: broadcast::Sender<GatewayEvent>,
        connected: Option<mpsc::UnboundedSender<()>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let label = self.label();
        let mut decoder = MessageDecoder::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let reason = match self.open().await {
                Ok(mut client) => {
                    info!(feed = label, "✅ Connected to Bitget WebSocket");
                    self.backoff.reset();
                    let _ = events.send(GatewayEvent::Connection(ConnectionStatus::Connected));
                    if let Some(tx) = &connected {
                        let _ = tx.send(());
                    }
                    match pump(&mut client, &mut decoder, &events, &mut shutdown).await {
                        None => break,
                        Some(reason) => reason,
                    }
                }
                Err(GatewayError::Authentication(msg)) => {
                    warn!(feed = label, %msg, "🔐 WebSocket login rejected");
                    format!("authentication failed: {}", msg)
                }
                Err(err) => err.to_string(),
            };

            warn!(feed = label, %reason, "🔌 WebSocket disconnected");
            let _ = events.send(GatewayEvent::Connection(ConnectionStatus::Disconnected { reason }));

            let delay = self.backoff.next_delay();
            let _ = events.send(GatewayEvent::Connection(ConnectionStatus::Reconnecting {
                attempt: self.backoff.attempt(),
                delay_ms: delay.as_millis() as u64,
            }));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!(feed = label, "WebSocket feed stopped");
    }
}

/// Read until the socket fails (returns the reason) or shutdown (returns None)
async fn pump(
    client: &mut BitgetWsClient,
    decoder: &mut MessageDecoder,
    events: &broadcast::Sender<GatewayEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<String> {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = client.ping().await {
                    return Some(e.to_string());
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
            message = client.ws_receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if text == "pong" {
                        continue;
                    }
                    for event in decoder.decode(&text) {
                        let _ = events.send(event);
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = client.ws_sender.send(Message::Pong(payload)).await {
                        return Some(e.to_string());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return Some(format!("closed by server: {:?}", frame));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(e.to_string()),
                None => return Some("stream ended".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_volume_is_delta_of_rolling_total() {
        let mut decoder = MessageDecoder::new();
        let push = |vol: &str| {
            format!(
                r#"{{"action":"snapshot","arg":{{"instType":"USDT-FUTURES","channel":"ticker","instId":"XRPUSDT"}},
                "data":[{{"instId":"XRPUSDT","lastPr":"0.52","bidPr":"0.5199","askPr":"0.5201","baseVolume":"{}","fundingRate":"0.0001","ts":"1700000000000"}}]}}"#,
                vol
            )
        };

        let first = decoder.decode(&push("1000"));
        let second = decoder.decode(&push("1250"));
        let rolled = decoder.decode(&push("900"));

        let volume = |events: &[GatewayEvent]| match &events[0] {
            GatewayEvent::Tick(t) => t.volume,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(volume(&first), 0.0);
        assert_eq!(volume(&second), 250.0);
        assert_eq!(volume(&rolled), 0.0);

        if let GatewayEvent::Tick(t) = &second[0] {
            assert_eq!(t.funding_rate, Some(0.0001));
            assert_eq!(t.bid, 0.5199);
        }
    }

    #[test]
    fn test_close_long_fill_is_a_sell_on_the_long_book() {
        let text = r#"{"action":"snapshot","arg":{"instType":"USDT-FUTURES","channel":"orders","instId":"default"},
            "data":[{"instId":"XRPUSDT","clientOid":"XRPUSDT-ab-000003","orderId":"1","side":"buy","tradeSide":"close",
            "posSide":"long","status":"filled","tradeId":"t-9","fillPrice":"0.53","baseVolume":"10","accBaseVolume":"10",
            "size":"10","fillFee":"-0.0053","uTime":"1700000000000"}]}"#;

        let events = MessageDecoder::new().decode(text);
        match &events[0] {
            GatewayEvent::Fill(fill) => {
                assert_eq!(fill.position_side, PositionSide::Long);
                assert_eq!(fill.side, Side::Sell);
                assert_eq!(fill.fill_id, "t-9");
                assert!(fill.is_final);
                assert!((fill.fee - 0.0053).abs() < 1e-12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_partial_fill_is_not_final() {
        let text = r#"{"arg":{"channel":"orders"},"data":[{"instId":"XRPUSDT","clientOid":"c1","side":"sell",
            "tradeSide":"open","status":"partially_filled","tradeId":"t-1","fillPrice":"0.55","baseVolume":"4",
            "accBaseVolume":"4","size":"10"}]}"#;
        match &MessageDecoder::new().decode(text)[0] {
            GatewayEvent::Fill(fill) => {
                assert_eq!(fill.position_side, PositionSide::Short);
                assert_eq!(fill.side, Side::Sell);
                assert!(!fill.is_final);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_cancel_push_closes_order() {
        let text = r#"{"arg":{"channel":"orders"},"data":[{"instId":"XRPUSDT","clientOid":"c2","status":"canceled"}]}"#;
        assert_eq!(
            MessageDecoder::new().decode(text),
            vec![GatewayEvent::OrderClosed { symbol: "XRPUSDT".into(), client_id: "c2".into() }]
        );
    }

    #[test]
    fn test_unrelated_messages_are_ignored() {
        let mut decoder = MessageDecoder::new();
        assert!(decoder.decode("pong").is_empty());
        assert!(decoder.decode(r#"{"event":"subscribe","arg":{"channel":"ticker"}}"#).is_empty());
    }

    #[test]
    fn test_login_message_shape() {
        let creds = Credentials {
            api_key: "k".into(),
            api_secret: "s".into(),
            passphrase: "p".into(),
        };
        let message = login_message(&creds, 1_700_000_000).unwrap();
        assert_eq!(message["op"], "login");
        assert_eq!(message["args"][0]["timestamp"], "1700000000");
        assert_eq!(message["args"][0]["sign"].as_str().map(str::len), Some(44));
    }
}
