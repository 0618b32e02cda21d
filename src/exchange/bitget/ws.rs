// =============================================================================
// Bitget WebSocket streams — public tickers and private order updates
// =============================================================================
//
// Each stream runs in its own task with an outer reconnect loop (5 s backoff).
// Bitget expects a literal "ping" text frame at least every 30 s and answers
// "pong". The private stream logs in first, then subscribes to the orders
// channel; fills are pushed out keyed by client order id.
// =============================================================================

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::exchange::bitget::rest::BitgetRest;
use crate::exchange::{FillResponse, Ticker};
use crate::types::{InstType, TradeSide};

const PUBLIC_WS_URL: &str = "wss://ws.bitget.com/v2/ws/public";
const PRIVATE_WS_URL: &str = "wss://ws.bitget.com/v2/ws/private";

/// Keepalive interval; Bitget drops connections silent for 30 s.
const PING_INTERVAL_SECS: u64 = 25;
/// Backoff between reconnect attempts.
const RECONNECT_DELAY_SECS: u64 = 5;

/// Subscription changes pushed into the public stream task.
#[derive(Debug)]
pub enum WsCommand {
    Subscribe(String),
    Unsubscribe(String),
}

fn ws_inst_type(inst_type: InstType) -> &'static str {
    match inst_type {
        InstType::Spot => "SPOT",
        InstType::Futures => "USDT-FUTURES",
    }
}

fn subscribe_frame(inst_type: InstType, channel: &str, inst_id: &str, op: &str) -> String {
    serde_json::json!({
        "op": op,
        "args": [{
            "instType": ws_inst_type(inst_type),
            "channel": channel,
            "instId": inst_id,
        }]
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Public ticker stream
// ---------------------------------------------------------------------------

/// Connect to the public WebSocket, keep the subscription set in sync, and
/// fan ticker pushes into `tick_tx` as `(symbol, Ticker)`.
///
/// Runs until the connection drops or a command-channel close, then returns
/// so the caller's reconnect loop can re-establish it. `subscribed` survives
/// reconnects: every symbol in it is re-subscribed on each new connection.
pub async fn run_public_stream(
    inst_type: InstType,
    subscribed: Arc<Mutex<HashSet<String>>>,
    commands: &mut mpsc::Receiver<WsCommand>,
    tick_tx: broadcast::Sender<(String, Ticker)>,
    up: &(dyn Fn(bool) + Send + Sync),
) -> Result<()> {
    info!(url = PUBLIC_WS_URL, %inst_type, "connecting to public WebSocket");
    let (ws_stream, _response) = connect_async(PUBLIC_WS_URL)
        .await
        .context("failed to connect to public WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    // Replay the current subscription set onto the fresh connection.
    let symbols: Vec<String> = subscribed.lock().iter().cloned().collect();
    for symbol in &symbols {
        write
            .send(Message::Text(subscribe_frame(inst_type, "ticker", symbol, "subscribe")))
            .await
            .context("failed to send ticker subscribe")?;
    }
    info!(count = symbols.len(), "public WebSocket connected, subscriptions replayed");
    up(true);

    let mut ping = tokio::time::interval(std::time::Duration::from_secs(PING_INTERVAL_SECS));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Text("ping".into())).await {
                    break Err(anyhow::anyhow!("ping failed: {e}"));
                }
            }
            command = commands.recv() => {
                match command {
                    Some(WsCommand::Subscribe(symbol)) => {
                        subscribed.lock().insert(symbol.clone());
                        let frame = subscribe_frame(inst_type, "ticker", &symbol, "subscribe");
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            break Err(anyhow::anyhow!("failed to send ticker subscribe: {e}"));
                        }
                        debug!(symbol, "ticker subscribed");
                    }
                    Some(WsCommand::Unsubscribe(symbol)) => {
                        subscribed.lock().remove(&symbol);
                        let frame = subscribe_frame(inst_type, "ticker", &symbol, "unsubscribe");
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            break Err(anyhow::anyhow!("failed to send ticker unsubscribe: {e}"));
                        }
                        debug!(symbol, "ticker unsubscribed");
                    }
                    None => break Ok(()),
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "pong" {
                            continue;
                        }
                        match parse_ticker_push(&text) {
                            Ok(Some((symbol, ticker))) => {
                                let _ = tick_tx.send((symbol, ticker));
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "failed to parse ticker push"),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(anyhow::anyhow!("public WebSocket read error: {e}")),
                    None => break Err(anyhow::anyhow!("public WebSocket stream ended")),
                }
            }
        }
    };

    up(false);
    result
}

/// Spawn the public stream with its reconnect loop.
pub fn spawn_public_stream(
    inst_type: InstType,
    subscribed: Arc<Mutex<HashSet<String>>>,
    mut commands: mpsc::Receiver<WsCommand>,
    tick_tx: broadcast::Sender<(String, Ticker)>,
    up: impl Fn(bool) + Send + Sync + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) =
                run_public_stream(inst_type, subscribed.clone(), &mut commands, tick_tx.clone(), &up)
                    .await
            {
                error!(error = %e, "public stream error — reconnecting in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                continue;
            }
            // Command channel closed: the connector is shutting down.
            break;
        }
    })
}

/// Parse a ticker push into `(symbol, Ticker)`. Non-data frames (subscribe
/// acks, error frames) yield `None`.
fn parse_ticker_push(text: &str) -> Result<Option<(String, Ticker)>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse ticker JSON")?;

    if root.get("event").is_some() {
        // subscribe/unsubscribe ack or error notification
        if root["event"] == "error" {
            warn!(frame = %text, "public WebSocket error frame");
        }
        return Ok(None);
    }

    let Some(entry) = root["data"].as_array().and_then(|d| d.first()) else {
        return Ok(None);
    };
    if root["arg"]["channel"] != "ticker" {
        return Ok(None);
    }

    let symbol = entry["instId"]
        .as_str()
        .context("ticker push missing instId")?
        .to_string();
    let last_price = Decimal::from_str(
        entry["lastPr"].as_str().context("ticker push missing lastPr")?,
    )
    .context("failed to parse lastPr")?;
    let ts_ms: i64 = entry["ts"]
        .as_str()
        .context("ticker push missing ts")?
        .parse()
        .context("failed to parse ts")?;

    Ok(Some((symbol, Ticker { last_price, ts_ms })))
}

// ---------------------------------------------------------------------------
// Private order stream
// ---------------------------------------------------------------------------

/// Connect to the private WebSocket, log in, subscribe to order updates, and
/// fan fully-filled orders into `fill_tx` keyed by client order id.
pub async fn run_private_stream(
    inst_type: InstType,
    rest: Arc<BitgetRest>,
    fill_tx: broadcast::Sender<(String, FillResponse)>,
    up: &(dyn Fn(bool) + Send + Sync),
) -> Result<()> {
    info!(url = PRIVATE_WS_URL, %inst_type, "connecting to private WebSocket");
    let (ws_stream, _response) = connect_async(PRIVATE_WS_URL)
        .await
        .context("failed to connect to private WebSocket")?;
    let (mut write, mut read) = ws_stream.split();

    // Login, then wait for the ack before subscribing.
    let ts_secs = BitgetRest::timestamp_ms() / 1000;
    let login = serde_json::json!({
        "op": "login",
        "args": [{
            "apiKey": rest.api_key(),
            "passphrase": rest.passphrase(),
            "timestamp": ts_secs.to_string(),
            "sign": rest.ws_login_signature(ts_secs),
        }]
    });
    write
        .send(Message::Text(login.to_string()))
        .await
        .context("failed to send login frame")?;

    let mut ping = tokio::time::interval(std::time::Duration::from_secs(PING_INTERVAL_SECS));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut logged_in = false;

    let result = loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Text("ping".into())).await {
                    break Err(anyhow::anyhow!("ping failed: {e}"));
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "pong" {
                            continue;
                        }
                        let root: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(error = %e, "failed to parse private frame");
                                continue;
                            }
                        };

                        if root["event"] == "login" {
                            if root["code"].as_str() == Some("0") || root["code"].as_i64() == Some(0) {
                                info!("private WebSocket logged in");
                                logged_in = true;
                                up(true);
                                let frame = subscribe_frame(inst_type, "orders", "default", "subscribe");
                                if let Err(e) = write.send(Message::Text(frame)).await {
                                    break Err(anyhow::anyhow!("failed to subscribe orders channel: {e}"));
                                }
                            } else {
                                break Err(anyhow::anyhow!("private WebSocket login rejected: {text}"));
                            }
                            continue;
                        }
                        if root["event"] == "error" {
                            warn!(frame = %text, "private WebSocket error frame");
                            continue;
                        }
                        if !logged_in || root["arg"]["channel"] != "orders" {
                            continue;
                        }

                        for fill in parse_order_push(&root, inst_type) {
                            let key = fill
                                .client_order_id
                                .clone()
                                .unwrap_or_else(|| fill.order_id.clone());
                            let _ = fill_tx.send((key, fill));
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(anyhow::anyhow!("private WebSocket read error: {e}")),
                    None => break Err(anyhow::anyhow!("private WebSocket stream ended")),
                }
            }
        }
    };

    up(false);
    result
}

/// Spawn the private stream with its reconnect loop.
pub fn spawn_private_stream(
    inst_type: InstType,
    rest: Arc<BitgetRest>,
    fill_tx: broadcast::Sender<(String, FillResponse)>,
    up: impl Fn(bool) + Send + Sync + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) =
                run_private_stream(inst_type, rest.clone(), fill_tx.clone(), &up).await
            {
                error!(error = %e, "private stream error — reconnecting in 5s");
                tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_DELAY_SECS)).await;
                continue;
            }
            break;
        }
    })
}

/// Extract fully-filled orders from an orders-channel push. Partial states
/// ("live", "partially_filled") are ignored; the engine applies fills only
/// when the order is done.
fn parse_order_push(root: &serde_json::Value, inst_type: InstType) -> Vec<FillResponse> {
    let Some(entries) = root["data"].as_array() else {
        return Vec::new();
    };

    let mut fills = Vec::new();
    for entry in entries {
        if entry["status"].as_str() != Some("filled") {
            continue;
        }

        let dec_field = |name: &str| -> Option<Decimal> {
            entry[name].as_str().and_then(|s| Decimal::from_str(s).ok())
        };

        let Some(order_id) = entry["orderId"].as_str() else {
            warn!("order push missing orderId");
            continue;
        };
        let Some(filled_price) = dec_field("priceAvg") else {
            warn!(order_id, "order push missing priceAvg");
            continue;
        };
        // Spot reports the filled base amount as accBaseVolume, futures as
        // baseVolume; fall back across both.
        let Some(filled_base_amount) = dec_field("accBaseVolume").or_else(|| dec_field("baseVolume"))
        else {
            warn!(order_id, "order push missing filled amount");
            continue;
        };

        let fee = entry["feeDetail"]
            .as_array()
            .and_then(|fees| fees.first())
            .and_then(|f| f["totalFee"].as_str())
            .and_then(|s| Decimal::from_str(s).ok())
            .map(|f| f.abs())
            .unwrap_or(Decimal::ZERO);

        let trade_side = match entry["tradeSide"].as_str() {
            Some("open") => Some(TradeSide::Open),
            Some("close") => Some(TradeSide::Close),
            _ => None,
        };

        fills.push(FillResponse {
            symbol: entry["instId"].as_str().unwrap_or_default().to_string(),
            order_id: order_id.to_string(),
            client_order_id: entry["clientOid"].as_str().map(str::to_string),
            trade_side,
            filled_price,
            filled_base_amount,
            filled_quote_value: dec_field("quoteVolume")
                .unwrap_or_else(|| filled_price * filled_base_amount),
            fee,
            profit: if inst_type == InstType::Futures {
                dec_field("totalProfits")
            } else {
                None
            },
            trade_time_ms: entry["uTime"]
                .as_str()
                .or_else(|| entry["fillTime"].as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        });
    }
    fills
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ticker_push_parses() {
        let text = r#"{
            "action": "snapshot",
            "arg": { "instType": "SPOT", "channel": "ticker", "instId": "BTCUSDT" },
            "data": [{ "instId": "BTCUSDT", "lastPr": "99.00", "ts": "1700000000000" }]
        }"#;
        let (symbol, ticker) = parse_ticker_push(text).unwrap().unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert_eq!(ticker.last_price, dec!(99.00));
        assert_eq!(ticker.ts_ms, 1_700_000_000_000);
    }

    #[test]
    fn subscribe_ack_yields_none() {
        let text = r#"{ "event": "subscribe", "arg": { "channel": "ticker", "instId": "BTCUSDT" } }"#;
        assert!(parse_ticker_push(text).unwrap().is_none());
    }

    #[test]
    fn order_push_extracts_filled_orders_only() {
        let root: serde_json::Value = serde_json::from_str(
            r#"{
                "arg": { "channel": "orders", "instId": "default" },
                "data": [
                    { "instId": "ETHUSDT", "orderId": "1", "clientOid": "grid_ab12cd34_0_9_tp",
                      "status": "filled", "priceAvg": "101.60", "accBaseVolume": "1.0000",
                      "feeDetail": [{ "totalFee": "-0.10" }], "uTime": "1700000000500" },
                    { "instId": "ETHUSDT", "orderId": "2", "status": "live", "priceAvg": "0" }
                ]
            }"#,
        )
        .unwrap();

        let fills = parse_order_push(&root, InstType::Spot);
        assert_eq!(fills.len(), 1);
        let fill = &fills[0];
        assert_eq!(fill.order_id, "1");
        assert_eq!(fill.client_order_id.as_deref(), Some("grid_ab12cd34_0_9_tp"));
        assert_eq!(fill.filled_price, dec!(101.60));
        assert_eq!(fill.fee, dec!(0.10));
        assert_eq!(fill.filled_quote_value, dec!(101.60));
    }

    #[test]
    fn subscribe_frame_shape() {
        let frame = subscribe_frame(InstType::Futures, "ticker", "BTCUSDT", "subscribe");
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["op"], "subscribe");
        assert_eq!(v["args"][0]["instType"], "USDT-FUTURES");
        assert_eq!(v["args"][0]["instId"], "BTCUSDT");
    }
}
