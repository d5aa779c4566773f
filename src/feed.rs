// ===============================
// src/feed.rs
// ===============================
//
// Mark price feed over the public Delta WebSocket.
//
// Subscribes to the `mark_price` channel for MARK:{SYMBOL} and publishes the
// latest value (with a received-at stamp) through a watch channel. The
// control loop treats this as a read-only source and falls back to a REST
// ticker query when the value is stale or absent, so this task only has to
// keep trying — it never fails the bot.
//
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use url::Url;

use crate::domain::MarkPrice;
use crate::metrics::{MARK_PRICE, WS_CONNECTED, WS_RECONNECTS};

fn subscribe_payload(symbol: &str) -> String {
    json!({
        "type": "subscribe",
        "payload": {
            "channels": [
                { "name": "mark_price", "symbols": [format!("MARK:{symbol}")] }
            ]
        }
    })
    .to_string()
}

fn parse_price(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub async fn run_mark_price(ws_base: String, symbol: String, tx: watch::Sender<MarkPrice>) {
    let ws_url = ws_base.trim_end_matches('/').to_string();
    if Url::parse(&ws_url).is_err() {
        error!(%ws_url, "bad ws url, mark price feed disabled");
        return;
    }
    let mark_symbol = format!("MARK:{symbol}");

    let mut attempt: u32 = 0;
    loop {
        info!(%ws_url, %symbol, "connecting mark price feed");
        match connect_async(ws_url.as_str()).await {
            Ok((mut ws, _resp)) => {
                if let Err(e) = ws.send(Message::Text(subscribe_payload(&symbol))).await {
                    error!(?e, "subscribe send failed");
                } else {
                    info!("subscribed to {}", mark_symbol);
                    WS_CONNECTED.with_label_values(&[&symbol]).set(1);
                    attempt = 0; // reset backoff

                    while let Some(frame) = ws.next().await {
                        match frame {
                            Ok(m) if m.is_text() => {
                                let txt = match m.into_text() {
                                    Ok(t) => t,
                                    Err(e) => {
                                        warn!(?e, "failed to read text frame");
                                        continue;
                                    }
                                };
                                let Ok(v) = serde_json::from_str::<serde_json::Value>(&txt) else {
                                    continue;
                                };
                                if v.get("type").and_then(|t| t.as_str()) != Some("mark_price") {
                                    continue;
                                }
                                if v.get("symbol").and_then(|s| s.as_str()) != Some(mark_symbol.as_str()) {
                                    continue;
                                }
                                if let Some(price) = v.get("price").and_then(parse_price) {
                                    let mp = MarkPrice { price, received_at: Utc::now().timestamp() };
                                    let _ = tx.send(mp);
                                    MARK_PRICE.with_label_values(&[&symbol]).set(price);
                                }
                            }
                            Ok(_) => {
                                // ignore non-text frames
                            }
                            Err(e) => {
                                error!(?e, "ws read error");
                                break;
                            }
                        }
                    }
                    info!("mark price feed disconnected, will reconnect…");
                }
                WS_CONNECTED.with_label_values(&[&symbol]).set(0);
            }
            Err(e) => {
                error!(?e, "connect failed");
            }
        }

        // Exponential backoff + jitter
        WS_RECONNECTS.with_label_values(&[&symbol]).inc();
        attempt = attempt.saturating_add(1);
        let shift = attempt.min(6);
        let factor = 1u64 << shift;                  // 2,4,...,64
        let base_ms = 500u64.saturating_mul(factor); // 1s..32s
        let jitter = rand::thread_rng().gen_range(0..=250);
        sleep(Duration::from_millis(base_ms + jitter)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_payload_names_the_mark_channel() {
        let p: serde_json::Value = serde_json::from_str(&subscribe_payload("BTCUSD")).unwrap();
        assert_eq!(p["type"], "subscribe");
        assert_eq!(p["payload"]["channels"][0]["name"], "mark_price");
        assert_eq!(p["payload"]["channels"][0]["symbols"][0], "MARK:BTCUSD");
    }

    #[test]
    fn price_parses_string_or_number() {
        assert_eq!(parse_price(&json!("60000.5")), Some(60000.5));
        assert_eq!(parse_price(&json!(60000.5)), Some(60000.5));
        assert_eq!(parse_price(&json!(null)), None);
    }
}
