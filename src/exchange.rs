// ===============================
// src/exchange.rs
// ===============================
//
// High-level Delta API client plus the single normalization boundary.
// The exchange returns heterogeneous payload shapes (positions come back as
// a list, a wrapped list, or a bare object; numbers arrive as strings);
// everything shape-dependent is sniffed here and nowhere else. The rest of
// the bot only ever sees InstrumentInfo / Position / LiveOrder.
//
use reqwest::Method;
use serde_json::{json, Value};
use tracing::warn;

use crate::domain::{InstrumentInfo, LiveOrder, Position, PositionSide, Side};
use crate::transport::{Transport, TransportError};

pub struct DeltaClient {
    transport: Transport,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderRequest {
    pub product_id: i64,
    pub side: Side,
    pub size: u32,
    pub limit_price: String,
    pub post_only: bool,
    pub reduce_only: bool,
    pub client_order_id: String,
}

impl DeltaClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    pub async fn get_product(&self, symbol: &str) -> Result<InstrumentInfo, TransportError> {
        let path = format!("/v2/products/{symbol}");
        let data = self.transport.request(Method::GET, &path, &[], None, false).await?;
        normalize_product(data.get("result").unwrap_or(&Value::Null))
    }

    /// Point-in-time mark price from the public ticker. Used when the WS
    /// feed has no fresh value.
    pub async fn get_mark_price(&self, symbol: &str) -> Result<f64, TransportError> {
        let path = format!("/v2/tickers/{symbol}");
        let data = self.transport.request(Method::GET, &path, &[], None, false).await?;
        data.pointer("/result/mark_price")
            .and_then(as_f64)
            .ok_or_else(|| TransportError::Payload(format!("no mark_price in ticker for {symbol}")))
    }

    pub async fn get_position(&self, product_id: i64) -> Result<Position, TransportError> {
        let query = [("product_id", product_id.to_string())];
        let data = self
            .transport
            .request(Method::GET, "/v2/positions", &query, None, true)
            .await?;
        Ok(normalize_position(data.get("result").unwrap_or(&Value::Null)))
    }

    /// Open + pending orders for one product.
    pub async fn get_open_orders(&self, product_id: i64) -> Result<Vec<LiveOrder>, TransportError> {
        let query = [
            ("states", "open,pending".to_string()),
            ("product_ids", product_id.to_string()),
        ];
        let data = self
            .transport
            .request(Method::GET, "/v2/orders", &query, None, true)
            .await?;
        Ok(normalize_orders(data.get("result").unwrap_or(&Value::Null)))
    }

    pub async fn place_limit_order(&self, req: &PlaceOrderRequest) -> Result<Value, TransportError> {
        let body = json!({
            "product_id": req.product_id,
            "size": req.size,
            "side": req.side.as_str(),
            "order_type": "limit_order",
            // string to preserve precision on the wire
            "limit_price": req.limit_price,
            "time_in_force": "gtc",
            "post_only": req.post_only,
            "reduce_only": req.reduce_only,
            "client_order_id": req.client_order_id,
        });
        self.transport.request(Method::POST, "/v2/orders", &[], Some(&body), true).await
    }

    /// Cancel one order. Prefers client_order_id when we have it (it is
    /// under our control), falls back to the exchange id.
    pub async fn cancel_order(
        &self,
        product_id: i64,
        order_id: i64,
        client_order_id: Option<&str>,
    ) -> Result<Value, TransportError> {
        let body = match client_order_id {
            Some(coid) => json!({
                "product_id": product_id,
                "client_order_id": coid,
            }),
            None => json!({
                "product_id": product_id,
                "id": order_id,
            }),
        };
        self.transport.request(Method::DELETE, "/v2/orders", &[], Some(&body), true).await
    }

    pub async fn cancel_all(&self, product_id: i64) -> Result<Value, TransportError> {
        let body = json!({ "product_id": product_id });
        self.transport.request(Method::DELETE, "/v2/orders/all", &[], Some(&body), true).await
    }

    pub async fn set_leverage(&self, product_id: i64, leverage: u32) -> Result<Value, TransportError> {
        let path = format!("/v2/products/{product_id}/orders/leverage");
        let body = json!({ "leverage": leverage });
        self.transport.request(Method::POST, &path, &[], Some(&body), true).await
    }
}

/// The exchange rejecting a duplicate client_order_id means the order is
/// already resting server-side; callers treat this as success.
pub fn is_duplicate_coid_error(err: &TransportError) -> bool {
    err.api_code()
        .map(|c| c.contains("duplicate") || c.contains("client_order_id"))
        .unwrap_or(false)
}

// ---- normalization boundary ----

/// Numbers arrive as JSON numbers or as strings; accept both.
fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    as_f64(v).map(|f| f as i64)
}

fn normalize_product(result: &Value) -> Result<InstrumentInfo, TransportError> {
    let product_id = result
        .get("id")
        .and_then(as_i64)
        .ok_or_else(|| TransportError::Payload(format!("product payload missing id: {result}")))?;
    let symbol = result
        .get("symbol")
        .and_then(|s| s.as_str())
        .ok_or_else(|| TransportError::Payload("product payload missing symbol".to_string()))?
        .to_string();
    let tick_size = result.get("tick_size").and_then(as_f64).unwrap_or(0.0);
    if tick_size <= 0.0 {
        // broken metadata must fail resolution, not silently no-op later
        return Err(TransportError::Payload(format!(
            "product {symbol} has invalid tick_size {tick_size}"
        )));
    }
    let contract_value = result.get("contract_value").and_then(as_f64).unwrap_or(0.0);
    Ok(InstrumentInfo { product_id, symbol, tick_size, contract_value })
}

/// Collapse the observed position payload shapes into one record:
/// a bare list, `{"positions": [...]}`, `{"position": {...}}`, or a single
/// object. Anything unrecognized is treated as flat.
pub fn normalize_position(result: &Value) -> Position {
    let item: Option<&Value> = match result {
        Value::Array(items) => items.first(),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("positions") {
                items.first()
            } else if let Some(pos @ Value::Object(_)) = map.get("position") {
                Some(pos)
            } else if map.contains_key("size") {
                Some(result)
            } else {
                None
            }
        }
        _ => None,
    };
    let Some(p) = item else { return Position::default() };

    let size = p.get("size").and_then(as_f64).unwrap_or(0.0);
    // side field when present, else the sign of size
    let side = match p.get("side").and_then(|s| s.as_str()) {
        Some("buy") => PositionSide::Long,
        Some("sell") => PositionSide::Short,
        _ if size > 0.0 => PositionSide::Long,
        _ if size < 0.0 => PositionSide::Short,
        _ => PositionSide::Flat,
    };
    let open_lots = size.abs() as u32;
    if side == PositionSide::Flat || open_lots == 0 {
        return Position::default();
    }
    let avg_price = p
        .get("entry_price")
        .and_then(as_f64)
        .or_else(|| p.get("avg_entry_price").and_then(as_f64))
        .filter(|px| *px > 0.0);
    Position { side, open_lots, avg_price }
}

pub fn normalize_orders(result: &Value) -> Vec<LiveOrder> {
    let Some(items) = result.as_array() else { return Vec::new() };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match normalize_order(item) {
            Some(o) => out.push(o),
            None => warn!(payload = %item, "skipping malformed order payload"),
        }
    }
    out
}

fn normalize_order(item: &Value) -> Option<LiveOrder> {
    let id = item.get("id").and_then(as_i64)?;
    let side = match item.get("side").and_then(|s| s.as_str())? {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        _ => return None,
    };
    let limit_price = item
        .get("limit_price")
        .and_then(as_f64)
        .or_else(|| item.get("price").and_then(as_f64))?;
    let size = item.get("size").and_then(as_i64).unwrap_or(0);
    let unfilled_size = item.get("unfilled_size").and_then(as_i64).unwrap_or(size);
    let state = item
        .get("state")
        .and_then(|s| s.as_str())
        .unwrap_or("open")
        .to_string();
    let product_id = item.get("product_id").and_then(as_i64).unwrap_or(0);
    let client_order_id = item
        .get("client_order_id")
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    Some(LiveOrder { id, client_order_id, side, limit_price, size, unfilled_size, state, product_id })
}
