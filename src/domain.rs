// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
    /// Uppercase token used inside client order ids.
    pub fn token(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionSide {
    #[default]
    Flat,
    Long,
    Short,
}

/// Normalized position, rebuilt from exchange truth every poll cycle.
/// `avg_price` is absent iff `open_lots == 0`.
#[derive(Debug, Clone, Default)]
pub struct Position {
    pub side: PositionSide,
    pub open_lots: u32,
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    Seed,
    AvgDown,
    TakeProfit,
}

impl IntentKind {
    /// Uppercase token used inside client order ids.
    pub fn token(&self) -> &'static str {
        match self {
            IntentKind::Seed => "SEED",
            IntentKind::AvgDown => "AVG",
            IntentKind::TakeProfit => "TP",
        }
    }
}

/// Desired order for this cycle, before price shading/quantization.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub side: Side,
    pub qty_lots: u32,
    pub price: f64,
    pub kind: IntentKind,
}

/// Exchange metadata for one product, resolved once and cached.
#[derive(Debug, Clone)]
pub struct InstrumentInfo {
    pub product_id: i64,
    pub symbol: String,
    pub tick_size: f64,
    pub contract_value: f64,
}

/// Quantized, identity-carrying order the reconciler converges toward.
/// `client_order_id` is a pure function of (env, kind, side, product, ticks),
/// so recomputing the same target always yields the same id.
#[derive(Debug, Clone)]
pub struct TargetOrder {
    pub side: Side,
    pub price: f64,
    pub ticks: i64,
    pub qty_lots: u32,
    pub kind: IntentKind,
    pub client_order_id: String,
}

/// Open order as reported by the exchange. The exchange owns these; we only
/// read snapshots and issue place/cancel requests against them.
#[derive(Debug, Clone)]
pub struct LiveOrder {
    pub id: i64,
    pub client_order_id: Option<String>,
    pub side: Side,
    pub limit_price: f64,
    pub size: i64,
    pub unfilled_size: i64,
    pub state: String,
    pub product_id: i64,
}

/// Latest mark price published by the WS feed task.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkPrice {
    pub price: f64,
    /// Unix seconds when the value was received; 0 = never.
    pub received_at: i64,
}
