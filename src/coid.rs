// ===============================
// src/coid.rs
// ===============================
//
// Deterministic client order ids. The id is a pure function of
// (env, kind, side, product, quantized tick index), so two cycles that want
// the same order produce byte-identical ids and the exchange's duplicate
// check becomes our idempotency guard. The NAMESPACE prefix doubles as the
// ownership marker: the reconciler only ever cancels orders carrying it.
//
use crate::domain::{IntentKind, Side};
use crate::quantize::{price_ticks, QuantizeError};

pub const NAMESPACE: &str = "GRIDBOT";

/// `{NAMESPACE}-{ENV}-{KIND}-{SIDE}-P{product_id}-T{ticks}`
pub fn make_coid(
    env: &str,
    kind: IntentKind,
    side: Side,
    product_id: i64,
    price: f64,
    tick_size: f64,
) -> Result<String, QuantizeError> {
    let ticks = price_ticks(price, tick_size)?;
    Ok(format!(
        "{NAMESPACE}-{}-{}-{}-P{product_id}-T{ticks}",
        env.to_ascii_uppercase(),
        kind.token(),
        side.token(),
    ))
}

/// Does this client order id belong to us?
pub fn is_ours(client_order_id: &str) -> bool {
    client_order_id.starts_with(NAMESPACE)
        && client_order_id.as_bytes().get(NAMESPACE.len()) == Some(&b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_identical_ids() {
        let a = make_coid("demo", IntentKind::TakeProfit, Side::Sell, 27, 60020.0, 0.5).unwrap();
        let b = make_coid("demo", IntentKind::TakeProfit, Side::Sell, 27, 60020.0, 0.5).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "GRIDBOT-DEMO-TP-SELL-P27-T120040");
    }

    #[test]
    fn prices_on_the_same_tick_collapse_to_one_id() {
        // both round to tick 1000 at tick_size 0.1
        let a = make_coid("live", IntentKind::Seed, Side::Buy, 1, 99.98, 0.1).unwrap();
        let b = make_coid("live", IntentKind::Seed, Side::Buy, 1, 100.04, 0.1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn env_and_kind_separate_ids() {
        let demo = make_coid("demo", IntentKind::Seed, Side::Buy, 27, 59995.0, 0.5).unwrap();
        let live = make_coid("live", IntentKind::Seed, Side::Buy, 27, 59995.0, 0.5).unwrap();
        let avg = make_coid("demo", IntentKind::AvgDown, Side::Buy, 27, 59995.0, 0.5).unwrap();
        assert_ne!(demo, live);
        assert_ne!(demo, avg);
    }

    #[test]
    fn ownership_marker() {
        assert!(is_ours("GRIDBOT-DEMO-TP-SELL-P27-T120040"));
        assert!(!is_ours("GRIDBOTX-DEMO-TP"));
        assert!(!is_ours("OTHERBOT-DEMO-TP-SELL-01"));
        assert!(!is_ours(""));
    }

    #[test]
    fn bad_tick_size_propagates() {
        assert!(make_coid("demo", IntentKind::Seed, Side::Buy, 27, 100.0, 0.0).is_err());
    }
}
