// ===============================
// src/quantize.rs
// ===============================
//
// Price/quantity quantization against instrument metadata.
//
// Rounding modes:
// - round_price: round-half-up (f64::round; prices are positive).
// - round_qty  : floor to step, never rounds up past the caller's size.
// - shade_price: move N ticks away from the market (down for buy, up for
//   sell) so the resting order stays maker-side, then round.
//
use thiserror::Error;

use crate::domain::Side;

#[derive(Debug, Error, PartialEq)]
pub enum QuantizeError {
    #[error("invalid tick size {0} (instrument metadata is broken)")]
    BadTickSize(f64),
    #[error("invalid lot step {0}")]
    BadLotStep(f64),
}

fn check_tick(tick_size: f64) -> Result<(), QuantizeError> {
    if tick_size > 0.0 && tick_size.is_finite() {
        Ok(())
    } else {
        Err(QuantizeError::BadTickSize(tick_size))
    }
}

/// Integer tick index of a price: round(price / tick_size).
pub fn price_ticks(price: f64, tick_size: f64) -> Result<i64, QuantizeError> {
    check_tick(tick_size)?;
    Ok((price / tick_size).round() as i64)
}

/// Round to the nearest multiple of `tick_size` (half-up).
pub fn round_price(price: f64, tick_size: f64) -> Result<f64, QuantizeError> {
    let n = price_ticks(price, tick_size)?;
    Ok(n as f64 * tick_size)
}

/// Floor to the nearest multiple of `lot_step`.
pub fn round_qty(qty: f64, lot_step: f64) -> Result<f64, QuantizeError> {
    if !(lot_step > 0.0 && lot_step.is_finite()) {
        return Err(QuantizeError::BadLotStep(lot_step));
    }
    let n = (qty / lot_step).floor();
    Ok(n * lot_step)
}

/// Shade `base_price` by `shade_ticks` ticks in the maker-safe direction,
/// then round to tick.
pub fn shade_price(
    base_price: f64,
    side: Side,
    tick_size: f64,
    shade_ticks: i64,
) -> Result<f64, QuantizeError> {
    check_tick(tick_size)?;
    if shade_ticks <= 0 {
        return round_price(base_price, tick_size);
    }
    let adj = tick_size * shade_ticks as f64;
    let px = match side {
        Side::Buy => base_price - adj,
        Side::Sell => base_price + adj,
    };
    round_price(px, tick_size)
}

/// Format a quantized price for the wire. Delta takes limit_price as a
/// string; trim trailing zeros so 59995.0 goes out as "59995".
pub fn format_price(price: f64) -> String {
    let s = format!("{price:.10}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_price_is_idempotent() {
        for &(p, t) in &[(60012.37, 0.5), (100.04, 0.1), (0.0731, 0.0001), (59995.0, 1.0)] {
            let once = round_price(p, t).unwrap();
            let twice = round_price(once, t).unwrap();
            assert_eq!(once, twice, "p={p} t={t}");
        }
    }

    #[test]
    fn nearby_prices_share_a_tick_index() {
        // 99.98 and 100.04 both round to tick 1000 at tick_size 0.1
        assert_eq!(price_ticks(99.98, 0.1).unwrap(), 1000);
        assert_eq!(price_ticks(100.04, 0.1).unwrap(), 1000);
    }

    #[test]
    fn qty_floors_never_up() {
        assert_eq!(round_qty(9.99, 1.0).unwrap(), 9.0);
        assert_eq!(round_qty(10.0, 1.0).unwrap(), 10.0);
        assert_eq!(round_qty(0.7, 0.25).unwrap(), 0.5);
    }

    #[test]
    fn shading_moves_away_from_market() {
        let buy = shade_price(60000.0, Side::Buy, 0.5, 2).unwrap();
        let sell = shade_price(60000.0, Side::Sell, 0.5, 2).unwrap();
        assert_eq!(buy, 59999.0);
        assert_eq!(sell, 60001.0);
        // zero shade is a plain rounding
        assert_eq!(shade_price(60000.3, Side::Buy, 0.5, 0).unwrap(), 60000.5);
    }

    #[test]
    fn bad_tick_size_is_an_error_not_a_noop() {
        assert_eq!(round_price(100.0, 0.0), Err(QuantizeError::BadTickSize(0.0)));
        assert!(round_price(100.0, -0.5).is_err());
        assert!(shade_price(100.0, Side::Buy, 0.0, 1).is_err());
    }

    #[test]
    fn price_formatting_trims_zeros() {
        assert_eq!(format_price(59995.0), "59995");
        assert_eq!(format_price(60000.5), "60000.5");
        assert_eq!(format_price(0.0731), "0.0731");
    }
}
