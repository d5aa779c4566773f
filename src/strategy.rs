// ===============================
// src/strategy.rs
// ===============================
//
// Grid/martingale target computation. Pure: (position, mark price, config)
// -> desired order intents, no I/O and no failure path. Config is validated
// at load time (see config.rs), so steps are trusted to be positive here.
//
// Per cycle:
// - flat           -> one SEED intent on the configured side
// - position open  -> exactly one TAKE_PROFIT (opposite side, qty L+1 so a
//                     fill flips the position by one lot) and at most one
//                     AVERAGE_DOWN (same side, qty L*multiplier), the latter
//                     suppressed when it would breach max_total_lots.
//
use crate::config::StrategyConfig;
use crate::domain::{IntentKind, OrderIntent, Position, PositionSide, Side};

pub fn compute_targets(
    position: &Position,
    mark_price: f64,
    cfg: &StrategyConfig,
) -> Vec<OrderIntent> {
    let mut intents = Vec::with_capacity(2);

    let is_long = match position.side {
        PositionSide::Flat => {
            let price = match cfg.seed_side {
                Side::Buy => mark_price - cfg.seed_offset_usd,
                Side::Sell => mark_price + cfg.seed_offset_usd,
            };
            intents.push(OrderIntent {
                side: cfg.seed_side,
                qty_lots: 1,
                price,
                kind: IntentKind::Seed,
            });
            return intents;
        }
        PositionSide::Long => true,
        PositionSide::Short => false,
    };

    let lots = position.open_lots;
    let avg = position.avg_price.unwrap_or(mark_price);

    // AVERAGE_DOWN: same side, worse price, martingale sizing. The risk cap
    // suppresses it silently; it never errors.
    let avg_qty = lots.saturating_mul(cfg.avg_multiplier);
    if lots.saturating_add(avg_qty) <= cfg.max_total_lots {
        intents.push(OrderIntent {
            side: if is_long { Side::Buy } else { Side::Sell },
            qty_lots: avg_qty,
            price: if is_long { avg - cfg.avg_step_usd } else { avg + cfg.avg_step_usd },
            kind: IntentKind::AvgDown,
        });
    }

    // TAKE_PROFIT: always emitted, qty L+1 so any fill flips the position.
    intents.push(OrderIntent {
        side: if is_long { Side::Sell } else { Side::Buy },
        qty_lots: lots + 1,
        price: if is_long { avg + cfg.tp_step_usd } else { avg - cfg.tp_step_usd },
        kind: IntentKind::TakeProfit,
    });

    intents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> StrategyConfig {
        StrategyConfig {
            seed_side: Side::Buy,
            seed_offset_usd: 5.0,
            tp_step_usd: 20.0,
            avg_step_usd: 20.0,
            avg_multiplier: 2,
            max_total_lots: 10,
        }
    }

    fn long(lots: u32, avg: f64) -> Position {
        Position { side: PositionSide::Long, open_lots: lots, avg_price: Some(avg) }
    }

    #[test]
    fn flat_emits_single_seed_below_mark() {
        let out = compute_targets(&Position::default(), 60000.0, &cfg());
        assert_eq!(out.len(), 1);
        let seed = &out[0];
        assert_eq!(seed.kind, IntentKind::Seed);
        assert_eq!(seed.side, Side::Buy);
        assert_eq!(seed.qty_lots, 1);
        assert_eq!(seed.price, 59995.0);
    }

    #[test]
    fn seed_side_is_configurable() {
        let mut c = cfg();
        c.seed_side = Side::Sell;
        let out = compute_targets(&Position::default(), 60000.0, &c);
        assert_eq!(out[0].side, Side::Sell);
        assert_eq!(out[0].price, 60005.0);
    }

    #[test]
    fn open_long_emits_avg_and_flip_tp() {
        let out = compute_targets(&long(2, 60000.0), 60010.0, &cfg());
        assert_eq!(out.len(), 2);

        let avg = out.iter().find(|i| i.kind == IntentKind::AvgDown).unwrap();
        assert_eq!(avg.side, Side::Buy);
        assert_eq!(avg.qty_lots, 4); // 2 * multiplier 2
        assert_eq!(avg.price, 59980.0);

        let tp = out.iter().find(|i| i.kind == IntentKind::TakeProfit).unwrap();
        assert_eq!(tp.side, Side::Sell);
        assert_eq!(tp.qty_lots, 3); // L + 1, flips to short by one lot
        assert_eq!(tp.price, 60020.0);
    }

    #[test]
    fn open_short_mirrors_prices() {
        let pos = Position { side: PositionSide::Short, open_lots: 1, avg_price: Some(60000.0) };
        let out = compute_targets(&pos, 59990.0, &cfg());

        let avg = out.iter().find(|i| i.kind == IntentKind::AvgDown).unwrap();
        assert_eq!(avg.side, Side::Sell);
        assert_eq!(avg.price, 60020.0);

        let tp = out.iter().find(|i| i.kind == IntentKind::TakeProfit).unwrap();
        assert_eq!(tp.side, Side::Buy);
        assert_eq!(tp.price, 59980.0);
        assert_eq!(tp.qty_lots, 2);
    }

    #[test]
    fn risk_cap_suppresses_averaging_but_keeps_tp() {
        // 8 lots + 8*2 = 24 > 10 -> AVG omitted, TP sell 9 @ 60020
        let out = compute_targets(&long(8, 60000.0), 60000.0, &cfg());
        assert_eq!(out.len(), 1);
        let tp = &out[0];
        assert_eq!(tp.kind, IntentKind::TakeProfit);
        assert_eq!(tp.side, Side::Sell);
        assert_eq!(tp.qty_lots, 9);
        assert_eq!(tp.price, 60020.0);
    }

    #[test]
    fn tp_always_flips_by_one_lot() {
        for lots in 1..=9 {
            let out = compute_targets(&long(lots, 60000.0), 60000.0, &cfg());
            let tps: Vec<_> =
                out.iter().filter(|i| i.kind == IntentKind::TakeProfit).collect();
            assert_eq!(tps.len(), 1, "lots={lots}");
            assert_eq!(tps[0].qty_lots, lots + 1, "lots={lots}");
        }
    }
}
