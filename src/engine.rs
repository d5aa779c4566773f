// ===============================
// src/engine.rs
// ===============================
//
// Control loop: one instrument, fixed cadence, sequential exchange calls.
// Every cycle is recomputed from exchange truth (mark price, position, open
// orders); a failed cycle is logged and the next one starts clean. Only two
// things stop the loop: a shutdown signal, or an auth rejection (retrying
// with bad credentials would just hammer the API).
//
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::coid::make_coid;
use crate::config::BotConfig;
use crate::domain::{InstrumentInfo, MarkPrice, OrderIntent, PositionSide, TargetOrder};
use crate::exchange::DeltaClient;
use crate::metrics::{CYCLES, CYCLE_ERRORS, POSITION_LOTS};
use crate::quantize::{price_ticks, shade_price, QuantizeError};
use crate::reconcile::Reconciler;
use crate::strategy::compute_targets;
use crate::transport::TransportError;

const BOOT_RESOLVE_ATTEMPTS: u32 = 5;

/// Shade, quantize and assign identities to this cycle's intents.
pub fn build_targets(
    intents: &[OrderIntent],
    instrument: &InstrumentInfo,
    env: &str,
    shade_ticks: i64,
) -> Result<Vec<TargetOrder>, QuantizeError> {
    let mut targets = Vec::with_capacity(intents.len());
    for intent in intents {
        let price = shade_price(intent.price, intent.side, instrument.tick_size, shade_ticks)?;
        let ticks = price_ticks(price, instrument.tick_size)?;
        let client_order_id = make_coid(
            env,
            intent.kind,
            intent.side,
            instrument.product_id,
            price,
            instrument.tick_size,
        )?;
        targets.push(TargetOrder {
            side: intent.side,
            price,
            ticks,
            qty_lots: intent.qty_lots,
            kind: intent.kind,
            client_order_id,
        });
    }
    Ok(targets)
}

/// Resolve instrument metadata with a few boot retries. Returns None when
/// the product is still unavailable; the loop keeps retrying lazily.
async fn resolve_product(client: &DeltaClient, symbol: &str) -> Option<InstrumentInfo> {
    for attempt in 1..=BOOT_RESOLVE_ATTEMPTS {
        match client.get_product(symbol).await {
            Ok(info) => return Some(info),
            Err(e) => {
                warn!(%symbol, attempt, error = %e, "product lookup failed");
                sleep(Duration::from_millis(1500 * attempt as u64)).await;
            }
        }
    }
    None
}

/// WS value if fresh enough, else a point-in-time REST ticker query.
async fn current_mark_price(
    client: &DeltaClient,
    symbol: &str,
    mark_rx: &watch::Receiver<MarkPrice>,
    max_age_secs: i64,
) -> Option<f64> {
    let mp = *mark_rx.borrow();
    if mp.received_at > 0 {
        let age = chrono::Utc::now().timestamp() - mp.received_at;
        if age <= max_age_secs {
            return Some(mp.price);
        }
        debug!(age, "ws mark price stale, falling back to REST");
    }
    match client.get_mark_price(symbol).await {
        Ok(px) => Some(px),
        Err(e) => {
            warn!(%symbol, error = %e, "mark price unavailable");
            None
        }
    }
}

pub async fn run(
    cfg: BotConfig,
    client: DeltaClient,
    mark_rx: watch::Receiver<MarkPrice>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let env = cfg.mode.env_token();
    let interval = Duration::from_millis(cfg.poll_interval_ms);

    let mut instrument = resolve_product(&client, &cfg.symbol).await;
    match &instrument {
        Some(info) => {
            info!(
                symbol = %info.symbol,
                product_id = info.product_id,
                tick_size = info.tick_size,
                "instrument resolved"
            );
            if let Some(lev) = cfg.leverage {
                if let Err(e) = client.set_leverage(info.product_id, lev).await {
                    warn!(error = %e, "failed to set leverage, continuing");
                }
            }
        }
        None => warn!(symbol = %cfg.symbol, "product unresolved after boot retries, will keep trying in-loop"),
    }

    let mut reconciler = instrument.as_ref().map(|info| {
        Reconciler::new(
            info,
            cfg.follow_threshold_ticks,
            cfg.use_post_only,
            Duration::from_secs(cfg.placement_guard_secs),
        )
    });

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Lazy resolve if boot failed
        if instrument.is_none() {
            match client.get_product(&cfg.symbol).await {
                Ok(info) => {
                    info!(product_id = info.product_id, tick_size = info.tick_size, "instrument ready");
                    if let Some(lev) = cfg.leverage {
                        if let Err(e) = client.set_leverage(info.product_id, lev).await {
                            warn!(error = %e, "failed to set leverage, continuing");
                        }
                    }
                    reconciler = Some(Reconciler::new(
                        &info,
                        cfg.follow_threshold_ticks,
                        cfg.use_post_only,
                        Duration::from_secs(cfg.placement_guard_secs),
                    ));
                    instrument = Some(info);
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "product still unavailable");
                    CYCLE_ERRORS.with_label_values(&["resolve"]).inc();
                }
            }
        }

        if let (Some(info), Some(rec)) = (instrument.as_ref(), reconciler.as_mut()) {
            match run_cycle(&cfg, &client, info, rec, &mark_rx, env).await {
                Ok(()) => CYCLES.inc(),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "cycle failed");
                    CYCLE_ERRORS.with_label_values(&["cycle"]).inc();
                }
            }
        }

        tokio::select! {
            _ = sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { break; }
            }
        }
    }

    info!("control loop stopped");
    Ok(())
}

async fn run_cycle(
    cfg: &BotConfig,
    client: &DeltaClient,
    instrument: &InstrumentInfo,
    reconciler: &mut Reconciler,
    mark_rx: &watch::Receiver<MarkPrice>,
    env: &str,
) -> Result<(), TransportError> {
    let Some(mark) =
        current_mark_price(client, &cfg.symbol, mark_rx, cfg.mark_price_max_age_secs).await
    else {
        // not fatal: skip strategy this cycle and try again next poll
        CYCLE_ERRORS.with_label_values(&["market_data"]).inc();
        return Ok(());
    };

    let position = client.get_position(instrument.product_id).await?;
    let signed_lots = match position.side {
        PositionSide::Long => position.open_lots as i64,
        PositionSide::Short => -(position.open_lots as i64),
        PositionSide::Flat => 0,
    };
    POSITION_LOTS.with_label_values(&[&cfg.symbol]).set(signed_lots);

    let intents = compute_targets(&position, mark, &cfg.strategy);
    let targets = build_targets(&intents, instrument, env, cfg.shade_ticks)
        .map_err(|e| TransportError::Payload(e.to_string()))?;

    let stats = reconciler.sync(client, &targets).await?;
    debug!(
        mark,
        lots = signed_lots,
        targets = targets.len(),
        placed = stats.placed,
        cancelled = stats.cancelled,
        exact = stats.matched_exact,
        near = stats.matched_near,
        guarded = stats.guarded,
        listing_failed = stats.listing_failed,
        "cycle complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyConfig;
    use crate::domain::{IntentKind, Position, Side};

    fn instrument() -> InstrumentInfo {
        InstrumentInfo {
            product_id: 27,
            symbol: "BTCUSD".to_string(),
            tick_size: 0.5,
            contract_value: 0.001,
        }
    }

    #[test]
    fn seed_scenario_end_to_end() {
        // flat, mark 60000, offset 5 -> one buy SEED at 59995
        let cfg = StrategyConfig {
            seed_side: Side::Buy,
            seed_offset_usd: 5.0,
            tp_step_usd: 20.0,
            avg_step_usd: 20.0,
            avg_multiplier: 1,
            max_total_lots: 10,
        };
        let intents = compute_targets(&Position::default(), 60000.0, &cfg);
        let targets = build_targets(&intents, &instrument(), "DEMO", 0).unwrap();
        assert_eq!(targets.len(), 1);
        let seed = &targets[0];
        assert_eq!(seed.kind, IntentKind::Seed);
        assert_eq!(seed.side, Side::Buy);
        assert_eq!(seed.qty_lots, 1);
        assert_eq!(seed.price, 59995.0);
        assert_eq!(seed.client_order_id, "GRIDBOT-DEMO-SEED-BUY-P27-T119990");
    }

    #[test]
    fn shading_shifts_target_and_identity_together() {
        let intents = vec![OrderIntent {
            side: Side::Buy,
            qty_lots: 1,
            price: 59995.0,
            kind: IntentKind::Seed,
        }];
        let shaded = build_targets(&intents, &instrument(), "DEMO", 2).unwrap();
        assert_eq!(shaded[0].price, 59994.0);
        assert_eq!(shaded[0].ticks, 119988);
        assert!(shaded[0].client_order_id.ends_with("T119988"));
    }

    #[test]
    fn identical_cycles_yield_identical_targets() {
        let intents = vec![OrderIntent {
            side: Side::Sell,
            qty_lots: 3,
            price: 60020.0,
            kind: IntentKind::TakeProfit,
        }];
        let a = build_targets(&intents, &instrument(), "LIVE", 1).unwrap();
        let b = build_targets(&intents, &instrument(), "LIVE", 1).unwrap();
        assert_eq!(a[0].client_order_id, b[0].client_order_id);
        assert_eq!(a[0].price, b[0].price);
    }
}
