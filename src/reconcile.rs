// ===============================
// src/reconcile.rs
// ===============================
//
// Order synchronization engine. Each cycle it converges the exchange's open
// orders for one product to this cycle's target set:
//
//   per target: exact COID match -> proximity match (follow threshold)
//             -> recent-placement guard -> place post-only limit
//   then:      cancel owned live orders outside the target set and outside
//              the follow threshold. Foreign orders are never touched.
//
// The engine is stateless across cycles except for the short-TTL placement
// guard: everything else is recomputed from exchange truth, so a restart
// loses nothing. When the live-order listing itself fails, placement treats
// the live set as empty but the cancellation pass is skipped entirely --
// an empty listing must never be read as "cancel everything".
//
use ahash::AHashMap as HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::coid::is_ours;
use crate::domain::{IntentKind, InstrumentInfo, LiveOrder, Side, TargetOrder};
use crate::exchange::{is_duplicate_coid_error, DeltaClient, PlaceOrderRequest};
use crate::metrics::{CANCELS, PLACEMENTS, RECONCILE_SKIPS};
use crate::quantize::format_price;
use crate::transport::TransportError;

/// Short-TTL memory of what we just placed, keyed by (product, side, kind).
/// It bridges the window where a placement succeeded but the next listing
/// call failed, so we cannot yet see our own order.
pub struct RecentPlacements {
    ttl: Duration,
    entries: HashMap<(i64, Side, IntentKind), (i64, Instant)>,
}

impl RecentPlacements {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: HashMap::new() }
    }

    pub fn record(&mut self, product_id: i64, side: Side, kind: IntentKind, ticks: i64, now: Instant) {
        self.entries.insert((product_id, side, kind), (ticks, now));
    }

    /// True if we placed an order for this (product, side, kind) within the
    /// TTL and within `tick_tolerance` ticks of `ticks`.
    pub fn covers(
        &self,
        product_id: i64,
        side: Side,
        kind: IntentKind,
        ticks: i64,
        tick_tolerance: i64,
        now: Instant,
    ) -> bool {
        match self.entries.get(&(product_id, side, kind)) {
            Some(&(placed_ticks, at)) => {
                now.duration_since(at) <= self.ttl && (placed_ticks - ticks).abs() <= tick_tolerance
            }
            None => false,
        }
    }

    pub fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries.retain(|_, &mut (_, at)| now.duration_since(at) <= ttl);
    }
}

#[derive(Debug, Default)]
pub struct SyncPlan {
    pub place: Vec<TargetOrder>,
    pub cancel: Vec<LiveOrder>,
    pub matched_exact: u32,
    pub matched_near: u32,
    pub guarded: u32,
}

fn order_ticks(o: &LiveOrder, tick_size: f64) -> i64 {
    // tick_size > 0 is guaranteed by instrument resolution
    (o.limit_price / tick_size).round() as i64
}

/// Pure planning step. `live = None` means the listing fetch failed this
/// cycle: placement proceeds against an empty set, cancellation is skipped.
pub fn plan_sync(
    product_id: i64,
    targets: &[TargetOrder],
    live: Option<&[LiveOrder]>,
    tick_size: f64,
    follow_threshold_ticks: i64,
    recent: &RecentPlacements,
    now: Instant,
) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let live_orders: &[LiveOrder] = live.unwrap_or(&[]);

    for target in targets {
        let exact = live_orders.iter().any(|o| {
            o.client_order_id.as_deref() == Some(target.client_order_id.as_str())
        });
        if exact {
            plan.matched_exact += 1;
            continue;
        }

        // A nearby owned order on the same side absorbs mark-price jitter
        // without a cancel/replace round trip.
        let near = live_orders.iter().any(|o| {
            o.side == target.side
                && o.client_order_id.as_deref().map(is_ours).unwrap_or(false)
                && (order_ticks(o, tick_size) - target.ticks).abs() <= follow_threshold_ticks
        });
        if near {
            plan.matched_near += 1;
            continue;
        }

        if recent.covers(
            product_id,
            target.side,
            target.kind,
            target.ticks,
            follow_threshold_ticks,
            now,
        ) {
            plan.guarded += 1;
            continue;
        }

        plan.place.push(target.clone());
    }

    // Cancellation pass: only with a trusted listing.
    if let Some(live_orders) = live {
        for o in live_orders {
            let Some(coid) = o.client_order_id.as_deref() else { continue };
            if !is_ours(coid) {
                continue;
            }
            let in_targets = targets.iter().any(|t| t.client_order_id == coid);
            if in_targets {
                continue;
            }
            let o_ticks = order_ticks(o, tick_size);
            let near_any_target = targets.iter().any(|t| {
                t.side == o.side && (t.ticks - o_ticks).abs() <= follow_threshold_ticks
            });
            if !near_any_target {
                plan.cancel.push(o.clone());
            }
        }
    }

    plan
}

#[derive(Debug, Default)]
pub struct SyncStats {
    pub placed: u32,
    pub place_failed: u32,
    pub cancelled: u32,
    pub cancel_failed: u32,
    pub matched_exact: u32,
    pub matched_near: u32,
    pub guarded: u32,
    pub listing_failed: bool,
}

/// Per-instrument reconciler. Owns its placement guard; independent
/// instruments get independent instances.
pub struct Reconciler {
    product_id: i64,
    symbol: String,
    tick_size: f64,
    follow_threshold_ticks: i64,
    post_only: bool,
    recent: RecentPlacements,
}

impl Reconciler {
    pub fn new(
        instrument: &InstrumentInfo,
        follow_threshold_ticks: i64,
        post_only: bool,
        guard_ttl: Duration,
    ) -> Self {
        Self {
            product_id: instrument.product_id,
            symbol: instrument.symbol.clone(),
            tick_size: instrument.tick_size,
            follow_threshold_ticks,
            post_only,
            recent: RecentPlacements::new(guard_ttl),
        }
    }

    /// One reconciliation cycle. Individual placement/cancel failures are
    /// logged and skipped; only auth rejection propagates (the loop must
    /// stop rather than hammer the API with bad credentials).
    pub async fn sync(
        &mut self,
        client: &DeltaClient,
        targets: &[TargetOrder],
    ) -> Result<SyncStats, TransportError> {
        let live = match client.get_open_orders(self.product_id).await {
            Ok(orders) => Some(orders),
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "open-order listing failed; skipping cancellation pass");
                None
            }
        };

        let now = Instant::now();
        self.recent.prune(now);
        let plan = plan_sync(
            self.product_id,
            targets,
            live.as_deref(),
            self.tick_size,
            self.follow_threshold_ticks,
            &self.recent,
            now,
        );
        RECONCILE_SKIPS.with_label_values(&["exact"]).inc_by(plan.matched_exact as u64);
        RECONCILE_SKIPS.with_label_values(&["near"]).inc_by(plan.matched_near as u64);
        RECONCILE_SKIPS.with_label_values(&["guarded"]).inc_by(plan.guarded as u64);

        let mut stats = SyncStats {
            matched_exact: plan.matched_exact,
            matched_near: plan.matched_near,
            guarded: plan.guarded,
            listing_failed: live.is_none(),
            ..SyncStats::default()
        };

        for target in &plan.place {
            let req = PlaceOrderRequest {
                product_id: self.product_id,
                side: target.side,
                size: target.qty_lots,
                limit_price: format_price(target.price),
                post_only: self.post_only,
                reduce_only: false,
                client_order_id: target.client_order_id.clone(),
            };
            match client.place_limit_order(&req).await {
                Ok(resp) => {
                    info!(
                        symbol = %self.symbol,
                        side = target.side.as_str(),
                        kind = target.kind.token(),
                        price = %req.limit_price,
                        qty = target.qty_lots,
                        coid = %target.client_order_id,
                        response = %resp,
                        "order placed"
                    );
                    self.recent.record(self.product_id, target.side, target.kind, target.ticks, now);
                    PLACEMENTS.with_label_values(&["ok"]).inc();
                    stats.placed += 1;
                }
                Err(e) if is_duplicate_coid_error(&e) => {
                    // already resting server-side; the COID did its job
                    info!(
                        symbol = %self.symbol,
                        coid = %target.client_order_id,
                        "duplicate client_order_id, order already resting"
                    );
                    self.recent.record(self.product_id, target.side, target.kind, target.ticks, now);
                    PLACEMENTS.with_label_values(&["duplicate"]).inc();
                    stats.matched_exact += 1;
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(
                        symbol = %self.symbol,
                        side = target.side.as_str(),
                        kind = target.kind.token(),
                        price = %req.limit_price,
                        coid = %target.client_order_id,
                        error = %e,
                        "placement failed, continuing with remaining targets"
                    );
                    PLACEMENTS.with_label_values(&["failed"]).inc();
                    stats.place_failed += 1;
                }
            }
        }

        for order in &plan.cancel {
            match client
                .cancel_order(self.product_id, order.id, order.client_order_id.as_deref())
                .await
            {
                Ok(resp) => {
                    info!(
                        symbol = %self.symbol,
                        side = order.side.as_str(),
                        price = order.limit_price,
                        coid = order.client_order_id.as_deref().unwrap_or("-"),
                        response = %resp,
                        "stale order cancelled"
                    );
                    CANCELS.with_label_values(&["ok"]).inc();
                    stats.cancelled += 1;
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    // it will still show in the next listing; retried then
                    warn!(
                        symbol = %self.symbol,
                        coid = order.client_order_id.as_deref().unwrap_or("-"),
                        error = %e,
                        "cancel failed, will retry next cycle"
                    );
                    CANCELS.with_label_values(&["failed"]).inc();
                    stats.cancel_failed += 1;
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coid::make_coid;

    const TICK: f64 = 0.5;
    const PRODUCT: i64 = 27;

    fn target(kind: IntentKind, side: Side, price: f64, qty: u32) -> TargetOrder {
        let coid = make_coid("demo", kind, side, PRODUCT, price, TICK).unwrap();
        TargetOrder {
            side,
            price,
            ticks: (price / TICK).round() as i64,
            qty_lots: qty,
            kind,
            client_order_id: coid,
        }
    }

    fn live(id: i64, side: Side, price: f64, coid: Option<&str>) -> LiveOrder {
        LiveOrder {
            id,
            client_order_id: coid.map(|s| s.to_string()),
            side,
            limit_price: price,
            size: 1,
            unfilled_size: 1,
            state: "open".to_string(),
            product_id: PRODUCT,
        }
    }

    fn empty_recent() -> RecentPlacements {
        RecentPlacements::new(Duration::from_secs(30))
    }

    #[test]
    fn first_cycle_places_everything() {
        let targets = vec![
            target(IntentKind::AvgDown, Side::Buy, 59980.0, 2),
            target(IntentKind::TakeProfit, Side::Sell, 60020.0, 3),
        ];
        let plan = plan_sync(PRODUCT, &targets, Some(&[]), TICK, 2, &empty_recent(), Instant::now());
        assert_eq!(plan.place.len(), 2);
        assert!(plan.cancel.is_empty());
    }

    #[test]
    fn exact_coid_match_suppresses_replacement() {
        // identical position + mark across two cycles -> identical COIDs ->
        // the second cycle issues zero placements
        let targets = vec![target(IntentKind::TakeProfit, Side::Sell, 60020.0, 3)];
        let resting = live(1, Side::Sell, 60020.0, Some(&targets[0].client_order_id));
        let plan = plan_sync(
            PRODUCT,
            &targets,
            Some(std::slice::from_ref(&resting)),
            TICK,
            2,
            &empty_recent(),
            Instant::now(),
        );
        assert!(plan.place.is_empty());
        assert!(plan.cancel.is_empty());
        assert_eq!(plan.matched_exact, 1);
    }

    #[test]
    fn proximity_match_absorbs_one_tick_of_jitter() {
        let targets = vec![target(IntentKind::TakeProfit, Side::Sell, 60020.0, 3)];
        // resting one tick away under a differently-priced (older) COID
        let old_coid = make_coid("demo", IntentKind::TakeProfit, Side::Sell, PRODUCT, 60020.5, TICK).unwrap();
        let resting = live(1, Side::Sell, 60020.5, Some(&old_coid));
        let plan = plan_sync(
            PRODUCT,
            &targets,
            Some(std::slice::from_ref(&resting)),
            TICK,
            2,
            &empty_recent(),
            Instant::now(),
        );
        assert!(plan.place.is_empty(), "no new placement");
        assert!(plan.cancel.is_empty(), "no cancel");
        assert_eq!(plan.matched_near, 1);
    }

    #[test]
    fn drift_beyond_threshold_replaces() {
        let targets = vec![target(IntentKind::TakeProfit, Side::Sell, 60020.0, 3)];
        let old_coid = make_coid("demo", IntentKind::TakeProfit, Side::Sell, PRODUCT, 60030.0, TICK).unwrap();
        let resting = live(1, Side::Sell, 60030.0, Some(&old_coid)); // 20 ticks away
        let plan = plan_sync(
            PRODUCT,
            &targets,
            Some(std::slice::from_ref(&resting)),
            TICK,
            2,
            &empty_recent(),
            Instant::now(),
        );
        assert_eq!(plan.place.len(), 1);
        assert_eq!(plan.cancel.len(), 1);
        assert_eq!(plan.cancel[0].id, 1);
    }

    #[test]
    fn proximity_requires_same_side() {
        let targets = vec![target(IntentKind::Seed, Side::Buy, 59995.0, 1)];
        let other_coid = make_coid("demo", IntentKind::TakeProfit, Side::Sell, PRODUCT, 59995.5, TICK).unwrap();
        let resting = live(1, Side::Sell, 59995.5, Some(&other_coid));
        let plan = plan_sync(
            PRODUCT,
            &targets,
            Some(std::slice::from_ref(&resting)),
            TICK,
            2,
            &empty_recent(),
            Instant::now(),
        );
        // opposite-side order neither satisfies the target nor survives
        assert_eq!(plan.place.len(), 1);
        assert_eq!(plan.cancel.len(), 1);
    }

    #[test]
    fn foreign_orders_are_never_cancelled() {
        let targets = vec![target(IntentKind::Seed, Side::Buy, 59995.0, 1)];
        let manual = live(1, Side::Sell, 70000.0, None);
        let other_bot = live(2, Side::Sell, 70000.0, Some("OTHERBOT-LIVE-X-1"));
        let plan = plan_sync(
            PRODUCT,
            &targets,
            Some(&[manual, other_bot]),
            TICK,
            2,
            &empty_recent(),
            Instant::now(),
        );
        assert!(plan.cancel.is_empty());
    }

    #[test]
    fn listing_failure_skips_cancellation_entirely() {
        // a stale order exists server-side, but the fetch failed: the
        // engine must not infer anything from the missing listing
        let targets = vec![target(IntentKind::Seed, Side::Buy, 59995.0, 1)];
        let plan = plan_sync(PRODUCT, &targets, None, TICK, 2, &empty_recent(), Instant::now());
        assert!(plan.cancel.is_empty());
        assert_eq!(plan.place.len(), 1); // placement still proceeds
    }

    #[test]
    fn placement_guard_blocks_rapid_duplicates() {
        let t = target(IntentKind::Seed, Side::Buy, 59995.0, 1);
        let now = Instant::now();
        let mut recent = empty_recent();
        recent.record(PRODUCT, Side::Buy, IntentKind::Seed, t.ticks, now);

        // within TTL and tick tolerance -> guarded
        let plan = plan_sync(PRODUCT, &[t.clone()], None, TICK, 2, &recent, now + Duration::from_secs(5));
        assert!(plan.place.is_empty());
        assert_eq!(plan.guarded, 1);

        // past TTL -> guard expires and the target is placed again
        let plan = plan_sync(PRODUCT, &[t], None, TICK, 2, &recent, now + Duration::from_secs(31));
        assert_eq!(plan.place.len(), 1);
    }

    #[test]
    fn placement_guard_ignores_far_prices() {
        let t = target(IntentKind::Seed, Side::Buy, 59995.0, 1);
        let now = Instant::now();
        let mut recent = empty_recent();
        // placed 10 ticks away; a 2-tick tolerance must not cover the target
        recent.record(PRODUCT, Side::Buy, IntentKind::Seed, t.ticks + 10, now);
        let plan = plan_sync(PRODUCT, &[t], None, TICK, 2, &recent, now);
        assert_eq!(plan.place.len(), 1);
    }

    #[test]
    fn prune_drops_expired_entries() {
        let now = Instant::now();
        let mut recent = RecentPlacements::new(Duration::from_secs(30));
        recent.record(PRODUCT, Side::Buy, IntentKind::Seed, 100, now);
        recent.prune(now + Duration::from_secs(31));
        assert!(!recent.covers(PRODUCT, Side::Buy, IntentKind::Seed, 100, 2, now + Duration::from_secs(31)));
    }
}
