//! Property-based coverage for the invariants listed in SPEC_FULL.md's
//! testable-properties section: book non-negativity and no-cross-at-rest,
//! zone additivity, the exhaustion gate, TP/SL sign, and the two
//! normalize/round-trip identities. Driven with `proptest` rather than fixed
//! examples since these are supposed to hold for *all* inputs, not just the
//! literal scenario values the unit tests already pin down.

use proptest::prelude::*;

use flowedge::config::{BookConfig, ExhaustionConfig, SignalManagerConfig};
use flowedge::detectors::ExhaustionDetector;
use flowedge::fixed_math::{
    int_to_price, normalize_price_to_tick, price_to_int, PRICE_SCALE, QUANTITY_SCALE,
};
use flowedge::model::{
    AggTrade, DepthRow, DepthSnapshot, DepthUpdate, EnrichedTrade, HealthRecommendation,
    MarketHealth, MarketHealthMetrics, Side, SignalCandidate, SignalCandidateData, SignalKind,
    StandardZoneData, ZoneSnapshot,
};
use flowedge::orderbook::OrderBookState;
use flowedge::signal_manager::SignalManager;

fn tick() -> i64 {
    PRICE_SCALE / 100
}

fn book_config() -> BookConfig {
    BookConfig {
        tick_size: tick(),
        max_price_distance_ticks: 100_000,
        stale_threshold_ms: 1_000_000,
        error_threshold: 1_000,
        sequence_validation_enabled: true,
    }
}

fn healthy() -> MarketHealth {
    MarketHealth {
        is_healthy: true,
        recommendation: HealthRecommendation::Continue,
        critical_issues: vec![],
        recent_anomaly_types: vec![],
        metrics: MarketHealthMetrics {
            spread_bps: 5.0,
            flow_imbalance: 0.0,
            volatility: 0.0,
            last_update_age_ms: 0,
        },
    }
}

proptest! {
    /// Round-trip and idempotence properties (§8).
    #[test]
    fn normalize_price_to_tick_is_idempotent(
        price in -10_000_000_000i64..10_000_000_000i64,
        tick_ticks in 1i64..10_000i64,
    ) {
        let t = tick_ticks * 1_000; // keep tick itself representable and positive
        let once = normalize_price_to_tick(price, t);
        let twice = normalize_price_to_tick(once, t);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn price_int_roundtrip(x in -10_000_000_000i64..10_000_000_000i64) {
        let f = int_to_price(x, PRICE_SCALE);
        prop_assert_eq!(price_to_int(f, PRICE_SCALE), x);
    }

    /// P1: after any sequence of `apply_depth` calls, every remaining level
    /// has non-negative bid/ask quantities and is never both-zero (a
    /// both-zero level is removed by `set_side`, so this also checks that
    /// removal actually happens).
    #[test]
    fn p1_book_non_negativity(
        rows in prop::collection::vec(
            (any::<bool>(), -200i64..200i64, 0i64..(500 * QUANTITY_SCALE)),
            1..30,
        ),
    ) {
        let mut book = OrderBookState::new("LTCUSDT", book_config());
        book.recover(
            DepthSnapshot { last_update_id: 0, bids: vec![], asks: vec![] },
            vec![],
            0,
        );

        let base = 100 * PRICE_SCALE;
        for (i, (is_bid, tick_offset, qty)) in rows.iter().enumerate() {
            let price = base + tick_offset * tick();
            let row = DepthRow { price, qty: *qty };
            let update = DepthUpdate {
                sequence_first: i as u64 + 1,
                sequence_last: i as u64 + 1,
                bids: if *is_bid { vec![row] } else { vec![] },
                asks: if *is_bid { vec![] } else { vec![row] },
                event_time_ms: i as i64,
                symbol: "LTCUSDT".into(),
            };
            book.apply_depth(&update, i as i64);
        }

        for level in book.levels_within(base, 10_000) {
            prop_assert!(level.bid_qty >= 0);
            prop_assert!(level.ask_qty >= 0);
            prop_assert!(!(level.bid_qty == 0 && level.ask_qty == 0));
        }
    }

    /// P2: after `purge_crossed_levels`, best_bid <= best_ask (equality is
    /// the retained-midpoint case).
    #[test]
    fn p2_no_cross_after_purge(
        bid_offsets in prop::collection::vec(-50i64..50i64, 0..10),
        ask_offsets in prop::collection::vec(-50i64..50i64, 0..10),
    ) {
        let mut book = OrderBookState::new("LTCUSDT", book_config());
        let base = 100 * PRICE_SCALE;
        let bids = bid_offsets
            .iter()
            .map(|o| DepthRow { price: base + o * tick(), qty: QUANTITY_SCALE })
            .collect();
        let asks = ask_offsets
            .iter()
            .map(|o| DepthRow { price: base + o * tick(), qty: QUANTITY_SCALE })
            .collect();
        book.recover(DepthSnapshot { last_update_id: 0, bids, asks }, vec![], 0);

        book.purge_crossed_levels();

        if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
            prop_assert!(bid <= ask);
        }
    }

    /// P5: zone additivity holds for any trade sequence recorded into a
    /// single bucket.
    #[test]
    fn p5_zone_additivity_holds_for_any_trade_sequence(
        trades in prop::collection::vec(
            (any::<bool>(), 0i64..(1_000 * QUANTITY_SCALE), 0i64..(1_000 * QUANTITY_SCALE), 0i64..(1_000 * QUANTITY_SCALE)),
            1..20,
        ),
    ) {
        use flowedge::zone::ZoneAggregator;

        let mut agg = ZoneAggregator::new(tick(), 5, 60_000);
        let price = 100 * PRICE_SCALE;
        for (i, (is_buy, qty, passive_bid, passive_ask)) in trades.iter().enumerate() {
            let side = if *is_buy { Side::Buy } else { Side::Sell };
            agg.record_trade(price, side, *qty, *passive_bid, *passive_ask, i as i64);
        }

        let key = agg.bucket_key(price);
        let z = agg.get(key).unwrap();
        prop_assert_eq!(z.aggr_buy_vol + z.aggr_sell_vol, z.aggressive_vol);
        prop_assert_eq!(z.passive_bid_vol + z.passive_ask_vol, z.passive_vol);
    }

    /// P7: no exhaustion emission when the zone's aggressive volume is
    /// below `min_agg_volume`, regardless of how lopsided passive volume is.
    #[test]
    fn p7_no_exhaustion_below_min_agg_volume(
        aggressive in 0i64..(2_000 * QUANTITY_SCALE),
        passive_bid in 0i64..(10_000 * QUANTITY_SCALE),
        passive_ask in 0i64..(10_000 * QUANTITY_SCALE),
    ) {
        let config = ExhaustionConfig {
            min_agg_volume: 2_000 * QUANTITY_SCALE,
            exhaustion_threshold: 0.1, // loose, so only the volume gate can block
            event_cooldown_ms: 5_000,
            min_initial_move_ticks: 3,
        };
        let mut det = ExhaustionDetector::new(config, tick());

        let price = 100 * PRICE_SCALE;
        let zone = ZoneSnapshot {
            price_level: price,
            tick_size: tick(),
            aggressive_vol: aggressive,
            passive_vol: passive_bid + passive_ask,
            aggr_buy_vol: 0,
            aggr_sell_vol: aggressive,
            passive_bid_vol: passive_bid,
            passive_ask_vol: passive_ask,
            trade_count: 1,
            timespan_ms: 60_000,
            boundary_min: price - PRICE_SCALE,
            boundary_max: price + PRICE_SCALE,
            last_update_ms: 0,
            volume_weighted_price: price,
        };
        let trade = EnrichedTrade {
            trade: AggTrade { trade_id: 1, price, qty: QUANTITY_SCALE, ts_ms: 0, buyer_is_maker: true },
            best_bid: Some(price - tick()),
            best_ask: Some(price + tick()),
            passive_bid_vol_at_price: 0,
            passive_ask_vol_at_price: 0,
            zone_passive_bid_vol: 0,
            zone_passive_ask_vol: 0,
            zone_data: StandardZoneData {
                zones_5t: vec![zone],
                zones_10t: vec![],
                zones_20t: vec![],
                base_ticks: [5, 10, 20],
                tick_value: tick(),
                time_window_ms: 60_000,
            },
        };

        prop_assert!(det.on_enriched_trade(&trade).is_none());
    }

    /// P10: TP/SL sign follows the confirmed signal's side, for any
    /// confidence above threshold and any positive price. `Iceberg` is used
    /// because its `default_direction()` is `None`, so the candidate's own
    /// `side` determines the outcome rather than a per-kind override.
    #[test]
    fn p10_tp_sl_sign_matches_side(
        price_units in 1i64..1_000_000i64,
        is_buy in any::<bool>(),
        confidence in 0.6f64..1.0f64,
    ) {
        let mut mgr = SignalManager::new(SignalManagerConfig {
            confidence_threshold: 0.5,
            dedup_tolerance: 0.001,
            correlation_window_ms: 60_000,
            target_pct: 0.01,
            stop_pct: 0.005,
        });

        let side = if is_buy { Side::Buy } else { Side::Sell };
        let candidate = SignalCandidate {
            id: uuid::Uuid::new_v4(),
            detector_id: "iceberg".to_string(),
            kind: SignalKind::Iceberg,
            side,
            confidence,
            ts_ms: 0,
            data: SignalCandidateData {
                price: price_units * PRICE_SCALE,
                aggressive: QUANTITY_SCALE,
                passive: 0,
                refilled: false,
                meta: Default::default(),
            },
        };

        let confirmed = mgr.process(candidate, &healthy()).unwrap();
        if is_buy {
            prop_assert!(confirmed.tp_price > confirmed.final_price);
            prop_assert!(confirmed.final_price > confirmed.sl_price);
        } else {
            prop_assert!(confirmed.tp_price < confirmed.final_price);
            prop_assert!(confirmed.final_price < confirmed.sl_price);
        }
    }
}
