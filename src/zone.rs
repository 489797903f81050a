//! Per-horizon zone aggregation.
//!
//! A flat, bucket-keyed map with integer keys derived from
//! `normalize(price, k*tick)` — no pointers between zones, eviction by time,
//! per the "arena + index" redesign note. One [`ZoneAggregator`] instance
//! exists per horizon (5T/10T/20T); [`crate::preprocessor::OrderFlowPreprocessor`]
//! owns all three.

use std::collections::HashMap;

use crate::fixed_math;
use crate::model::{Side, ZoneSnapshot};

struct ZoneEntry {
    snapshot: ZoneSnapshot,
    vwp_numerator: i128,
    vwp_denominator: i128,
}

pub struct ZoneAggregator {
    tick_size: i64,
    bucket_ticks: i64,
    time_window_ms: i64,
    zones: HashMap<i64, ZoneEntry>,
}

impl ZoneAggregator {
    pub fn new(tick_size: i64, bucket_ticks: i64, time_window_ms: i64) -> Self {
        Self {
            tick_size,
            bucket_ticks,
            time_window_ms,
            zones: HashMap::new(),
        }
    }

    pub fn bucket_width(&self) -> i64 {
        self.bucket_ticks * self.tick_size
    }

    pub fn bucket_key(&self, price: i64) -> i64 {
        fixed_math::normalize_price_to_tick(price, self.bucket_width())
    }

    /// Record one trade into the bucket covering `price`. `passive_bid` /
    /// `passive_ask` are the *level*-level passive volumes sampled at the
    /// trade price (§4.3 step 2), added into the zone's running passive
    /// totals once per trade — not the band sum, and not double-counted on
    /// subsequent trades in the same zone.
    pub fn record_trade(
        &mut self,
        price: i64,
        side: Side,
        qty: i64,
        passive_bid: i64,
        passive_ask: i64,
        ts_ms: i64,
    ) {
        let width = self.bucket_width();
        let key = self.bucket_key(price);
        let entry = self.zones.entry(key).or_insert_with(|| ZoneEntry {
            snapshot: ZoneSnapshot {
                price_level: key,
                tick_size: self.tick_size,
                aggressive_vol: 0,
                passive_vol: 0,
                aggr_buy_vol: 0,
                aggr_sell_vol: 0,
                passive_bid_vol: 0,
                passive_ask_vol: 0,
                trade_count: 0,
                timespan_ms: self.time_window_ms,
                boundary_min: key - width / 2,
                boundary_max: key + width / 2,
                last_update_ms: ts_ms,
                volume_weighted_price: key,
            },
            vwp_numerator: 0,
            vwp_denominator: 0,
        });

        entry.snapshot.aggressive_vol += qty;
        match side {
            Side::Buy => entry.snapshot.aggr_buy_vol += qty,
            Side::Sell => entry.snapshot.aggr_sell_vol += qty,
        }
        entry.snapshot.passive_bid_vol += passive_bid;
        entry.snapshot.passive_ask_vol += passive_ask;
        entry.snapshot.passive_vol = entry.snapshot.passive_bid_vol + entry.snapshot.passive_ask_vol;
        entry.snapshot.trade_count += 1;
        entry.snapshot.last_update_ms = ts_ms;

        entry.vwp_numerator += price as i128 * qty as i128;
        entry.vwp_denominator += qty as i128;
        if entry.vwp_denominator > 0 {
            entry.snapshot.volume_weighted_price =
                (entry.vwp_numerator / entry.vwp_denominator) as i64;
        }
    }

    pub fn evict(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.time_window_ms;
        self.zones.retain(|_, e| e.snapshot.last_update_ms >= cutoff);
    }

    pub fn get(&self, key: i64) -> Option<ZoneSnapshot> {
        self.zones.get(&key).map(|e| e.snapshot)
    }

    /// The bucket covering `price` plus its immediate neighbors, for
    /// `StandardZoneData`.
    pub fn snapshot_near(&self, price: i64) -> Vec<ZoneSnapshot> {
        let width = self.bucket_width();
        let center = self.bucket_key(price);
        [center - width, center, center + width]
            .into_iter()
            .filter_map(|k| self.get(k))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}
