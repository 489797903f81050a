//! Attaches passive-liquidity context and multi-horizon zone state to every
//! aggressive trade, in strict arrival order (§4.3).

use crate::config::{PreprocessorConfig, ZoneConfig};
use crate::model::{AggTrade, EnrichedTrade, StandardZoneData};
use crate::orderbook::OrderBookState;
use crate::zone::ZoneAggregator;

pub struct OrderFlowPreprocessor {
    config: PreprocessorConfig,
    zone_config: ZoneConfig,
    tick_size: i64,
    zones_5t: ZoneAggregator,
    zones_10t: ZoneAggregator,
    zones_20t: ZoneAggregator,
}

impl OrderFlowPreprocessor {
    pub fn new(tick_size: i64, config: PreprocessorConfig, zone_config: ZoneConfig) -> Self {
        let [k5, k10, k20] = zone_config.base_ticks;
        Self {
            zones_5t: ZoneAggregator::new(tick_size, k5, zone_config.time_window_ms),
            zones_10t: ZoneAggregator::new(tick_size, k10, zone_config.time_window_ms),
            zones_20t: ZoneAggregator::new(tick_size, k20, zone_config.time_window_ms),
            config,
            zone_config,
            tick_size,
        }
    }

    /// Enrich one trade against the current book state. The caller
    /// guarantees this is invoked strictly after all depth updates whose
    /// sequence precedes the trade's implied update id have already been
    /// applied to `book` (§4.3 ordering guarantee, enforced by the core loop
    /// processing one channel in arrival order).
    pub fn process(&mut self, trade: AggTrade, book: &OrderBookState) -> EnrichedTrade {
        let best_bid = book.best_bid();
        let best_ask = book.best_ask();

        let level = book.get_level(trade.price);
        let passive_bid_vol_at_price = level.map(|l| l.bid_qty).unwrap_or(0);
        let passive_ask_vol_at_price = level.map(|l| l.ask_qty).unwrap_or(0);

        let band = book.sum_band(trade.price, self.config.band_ticks);

        let side = trade.aggressive_side();

        self.zones_5t.record_trade(
            trade.price,
            side,
            trade.qty,
            passive_bid_vol_at_price,
            passive_ask_vol_at_price,
            trade.ts_ms,
        );
        self.zones_10t.record_trade(
            trade.price,
            side,
            trade.qty,
            passive_bid_vol_at_price,
            passive_ask_vol_at_price,
            trade.ts_ms,
        );
        self.zones_20t.record_trade(
            trade.price,
            side,
            trade.qty,
            passive_bid_vol_at_price,
            passive_ask_vol_at_price,
            trade.ts_ms,
        );

        self.zones_5t.evict(trade.ts_ms);
        self.zones_10t.evict(trade.ts_ms);
        self.zones_20t.evict(trade.ts_ms);

        let zone_data = StandardZoneData {
            zones_5t: self.zones_5t.snapshot_near(trade.price),
            zones_10t: self.zones_10t.snapshot_near(trade.price),
            zones_20t: self.zones_20t.snapshot_near(trade.price),
            base_ticks: self.zone_config.base_ticks,
            tick_value: self.tick_size,
            time_window_ms: self.zone_config.time_window_ms,
        };

        EnrichedTrade {
            trade,
            best_bid,
            best_ask,
            passive_bid_vol_at_price,
            passive_ask_vol_at_price,
            zone_passive_bid_vol: band.bid_total,
            zone_passive_ask_vol: band.ask_total,
            zone_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BookConfig;
    use crate::fixed_math::{PRICE_SCALE, QUANTITY_SCALE};
    use crate::model::{DepthRow, DepthSnapshot};

    fn p(v: f64) -> i64 {
        (v * PRICE_SCALE as f64) as i64
    }
    fn q(v: f64) -> i64 {
        (v * QUANTITY_SCALE as f64) as i64
    }

    fn test_book() -> OrderBookState {
        let tick = PRICE_SCALE / 100;
        let mut book = OrderBookState::new(
            "LTCUSDT",
            BookConfig {
                tick_size: tick,
                max_price_distance_ticks: 10_000,
                stale_threshold_ms: 60_000,
                error_threshold: 100,
                sequence_validation_enabled: true,
            },
        );
        book.recover(
            DepthSnapshot {
                last_update_id: 0,
                bids: vec![DepthRow { price: p(99.99), qty: q(10.0) }],
                asks: vec![DepthRow { price: p(100.01), qty: q(10.0) }],
            },
            vec![],
            0,
        );
        book
    }

    #[test]
    fn p4_enrichment_is_deterministic() {
        let book = test_book();
        let tick = PRICE_SCALE / 100;
        let trade = AggTrade {
            trade_id: 1,
            price: p(100.0),
            qty: q(5.0),
            ts_ms: 100,
            buyer_is_maker: false,
        };

        let mut pre1 = OrderFlowPreprocessor::new(
            tick,
            crate::config::PreprocessorConfig { band_ticks: 5 },
            crate::config::ZoneConfig { base_ticks: [5, 10, 20], time_window_ms: 60_000 },
        );
        let mut pre2 = OrderFlowPreprocessor::new(
            tick,
            crate::config::PreprocessorConfig { band_ticks: 5 },
            crate::config::ZoneConfig { base_ticks: [5, 10, 20], time_window_ms: 60_000 },
        );

        let e1 = pre1.process(trade, &book);
        let e2 = pre2.process(trade, &book);

        assert_eq!(e1.best_bid, e2.best_bid);
        assert_eq!(e1.passive_bid_vol_at_price, e2.passive_bid_vol_at_price);
        assert_eq!(e1.zone_passive_ask_vol, e2.zone_passive_ask_vol);
        assert_eq!(
            e1.zone_data.zones_5t.len(),
            e2.zone_data.zones_5t.len()
        );
    }

    #[test]
    fn side_determined_by_buyer_is_maker() {
        let book = test_book();
        let tick = PRICE_SCALE / 100;
        let mut pre = OrderFlowPreprocessor::new(
            tick,
            crate::config::PreprocessorConfig { band_ticks: 5 },
            crate::config::ZoneConfig { base_ticks: [5, 10, 20], time_window_ms: 60_000 },
        );
        let buy_trade = AggTrade {
            trade_id: 1,
            price: p(100.0),
            qty: q(1.0),
            ts_ms: 0,
            buyer_is_maker: false,
        };
        assert_eq!(buy_trade.aggressive_side(), crate::model::Side::Buy);
        let enriched = pre.process(buy_trade, &book);
        assert_eq!(enriched.trade.aggressive_side(), crate::model::Side::Buy);
    }
}
