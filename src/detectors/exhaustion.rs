//! Detects depletion of one passive side by aggressive flow (§4.6).

use uuid::Uuid;

use crate::config::ExhaustionConfig;
use crate::detectors::base::{CooldownTracker, DetectorBase, ErrorIsolation};
use crate::detectors::zones::nearest_zone;
use crate::model::{EnrichedTrade, SignalCandidate, SignalCandidateData, SignalKind, Side};

pub struct ExhaustionDetector {
    config: ExhaustionConfig,
    tick_size: i64,
    cooldown: CooldownTracker,
    errors: ErrorIsolation,
}

impl ExhaustionDetector {
    pub fn new(config: ExhaustionConfig, tick_size: i64) -> Self {
        let cooldown = CooldownTracker::new(
            config.event_cooldown_ms,
            config.min_initial_move_ticks,
            tick_size,
        );
        Self {
            config,
            tick_size,
            cooldown,
            errors: ErrorIsolation::new(),
        }
    }

    pub fn on_enriched_trade(&mut self, trade: &EnrichedTrade) -> Option<SignalCandidate> {
        match self.analyze(trade) {
            Ok(Some(candidate)) => {
                if self.cooldown.allow(candidate.data.price, candidate.confidence, trade.trade.ts_ms) {
                    self.cooldown
                        .record(candidate.data.price, candidate.confidence, trade.trade.ts_ms);
                    Some(candidate)
                } else {
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                self.errors.record("exhaustion", e);
                None
            }
        }
    }

    fn analyze(&mut self, trade: &EnrichedTrade) -> Result<Option<SignalCandidate>, String> {
        let price = trade.trade.price;
        let zone = match nearest_zone(&trade.zone_data.zones_5t, price, 5 * self.tick_size) {
            Some(z) => z,
            None => return Ok(None),
        };

        let aggressive = zone.aggressive_vol;
        if aggressive < self.config.min_agg_volume {
            // P7: no emission below the absolute gate.
            return Ok(None);
        }

        let total = zone.passive_bid_vol + zone.passive_ask_vol + aggressive;
        if total <= 0 {
            return Ok(None);
        }
        let exhaustion_ratio = aggressive as f64 / total as f64;
        if exhaustion_ratio < self.config.exhaustion_threshold {
            return Ok(None);
        }

        let dominant_sell = zone.aggr_sell_vol > zone.aggr_buy_vol;
        let dominant_buy = zone.aggr_buy_vol > zone.aggr_sell_vol;

        let side = if zone.passive_bid_vol > zone.passive_ask_vol && dominant_sell {
            Side::Buy
        } else if zone.passive_ask_vol > zone.passive_bid_vol && dominant_buy {
            Side::Sell
        } else {
            return Ok(None);
        };

        Ok(Some(SignalCandidate {
            id: Uuid::new_v4(),
            detector_id: "exhaustion".to_string(),
            kind: SignalKind::Exhaustion,
            side,
            confidence: exhaustion_ratio.min(1.0),
            ts_ms: trade.trade.ts_ms,
            data: SignalCandidateData {
                price,
                aggressive,
                passive: zone.passive_bid_vol + zone.passive_ask_vol,
                refilled: false,
                meta: Default::default(),
            },
        }))
    }
}

impl DetectorBase for ExhaustionDetector {
    fn name(&self) -> &'static str {
        "exhaustion"
    }

    fn cleanup(&mut self, _now_ms: i64) {
        // No persistent state beyond the cooldown tracker, which self-expires.
    }

    fn error_count(&self) -> u64 {
        self.errors.error_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_math::{PRICE_SCALE, QUANTITY_SCALE};
    use crate::model::{AggTrade, StandardZoneData, ZoneSnapshot};

    fn p(v: f64) -> i64 {
        (v * PRICE_SCALE as f64) as i64
    }
    fn q(v: f64) -> i64 {
        (v * QUANTITY_SCALE as f64) as i64
    }

    fn test_config() -> ExhaustionConfig {
        ExhaustionConfig {
            min_agg_volume: q(2_000.0),
            exhaustion_threshold: 0.7,
            event_cooldown_ms: 5_000,
            min_initial_move_ticks: 3,
        }
    }

    fn zone(passive_bid: f64, passive_ask: f64, aggr_buy: f64, aggr_sell: f64) -> ZoneSnapshot {
        ZoneSnapshot {
            price_level: p(100.0),
            tick_size: PRICE_SCALE / 100,
            aggressive_vol: q(aggr_buy) + q(aggr_sell),
            passive_vol: q(passive_bid) + q(passive_ask),
            aggr_buy_vol: q(aggr_buy),
            aggr_sell_vol: q(aggr_sell),
            passive_bid_vol: q(passive_bid),
            passive_ask_vol: q(passive_ask),
            trade_count: 1,
            timespan_ms: 60_000,
            boundary_min: p(99.9),
            boundary_max: p(100.1),
            last_update_ms: 0,
            volume_weighted_price: p(100.0),
        }
    }

    fn trade_with_zone(z: ZoneSnapshot) -> EnrichedTrade {
        EnrichedTrade {
            trade: AggTrade {
                trade_id: 1,
                price: p(100.0),
                qty: q(1.0),
                ts_ms: 0,
                buyer_is_maker: true,
            },
            best_bid: Some(p(99.99)),
            best_ask: Some(p(100.01)),
            passive_bid_vol_at_price: 0,
            passive_ask_vol_at_price: 0,
            zone_passive_bid_vol: 0,
            zone_passive_ask_vol: 0,
            zone_data: StandardZoneData {
                zones_5t: vec![z],
                zones_10t: vec![],
                zones_20t: vec![],
                base_ticks: [5, 10, 20],
                tick_value: PRICE_SCALE / 100,
                time_window_ms: 60_000,
            },
        }
    }

    #[test]
    fn scenario_2_bid_exhaustion_emits_buy() {
        let mut det = ExhaustionDetector::new(test_config(), PRICE_SCALE / 100);
        // passive_bid=100, passive_ask=30, aggressive=2500, dominantly sell.
        let z = zone(100.0, 30.0, 0.0, 2500.0);
        let signal = det.on_enriched_trade(&trade_with_zone(z)).unwrap();
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.kind, SignalKind::Exhaustion);
    }

    #[test]
    fn scenario_2_below_gate_emits_nothing() {
        let mut det = ExhaustionDetector::new(test_config(), PRICE_SCALE / 100);
        let z = zone(100.0, 30.0, 0.0, 50.0);
        assert!(det.on_enriched_trade(&trade_with_zone(z)).is_none());
    }

    #[test]
    fn scenario_3_ask_exhaustion_emits_sell() {
        let mut det = ExhaustionDetector::new(test_config(), PRICE_SCALE / 100);
        let z = zone(30.0, 100.0, 2500.0, 0.0);
        let signal = det.on_enriched_trade(&trade_with_zone(z)).unwrap();
        assert_eq!(signal.side, Side::Sell);
    }

    #[test]
    fn p7_no_emission_below_min_agg_volume() {
        let mut det = ExhaustionDetector::new(test_config(), PRICE_SCALE / 100);
        let z = zone(100.0, 30.0, 0.0, 1_999.999);
        assert!(det.on_enriched_trade(&trade_with_zone(z)).is_none());
    }
}
