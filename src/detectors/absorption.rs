//! Detects a price level absorbing aggressive flow without moving (§4.5).
//!
//! Baseline logic is the only emission path; the multi-timeframe confluence
//! layer only ever adds to the baseline's confidence (§9 open question:
//! enhanced layer is confidence-only, never an independent emitter).

use uuid::Uuid;

use crate::config::AbsorptionConfig;
use crate::detectors::base::{CooldownTracker, DetectorBase, ErrorIsolation};
use crate::detectors::spoofing::SpoofingDetector;
use crate::detectors::zones::nearest_zone;
use crate::model::{EnrichedTrade, SignalCandidate, SignalCandidateData, SignalKind, Side, ZoneSnapshot};

/// How far a spoofing flag is allowed to trail the absorption check.
const SPOOF_QUERY_MAX_AGE_MS: i64 = 10_000;
/// Baseline confidence once all baseline gates pass; the enhanced layer
/// below adds to this.
const BASELINE_CONFIDENCE: f64 = 0.5;
const CROSS_TIMEFRAME_BONUS: f64 = 0.10;
const CROSS_TIMEFRAME_STRENGTH_THRESHOLD: f64 = 0.5;

pub struct AbsorptionDetector {
    config: AbsorptionConfig,
    tick_size: i64,
    cooldown: CooldownTracker,
    errors: ErrorIsolation,
}

impl AbsorptionDetector {
    pub fn new(config: AbsorptionConfig, tick_size: i64) -> Self {
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

    pub fn on_enriched_trade(
        &mut self,
        trade: &EnrichedTrade,
        spoofing: &SpoofingDetector,
    ) -> Option<SignalCandidate> {
        match self.analyze(trade, spoofing) {
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
                self.errors.record("absorption", e);
                None
            }
        }
    }

    fn analyze(
        &mut self,
        trade: &EnrichedTrade,
        spoofing: &SpoofingDetector,
    ) -> Result<Option<SignalCandidate>, String> {
        let price = trade.trade.price;
        let zone = match nearest_zone(&trade.zone_data.zones_5t, price, 5 * self.tick_size) {
            Some(z) => z,
            None => return Ok(None),
        };

        let a = zone.aggressive_vol;
        let p_vol = zone.passive_vol;
        if a < self.config.min_agg_volume {
            return Ok(None);
        }

        let passive_ratio = p_vol as f64 / a.max(self.config.min_volume_for_ratio) as f64;
        if passive_ratio < self.config.min_passive_multiplier {
            return Ok(None);
        }

        let absorption_ratio = a as f64 / (a + p_vol).max(1) as f64;
        if absorption_ratio > self.config.max_absorption_ratio {
            return Ok(None);
        }

        let price_move = (price - zone.volume_weighted_price).abs();
        let price_efficiency = price_move as f64 / a as f64;
        if price_efficiency > self.config.price_efficiency_threshold {
            return Ok(None);
        }

        let spread_impact = match (trade.best_bid, trade.best_ask) {
            (Some(bid), Some(ask)) if bid > 0 => (ask - bid) as f64 / bid as f64,
            _ => 0.0,
        };
        if spread_impact > self.config.spread_impact_threshold {
            return Ok(None);
        }

        if spoofing.is_wall_spoofed_near(
            price,
            5 * self.tick_size,
            trade.trade.ts_ms,
            SPOOF_QUERY_MAX_AGE_MS,
        ) {
            return Ok(None);
        }

        let side = if zone.aggr_sell_vol > zone.aggr_buy_vol {
            Side::Buy
        } else {
            Side::Sell
        };

        let confidence = self.enhanced_confidence(trade, price, BASELINE_CONFIDENCE);

        Ok(Some(SignalCandidate {
            id: Uuid::new_v4(),
            detector_id: "absorption".to_string(),
            kind: SignalKind::Absorption,
            side,
            confidence,
            ts_ms: trade.trade.ts_ms,
            data: SignalCandidateData {
                price,
                aggressive: a,
                passive: p_vol,
                refilled: false,
                meta: Default::default(),
            },
        }))
    }

    /// Multi-timeframe confluence layer: additive, confidence-only (§9).
    fn enhanced_confidence(&self, trade: &EnrichedTrade, price: i64, baseline: f64) -> f64 {
        let horizons: [(&[ZoneSnapshot], i64, f64); 3] = [
            (&trade.zone_data.zones_5t, 5 * self.tick_size, 0.40),
            (&trade.zone_data.zones_10t, 10 * self.tick_size, 0.35),
            (&trade.zone_data.zones_20t, 20 * self.tick_size, 0.25),
        ];

        let mut present = 0usize;
        let mut confluence = 0.0f64;
        let mut strengths = Vec::with_capacity(3);
        let mut institutional_hit = false;

        for (zones, width, weight) in horizons {
            let Some(zone) = nearest_zone(zones, price, width) else {
                continue;
            };
            present += 1;

            let distance = (price - zone.price_level).abs();
            let distance_score = (1.0 - distance as f64 / width as f64).clamp(0.0, 1.0);

            let total_vol = zone.aggressive_vol + zone.passive_vol;
            let volume_score = (total_vol as f64 / self.config.institutional_volume_threshold as f64)
                .clamp(0.0, 1.0);

            let absorption_strength = if total_vol > 0 {
                zone.passive_vol as f64 / total_vol as f64
            } else {
                0.0
            };

            let composite = 0.4 * distance_score + 0.3 * volume_score + 0.3 * absorption_strength;
            confluence += weight * composite;
            strengths.push(absorption_strength);

            if total_vol >= self.config.institutional_volume_threshold {
                institutional_hit = true;
            }
        }

        let mut boost = confluence.min(1.0) * 0.15;

        if present == 3 {
            boost += 0.20;
        }

        if !strengths.is_empty() {
            let mean = strengths.iter().sum::<f64>() / strengths.len() as f64;
            let variance =
                strengths.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / strengths.len() as f64;
            let consistency = (1.0 - variance).max(0.0);
            boost += consistency * 0.10;
        }

        if institutional_hit {
            boost += self.config.institutional_volume_boost;
        }

        let cross_timeframe_count = strengths
            .iter()
            .filter(|&&s| s >= CROSS_TIMEFRAME_STRENGTH_THRESHOLD)
            .count();
        if cross_timeframe_count >= 2 {
            boost += CROSS_TIMEFRAME_BONUS;
        }

        (baseline + boost).min(1.0)
    }
}

impl DetectorBase for AbsorptionDetector {
    fn name(&self) -> &'static str {
        "absorption"
    }

    fn cleanup(&mut self, _now_ms: i64) {}

    fn error_count(&self) -> u64 {
        self.errors.error_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpoofingConfig;
    use crate::fixed_math::{PRICE_SCALE, QUANTITY_SCALE};
    use crate::model::{AggTrade, StandardZoneData};

    fn p(v: f64) -> i64 {
        (v * PRICE_SCALE as f64) as i64
    }
    fn q(v: f64) -> i64 {
        (v * QUANTITY_SCALE as f64) as i64
    }

    fn test_config() -> AbsorptionConfig {
        AbsorptionConfig {
            min_agg_volume: q(1_500.0),
            min_volume_for_ratio: q(1.0),
            min_passive_multiplier: 1.5,
            max_absorption_ratio: 0.4,
            price_efficiency_threshold: 0.05,
            spread_impact_threshold: 0.3,
            event_cooldown_ms: 5_000,
            min_initial_move_ticks: 3,
            institutional_volume_threshold: q(10_000.0),
            institutional_volume_boost: 0.1,
            horizon_weights: [0.40, 0.35, 0.25],
        }
    }

    fn no_spoof() -> SpoofingDetector {
        SpoofingDetector::new(
            SpoofingConfig {
                wall_ticks: 5,
                min_wall_size: q(5_000.0),
                max_cancellation_ratio: 0.8,
                rapid_cancellation_ms: 2_000,
                event_cooldown_ms: 10_000,
            },
            PRICE_SCALE / 100,
        )
    }

    fn zone_at(price: i64, aggr_sell: f64, aggr_buy: f64, passive: f64) -> ZoneSnapshot {
        ZoneSnapshot {
            price_level: price,
            tick_size: PRICE_SCALE / 100,
            aggressive_vol: q(aggr_sell) + q(aggr_buy),
            passive_vol: q(passive),
            aggr_buy_vol: q(aggr_buy),
            aggr_sell_vol: q(aggr_sell),
            passive_bid_vol: q(passive),
            passive_ask_vol: 0,
            trade_count: 1,
            timespan_ms: 60_000,
            boundary_min: price - PRICE_SCALE / 20,
            boundary_max: price + PRICE_SCALE / 20,
            last_update_ms: 0,
            volume_weighted_price: price,
        }
    }

    #[test]
    fn baseline_absorption_emits_buy_when_sellers_absorbed() {
        let mut det = AbsorptionDetector::new(test_config(), PRICE_SCALE / 100);
        let zone = zone_at(p(100.0), 2_000.0, 0.0, 4_000.0);
        let trade = EnrichedTrade {
            trade: AggTrade {
                trade_id: 1,
                price: p(100.0),
                qty: q(10.0),
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
                zones_5t: vec![zone],
                zones_10t: vec![],
                zones_20t: vec![],
                base_ticks: [5, 10, 20],
                tick_value: PRICE_SCALE / 100,
                time_window_ms: 60_000,
            },
        };

        let signal = det.on_enriched_trade(&trade, &no_spoof()).unwrap();
        assert_eq!(signal.side, Side::Buy);
        assert!(signal.confidence >= BASELINE_CONFIDENCE);
        assert!(signal.confidence <= 1.0);
    }

    #[test]
    fn gate_rejects_insufficient_aggressive_volume() {
        let mut det = AbsorptionDetector::new(test_config(), PRICE_SCALE / 100);
        let zone = zone_at(p(100.0), 10.0, 0.0, 4_000.0);
        let trade = EnrichedTrade {
            trade: AggTrade {
                trade_id: 1,
                price: p(100.0),
                qty: q(10.0),
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
                zones_5t: vec![zone],
                zones_10t: vec![],
                zones_20t: vec![],
                base_ticks: [5, 10, 20],
                tick_value: PRICE_SCALE / 100,
                time_window_ms: 60_000,
            },
        };

        assert!(det.on_enriched_trade(&trade, &no_spoof()).is_none());
    }
}
