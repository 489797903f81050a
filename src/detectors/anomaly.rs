//! Aggregate market-health signal derived from rolling trade/book statistics
//! (§4.9). Unlike the other detectors this never emits a `SignalCandidate`;
//! it feeds `SignalManager`'s health gate (P9) and publishes `AnomalyEvent`s.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::config::AnomalyConfig;
use crate::detectors::base::{DetectorBase, ErrorIsolation};
use crate::fixed_math;
use crate::model::{
    AnomalyEvent, AnomalySeverity, AnomalyType, EnrichedTrade, HealthRecommendation, MarketHealth,
    MarketHealthMetrics,
};
use crate::rolling_window::{RollingWindow, Timestamped};

#[derive(Debug, Clone, Copy)]
struct TradeSample {
    ts_ms: i64,
    price: i64,
    qty: i64,
    spread_bps: f64,
    passive_bid: i64,
    passive_ask: i64,
    aggressive_signed: i64, // + buy, - sell
}

impl Timestamped for TradeSample {
    fn ts_ms(&self) -> i64 {
        self.ts_ms
    }
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
    samples: RollingWindow<TradeSample>,
    last_emitted: HashMap<AnomalyType, (i64, AnomalySeverity)>,
    recent: VecDeque<AnomalyEvent>,
    last_ts_ms: Option<i64>,
    errors: ErrorIsolation,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        let samples = RollingWindow::new(config.window_count, config.window_ms);
        Self {
            config,
            samples,
            last_emitted: HashMap::new(),
            recent: VecDeque::new(),
            last_ts_ms: None,
            errors: ErrorIsolation::new(),
        }
    }

    pub fn on_enriched_trade(&mut self, trade: &EnrichedTrade) -> Vec<AnomalyEvent> {
        match self.analyze(trade) {
            Ok(events) => events,
            Err(e) => {
                self.errors.record("anomaly", e);
                Vec::new()
            }
        }
    }

    fn analyze(&mut self, trade: &EnrichedTrade) -> Result<Vec<AnomalyEvent>, String> {
        let now_ms = trade.trade.ts_ms;
        let spread_bps = match (trade.best_bid, trade.best_ask) {
            (Some(bid), Some(ask)) if bid > 0 => {
                (ask - bid) as f64 / bid as f64 * 10_000.0
            }
            _ => 0.0,
        };
        let signed = if trade.trade.aggressive_side() == crate::model::Side::Buy {
            trade.trade.qty
        } else {
            -trade.trade.qty
        };

        let gap_ms = self.last_ts_ms.map(|prev| now_ms - prev).unwrap_or(0);
        self.last_ts_ms = Some(now_ms);

        let sample = TradeSample {
            ts_ms: now_ms,
            price: trade.trade.price,
            qty: trade.trade.qty,
            spread_bps,
            passive_bid: trade.zone_passive_bid_vol,
            passive_ask: trade.zone_passive_ask_vol,
            aggressive_signed: signed,
        };
        self.samples.push(sample, now_ms);

        let mut events = Vec::new();

        if gap_ms > self.config.gap_threshold_ms && self.samples.len() > 1 {
            self.try_emit(&mut events, AnomalyType::ApiGap, AnomalySeverity::High, now_ms, trade.trade.price, trade.trade.price, "reconcile with a fresh snapshot".into());
        }

        let prices: Vec<i64> = self.samples.iter().map(|s| s.price).collect();
        if let (Some(mean), Some(stddev)) = (
            fixed_math::calculate_mean(&prices),
            fixed_math::calculate_stddev(&prices),
        ) {
            if stddev > 0 {
                let z = (trade.trade.price - mean).abs() as f64 / stddev as f64;
                if z > self.config.flash_crash_z_threshold {
                    let severity = if z > self.config.flash_crash_z_threshold * 1.5 {
                        AnomalySeverity::Critical
                    } else {
                        AnomalySeverity::High
                    };
                    self.try_emit(&mut events, AnomalyType::FlashCrash, severity, now_ms, trade.trade.price, trade.trade.price, "pause new entries until price stabilizes".into());
                }
            }
        }

        if spread_bps > self.config.normal_spread_bps * 5.0 {
            let recent_avg_band: i64 = {
                let two_min_ago = now_ms - 120_000;
                let recent: Vec<i64> = self
                    .samples
                    .iter()
                    .filter(|s| s.ts_ms >= two_min_ago)
                    .map(|s| s.passive_bid + s.passive_ask)
                    .collect();
                fixed_math::calculate_mean(&recent).unwrap_or(0)
            };
            let current_band = sample.passive_bid + sample.passive_ask;
            if recent_avg_band > 0 && current_band < recent_avg_band / 2 {
                self.try_emit(&mut events, AnomalyType::LiquidityVoid, AnomalySeverity::High, now_ms, trade.trade.price, trade.trade.price, "reduce size, liquidity thin".into());
            }
        }

        let returns: Vec<i64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
        if returns.len() >= 4 {
            let (recent_half, older_half) = returns.split_at(returns.len() / 2);
            if let (Some(recent_std), Some(older_std)) = (
                fixed_math::calculate_stddev(recent_half),
                fixed_math::calculate_stddev(older_half),
            ) {
                if older_std > 0
                    && recent_std as f64 / older_std as f64 > self.config.volatility_ratio_threshold
                {
                    self.try_emit(&mut events, AnomalyType::ExtremeVolatility, AnomalySeverity::Medium, now_ms, trade.trade.price, trade.trade.price, "widen stops, reduce size".into());
                }
            }
        }

        let sizes: Vec<i64> = self.samples.iter().map(|s| s.qty).collect();
        if sizes.len() >= 10 {
            let mut sorted = sizes.clone();
            sorted.sort_unstable();
            let idx = ((sorted.len() as f64 - 1.0) * self.config.whale_percentile) as usize;
            let threshold = sorted[idx];
            if trade.trade.qty >= threshold && threshold > 0 {
                let window_60s = now_ms - 60_000;
                let clustered = self.samples.iter().filter(|s| s.ts_ms >= window_60s && s.qty >= threshold).count();
                let severity = if clustered >= 3 {
                    AnomalySeverity::High
                } else {
                    AnomalySeverity::Info
                };
                self.try_emit(&mut events, AnomalyType::WhaleActivity, severity, now_ms, trade.trade.price, trade.trade.price, "monitor for follow-through".into());
            }
        }

        let (pb, pa) = (sample.passive_bid, sample.passive_ask);
        if pb + pa > 0 {
            let imbalance = (pb - pa).abs() as f64 / (pb + pa) as f64;
            if imbalance > self.config.volume_imbalance_threshold {
                self.try_emit(&mut events, AnomalyType::OrderbookImbalance, AnomalySeverity::Medium, now_ms, trade.trade.price, trade.trade.price, "expect short-term pressure toward the thinner side".into());
            }
        }

        let window_30s = now_ms - 30_000;
        let net_flow: i64 = self.samples.iter().filter(|s| s.ts_ms >= window_30s).map(|s| s.aggressive_signed).sum();
        let gross_flow: i64 = self.samples.iter().filter(|s| s.ts_ms >= window_30s).map(|s| s.aggressive_signed.abs()).sum();
        if gross_flow > 0 {
            let flow_imbalance = net_flow as f64 / gross_flow as f64;
            if flow_imbalance.abs() > self.config.volume_imbalance_threshold {
                self.try_emit(&mut events, AnomalyType::FlowImbalance, AnomalySeverity::Medium, now_ms, trade.trade.price, trade.trade.price, "aggressive flow is one-sided".into());
            }
        }

        Ok(events)
    }

    #[allow(clippy::too_many_arguments)]
    fn try_emit(
        &mut self,
        events: &mut Vec<AnomalyEvent>,
        kind: AnomalyType,
        severity: AnomalySeverity,
        now_ms: i64,
        price_min: i64,
        price_max: i64,
        action: String,
    ) {
        let supersedes_cooldown = match self.last_emitted.get(&kind) {
            None => true,
            Some(&(last_ts, last_sev)) => {
                now_ms - last_ts >= self.config.anomaly_cooldown_ms
                    || (severity == AnomalySeverity::Critical && last_sev != AnomalySeverity::Critical)
            }
        };
        if !supersedes_cooldown {
            return;
        }
        self.last_emitted.insert(kind, (now_ms, severity));
        let event = AnomalyEvent {
            kind,
            severity,
            detected_at_ms: now_ms,
            affected_price_min: price_min,
            affected_price_max: price_max,
            recommended_action: action,
            details: BTreeMap::new(),
        };
        self.recent.push_back(event.clone());
        while self.recent.len() > 2_048 {
            self.recent.pop_front();
        }
        events.push(event);
    }

    /// Aggregate recommendation (§4.9 last paragraph).
    pub fn market_health(&self, now_ms: i64) -> MarketHealth {
        let five_min_ago = now_ms - 300_000;
        let recent: Vec<&AnomalyEvent> = self
            .recent
            .iter()
            .filter(|e| e.detected_at_ms >= five_min_ago)
            .collect();

        let infra_anomaly = recent
            .iter()
            .any(|e| matches!(e.kind, AnomalyType::ApiGap | AnomalyType::FlashCrash));

        let highest_severity = recent.iter().map(|e| e.severity).max().unwrap_or(AnomalySeverity::Info);

        let prices: Vec<i64> = self.samples.iter().map(|s| s.price).collect();
        let returns: Vec<i64> = prices.windows(2).map(|w| w[1] - w[0]).collect();
        let volatility = fixed_math::calculate_stddev(&returns).unwrap_or(0) as f64;

        let spread_bps = self.samples.back().map(|s| s.spread_bps).unwrap_or(0.0);

        let is_healthy = !infra_anomaly
            && spread_bps < 50.0
            && highest_severity <= AnomalySeverity::Info;

        let recommendation = if self.samples.len() < 10 {
            HealthRecommendation::InsufficientData
        } else if infra_anomaly || highest_severity == AnomalySeverity::Critical {
            HealthRecommendation::ClosePositions
        } else if highest_severity == AnomalySeverity::High {
            HealthRecommendation::Pause
        } else if spread_bps >= 50.0 || highest_severity == AnomalySeverity::Medium {
            HealthRecommendation::ReduceSize
        } else {
            HealthRecommendation::Continue
        };

        MarketHealth {
            is_healthy,
            recommendation,
            critical_issues: recent
                .iter()
                .filter(|e| e.severity == AnomalySeverity::Critical)
                .map(|e| format!("{:?}", e.kind))
                .collect(),
            recent_anomaly_types: recent.iter().map(|e| e.kind).collect(),
            metrics: MarketHealthMetrics {
                spread_bps,
                flow_imbalance: 0.0,
                volatility,
                last_update_age_ms: self.samples.back().map(|s| now_ms - s.ts_ms).unwrap_or(i64::MAX),
            },
        }
    }
}

impl DetectorBase for AnomalyDetector {
    fn name(&self) -> &'static str {
        "anomaly"
    }

    fn cleanup(&mut self, now_ms: i64) {
        self.samples.evict(now_ms);
        let cutoff = now_ms - 300_000;
        self.recent.retain(|e| e.detected_at_ms >= cutoff);
    }

    fn error_count(&self) -> u64 {
        self.errors.error_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_math::{PRICE_SCALE, QUANTITY_SCALE};
    use crate::model::{AggTrade, StandardZoneData};

    fn p(v: f64) -> i64 {
        (v * PRICE_SCALE as f64) as i64
    }
    fn q(v: f64) -> i64 {
        (v * QUANTITY_SCALE as f64) as i64
    }

    fn test_config() -> AnomalyConfig {
        AnomalyConfig {
            normal_spread_bps: 10.0,
            volume_imbalance_threshold: 0.7,
            anomaly_cooldown_ms: 30_000,
            flash_crash_z_threshold: 3.0,
            volatility_ratio_threshold: 2.5,
            whale_percentile: 0.99,
            window_count: 500,
            window_ms: 300_000,
            gap_threshold_ms: 5_000,
        }
    }

    fn trade_at(ts_ms: i64, price: i64) -> EnrichedTrade {
        EnrichedTrade {
            trade: AggTrade {
                trade_id: ts_ms as u64,
                price,
                qty: q(1.0),
                ts_ms,
                buyer_is_maker: false,
            },
            best_bid: Some(p(99.99)),
            best_ask: Some(p(100.01)),
            passive_bid_vol_at_price: 0,
            passive_ask_vol_at_price: 0,
            zone_passive_bid_vol: q(10.0),
            zone_passive_ask_vol: q(10.0),
            zone_data: StandardZoneData {
                zones_5t: vec![],
                zones_10t: vec![],
                zones_20t: vec![],
                base_ticks: [5, 10, 20],
                tick_value: PRICE_SCALE / 100,
                time_window_ms: 60_000,
            },
        }
    }

    #[test]
    fn scenario_5_flash_crash_then_blocks_health() {
        let mut det = AnomalyDetector::new(test_config());
        for i in 0..14 {
            det.on_enriched_trade(&trade_at(i * 100, p(100.0)));
        }
        // Far-from-mean price spike.
        let events = det.on_enriched_trade(&trade_at(1_400, p(150.0)));
        assert!(events.iter().any(|e| e.kind == AnomalyType::FlashCrash));

        let health = det.market_health(1_400);
        assert!(health.recommendation.blocks_signals() || health.recommendation == HealthRecommendation::Pause);
    }

    #[test]
    fn insufficient_data_before_ten_samples() {
        let mut det = AnomalyDetector::new(test_config());
        det.on_enriched_trade(&trade_at(0, p(100.0)));
        let health = det.market_health(0);
        assert_eq!(health.recommendation, HealthRecommendation::InsufficientData);
    }
}
