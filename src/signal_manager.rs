//! Final pipeline stage: health gate → confidence gate → correlation boost
//! → dedup → TP/SL derivation → `ConfirmedSignal` emission (§4.10).

use crate::config::SignalManagerConfig;
use crate::model::{
    ConfirmedSignal, CorrelationInfo, MarketHealth, SignalCandidate, SignalKind, Side,
};
use crate::rolling_window::{RollingWindow, Timestamped};

#[derive(Debug, Clone)]
struct SignalHistoryEntry {
    kind: SignalKind,
    price: i64,
    confidence: f64,
    ts_ms: i64,
}

impl Timestamped for SignalHistoryEntry {
    fn ts_ms(&self) -> i64 {
        self.ts_ms
    }
}

/// Dedup only catches rapid-fire repeats of the same confirmed type — kept
/// deliberately shorter than `correlation_window_ms` so a genuinely distinct
/// signal a few seconds to a minute later still reaches the correlation
/// boost instead of being silently dropped here.
const DEDUP_TIME_WINDOW_MS: i64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BlockedByHealth,
    BelowConfidenceThreshold,
    Deduped,
}

pub struct SignalManager {
    config: SignalManagerConfig,
    history: RollingWindow<SignalHistoryEntry>,
    last_confirmed: Vec<SignalHistoryEntry>, // per-kind last confirmed, for dedup
}

impl SignalManager {
    pub fn new(config: SignalManagerConfig) -> Self {
        let history = RollingWindow::new(4_096, config.correlation_window_ms);
        Self {
            config,
            history,
            last_confirmed: Vec::new(),
        }
    }

    /// Runs one candidate through the full pipeline. `Err` carries the drop
    /// reason (used by callers / tests, never propagated as a panic).
    pub fn process(
        &mut self,
        candidate: SignalCandidate,
        health: &MarketHealth,
    ) -> Result<ConfirmedSignal, DropReason> {
        // 1. Health gate (P9).
        if health.recommendation.blocks_signals() {
            return Err(DropReason::BlockedByHealth);
        }

        // 2. Confidence gate.
        if candidate.confidence < self.config.confidence_threshold {
            return Err(DropReason::BelowConfidenceThreshold);
        }

        // 3. Correlation boost.
        let correlation = self.correlation_for(&candidate);
        let final_confidence =
            (candidate.confidence * (1.0 + 0.15 * correlation.strength)).min(1.0);

        // 4. Dedup against the last confirmed signal of the same kind.
        if let Some(last) = self
            .last_confirmed
            .iter()
            .find(|e| e.kind == candidate.kind)
        {
            let tolerance = (last.price as f64 * self.config.dedup_tolerance).abs() as i64;
            if (candidate.data.price - last.price).abs() <= tolerance
                && candidate.ts_ms - last.ts_ms < DEDUP_TIME_WINDOW_MS
            {
                return Err(DropReason::Deduped);
            }
        }

        // 5. TP/SL derivation.
        let side = candidate.kind.default_direction().unwrap_or(candidate.side);
        let side_sign = side.sign() as f64;
        let final_price = candidate.data.price;
        let tp_price = (final_price as f64 * (1.0 + side_sign * self.config.target_pct)) as i64;
        let sl_price = (final_price as f64 * (1.0 - side_sign * self.config.stop_pct)) as i64;

        let entry = SignalHistoryEntry {
            kind: candidate.kind,
            price: final_price,
            confidence: final_confidence,
            ts_ms: candidate.ts_ms,
        };
        self.history.push(entry.clone(), candidate.ts_ms);
        self.record_confirmed(entry);

        Ok(ConfirmedSignal {
            origin_ids: vec![candidate.id],
            kind: candidate.kind,
            side,
            final_confidence,
            final_price,
            tp_price,
            sl_price,
            confirmed_at_ms: candidate.ts_ms,
            correlation,
            health_context: health.clone(),
        })
    }

    fn correlation_for(&self, candidate: &SignalCandidate) -> CorrelationInfo {
        let tolerance = (candidate.data.price as f64 * 0.001).abs() as i64;
        let count = self
            .history
            .iter()
            .filter(|e| {
                e.kind == candidate.kind
                    && candidate.ts_ms - e.ts_ms <= self.config.correlation_window_ms
                    && (e.price - candidate.data.price).abs() <= tolerance
            })
            .count();
        CorrelationInfo {
            count,
            strength: (count as f64 / 3.0).min(1.0),
        }
    }

    fn record_confirmed(&mut self, entry: SignalHistoryEntry) {
        if let Some(slot) = self.last_confirmed.iter_mut().find(|e| e.kind == entry.kind) {
            *slot = entry;
        } else {
            self.last_confirmed.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_math::{PRICE_SCALE, QUANTITY_SCALE};
    use crate::model::{
        AnomalyType, HealthRecommendation, MarketHealthMetrics, SignalCandidateData,
    };
    use uuid::Uuid;

    fn p(v: f64) -> i64 {
        (v * PRICE_SCALE as f64) as i64
    }
    fn q(v: f64) -> i64 {
        (v * QUANTITY_SCALE as f64) as i64
    }

    fn test_config() -> SignalManagerConfig {
        SignalManagerConfig {
            confidence_threshold: 0.6,
            dedup_tolerance: 0.001,
            correlation_window_ms: 60_000,
            target_pct: 0.01,
            stop_pct: 0.005,
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

    fn unhealthy() -> MarketHealth {
        MarketHealth {
            recommendation: HealthRecommendation::Pause,
            ..healthy()
        }
    }

    fn candidate(kind: SignalKind, side: Side, price: i64, confidence: f64, ts_ms: i64) -> SignalCandidate {
        SignalCandidate {
            id: Uuid::new_v4(),
            detector_id: "absorption".to_string(),
            kind,
            side,
            confidence,
            ts_ms,
            data: SignalCandidateData {
                price,
                aggressive: q(1.0),
                passive: q(1.0),
                refilled: false,
                meta: Default::default(),
            },
        }
    }

    #[test]
    fn scenario_5_health_gate_blocks_signal() {
        let mut mgr = SignalManager::new(test_config());
        let c = candidate(SignalKind::Absorption, Side::Buy, p(100.0), 0.9, 0);
        assert_eq!(mgr.process(c, &unhealthy()).unwrap_err(), DropReason::BlockedByHealth);
    }

    #[test]
    fn p9_never_emits_under_blocking_health() {
        let mut mgr = SignalManager::new(test_config());
        for reco in [
            HealthRecommendation::Pause,
            HealthRecommendation::ClosePositions,
            HealthRecommendation::InsufficientData,
        ] {
            let health = MarketHealth { recommendation: reco, ..healthy() };
            let c = candidate(SignalKind::Absorption, Side::Buy, p(100.0), 0.95, 0);
            assert!(mgr.process(c, &health).is_err());
        }
    }

    #[test]
    fn scenario_6_correlation_boosts_second_signal() {
        let mut mgr = SignalManager::new(test_config());
        let c1 = candidate(SignalKind::Absorption, Side::Buy, p(100.0), 0.7, 0);
        let first = mgr.process(c1, &healthy()).unwrap();

        // Second candidate of the same kind/side, within 60s and within
        // 0.1% price, but past the short dedup window (2s) — so it reaches
        // the correlation boost instead of being suppressed as a repeat.
        let c2 = candidate(SignalKind::Absorption, Side::Buy, p(100.05), 0.7, 10_000);
        let second = mgr.process(c2, &healthy());
        assert!(second.is_ok());
        let second = second.unwrap();
        assert!(second.final_confidence > first.final_confidence);
        assert!(second.final_confidence <= 1.0);
    }

    #[test]
    fn p10_tp_sl_sign_for_buy_and_sell() {
        let mut mgr = SignalManager::new(test_config());
        let buy = candidate(SignalKind::Absorption, Side::Buy, p(100.0), 0.9, 0);
        let confirmed = mgr.process(buy, &healthy()).unwrap();
        assert!(confirmed.tp_price > confirmed.final_price);
        assert!(confirmed.final_price > confirmed.sl_price);

        let sell = candidate(SignalKind::Exhaustion, Side::Sell, p(100.0), 0.9, 1);
        let confirmed = mgr.process(sell, &healthy()).unwrap();
        assert!(confirmed.tp_price < confirmed.final_price);
        assert!(confirmed.final_price < confirmed.sl_price);
    }

    #[test]
    fn dedup_suppresses_near_identical_repeat() {
        let mut mgr = SignalManager::new(test_config());
        let c1 = candidate(SignalKind::Absorption, Side::Buy, p(100.0), 0.9, 0);
        mgr.process(c1, &healthy()).unwrap();
        let c2 = candidate(SignalKind::Absorption, Side::Buy, p(100.0001), 0.9, 100);
        assert_eq!(mgr.process(c2, &healthy()).unwrap_err(), DropReason::Deduped);
    }
}
