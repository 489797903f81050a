//! Matches repeated child orders of a sliced-up parent order (§4.7).
//!
//! Three pattern kinds, tried in strict priority order per trade: a trade
//! that continues (or starts) a `passive` pattern never also feeds
//! `aggressive_ltc`/`aggressive_usdt` bookkeeping for the same event.

use std::collections::{HashMap, VecDeque};

use uuid::Uuid;

use crate::config::IcebergConfig;
use crate::detectors::base::{DetectorBase, ErrorIsolation};
use crate::fixed_math::{self, QUANTITY_SCALE};
use crate::model::{EnrichedTrade, SignalCandidate, SignalCandidateData, SignalKind, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PatternKind {
    Passive,
    AggressiveLtc,
    AggressiveUsdt,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatternKey {
    kind: PatternKind,
    side: Side,
    exact_value: i64,
}

struct TradeInfo {
    price: i64,
    qty: i64,
    ts_ms: i64,
}

struct PatternState {
    trades: Vec<TradeInfo>,
    detected: bool,
    last_ts_ms: i64,
}

impl PatternState {
    fn new(ts_ms: i64) -> Self {
        Self {
            trades: Vec::new(),
            detected: false,
            last_ts_ms: ts_ms,
        }
    }
}

enum PatternOutcome {
    NotMatched,
    Matched(Option<SignalCandidate>),
}

pub struct IcebergDetector {
    config: IcebergConfig,
    errors: ErrorIsolation,
    patterns: HashMap<PatternKey, PatternState>,
    lru: VecDeque<PatternKey>,
}

impl IcebergDetector {
    pub fn new(config: IcebergConfig) -> Self {
        Self {
            config,
            errors: ErrorIsolation::new(),
            patterns: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    pub fn on_enriched_trade(&mut self, trade: &EnrichedTrade) -> Option<SignalCandidate> {
        match self.analyze(trade) {
            Ok(candidate) => candidate,
            Err(e) => {
                self.errors.record("iceberg", e);
                None
            }
        }
    }

    /// `round(price × size, 2)`, expressed in the quantity fixed-point scale.
    fn notional(price: i64, qty: i64) -> i64 {
        let raw = (price as i128 * qty as i128) / fixed_math::PRICE_SCALE as i128;
        let cents_unit = (QUANTITY_SCALE / 100) as i128;
        (((raw + cents_unit / 2) / cents_unit) * cents_unit) as i64
    }

    fn analyze(&mut self, trade: &EnrichedTrade) -> Result<Option<SignalCandidate>, String> {
        let side = trade.trade.aggressive_side();
        let price = trade.trade.price;
        let qty = trade.trade.qty;
        let ts = trade.trade.ts_ms;

        let candidates = [
            PatternKey { kind: PatternKind::Passive, side, exact_value: price },
            PatternKey { kind: PatternKind::AggressiveLtc, side, exact_value: qty },
            PatternKey {
                kind: PatternKind::AggressiveUsdt,
                side,
                exact_value: Self::notional(price, qty),
            },
        ];

        for key in candidates {
            match self.try_update(key, price, qty, ts) {
                PatternOutcome::NotMatched => continue,
                PatternOutcome::Matched(result) => return Ok(result),
            }
        }
        Ok(None)
    }

    fn try_update(&mut self, key: PatternKey, price: i64, qty: i64, ts: i64) -> PatternOutcome {
        let is_new = !self.patterns.contains_key(&key);
        if is_new && self.patterns.len() >= self.config.max_active_patterns {
            self.evict_lru();
        }

        let state = self
            .patterns
            .entry(key.clone())
            .or_insert_with(|| PatternState::new(ts));

        if key.kind == PatternKind::Passive {
            if let Some(first) = state.trades.first() {
                if first.qty != qty {
                    // Same price, different size: this trade does not
                    // continue the passive pattern here. Zero tolerance
                    // (P8) — fall through to the next priority kind.
                    return PatternOutcome::NotMatched;
                }
            }
        }

        if !state.trades.is_empty() && ts - state.last_ts_ms > self.config.max_order_gap_ms {
            state.trades.clear();
            state.detected = false;
        }

        state.trades.push(TradeInfo { price, qty, ts_ms: ts });
        state.last_ts_ms = ts;
        let cutoff = ts - self.config.time_window_ms;
        state.trades.retain(|t| t.ts_ms >= cutoff);

        self.touch_lru(&key);

        let order_count = state.trades.len();
        let total_size: i64 = state.trades.iter().map(|t| t.qty).sum();

        if !state.detected
            && order_count >= self.config.min_order_count
            && total_size >= self.config.min_total_size
        {
            state.detected = true;
            let mut meta = std::collections::BTreeMap::new();
            meta.insert("order_count".to_string(), order_count.to_string());
            meta.insert("total_size".to_string(), total_size.to_string());
            meta.insert("pattern_kind".to_string(), format!("{:?}", key.kind));

            return PatternOutcome::Matched(Some(SignalCandidate {
                id: Uuid::new_v4(),
                detector_id: "iceberg".to_string(),
                kind: SignalKind::Iceberg,
                side: key.side,
                confidence: 0.8,
                ts_ms: ts,
                data: SignalCandidateData {
                    price,
                    aggressive: total_size,
                    passive: 0,
                    refilled: false,
                    meta,
                },
            }));
        }

        PatternOutcome::Matched(None)
    }

    fn touch_lru(&mut self, key: &PatternKey) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.clone());
    }

    fn evict_lru(&mut self) {
        if let Some(oldest) = self.lru.pop_front() {
            self.patterns.remove(&oldest);
        }
    }
}

impl DetectorBase for IcebergDetector {
    fn name(&self) -> &'static str {
        "iceberg"
    }

    fn cleanup(&mut self, now_ms: i64) {
        let window = self.config.time_window_ms;
        let expired: Vec<PatternKey> = self
            .patterns
            .iter()
            .filter(|(_, s)| now_ms - s.last_ts_ms > window)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.patterns.remove(&key);
            if let Some(pos) = self.lru.iter().position(|k| k == &key) {
                self.lru.remove(pos);
            }
        }
    }

    fn error_count(&self) -> u64 {
        self.errors.error_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_math::PRICE_SCALE;
    use crate::model::{AggTrade, StandardZoneData};

    fn p(v: f64) -> i64 {
        (v * PRICE_SCALE as f64) as i64
    }
    fn q(v: f64) -> i64 {
        (v * QUANTITY_SCALE as f64) as i64
    }

    fn test_config() -> IcebergConfig {
        IcebergConfig {
            min_order_count: 4,
            min_total_size: q(100.0),
            max_order_gap_ms: 2_000,
            time_window_ms: 120_000,
            max_active_patterns: 256,
        }
    }

    fn trade_at(ts_ms: i64, price: i64, qty: i64) -> EnrichedTrade {
        EnrichedTrade {
            trade: AggTrade {
                trade_id: ts_ms as u64,
                price,
                qty,
                ts_ms,
                buyer_is_maker: false,
            },
            best_bid: None,
            best_ask: None,
            passive_bid_vol_at_price: 0,
            passive_ask_vol_at_price: 0,
            zone_passive_bid_vol: 0,
            zone_passive_ask_vol: 0,
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
    fn scenario_4_passive_iceberg_emits_once_at_fourth_trade() {
        let mut det = IcebergDetector::new(test_config());
        let price = p(89.00);
        let qty = q(25.0);

        assert!(det.on_enriched_trade(&trade_at(0, price, qty)).is_none());
        assert!(det.on_enriched_trade(&trade_at(200, price, qty)).is_none());
        assert!(det.on_enriched_trade(&trade_at(400, price, qty)).is_none());

        let signal = det.on_enriched_trade(&trade_at(600, price, qty)).unwrap();
        assert_eq!(signal.confidence, 0.8);
        assert_eq!(signal.data.meta.get("order_count").unwrap(), "4");
        assert_eq!(signal.data.meta.get("total_size").unwrap(), &q(100.0).to_string());
    }

    #[test]
    fn p8_passive_pattern_rejects_mismatched_size() {
        let mut det = IcebergDetector::new(test_config());
        let price = p(89.00);
        det.on_enriched_trade(&trade_at(0, price, q(25.0)));
        // Different size at the same price does not continue the passive
        // pattern (it starts an aggressive_ltc one instead, keyed by its own
        // size).
        det.on_enriched_trade(&trade_at(100, price, q(30.0)));
        det.on_enriched_trade(&trade_at(300, price, q(25.0)));
        det.on_enriched_trade(&trade_at(500, price, q(25.0)));
        // Still only 3 matching trades at exactly 25 units; no emission yet.
        assert!(det.on_enriched_trade(&trade_at(700, price, q(30.0))).is_none());
    }

    #[test]
    fn gap_resets_sequence() {
        let mut det = IcebergDetector::new(test_config());
        let price = p(89.00);
        let qty = q(25.0);
        det.on_enriched_trade(&trade_at(0, price, qty));
        det.on_enriched_trade(&trade_at(200, price, qty));
        det.on_enriched_trade(&trade_at(400, price, qty));
        // Gap far exceeds max_order_gap_ms: resets to a single trade.
        assert!(det.on_enriched_trade(&trade_at(50_000, price, qty)).is_none());
        assert!(det.on_enriched_trade(&trade_at(50_200, price, qty)).is_none());
        assert!(det.on_enriched_trade(&trade_at(50_400, price, qty)).is_none());
    }
}
