//! Detects a resting wall that appears and is canceled before execution
//! (§4.8). Driven off book state directly (it needs to see resting liquidity
//! appear/disappear), not off enriched trades.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::config::SpoofingConfig;
use crate::detectors::base::{CooldownTracker, DetectorBase, ErrorIsolation};
use crate::model::{SignalCandidate, SignalCandidateData, SignalKind, Side};
use crate::orderbook::OrderBookState;

struct WallObservation {
    side: Side,
    first_seen_ms: i64,
}

pub struct SpoofingDetector {
    config: SpoofingConfig,
    cooldown: CooldownTracker,
    errors: ErrorIsolation,
    walls: HashMap<i64, WallObservation>,
    cancellations: HashMap<Side, (u64, u64)>, // (cancelled, total)
    /// Prices recently flagged spoofed, for AbsorptionDetector's query.
    recent_spoofed: HashMap<i64, i64>,
}

impl SpoofingDetector {
    pub fn new(config: SpoofingConfig, tick_size: i64) -> Self {
        let cooldown = CooldownTracker::new(config.event_cooldown_ms, 0, tick_size);
        Self {
            config,
            cooldown,
            errors: ErrorIsolation::new(),
            walls: HashMap::new(),
            cancellations: HashMap::new(),
            recent_spoofed: HashMap::new(),
        }
    }

    pub fn on_book_update(&mut self, book: &OrderBookState, now_ms: i64) -> Option<SignalCandidate> {
        match self.analyze(book, now_ms) {
            Ok(Some(candidate)) => {
                if self.cooldown.allow(candidate.data.price, candidate.confidence, now_ms) {
                    self.cooldown.record(candidate.data.price, candidate.confidence, now_ms);
                    Some(candidate)
                } else {
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                self.errors.record("spoofing", e);
                None
            }
        }
    }

    /// Queried by `AbsorptionDetector` before emitting: has a wall near
    /// `price` been flagged spoofed within `max_age_ms` of `now_ms`?
    pub fn is_wall_spoofed_near(&self, price: i64, radius: i64, now_ms: i64, max_age_ms: i64) -> bool {
        self.recent_spoofed
            .iter()
            .any(|(&p, &ts)| (p - price).abs() <= radius && now_ms - ts <= max_age_ms)
    }

    fn analyze(&mut self, book: &OrderBookState, now_ms: i64) -> Result<Option<SignalCandidate>, String> {
        let (Some(best_bid), Some(best_ask)) = (book.best_bid(), book.best_ask()) else {
            return Ok(None);
        };

        let near_bid = book.levels_within(best_bid, self.config.wall_ticks);
        let near_ask = book.levels_within(best_ask, self.config.wall_ticks);

        let mut current: HashSet<(i64, Side)> = HashSet::new();
        for level in near_bid.iter().chain(near_ask.iter()) {
            if level.bid_qty >= self.config.min_wall_size {
                current.insert((level.price, Side::Buy));
                self.walls.entry(level.price).or_insert(WallObservation {
                    side: Side::Buy,
                    first_seen_ms: now_ms,
                });
            }
            if level.ask_qty >= self.config.min_wall_size {
                current.insert((level.price, Side::Sell));
                self.walls.entry(level.price).or_insert(WallObservation {
                    side: Side::Sell,
                    first_seen_ms: now_ms,
                });
            }
        }

        let mut emission = None;
        let mut gone = Vec::new();
        for (&price, wall) in self.walls.iter() {
            if current.contains(&(price, wall.side)) {
                continue;
            }
            gone.push(price);

            let age = now_ms - wall.first_seen_ms;
            let counter = self.cancellations.entry(wall.side).or_insert((0, 0));
            counter.1 += 1;
            if age <= self.config.rapid_cancellation_ms {
                counter.0 += 1;
                self.recent_spoofed.insert(price, now_ms);

                let ratio = counter.0 as f64 / counter.1 as f64;
                if ratio > self.config.max_cancellation_ratio && emission.is_none() {
                    emission = Some(SignalCandidate {
                        id: Uuid::new_v4(),
                        detector_id: "spoofing".to_string(),
                        kind: SignalKind::Spoofing,
                        side: wall.side,
                        confidence: ratio.min(1.0),
                        ts_ms: now_ms,
                        data: SignalCandidateData {
                            price,
                            aggressive: 0,
                            passive: self.config.min_wall_size,
                            refilled: false,
                            meta: Default::default(),
                        },
                    });
                }
            }
        }
        for price in gone {
            self.walls.remove(&price);
        }

        Ok(emission)
    }
}

impl DetectorBase for SpoofingDetector {
    fn name(&self) -> &'static str {
        "spoofing"
    }

    fn cleanup(&mut self, now_ms: i64) {
        let stale_wall_ms = self.config.rapid_cancellation_ms * 10;
        self.walls
            .retain(|_, w| now_ms - w.first_seen_ms <= stale_wall_ms);

        let stale_flag_ms = self.config.rapid_cancellation_ms * 20;
        self.recent_spoofed
            .retain(|_, &mut ts| now_ms - ts <= stale_flag_ms);
    }

    fn error_count(&self) -> u64 {
        self.errors.error_count()
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

    fn test_config() -> SpoofingConfig {
        SpoofingConfig {
            wall_ticks: 5,
            min_wall_size: q(1_000.0),
            max_cancellation_ratio: 0.5,
            rapid_cancellation_ms: 2_000,
            event_cooldown_ms: 10_000,
        }
    }

    fn book_with_bid_wall(qty: f64) -> OrderBookState {
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
                bids: vec![DepthRow { price: p(99.99), qty: q(qty) }],
                asks: vec![DepthRow { price: p(100.01), qty: q(10.0) }],
            },
            vec![],
            0,
        );
        book
    }

    #[test]
    fn wall_then_rapid_cancel_flags_spoofed() {
        let mut det = SpoofingDetector::new(test_config(), PRICE_SCALE / 100);
        let with_wall = book_with_bid_wall(2_000.0);
        assert!(det.on_book_update(&with_wall, 0).is_none());

        let without_wall = book_with_bid_wall(1.0);
        det.on_book_update(&without_wall, 500);

        assert!(det.is_wall_spoofed_near(p(99.99), 5 * (PRICE_SCALE / 100), 500, 5_000));
    }

    #[test]
    fn slow_cancel_past_rapid_window_is_not_flagged() {
        let mut det = SpoofingDetector::new(test_config(), PRICE_SCALE / 100);
        let with_wall = book_with_bid_wall(2_000.0);
        det.on_book_update(&with_wall, 0);

        let without_wall = book_with_bid_wall(1.0);
        det.on_book_update(&without_wall, 10_000);

        assert!(!det.is_wall_spoofed_near(p(99.99), 5 * (PRICE_SCALE / 100), 10_000, 5_000));
    }
}
