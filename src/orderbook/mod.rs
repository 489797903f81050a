//! Authoritative, tick-aligned order book for a single symbol.
//!
//! Owns every [`PriceLevel`] exclusively; nothing outside this module ever
//! mutates book state. Other threads only ever see an [`OrderBookSnapshot`]
//! taken via [`OrderBookState::snapshot`].

use std::collections::BTreeMap;

use tracing::warn;

use crate::config::BookConfig;
use crate::fixed_math::{self, MathResult};
use crate::model::{
    BookHealth, BookState, DepthRow, DepthSnapshot, DepthUpdate, OrderBookSnapshot, PriceLevel,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct BandSum {
    pub bid_total: i64,
    pub ask_total: i64,
    pub levels_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    GapDetected,
    Rejected,
}

pub struct OrderBookState {
    symbol: String,
    config: BookConfig,
    levels: BTreeMap<i64, PriceLevel>,
    best_bid: Option<i64>,
    best_ask: Option<i64>,
    last_update_id: u64,
    state: BookState,
    error_count: u64,
    last_update_ms: i64,
}

impl OrderBookState {
    pub fn new(symbol: impl Into<String>, config: BookConfig) -> Self {
        Self {
            symbol: symbol.into(),
            config,
            levels: BTreeMap::new(),
            best_bid: None,
            best_ask: None,
            last_update_id: 0,
            state: BookState::Uninit,
            error_count: 0,
            last_update_ms: 0,
        }
    }

    pub fn state(&self) -> BookState {
        self.state
    }

    pub fn best_bid(&self) -> Option<i64> {
        self.best_bid
    }

    pub fn best_ask(&self) -> Option<i64> {
        self.best_ask
    }

    pub fn spread(&self) -> MathResult {
        fixed_math::calculate_spread(self.best_bid?, self.best_ask?)
    }

    pub fn mid_price(&self) -> MathResult {
        fixed_math::calculate_mid_price(self.best_bid?, self.best_ask?, self.config.tick_size)
    }

    pub fn get_level(&self, price: i64) -> Option<PriceLevel> {
        let price = fixed_math::normalize_price_to_tick(price, self.config.tick_size);
        self.levels.get(&price).copied()
    }

    pub fn sum_band(&self, center: i64, n_ticks: i64) -> BandSum {
        let center = fixed_math::normalize_price_to_tick(center, self.config.tick_size);
        let lo = center - n_ticks * self.config.tick_size;
        let hi = center + n_ticks * self.config.tick_size;
        let mut sum = BandSum::default();
        for level in self.levels.range(lo..=hi).map(|(_, l)| l) {
            sum.bid_total += level.bid_qty;
            sum.ask_total += level.ask_qty;
            sum.levels_count += 1;
        }
        sum
    }

    /// All levels within `n_ticks` of `center`, for detectors that need to
    /// scan the resting book directly (e.g. wall detection) rather than a
    /// single aggregate.
    pub fn levels_within(&self, center: i64, n_ticks: i64) -> Vec<PriceLevel> {
        let center = fixed_math::normalize_price_to_tick(center, self.config.tick_size);
        let lo = center - n_ticks * self.config.tick_size;
        let hi = center + n_ticks * self.config.tick_size;
        self.levels.range(lo..=hi).map(|(_, l)| *l).collect()
    }

    pub fn snapshot(&self) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: self.symbol.clone(),
            ts_ms: self.last_update_ms,
            levels: self.levels.values().copied().collect(),
            best_bid: self.best_bid,
            best_ask: self.best_ask,
        }
    }

    /// Initialize (or re-initialize after a gap) from an exchange snapshot,
    /// then replay any depth updates buffered while recovering, per the
    /// recovery protocol in §4.2.
    pub fn recover(
        &mut self,
        snapshot: DepthSnapshot,
        buffered: Vec<DepthUpdate>,
        now_ms: i64,
    ) -> ApplyOutcome {
        self.state = BookState::Recovering;
        self.levels.clear();
        self.error_count = 0;

        for row in snapshot.bids {
            self.set_side(row, true, now_ms);
        }
        for row in snapshot.asks {
            self.set_side(row, false, now_ms);
        }
        self.last_update_id = snapshot.last_update_id;
        self.recompute_best(now_ms);

        let mut applied_any = false;
        for update in buffered {
            if update.sequence_last <= self.last_update_id {
                continue; // stale relative to snapshot, discard
            }
            if !applied_any {
                if update.sequence_first > self.last_update_id + 1
                    || update.sequence_last < self.last_update_id + 1
                {
                    warn!(
                        symbol = %self.symbol,
                        "gap between snapshot and first buffered update; requesting re-snapshot"
                    );
                    self.state = BookState::Degraded;
                    return ApplyOutcome::GapDetected;
                }
                applied_any = true;
            } else if update.sequence_first != self.last_update_id + 1 {
                warn!(symbol = %self.symbol, "sequence gap during recovery replay");
                self.state = BookState::Degraded;
                return ApplyOutcome::GapDetected;
            }

            match self.apply_rows(&update, now_ms) {
                ApplyOutcome::Applied => {}
                other => return other,
            }
        }

        self.state = BookState::Ready;
        ApplyOutcome::Applied
    }

    /// Apply a batch depth update. Returns `GapDetected` (and flips to
    /// `Degraded`) if sequence validation is enabled and the update does not
    /// chain onto `last_update_id`.
    pub fn apply_depth(&mut self, update: &DepthUpdate, now_ms: i64) -> ApplyOutcome {
        if matches!(self.state, BookState::Uninit | BookState::Recovering) {
            return ApplyOutcome::Rejected;
        }

        if self.config.sequence_validation_enabled
            && update.sequence_first != self.last_update_id + 1
        {
            self.error_count += 1;
            self.state = BookState::Degraded;
            warn!(
                symbol = %self.symbol,
                expected = self.last_update_id + 1,
                got = update.sequence_first,
                "sequence gap detected"
            );
            return ApplyOutcome::GapDetected;
        }

        self.apply_rows(update, now_ms)
    }

    fn apply_rows(&mut self, update: &DepthUpdate, now_ms: i64) -> ApplyOutcome {
        for &row in &update.bids {
            if row.qty < 0 {
                self.error_count += 1;
                continue;
            }
            self.set_side(row, true, now_ms);
        }
        for &row in &update.asks {
            if row.qty < 0 {
                self.error_count += 1;
                continue;
            }
            self.set_side(row, false, now_ms);
        }
        self.last_update_id = update.sequence_last;
        self.last_update_ms = update.event_time_ms.max(now_ms);
        self.recompute_best(now_ms);

        if self.error_count > self.config.error_threshold {
            self.state = BookState::Degraded;
        }
        ApplyOutcome::Applied
    }

    fn set_side(&mut self, row: DepthRow, is_bid: bool, now_ms: i64) {
        let price = fixed_math::normalize_price_to_tick(row.price, self.config.tick_size);
        let entry = self
            .levels
            .entry(price)
            .or_insert_with(|| PriceLevel::new(price, now_ms));
        if is_bid {
            entry.bid_qty = row.qty.max(0);
        } else {
            entry.ask_qty = row.qty.max(0);
        }
        entry.last_update_ms = now_ms;
        entry.update_count += 1;
        if entry.is_empty() {
            self.levels.remove(&price);
        }
    }

    fn recompute_best(&mut self, now_ms: i64) {
        self.best_bid = self
            .levels
            .iter()
            .rev()
            .find(|(_, l)| l.bid_qty > 0)
            .map(|(&p, _)| p);
        self.best_ask = self
            .levels
            .iter()
            .find(|(_, l)| l.ask_qty > 0)
            .map(|(&p, _)| p);
        self.last_update_ms = self.last_update_ms.max(now_ms);
    }

    /// Remove bid levels priced above the current best ask and ask levels
    /// priced below the current best bid, preserving a level that sits
    /// exactly at both (the legitimate midpoint case, P2).
    pub fn purge_crossed_levels(&mut self) {
        let (Some(best_bid), Some(best_ask)) = (self.best_bid, self.best_ask) else {
            return;
        };

        let mut to_remove = Vec::new();
        for (&price, level) in self.levels.iter_mut() {
            if price > best_ask && level.bid_qty > 0 {
                level.bid_qty = 0;
            }
            if price < best_bid && level.ask_qty > 0 {
                level.ask_qty = 0;
            }
            if level.is_empty() {
                to_remove.push(price);
            }
        }
        for price in to_remove {
            self.levels.remove(&price);
        }
        self.recompute_best(self.last_update_ms);
    }

    pub fn prune_stale(&mut self, now_ms: i64) {
        let Some(mid) = self.mid_price() else {
            return;
        };
        let max_distance = self.config.max_price_distance_ticks * self.config.tick_size;
        let stale_cutoff = now_ms - self.config.stale_threshold_ms;

        self.levels.retain(|&price, level| {
            let distance = (price - mid).abs();
            distance <= max_distance && level.last_update_ms >= stale_cutoff
        });
        self.recompute_best(now_ms);
    }

    pub fn health(&self, now_ms: i64) -> BookHealth {
        BookHealth {
            state: self.state,
            error_count: self.error_count,
            book_size: self.levels.len(),
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            last_update_ms: self.last_update_ms,
            staleness_ms: now_ms - self.last_update_ms,
        }
    }

    #[cfg(test)]
    pub(crate) fn debug_force_ready(&mut self) {
        self.state = BookState::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_math::{PRICE_SCALE, QUANTITY_SCALE};

    fn test_config() -> BookConfig {
        BookConfig {
            tick_size: PRICE_SCALE / 100, // 0.01
            max_price_distance_ticks: 10_000,
            stale_threshold_ms: 60_000,
            error_threshold: 10,
            sequence_validation_enabled: true,
        }
    }

    fn p(v: f64) -> i64 {
        (v * PRICE_SCALE as f64) as i64
    }

    fn q(v: f64) -> i64 {
        (v * QUANTITY_SCALE as f64) as i64
    }

    #[test]
    fn scenario_1_midpoint_purge() {
        let mut book = OrderBookState::new("LTCUSDT", test_config());
        let snapshot = DepthSnapshot {
            last_update_id: 1,
            bids: vec![DepthRow { price: p(100.0), qty: q(2.0) }],
            asks: vec![DepthRow { price: p(100.0), qty: q(3.0) }],
        };
        let outcome = book.recover(snapshot, vec![], 0);
        assert_eq!(outcome, ApplyOutcome::Applied);

        assert_eq!(book.best_bid(), Some(p(100.0)));
        assert_eq!(book.best_ask(), Some(p(100.0)));

        book.purge_crossed_levels();

        let level = book.get_level(p(100.0)).unwrap();
        assert_eq!(level.bid_qty, q(2.0));
        assert_eq!(level.ask_qty, q(3.0));
    }

    #[test]
    fn p1_non_negative_after_apply() {
        let mut book = OrderBookState::new("LTCUSDT", test_config());
        book.recover(
            DepthSnapshot { last_update_id: 0, bids: vec![], asks: vec![] },
            vec![],
            0,
        );
        let update = DepthUpdate {
            sequence_first: 1,
            sequence_last: 1,
            bids: vec![DepthRow { price: p(99.0), qty: q(5.0) }],
            asks: vec![DepthRow { price: p(101.0), qty: q(5.0) }],
            event_time_ms: 1,
            symbol: "LTCUSDT".into(),
        };
        assert_eq!(book.apply_depth(&update, 1), ApplyOutcome::Applied);
        for level in book.levels.values() {
            assert!(level.bid_qty >= 0);
            assert!(level.ask_qty >= 0);
            assert!(!level.is_empty());
        }
    }

    #[test]
    fn sequence_gap_flips_to_degraded() {
        let mut book = OrderBookState::new("LTCUSDT", test_config());
        book.recover(
            DepthSnapshot { last_update_id: 5, bids: vec![], asks: vec![] },
            vec![],
            0,
        );
        let update = DepthUpdate {
            sequence_first: 10, // expected 6
            sequence_last: 10,
            bids: vec![],
            asks: vec![],
            event_time_ms: 1,
            symbol: "LTCUSDT".into(),
        };
        assert_eq!(book.apply_depth(&update, 1), ApplyOutcome::GapDetected);
        assert_eq!(book.state(), BookState::Degraded);
    }

    #[test]
    fn zero_qty_removes_level() {
        let mut book = OrderBookState::new("LTCUSDT", test_config());
        book.recover(
            DepthSnapshot {
                last_update_id: 0,
                bids: vec![DepthRow { price: p(100.0), qty: q(1.0) }],
                asks: vec![],
            },
            vec![],
            0,
        );
        assert!(book.get_level(p(100.0)).is_some());
        let update = DepthUpdate {
            sequence_first: 1,
            sequence_last: 1,
            bids: vec![DepthRow { price: p(100.0), qty: 0 }],
            asks: vec![],
            event_time_ms: 1,
            symbol: "LTCUSDT".into(),
        };
        book.apply_depth(&update, 1);
        assert!(book.get_level(p(100.0)).is_none());
    }

    #[test]
    fn duplicate_update_is_rejected_as_gap_when_sequence_already_applied() {
        let mut book = OrderBookState::new("LTCUSDT", test_config());
        book.recover(
            DepthSnapshot { last_update_id: 0, bids: vec![], asks: vec![] },
            vec![],
            0,
        );
        let update = DepthUpdate {
            sequence_first: 1,
            sequence_last: 1,
            bids: vec![DepthRow { price: p(100.0), qty: q(1.0) }],
            asks: vec![],
            event_time_ms: 1,
            symbol: "LTCUSDT".into(),
        };
        assert_eq!(book.apply_depth(&update, 1), ApplyOutcome::Applied);
        // Re-applying the same sequence range is a no-op from the book's
        // perspective: it is rejected as a gap (expected 2, got 1) rather
        // than silently reprocessed.
        assert_eq!(book.apply_depth(&update, 2), ApplyOutcome::GapDetected);
    }

    #[test]
    fn sum_band_covers_requested_ticks() {
        let mut book = OrderBookState::new("LTCUSDT", test_config());
        book.recover(
            DepthSnapshot {
                last_update_id: 0,
                bids: vec![
                    DepthRow { price: p(99.98), qty: q(1.0) },
                    DepthRow { price: p(99.99), qty: q(2.0) },
                ],
                asks: vec![DepthRow { price: p(100.01), qty: q(3.0) }],
            },
            vec![],
            0,
        );
        let band = book.sum_band(p(100.0), 5);
        assert_eq!(band.bid_total, q(3.0));
        assert_eq!(band.ask_total, q(3.0));
    }
}
