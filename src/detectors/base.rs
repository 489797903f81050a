//! Shared detector contract (§4.4): validated config at construction, one
//! hot-path entry point, cooldown suppression, error isolation.
//!
//! Detectors never propagate `Result` out of their hot path — `analyze`
//! returns `Result<Option<SignalCandidate>, String>` internally only so
//! [`ErrorIsolation`] has something to catch and count; the public
//! `on_enriched_trade` always returns a plain `Option`.

use tracing::error;

/// Per-detector (or per-pattern) emission throttle. Suppresses repeat
/// emissions at or near the same price within `cooldown_ms` of the last one,
/// unless the new candidate clears both the confidence bar and the price
/// distance bar (§4.4, P6).
pub struct CooldownTracker {
    cooldown_ms: i64,
    min_move_ticks: i64,
    tick_size: i64,
    last: Option<(i64, i64, f64)>, // ts_ms, price, confidence
}

impl CooldownTracker {
    pub fn new(cooldown_ms: i64, min_move_ticks: i64, tick_size: i64) -> Self {
        Self {
            cooldown_ms,
            min_move_ticks,
            tick_size,
            last: None,
        }
    }

    /// Does NOT record the emission — callers call `record` only once the
    /// candidate has actually been accepted downstream.
    pub fn allow(&self, price: i64, confidence: f64, ts_ms: i64) -> bool {
        match self.last {
            None => true,
            Some((last_ts, last_price, last_conf)) => {
                if ts_ms - last_ts >= self.cooldown_ms {
                    return true;
                }
                let min_move = self.min_move_ticks * self.tick_size;
                confidence > last_conf && (price - last_price).abs() >= min_move
            }
        }
    }

    pub fn record(&mut self, price: i64, confidence: f64, ts_ms: i64) {
        self.last = Some((ts_ms, price, confidence));
    }
}

/// Counts and logs analysis failures instead of letting them propagate —
/// the systems-language equivalent of "catch, log, count, continue" for a
/// hot path that otherwise never returns `Result`.
#[derive(Default)]
pub struct ErrorIsolation {
    error_count: u64,
}

impl ErrorIsolation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, detector: &str, err: impl std::fmt::Display) {
        self.error_count += 1;
        error!(detector, error = %err, "detector analysis failed, skipping event");
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }
}

/// Minimal common surface the core loop drives every detector through
/// alongside its own trade-specific `on_enriched_trade`/`on_book_update`
/// method (kept off this trait since their inputs differ per detector).
pub trait DetectorBase {
    fn name(&self) -> &'static str;

    /// Periodic sweep (§5: "every ~30-60s on the core loop") purging state
    /// older than the detector's own time window.
    fn cleanup(&mut self, now_ms: i64);

    fn error_count(&self) -> u64;
}
