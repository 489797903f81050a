//! Fixed-point arithmetic for monetary values.
//!
//! Prices and quantities live as `i64` scaled by [`PRICE_SCALE`] /
//! [`QUANTITY_SCALE`] for the entire hot path; floats only appear at the
//! edges (wire decode of decimal strings, serialization back out).
//!
//! Every operation that can be undefined (division by zero, stats over an
//! empty sample) returns `None` instead of panicking or propagating an error
//! — callers on the hot path treat `None` as "no signal" and move on.

pub const PRICE_SCALE: i64 = 100_000_000;
pub const QUANTITY_SCALE: i64 = 100_000_000;

/// Null-result sentinel for undefined arithmetic (division by zero, empty
/// sample). Never throws on the hot path; callers propagate `None`.
pub type MathResult = Option<i64>;

/// Convert a decimal value into a scaled integer, rounding to nearest with
/// ties-to-even at the scale boundary.
pub fn price_to_int(value: f64, scale: i64) -> i64 {
    let scaled = value * scale as f64;
    round_ties_even(scaled) as i64
}

/// Inverse of [`price_to_int`].
pub fn int_to_price(value: i64, scale: i64) -> f64 {
    value as f64 / scale as f64
}

fn round_ties_even(x: f64) -> f64 {
    let floor = x.floor();
    let diff = x - floor;
    if (diff - 0.5).abs() < f64::EPSILON {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        x.round()
    }
}

/// Checked add; `None` on overflow.
pub fn safe_add(a: i64, b: i64) -> MathResult {
    a.checked_add(b)
}

/// Checked sub; `None` on overflow.
pub fn safe_sub(a: i64, b: i64) -> MathResult {
    a.checked_sub(b)
}

/// Multiply two scaled integers, rescaling back down by `scale`, with a
/// widened `i128` fallback when the direct `i64` multiply would overflow.
pub fn safe_mul(a: i64, b: i64, scale: i64) -> MathResult {
    if scale == 0 {
        return None;
    }
    let wide = (a as i128) * (b as i128) / (scale as i128);
    if wide > i64::MAX as i128 || wide < i64::MIN as i128 {
        None
    } else {
        Some(wide as i64)
    }
}

/// Divide two scaled integers, rescaling the numerator up by `scale` first so
/// the result stays in the same fixed-point scale. Returns `None` on
/// division by zero (the null-result sentinel).
pub fn safe_div(a: i64, b: i64, scale: i64) -> MathResult {
    if b == 0 {
        return None;
    }
    let wide = (a as i128) * (scale as i128) / (b as i128);
    if wide > i64::MAX as i128 || wide < i64::MIN as i128 {
        None
    } else {
        Some(wide as i64)
    }
}

/// Midpoint of bid/ask, rounded to the nearest tick with banker's rounding.
pub fn calculate_mid_price(bid: i64, ask: i64, tick: i64) -> MathResult {
    if tick <= 0 {
        return None;
    }
    let sum = safe_add(bid, ask)?;
    let raw_mid = sum as f64 / 2.0;
    Some(normalize_price_to_tick(round_ties_even(raw_mid) as i64, tick))
}

pub fn calculate_spread(bid: i64, ask: i64) -> MathResult {
    safe_sub(ask, bid)
}

pub fn calculate_mean(samples: &[i64]) -> MathResult {
    if samples.is_empty() {
        return None;
    }
    let sum: i128 = samples.iter().map(|&v| v as i128).sum();
    let mean = sum / samples.len() as i128;
    Some(mean as i64)
}

pub fn calculate_median(samples: &[i64]) -> MathResult {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        safe_add(sorted[mid - 1], sorted[mid]).map(|s| s / 2)
    } else {
        Some(sorted[mid])
    }
}

pub fn calculate_min(samples: &[i64]) -> MathResult {
    samples.iter().copied().min()
}

pub fn calculate_max(samples: &[i64]) -> MathResult {
    samples.iter().copied().max()
}

/// Population standard deviation via integer-domain Newton's method sqrt, to
/// keep the hot path float-free.
pub fn calculate_stddev(samples: &[i64]) -> MathResult {
    if samples.len() < 2 {
        return None;
    }
    let mean = calculate_mean(samples)? as i128;
    let variance: i128 = samples
        .iter()
        .map(|&v| {
            let d = v as i128 - mean;
            d * d
        })
        .sum::<i128>()
        / samples.len() as i128;
    Some(isqrt(variance) as i64)
}

fn isqrt(n: i128) -> i128 {
    if n < 2 {
        return n.max(0);
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}

/// `round(price / tick) * tick`. Idempotent: `normalize(normalize(p)) ==
/// normalize(p)`.
pub fn normalize_price_to_tick(price: i64, tick: i64) -> i64 {
    if tick <= 0 {
        return price;
    }
    let half = tick / 2;
    let adjusted = if price >= 0 { price + half } else { price - half };
    (adjusted / tick) * tick
}

pub fn is_price_in_zone(price: i64, lo: i64, hi: i64) -> bool {
    price >= lo && price <= hi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let tick = 1_000_000; // 0.01 at 1e8 scale
        for raw in [123_456_789i64, 1, 0, -555_555_555, 1_000_001] {
            let once = normalize_price_to_tick(raw, tick);
            let twice = normalize_price_to_tick(once, tick);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn price_roundtrip() {
        for x in [0i64, 1, -1, 123_456_789, -987_654_321] {
            let f = int_to_price(x, PRICE_SCALE);
            assert_eq!(price_to_int(f, PRICE_SCALE), x);
        }
    }

    #[test]
    fn div_by_zero_is_null_result() {
        assert_eq!(safe_div(100, 0, PRICE_SCALE), None);
    }

    #[test]
    fn mean_median_on_empty_is_null() {
        let empty: [i64; 0] = [];
        assert_eq!(calculate_mean(&empty), None);
        assert_eq!(calculate_median(&empty), None);
        assert_eq!(calculate_stddev(&empty), None);
    }

    #[test]
    fn mid_price_prefers_midpoint_level() {
        let tick = 1_000_000;
        let mid = calculate_mid_price(100 * PRICE_SCALE, 100 * PRICE_SCALE, tick).unwrap();
        assert_eq!(mid, 100 * PRICE_SCALE);
    }

    #[test]
    fn stddev_of_constant_samples_is_zero() {
        let samples = [10i64, 10, 10, 10];
        assert_eq!(calculate_stddev(&samples), Some(0));
    }
}
