//! Shared helper for picking the zone bucket a detector cares about out of
//! the few buckets `StandardZoneData` carries around a trade price.

use crate::fixed_math;
use crate::model::ZoneSnapshot;

/// The zone whose bucket covers `price` at the given `bucket_width` (e.g.
/// `5 * tick_size` for the 5T horizon), if the preprocessor reported one.
pub fn nearest_zone(zones: &[ZoneSnapshot], price: i64, bucket_width: i64) -> Option<&ZoneSnapshot> {
    let key = fixed_math::normalize_price_to_tick(price, bucket_width);
    zones.iter().find(|z| z.price_level == key)
}
