use std::time::Duration;

/// `min(base * 2^(delivery_count - 1), max)`.
///
/// A delivery count of 0 is treated as the first delivery.
pub fn retry_delay(base: Duration, max: Duration, delivery_count: u32) -> Duration {
    let exponent = delivery_count.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}
