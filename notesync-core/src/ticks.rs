//! Conversion between the object store's native time unit and local timestamps.
//!
//! The store reports `putTime` in hundred-nanosecond ticks since the Unix epoch, while
//! notes carry epoch milliseconds. Converting ticks to milliseconds truncates: anything
//! below one millisecond is dropped and cannot be recovered.

use time::OffsetDateTime;

/// Hundred-nanosecond ticks in one millisecond.
pub const TICKS_PER_MILLI: i64 = 10_000;

/// Normalizes raw store ticks to epoch milliseconds.
pub fn ticks_to_millis(ticks: i64) -> i64 {
    ticks / TICKS_PER_MILLI
}

/// Wall clock in epoch milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Expands epoch milliseconds back into store ticks.
pub fn millis_to_ticks(millis: i64) -> i64 {
    millis.saturating_mul(TICKS_PER_MILLI)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_raw_ticks_to_millis() {
        assert_eq!(ticks_to_millis(20_000_000), 2_000);
        assert_eq!(ticks_to_millis(0), 0);
    }

    #[test]
    fn wall_clock_is_in_milliseconds() {
        let now = now_millis();
        assert!(now > 1_600_000_000_000 && now < 10_000_000_000_000);
    }

    #[test]
    fn drops_sub_millisecond_precision() {
        assert_eq!(ticks_to_millis(20_009_999), 2_000);
        assert_eq!(millis_to_ticks(ticks_to_millis(20_009_999)), 20_000_000);
    }

    #[test]
    fn millis_survive_a_trip_through_ticks() {
        for millis in [0, 1, 1_000, 1_700_000_000_123] {
            assert_eq!(ticks_to_millis(millis_to_ticks(millis)), millis);
        }
    }

    #[test]
    fn real_put_time_lands_in_the_expected_second() {
        // 2024-01-01T00:00:00.5Z
        let put_time = 17_040_672_005_000_000;
        assert_eq!(ticks_to_millis(put_time), 1_704_067_200_500);
    }
}
