//! Wall-clock helpers for the daily jobs.

use time::{Duration, OffsetDateTime, Time, UtcOffset};

/// Midnight that starts the local day containing `at`.
pub fn start_of_local_day(at: OffsetDateTime, offset: UtcOffset) -> OffsetDateTime {
    at.to_offset(offset).replace_time(Time::MIDNIGHT)
}

/// Time left until the next local midnight. Never zero, so a job that
/// finishes within the same second does not fire twice.
pub fn until_next_local_midnight(now: OffsetDateTime, offset: UtcOffset) -> Duration {
    let next = start_of_local_day(now, offset) + Duration::DAY;
    let remaining = next - now;
    if remaining <= Duration::ZERO {
        Duration::DAY
    } else {
        remaining
    }
}

/// Convert to a std duration for `tokio::time::sleep`, clamping negatives.
pub fn to_std(duration: Duration) -> std::time::Duration {
    std::time::Duration::try_from(duration).unwrap_or(std::time::Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn test_start_of_local_day_respects_offset() {
        // 03:00 UTC is still the previous day at -06:00.
        let start = start_of_local_day(datetime!(2026-03-02 03:00 UTC), offset!(-6));
        assert_eq!(start, datetime!(2026-03-01 00:00 -6));
    }

    #[test]
    fn test_until_next_midnight() {
        let wait = until_next_local_midnight(datetime!(2026-03-01 23:30 -6), offset!(-6));
        assert_eq!(wait, Duration::minutes(30));
        let wait = until_next_local_midnight(datetime!(2026-03-01 00:00 UTC), UtcOffset::UTC);
        assert_eq!(wait, Duration::DAY);
    }

    #[test]
    fn test_to_std_clamps_negative() {
        assert_eq!(to_std(Duration::seconds(-5)), std::time::Duration::ZERO);
        assert_eq!(to_std(Duration::seconds(5)), std::time::Duration::from_secs(5));
    }
}
