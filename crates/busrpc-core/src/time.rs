//! Wall-clock helpers. Expiries travel the bus as nanoseconds since the
//! Unix epoch so that independent processes agree on them.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Upper bound for local deadlines: about thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn saturating_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Current time in nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(saturating_nanos)
        .unwrap_or(0)
}

/// Absolute deadline `timeout` from now. Saturates instead of wrapping,
/// so a huge timeout never lands in the past.
pub fn expiry_after(timeout: Duration) -> i64 {
    now_nanos().saturating_add(saturating_nanos(timeout))
}

/// Local monotonic deadline `timeout` from now, capped rather than
/// overflowing `Instant`.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

/// Time left until `expiry`, zero if it already passed.
pub fn remaining(expiry: i64) -> Duration {
    let left = expiry.saturating_sub(now_nanos());
    Duration::from_nanos(left.max(0) as u64)
}

/// Whether `expiry` has passed.
pub fn is_expired(expiry: i64) -> bool {
    now_nanos() >= expiry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_round_trip() {
        let expiry = expiry_after(Duration::from_secs(2));
        assert!(!is_expired(expiry));
        let left = remaining(expiry);
        assert!(left <= Duration::from_secs(2));
        assert!(left > Duration::from_secs(1));
    }

    #[test]
    fn test_past_expiry() {
        let expiry = now_nanos() - 1;
        assert!(is_expired(expiry));
        assert_eq!(remaining(expiry), Duration::ZERO);
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let expiry = expiry_after(Duration::from_secs(u64::MAX / 4));
        assert_eq!(expiry, i64::MAX);
        assert!(!is_expired(expiry));
        assert!(remaining(expiry) > Duration::from_secs(86_400 * 365));

        assert!(expiry_after(Duration::MAX) > now_nanos());
    }

    #[test]
    fn test_deadline_is_capped() {
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > Instant::now() + Duration::from_secs(86_400));
        assert!(deadline_after(Duration::ZERO) <= Instant::now());
    }
}
