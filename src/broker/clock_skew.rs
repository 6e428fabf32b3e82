use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Symmetric tolerance for clock differences between the broker and the
/// parties whose timestamps it checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSkewPolicy {
    tolerance: TimeDelta,
}

impl ClockSkewPolicy {
    pub fn new(tolerance: Duration) -> Self {
        Self {
            tolerance: TimeDelta::from_std(tolerance).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn tolerance(&self) -> TimeDelta {
        self.tolerance
    }

    /// `now >= not_before - tolerance && now < not_on_or_after + tolerance`
    pub fn is_within_window(
        &self,
        not_before: DateTime<Utc>,
        not_on_or_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        self.is_before_now(not_before, now) && self.is_after_now(not_on_or_after, now)
    }

    /// Like [`is_within_window`](Self::is_within_window), with a missing bound
    /// treated as unbounded.
    pub fn check_conditions(
        &self,
        not_before: Option<DateTime<Utc>>,
        not_on_or_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        not_before.is_none_or(|instant| self.is_before_now(instant, now))
            && not_on_or_after.is_none_or(|instant| self.is_after_now(instant, now))
    }

    /// Whether `instant` has been reached: `instant - tolerance <= now`.
    pub fn is_before_now(&self, instant: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match instant.checked_sub_signed(self.tolerance) {
            Some(earliest) => now >= earliest,
            None => true,
        }
    }

    /// Whether `instant` is still ahead: `now < instant + tolerance`.
    pub fn is_after_now(&self, instant: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match instant.checked_add_signed(self.tolerance) {
            Some(latest) => now < latest,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + TimeDelta::milliseconds(millis)
    }

    const NOT_BEFORE: i64 = 0;
    const NOT_ON_OR_AFTER: i64 = 60_000;
    const TOLERANCE: i64 = 5_000;

    #[rstest]
    #[case::one_ms_before_tolerated_start(NOT_BEFORE - TOLERANCE - 1, false)]
    #[case::at_tolerated_start(NOT_BEFORE - TOLERANCE, true)]
    #[case::inside_window(30_000, true)]
    #[case::at_not_on_or_after(NOT_ON_OR_AFTER, true)]
    #[case::one_ms_before_tolerated_end(NOT_ON_OR_AFTER + TOLERANCE - 1, true)]
    #[case::at_tolerated_end(NOT_ON_OR_AFTER + TOLERANCE, false)]
    fn test_window_boundaries(#[case] now: i64, #[case] expected: bool) {
        let policy = ClockSkewPolicy::new(Duration::from_millis(TOLERANCE as u64));
        assert_eq!(
            policy.is_within_window(at(NOT_BEFORE), at(NOT_ON_OR_AFTER), at(now)),
            expected
        );
    }

    #[rstest]
    #[case(-1, false)]
    #[case(0, true)]
    #[case(59_999, true)]
    #[case(60_000, false)]
    fn test_zero_tolerance(#[case] now: i64, #[case] expected: bool) {
        let policy = ClockSkewPolicy::from_secs(0);
        assert_eq!(
            policy.is_within_window(at(NOT_BEFORE), at(NOT_ON_OR_AFTER), at(now)),
            expected
        );
    }

    #[test]
    fn test_missing_bounds_are_unbounded() {
        let policy = ClockSkewPolicy::from_secs(0);
        assert!(policy.check_conditions(None, None, at(0)));
        assert!(policy.check_conditions(None, Some(at(1)), at(0)));
        assert!(!policy.check_conditions(None, Some(at(0)), at(0)));
        assert!(policy.check_conditions(Some(at(0)), None, at(0)));
        assert!(!policy.check_conditions(Some(at(1)), None, at(0)));
    }

    #[test]
    fn test_huge_tolerance_does_not_overflow() {
        let policy = ClockSkewPolicy::from_secs(u64::MAX);
        assert!(policy.is_within_window(at(0), at(1), at(1_000_000)));
    }
}
