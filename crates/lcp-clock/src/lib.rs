//! C1 — Clock & Watermark.
//!
//! Pure computation, no IO: given a loader's watermark and scheduling
//! fields, compute the half-open `[from, to)` range for its next run and
//! the source-local bind bounds to send to the source database.

use chrono::{DateTime, Duration, Utc};
use lcp_schemas::TimeRange;

/// Current wall-clock UTC instant. The sole IO-free "now" source used
/// throughout the workspace so tests can substitute a fixed instant by
/// calling [`next_range`] directly instead of [`now_utc`].
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// The scheduling fields of a `Loader` row needed to compute its next
/// range.
#[derive(Debug, Clone, Copy)]
pub struct LoaderSchedule {
    /// UTC upper bound of data already persisted; `None` before the
    /// loader's first successful run.
    pub last_load_timestamp: Option<DateTime<Utc>>,
    pub max_query_period_seconds: i64,
    pub source_timezone_offset_hours: i32,
}

/// The UTC range to track watermark progress by, plus the source-local
/// bind bounds to send to the source query.
#[derive(Debug, Clone, Copy)]
pub struct ComputedRange {
    pub utc: TimeRange,
    pub source_bind: TimeRange,
}

/// Compute the next `[from, to)` range for a loader at instant `now`.
///
/// `to ≤ from` signals a no-op run — callers check
/// `computed.utc.is_empty()`.
pub fn next_range(now: DateTime<Utc>, schedule: &LoaderSchedule) -> ComputedRange {
    let from = schedule
        .last_load_timestamp
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let candidate_to = from
        .checked_add_signed(Duration::seconds(schedule.max_query_period_seconds))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let to = now.min(candidate_to);

    let utc = TimeRange { from, to };

    let offset = Duration::hours(schedule.source_timezone_offset_hours as i64);
    let source_bind = TimeRange {
        from: from - offset,
        to: to - offset,
    };

    ComputedRange { utc, source_bind }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(s: &str) -> DateTime<Utc> {
        Utc.datetime_from_str(s, "%Y-%m-%dT%H:%M:%SZ").unwrap()
    }

    /// S1 — happy-path single run.
    #[test]
    fn s1_happy_path_window() {
        let schedule = LoaderSchedule {
            last_load_timestamp: Some(dt("2025-12-27T10:00:00Z")),
            max_query_period_seconds: 7200,
            source_timezone_offset_hours: 0,
        };
        let now = dt("2025-12-27T11:00:00Z");
        let r = next_range(now, &schedule);
        assert_eq!(r.utc.from, dt("2025-12-27T10:00:00Z"));
        assert_eq!(r.utc.to, dt("2025-12-27T11:00:00Z"));
        assert!(!r.utc.is_empty());
    }

    /// S2 — chunked catch-up: only one period-sized chunk advances per run.
    #[test]
    fn s2_chunked_catch_up_caps_the_range() {
        let schedule = LoaderSchedule {
            last_load_timestamp: Some(dt("2025-12-25T00:00:00Z")),
            max_query_period_seconds: 3600,
            source_timezone_offset_hours: 0,
        };
        let now = dt("2025-12-27T00:00:00Z");
        let r = next_range(now, &schedule);
        assert_eq!(r.utc.from, dt("2025-12-25T00:00:00Z"));
        assert_eq!(r.utc.to, dt("2025-12-25T01:00:00Z"));
    }

    #[test]
    fn no_watermark_yet_uses_min_sentinel() {
        let schedule = LoaderSchedule {
            last_load_timestamp: None,
            max_query_period_seconds: 60,
            source_timezone_offset_hours: 0,
        };
        let now = dt("2025-01-01T00:00:00Z");
        let r = next_range(now, &schedule);
        assert_eq!(r.utc.from, DateTime::<Utc>::MIN_UTC);
        // candidate_to (MIN_UTC + 60s) is far before `now`, so `to` is capped there.
        assert!(r.utc.to < now);
    }

    #[test]
    fn to_less_or_equal_from_is_a_no_op() {
        let schedule = LoaderSchedule {
            last_load_timestamp: Some(dt("2025-12-27T11:00:00Z")),
            max_query_period_seconds: 3600,
            source_timezone_offset_hours: 0,
        };
        // `now` equal to the watermark: candidate_to is in the future but
        // `now` itself caps `to` back down to `from`.
        let now = dt("2025-12-27T11:00:00Z");
        let r = next_range(now, &schedule);
        assert!(r.utc.is_empty());
    }

    #[test]
    fn negative_timezone_offset_shifts_source_bind_per_spec() {
        let schedule = LoaderSchedule {
            last_load_timestamp: Some(dt("2025-12-27T10:00:00Z")),
            max_query_period_seconds: 3600,
            source_timezone_offset_hours: -5,
        };
        let now = dt("2025-12-27T11:00:00Z");
        let r = next_range(now, &schedule);
        // bind bound shifted by `-offset` => here offset=-5h,
        // so the bind bound is UTC + 5h.
        assert_eq!(r.source_bind.from, dt("2025-12-27T15:00:00Z"));
        assert_eq!(r.source_bind.to, dt("2025-12-27T16:00:00Z"));
        // The UTC-tracked range used for the watermark is unaffected.
        assert_eq!(r.utc.from, dt("2025-12-27T10:00:00Z"));
    }

    #[test]
    fn zero_offset_leaves_bind_bounds_equal_to_utc() {
        let schedule = LoaderSchedule {
            last_load_timestamp: Some(dt("2025-12-27T10:00:00Z")),
            max_query_period_seconds: 3600,
            source_timezone_offset_hours: 0,
        };
        let now = dt("2025-12-27T11:00:00Z");
        let r = next_range(now, &schedule);
        assert_eq!(r.source_bind.from, r.utc.from);
        assert_eq!(r.source_bind.to, r.utc.to);
    }
}
