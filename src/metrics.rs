//! The sliding-window health record shared through the store.
//!
//! The window is a single bucket `(success_count, failure_count,
//! window_start)` covering every call observed since `window_start`. There is
//! no per-sub-bucket fidelity: the design trades histogram precision for one
//! store read and one store write per guarded call. A multi-bucket ring would
//! need server-side scripting or optimistic retry loops on every call, and
//! cross-process precision is bounded by store round-trip cost anyway.
//!
//! A record is *fresh* while `now - window_start` is within the sampling
//! duration. A stale record is never read: whoever needs metrics next
//! replaces it with an empty window starting at that moment.
//!
//! Concurrent peers update the record without coordination; last write wins.
//! The resulting undercount is acceptable because the trip decision uses a
//! ratio over a growing sample, not exact totals.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

/// Success/failure counts observed since `window_start`.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use shared_breaker::metrics::HealthMetrics;
///
/// let mut window = HealthMetrics::fresh(Utc::now());
/// window.record_failure();
/// window.record_failure();
/// window.record_success();
///
/// assert_eq!(window.total(), 3);
/// assert!((window.failure_ratio() - 2.0 / 3.0).abs() < f64::EPSILON);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMetrics {
    /// Successful guarded calls recorded in the current window.
    pub success_count: u64,
    /// Failed guarded calls recorded in the current window.
    pub failure_count: u64,
    /// Instant the window began. Never moves backward; replaced only by a
    /// transition to Closed or by lazy expiry.
    pub window_start: DateTime<Utc>,
}

impl HealthMetrics {
    /// An empty window starting at `now`.
    ///
    /// The start instant is truncated to millisecond precision so the record
    /// survives the wire codec unchanged.
    #[must_use]
    pub fn fresh(now: DateTime<Utc>) -> Self {
        let window_start = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
        Self { success_count: 0, failure_count: 0, window_start }
    }

    /// Total calls observed in the window.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.success_count.saturating_add(self.failure_count)
    }

    /// Fraction of observed calls that failed, or `0.0` for an empty window.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        reason = "counts far below 2^52 in any realistic window"
    )]
    pub fn failure_ratio(&self) -> f64 {
        let total = self.total();
        if total == 0 { 0.0 } else { self.failure_count as f64 / total as f64 }
    }

    /// Whether the record still counts as current at `now`.
    ///
    /// A window whose start lies in the future (peer clock skew) is treated
    /// as fresh; the start never moves backward to accommodate it.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, sampling_duration: Duration) -> bool {
        let elapsed = now.signed_duration_since(self.window_start);
        elapsed <= TimeDelta::from_std(sampling_duration).unwrap_or(TimeDelta::MAX)
    }

    /// Records one successful call.
    pub const fn record_success(&mut self) {
        self.success_count = self.success_count.saturating_add(1);
    }

    /// Records one failed call.
    pub const fn record_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
    }

    /// Encodes the record into the compact wire form shared by peers.
    ///
    /// The format is `"{success}:{failure}:{window_start_ms}"` with the
    /// window start as UTC epoch milliseconds. It is stable across peers of
    /// the same deployment and round-trips exactly:
    ///
    /// ```
    /// use chrono::Utc;
    /// use shared_breaker::metrics::HealthMetrics;
    ///
    /// let window = HealthMetrics::fresh(Utc::now());
    /// let decoded = HealthMetrics::decode(&window.encode()).unwrap();
    /// assert_eq!(decoded, window);
    /// ```
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}",
            self.success_count,
            self.failure_count,
            self.window_start.timestamp_millis()
        )
    }

    /// Decodes a record from the compact wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ParseMetricsError`] when the value does not have three
    /// colon-separated fields, a count fails to parse, or the timestamp lies
    /// outside the representable range.
    pub fn decode(value: &str) -> Result<Self, ParseMetricsError> {
        let malformed = || ParseMetricsError(value.to_owned());

        let mut fields = value.split(':');
        let success_count =
            fields.next().and_then(|f| f.parse::<u64>().ok()).ok_or_else(malformed)?;
        let failure_count =
            fields.next().and_then(|f| f.parse::<u64>().ok()).ok_or_else(malformed)?;
        let window_start_ms =
            fields.next().and_then(|f| f.parse::<i64>().ok()).ok_or_else(malformed)?;
        if fields.next().is_some() {
            return Err(malformed());
        }

        let window_start =
            DateTime::from_timestamp_millis(window_start_ms).ok_or_else(malformed)?;
        Ok(Self { success_count, failure_count, window_start })
    }
}

/// A metrics value that does not match the deployment's wire format.
///
/// Treated by readers the same as an absent record: the window is replaced,
/// not trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed health metrics value: {0:?}")]
pub struct ParseMetricsError(String);

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests assert on values that must exist")]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_fresh_window_is_empty() {
        let window = HealthMetrics::fresh(Utc::now());
        assert_eq!(window.success_count, 0);
        assert_eq!(window.failure_count, 0);
        assert_eq!(window.total(), 0);
    }

    #[test]
    fn test_failure_ratio_of_empty_window_is_zero() {
        let window = HealthMetrics::fresh(Utc::now());
        assert!(window.failure_ratio().abs() < f64::EPSILON);
    }

    #[test]
    fn test_failure_ratio_matches_counts() {
        let mut window = HealthMetrics::fresh(Utc::now());
        for _ in 0..3 {
            window.record_failure();
        }
        window.record_success();

        assert_eq!(window.total(), 4);
        assert!((window.failure_ratio() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_freshness_boundary() {
        let now = Utc::now();
        let sampling = Duration::from_secs(10);
        let window = HealthMetrics::fresh(now);

        assert!(window.is_fresh(now, sampling));
        assert!(window.is_fresh(now + TimeDelta::seconds(10), sampling));
        assert!(!window.is_fresh(now + TimeDelta::seconds(11), sampling));
    }

    #[test]
    fn test_future_window_counts_as_fresh() {
        let now = Utc::now();
        let window = HealthMetrics::fresh(now + TimeDelta::seconds(2));
        assert!(window.is_fresh(now, Duration::from_secs(10)));
    }

    #[test]
    fn test_encode_format() {
        let window_start = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let metrics = HealthMetrics { success_count: 7, failure_count: 3, window_start };
        assert_eq!(metrics.encode(), "7:3:1700000000000");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(HealthMetrics::decode("").is_err());
        assert!(HealthMetrics::decode("1:2").is_err());
        assert!(HealthMetrics::decode("1:2:3:4").is_err());
        assert!(HealthMetrics::decode("a:2:3").is_err());
        assert!(HealthMetrics::decode("1:-2:3").is_err());
        assert!(HealthMetrics::decode("1:2:not-a-timestamp").is_err());
    }

    #[test]
    fn test_saturating_counts() {
        let mut window = HealthMetrics {
            success_count: u64::MAX,
            failure_count: u64::MAX - 1,
            window_start: Utc::now(),
        };
        window.record_success();
        window.record_failure();
        assert_eq!(window.success_count, u64::MAX);
        assert_eq!(window.failure_count, u64::MAX);
    }

    proptest! {
        #[test]
        fn prop_codec_round_trips(
            success_count in any::<u64>(),
            failure_count in any::<u64>(),
            window_start_ms in 0_i64..4_102_444_800_000,
        ) {
            let metrics = HealthMetrics {
                success_count,
                failure_count,
                window_start: DateTime::from_timestamp_millis(window_start_ms).unwrap(),
            };
            let decoded = HealthMetrics::decode(&metrics.encode()).unwrap();
            prop_assert_eq!(decoded, metrics);
        }

        #[test]
        fn prop_failure_ratio_is_bounded(
            success_count in 0_u64..1_000_000,
            failure_count in 0_u64..1_000_000,
        ) {
            let metrics = HealthMetrics {
                success_count,
                failure_count,
                window_start: Utc::now(),
            };
            let ratio = metrics.failure_ratio();
            prop_assert!((0.0..=1.0).contains(&ratio));
        }
    }
}
