//! Bounded retry with a fixed back-off schedule.
//!
//! Every failure of a job or delivery, whether reported by a worker or
//! detected by the reaper, is funnelled through [`RetryPolicy::decide`] so the
//! two paths can never disagree about when a row becomes permanently failed.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Default schedule: 30 s, 2 min, 10 min.
pub const DEFAULT_BACKOFF_SECS: [u64; 3] = [30, 120, 600];

/// Substrings that mark an error message as transient.
const RETRYABLE_MARKERS: [&str; 8] = [
    "timeout",
    "timed out",
    "rate limit",
    "429",
    "502",
    "503",
    "504",
    "connection",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeouts, transient I/O, rate limiting. Eligible for another attempt.
    Retryable,
    /// Malformed input, auth or policy rejection. Goes straight to `Failed`.
    Fatal,
}

impl FailureClass {
    /// Default classification predicate for collaborators that only hand back
    /// a message.
    #[must_use]
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if RETRYABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            FailureClass::Retryable
        } else {
            FailureClass::Fatal
        }
    }
}

/// What the store should do with a row after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending`, invisible to claims until `not_before`.
    Retry {
        retry_count: i32,
        not_before: DateTime<Utc>,
    },
    /// Permanently `Failed`.
    Fail { retry_count: i32 },
}

impl RetryDecision {
    #[must_use]
    pub fn retry_count(&self) -> i32 {
        match *self {
            RetryDecision::Retry { retry_count, .. } | RetryDecision::Fail { retry_count } => {
                retry_count
            }
        }
    }

    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, RetryDecision::Fail { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from an explicit schedule. An empty schedule means
    /// retries become eligible immediately.
    #[must_use]
    pub fn new(backoff: Vec<Duration>) -> Self {
        Self { backoff }
    }

    #[must_use]
    pub fn backoff(&self) -> &[Duration] {
        &self.backoff
    }

    /// Delay before the attempt that follows failure number `retry_count`
    /// (1-based). The last entry repeats once the schedule runs out.
    #[must_use]
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let idx = usize::try_from(retry_count.saturating_sub(1)).unwrap_or(0);
        self.backoff
            .get(idx)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Applies one failure to a row currently at `retry_count`.
    ///
    /// Retryable failures increment the count; when the new count reaches
    /// `max_retries` the row fails with `retry_count == max_retries`. Fatal
    /// failures fail the row without touching the count.
    #[must_use]
    pub fn decide(
        &self,
        retry_count: i32,
        max_retries: i32,
        class: FailureClass,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if class == FailureClass::Fatal {
            return RetryDecision::Fail {
                retry_count: retry_count.min(max_retries),
            };
        }

        let next = retry_count.saturating_add(1);
        if next >= max_retries {
            return RetryDecision::Fail {
                retry_count: max_retries,
            };
        }

        let delay = TimeDelta::from_std(self.delay_for(next)).unwrap_or(TimeDelta::MAX);
        let not_before = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry {
            retry_count: next,
            not_before,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_retry_uses_first_backoff_entry() {
        let decision = RetryPolicy::default().decide(0, 3, FailureClass::Retryable, now());
        assert_eq!(
            decision,
            RetryDecision::Retry {
                retry_count: 1,
                not_before: now() + TimeDelta::seconds(30),
            }
        );
    }

    #[test]
    fn second_retry_uses_second_entry() {
        let decision = RetryPolicy::default().decide(1, 5, FailureClass::Retryable, now());
        assert_eq!(
            decision,
            RetryDecision::Retry {
                retry_count: 2,
                not_before: now() + TimeDelta::minutes(2),
            }
        );
    }

    #[test]
    fn last_entry_repeats_past_end_of_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(3), Duration::from_secs(600));
        assert_eq!(policy.delay_for(9), Duration::from_secs(600));
    }

    #[test]
    fn three_retryable_failures_exhaust_max_retries_of_three() {
        let policy = RetryPolicy::default();
        let mut count = 0;
        let mut last = None;
        for _ in 0..3 {
            let d = policy.decide(count, 3, FailureClass::Retryable, now());
            count = d.retry_count();
            last = Some(d);
        }
        assert_eq!(last, Some(RetryDecision::Fail { retry_count: 3 }));
    }

    #[test]
    fn fatal_fails_without_incrementing() {
        let decision = RetryPolicy::default().decide(1, 3, FailureClass::Fatal, now());
        assert_eq!(decision, RetryDecision::Fail { retry_count: 1 });
        assert!(decision.is_final());
    }

    #[test]
    fn empty_schedule_retries_immediately() {
        let decision = RetryPolicy::new(Vec::new()).decide(0, 2, FailureClass::Retryable, now());
        assert_eq!(
            decision,
            RetryDecision::Retry {
                retry_count: 1,
                not_before: now(),
            }
        );
    }

    #[test]
    fn transient_messages_are_retryable() {
        for msg in [
            "request timed out",
            "upstream returned 503",
            "Rate limit exceeded",
            "connection reset by peer",
        ] {
            assert_eq!(FailureClass::from_message(msg), FailureClass::Retryable, "{msg}");
        }
    }

    #[test]
    fn other_messages_are_fatal() {
        assert_eq!(
            FailureClass::from_message("spec rejected: unknown genre"),
            FailureClass::Fatal
        );
    }
}
