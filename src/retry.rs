//! # Retry Policy
//!
//! Failure classification and bounded exponential backoff for step and
//! compensation attempts.

use crate::models::workflow_definition::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Why a failed attempt was classified the way it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    NetworkError,
    ServerError,
    ConflictRetryEnabled,
    ClientError,
    Unknown,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::NetworkError => write!(f, "network_error"),
            Self::ServerError => write!(f, "server_error"),
            Self::ConflictRetryEnabled => write!(f, "conflict_retry_enabled"),
            Self::ClientError => write!(f, "client_error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retryable: bool,
    pub reason: FailureReason,
}

/// Classify a failure as transient or permanent. First matching rule wins:
/// timeout, then transport error, then 5xx, then opt-in 409, then any other
/// HTTP status is permanent.
pub fn is_transient_failure(
    timed_out: bool,
    network_error: bool,
    status_code: Option<u16>,
    retry_on_409: bool,
) -> RetryDecision {
    if timed_out {
        return RetryDecision {
            retryable: true,
            reason: FailureReason::Timeout,
        };
    }
    if network_error {
        return RetryDecision {
            retryable: true,
            reason: FailureReason::NetworkError,
        };
    }
    match status_code {
        Some(code) if code >= 500 => RetryDecision {
            retryable: true,
            reason: FailureReason::ServerError,
        },
        Some(409) if retry_on_409 => RetryDecision {
            retryable: true,
            reason: FailureReason::ConflictRetryEnabled,
        },
        Some(_) => RetryDecision {
            retryable: false,
            reason: FailureReason::ClientError,
        },
        None => RetryDecision {
            retryable: false,
            reason: FailureReason::Unknown,
        },
    }
}

/// Compute the backoff before attempt `attempt_no + 1`, in milliseconds.
///
/// `rand` must be drawn from `[0, 1)`. The jitter window is
/// `[bounded * (1 - jitter), bounded * (1 + jitter))` where
/// `bounded = min(max_delay_ms, initial_delay_ms * multiplier^(attempt_no - 1))`.
pub fn compute_backoff_ms(policy: &RetryPolicy, attempt_no: u32, rand: f64) -> u64 {
    let exponent = attempt_no.saturating_sub(1);
    let base = policy.initial_delay_ms as f64 * policy.multiplier.powi(exponent as i32);
    let bounded = (policy.max_delay_ms as f64).min(base);

    if policy.jitter <= 0.0 {
        return bounded.floor() as u64;
    }

    let jittered = bounded * (1.0 - policy.jitter + rand * 2.0 * policy.jitter);
    jittered.floor().max(0.0) as u64
}

/// Draw a jittered backoff for the given attempt.
pub fn backoff_delay_ms(policy: &RetryPolicy, attempt_no: u32) -> u64 {
    use rand::Rng;

    let rand = rand::thread_rng().gen::<f64>();
    compute_backoff_ms(policy, attempt_no, rand)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial: u64, max: u64, multiplier: f64, jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: initial,
            max_delay_ms: max,
            multiplier,
            jitter,
            retry_on_409: false,
        }
    }

    #[test]
    fn timeout_wins_over_everything() {
        let decision = is_transient_failure(true, true, Some(400), false);
        assert!(decision.retryable);
        assert_eq!(decision.reason, FailureReason::Timeout);
    }

    #[test]
    fn network_error_is_transient() {
        let decision = is_transient_failure(false, true, None, false);
        assert!(decision.retryable);
        assert_eq!(decision.reason, FailureReason::NetworkError);
    }

    #[test]
    fn server_errors_are_transient() {
        for code in [500, 502, 503, 599] {
            let decision = is_transient_failure(false, false, Some(code), false);
            assert!(decision.retryable, "HTTP {code} should be retryable");
            assert_eq!(decision.reason, FailureReason::ServerError);
        }
    }

    #[test]
    fn conflict_is_opt_in() {
        let off = is_transient_failure(false, false, Some(409), false);
        assert!(!off.retryable);
        assert_eq!(off.reason, FailureReason::ClientError);

        let on = is_transient_failure(false, false, Some(409), true);
        assert!(on.retryable);
        assert_eq!(on.reason, FailureReason::ConflictRetryEnabled);
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400, 401, 404, 422, 499] {
            let decision = is_transient_failure(false, false, Some(code), true);
            assert!(!decision.retryable, "HTTP {code} should be permanent");
            assert_eq!(decision.reason, FailureReason::ClientError);
        }
    }

    #[test]
    fn no_signal_is_unknown() {
        let decision = is_transient_failure(false, false, None, false);
        assert!(!decision.retryable);
        assert_eq!(decision.reason, FailureReason::Unknown);
    }

    #[test]
    fn backoff_without_jitter_is_deterministic() {
        let p = policy(100, 10_000, 2.0, 0.0);
        assert_eq!(compute_backoff_ms(&p, 1, 0.99), 100);
        assert_eq!(compute_backoff_ms(&p, 2, 0.0), 200);
        assert_eq!(compute_backoff_ms(&p, 3, 0.5), 400);
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let p = policy(1_000, 2_500, 3.0, 0.0);
        assert_eq!(compute_backoff_ms(&p, 1, 0.0), 1_000);
        assert_eq!(compute_backoff_ms(&p, 2, 0.0), 2_500);
        assert_eq!(compute_backoff_ms(&p, 10, 0.0), 2_500);
    }

    #[test]
    fn jitter_stays_inside_the_window() {
        let p = policy(500, 60_000, 2.0, 0.3);
        for attempt_no in 1..=6u32 {
            let base = 500.0 * 2.0f64.powi(attempt_no as i32 - 1);
            let bounded = base.min(60_000.0);
            for rand in [0.0, 0.1, 0.25, 0.5, 0.75, 0.9999] {
                let delay = compute_backoff_ms(&p, attempt_no, rand) as f64;
                assert!(
                    delay >= (bounded * 0.7).floor(),
                    "attempt {attempt_no} rand {rand}: {delay} below window"
                );
                assert!(
                    delay < bounded * 1.3,
                    "attempt {attempt_no} rand {rand}: {delay} above window"
                );
            }
        }
    }

    #[test]
    fn zero_initial_delay_stays_zero() {
        let p = policy(0, 1_000, 2.0, 0.5);
        assert_eq!(compute_backoff_ms(&p, 1, 0.9), 0);
        assert_eq!(compute_backoff_ms(&p, 4, 0.1), 0);
    }

    #[test]
    fn drawn_backoff_respects_bounds() {
        let p = policy(200, 5_000, 2.0, 0.2);
        for attempt_no in 1..=4u32 {
            let base = 200.0 * 2.0f64.powi(attempt_no as i32 - 1);
            let bounded = base.min(5_000.0);
            for _ in 0..50 {
                let delay = backoff_delay_ms(&p, attempt_no) as f64;
                assert!(delay >= (bounded * 0.8).floor());
                assert!(delay < bounded * 1.2);
            }
        }
    }
}
