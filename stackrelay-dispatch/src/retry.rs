//! Retry decisions for failed upstream calls

use stackrelay_core::{DispatchError, RelayError, RetryConfig, TransportMode, UpstreamError};
use std::time::Duration;

/// What the dispatcher should do with a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Re-enqueue at the same priority after `delay` (jitter added by the
    /// caller), with the attempt counter incremented.
    Retry { delay: Duration },
    /// Re-enqueue immediately under the fallback transport. Counted as a
    /// mode switch, not an attempt.
    SwitchMode,
    /// Resolve every waiter with this terminal error.
    Fail { error: RelayError },
}

/// Pure retry policy: no I/O, no clock, no randomness.
///
/// `attempt` is the zero-based index of the attempt that just failed, so a
/// cap of 3 allows up to three retries after the initial call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide what to do about a failed attempt.
    pub fn decide(
        &self,
        error: &RelayError,
        attempt: u32,
        mode: TransportMode,
        mode_switched: bool,
    ) -> Decision {
        let upstream = match error {
            RelayError::Upstream(upstream) => upstream,
            // Validation failures and internal errors are terminal as-is.
            _ => {
                return Decision::Fail {
                    error: error.clone(),
                }
            }
        };

        match upstream {
            UpstreamError::RateLimited { backoff, .. } => {
                if mode == TransportMode::Authenticated && !mode_switched {
                    // The anonymous quota may still have headroom; switching
                    // is cheaper than waiting out the window.
                    return Decision::SwitchMode;
                }
                self.retry_or_exhaust(upstream, attempt, *backoff)
            }
            UpstreamError::Server { .. }
            | UpstreamError::Network { .. }
            | UpstreamError::Timeout { .. } => self.retry_or_exhaust(upstream, attempt, None),
            UpstreamError::InvalidResponse { .. } => Decision::Fail {
                error: error.clone(),
            },
        }
    }

    /// Deterministic backoff for a given attempt: `base * multiplier^n`,
    /// capped. Jitter is layered on by the dispatcher.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_backoff.as_secs_f64();
        let grown = base * self.config.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(grown.min(self.config.max_backoff.as_secs_f64()))
    }

    fn retry_or_exhaust(
        &self,
        upstream: &UpstreamError,
        attempt: u32,
        delay_floor: Option<Duration>,
    ) -> Decision {
        if attempt < self.config.max_attempts {
            let delay = self.backoff_delay(attempt);
            let delay = delay_floor.map_or(delay, |floor| delay.max(floor));
            Decision::Retry { delay }
        } else {
            Decision::Fail {
                error: DispatchError::ExhaustedRetries {
                    attempts: attempt + 1,
                    source: Box::new(upstream.clone()),
                }
                .into(),
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use stackrelay_core::ValidationError;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default())
    }

    fn network_error() -> RelayError {
        UpstreamError::Network {
            reason: "connection reset".to_string(),
        }
        .into()
    }

    #[test]
    fn test_backoff_grows_exponentially_then_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
        });

        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_transient_errors_retry_until_cap() {
        let policy = policy();
        let error = network_error();

        for attempt in 0..3 {
            let decision =
                policy.decide(&error, attempt, TransportMode::Unauthenticated, false);
            assert!(matches!(decision, Decision::Retry { .. }), "attempt {attempt}");
        }

        let decision = policy.decide(&error, 3, TransportMode::Unauthenticated, false);
        match decision {
            Decision::Fail { error } => {
                assert!(matches!(
                    error,
                    RelayError::Dispatch(DispatchError::ExhaustedRetries { attempts: 4, .. })
                ));
            }
            other => panic!("expected terminal failure, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_delays_are_non_decreasing() {
        let policy = policy();
        let error = network_error();
        let mut last = Duration::ZERO;

        for attempt in 0..3 {
            match policy.decide(&error, attempt, TransportMode::Unauthenticated, false) {
                Decision::Retry { delay } => {
                    assert!(delay >= last);
                    last = delay;
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_rate_limit_on_authenticated_switches_mode() {
        let policy = policy();
        let error: RelayError = UpstreamError::RateLimited {
            mode: TransportMode::Authenticated,
            backoff: Some(Duration::from_secs(60)),
        }
        .into();

        let decision = policy.decide(&error, 0, TransportMode::Authenticated, false);
        assert_eq!(decision, Decision::SwitchMode);
    }

    #[test]
    fn test_rate_limit_after_switch_uses_attempt_budget() {
        let policy = policy();
        let error: RelayError = UpstreamError::RateLimited {
            mode: TransportMode::Unauthenticated,
            backoff: Some(Duration::from_secs(45)),
        }
        .into();

        // Already switched; the server backoff floors the retry delay.
        match policy.decide(&error, 0, TransportMode::Unauthenticated, true) {
            Decision::Retry { delay } => assert_eq!(delay, Duration::from_secs(45)),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_errors_are_never_retried() {
        let policy = policy();
        let error: RelayError = ValidationError::UpstreamRejected {
            status: 400,
            message: "bad parameter".to_string(),
        }
        .into();

        let decision = policy.decide(&error, 0, TransportMode::Authenticated, false);
        assert!(matches!(
            decision,
            Decision::Fail { error: RelayError::Validation(_) }
        ));
    }

    #[test]
    fn test_malformed_body_is_terminal() {
        let policy = policy();
        let error: RelayError = UpstreamError::InvalidResponse {
            reason: "truncated json".to_string(),
        }
        .into();

        assert!(matches!(
            policy.decide(&error, 0, TransportMode::Authenticated, false),
            Decision::Fail { .. }
        ));
    }
}
