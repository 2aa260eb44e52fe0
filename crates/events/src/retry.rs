//! Redelivery policy and the per-message delivery loop.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use pulse_core::{AppError, ErrorCode};

use crate::{Delivery, EventHandler, HandlerError};

/// Backoff strategy for redeliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay between every attempt
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

/// Redelivery budget and backoff.
///
/// `max_attempts` counts every delivery including the first, so `1` means
/// "never redeliver". Zero is treated as one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Deliver once; failures go straight to the dead-letter path.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed), unseeded.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, "")
    }

    /// Delay after failed attempt `attempt`, with jitter keyed on `seed`.
    ///
    /// Deliveries with different seeds (consumer and event) spread out
    /// within `delay * (1 ± jitter)`; the same seed always gets the same
    /// delay for the same attempt.
    pub fn delay_for(&self, attempt: u32, seed: &str) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let mut hasher = DefaultHasher::new();
            seed.hash(&mut hasher);
            attempt.hash(&mut hasher);
            let pseudo_random = (hasher.finish() % 10_000) as f64 / 10_000.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another delivery may follow failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Everything a bus needs to drive one consumer's deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryPolicy {
    pub retry: RetryPolicy,
    /// Upper bound on a single handler invocation. Elapsing counts as a
    /// transient failure; any ledger claim made by the handler stands.
    pub handler_timeout: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryPolicy {
    pub fn new(retry: RetryPolicy, handler_timeout: Duration) -> Self {
        Self {
            retry,
            handler_timeout,
        }
    }
}

/// Final result of driving one message through a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked { attempts: u32 },
    DeadLettered { attempts: u32, reason: String },
}

impl DeliveryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Acked { attempts } | DeliveryOutcome::DeadLettered { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Run one handler invocation under the policy's deadline.
pub async fn attempt_once(
    handler: &dyn EventHandler,
    delivery: &Delivery,
    policy: &DeliveryPolicy,
) -> Result<(), HandlerError> {
    match tokio::time::timeout(policy.handler_timeout, handler.handle(delivery)).await {
        Ok(result) => result,
        Err(_) => Err(HandlerError::Transient(AppError::new(
            ErrorCode::UnknownError,
            format!(
                "handler {} timed out after {:?}",
                handler.name(),
                policy.handler_timeout
            ),
        ))),
    }
}

/// Drive `delivery` until it is acknowledged or dead-lettered.
///
/// Transient failures (including timeouts) are retried with backoff while
/// the budget allows; terminal failures stop immediately.
pub async fn deliver(
    handler: &dyn EventHandler,
    delivery: Delivery,
    policy: &DeliveryPolicy,
) -> DeliveryOutcome {
    let mut delivery = delivery;
    loop {
        let attempt = delivery.attempt;
        match attempt_once(handler, &delivery, policy).await {
            Ok(()) => {
                debug!(
                    consumer = handler.name(),
                    topic = %delivery.topic,
                    event_id = %delivery.envelope.id(),
                    attempt,
                    "delivery acknowledged"
                );
                return DeliveryOutcome::Acked { attempts: attempt };
            }
            Err(HandlerError::Terminal(e)) => {
                return DeliveryOutcome::DeadLettered {
                    attempts: attempt,
                    reason: e.to_string(),
                };
            }
            Err(HandlerError::Transient(e)) => {
                if !policy.retry.should_retry(attempt) {
                    return DeliveryOutcome::DeadLettered {
                        attempts: attempt,
                        reason: e.to_string(),
                    };
                }
                let seed = format!("{}:{}", handler.name(), delivery.envelope.id());
                let backoff = policy.retry.delay_for(attempt, &seed);
                warn!(
                    consumer = handler.name(),
                    topic = %delivery.topic,
                    event_id = %delivery.envelope.id(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "delivery failed, redelivering"
                );
                tokio::time::sleep(backoff).await;
                delivery = delivery.next_attempt();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventEnvelope, handler_fn};
    use pulse_core::TenantId;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn delivery() -> Delivery {
        let envelope = EventEnvelope::new(
            "employee.created",
            1,
            "directory",
            TenantId::parse("t1").unwrap(),
            json!({}),
        );
        Delivery::new("employee.created", Arc::new(envelope))
    }

    fn fast_policy(max_attempts: u32) -> DeliveryPolicy {
        DeliveryPolicy::new(
            RetryPolicy::fixed(max_attempts, Duration::from_millis(1)),
            Duration::from_millis(200),
        )
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1))
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(1));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            ..RetryPolicy::exponential(5, Duration::from_millis(10), Duration::from_millis(25))
        };
        assert_eq!(linear.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(25));

        let fixed = RetryPolicy::fixed(3, Duration::from_millis(7));
        assert_eq!(fixed.delay_for_attempt(1), fixed.delay_for_attempt(3));
    }

    #[test]
    fn jitter_is_keyed_per_delivery() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::fixed(5, Duration::from_millis(1_000))
        };

        let delays: std::collections::HashSet<_> = (0..20)
            .map(|n| policy.delay_for(1, &format!("mailer:evt-{n}")))
            .collect();
        assert!(delays.len() > 1, "jitter should spread redeliveries");
        for delay in &delays {
            assert!(*delay >= Duration::from_millis(500));
            assert!(*delay <= Duration::from_millis(1_500));
        }

        assert_eq!(
            policy.delay_for(2, "mailer:evt-1"),
            policy.delay_for(2, "mailer:evt-1")
        );
    }

    #[test]
    fn max_attempts_counts_the_first_delivery() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        assert!(!RetryPolicy::no_retry().should_retry(1));
        assert!(!RetryPolicy::fixed(0, Duration::ZERO).should_retry(1));
    }

    #[test]
    fn strategies_parse_from_config_strings() {
        assert_eq!("Linear".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Linear));
        assert!("random".parse::<BackoffStrategy>().is_err());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_acked() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let handler = handler_fn("flaky", move |_d: Delivery| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(HandlerError::from(AppError::new(
                        ErrorCode::LedgerUnavailable,
                        "down",
                    )));
                }
                Ok(())
            }
        });

        let outcome = deliver(handler.as_ref(), delivery(), &fast_policy(5)).await;
        assert_eq!(outcome, DeliveryOutcome::Acked { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters() {
        let handler = handler_fn("broken", |_d: Delivery| async {
            Err::<(), _>(HandlerError::from(AppError::new(
                ErrorCode::LedgerUnavailable,
                "down",
            )))
        });

        let outcome = deliver(handler.as_ref(), delivery(), &fast_policy(3)).await;
        match outcome {
            DeliveryOutcome::DeadLettered { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("down"));
            }
            other => panic!("expected dead letter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_failures_skip_retries() {
        let handler = handler_fn("strict", |_d: Delivery| async {
            Err::<(), _>(HandlerError::Terminal(AppError::invalid_event("bad payload")))
        });

        let outcome = deliver(handler.as_ref(), delivery(), &fast_policy(5)).await;
        assert_eq!(outcome.attempts(), 1);
        assert!(matches!(outcome, DeliveryOutcome::DeadLettered { .. }));
    }

    #[tokio::test]
    async fn handler_timeouts_count_as_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let handler = handler_fn("slow", move |_d: Delivery| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<(), HandlerError>(())
            }
        });
        let policy = DeliveryPolicy::new(
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            Duration::from_millis(20),
        );

        let outcome = deliver(handler.as_ref(), delivery(), &policy).await;
        assert_eq!(outcome, DeliveryOutcome::Acked { attempts: 2 });
    }
}
