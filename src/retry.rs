use crate::config::RetryPolicy;
use crate::error::{EngineError, EngineResult};
use std::future::Future;
use std::time::Duration;

/// Retries a storage write using the backoff schedule of `$policy`. Every
/// write it wraps is keyed, so repeating one is safe.
macro_rules! retry_db_operation {
    ($context:expr, $policy:expr, $operation:expr) => {{
        let policy: &$crate::config::RetryPolicy = $policy;
        let max_attempts = policy.max_attempts.max(1);
        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= max_attempts => break Err(err),
                Err(err) => {
                    let delay = $crate::retry::backoff_delay(policy, attempt);
                    log::warn!(
                        "Attempt {}/{} for {} failed: {}. Retrying in {}ms.",
                        attempt,
                        max_attempts,
                        context_value,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_db_operation;

/// Exponential delay before retry number `attempt` (1-based), capped at
/// `max_delay_ms` and spread by +/-25% jitter.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    let delay_ms = policy
        .base_delay_ms
        .saturating_mul(2_u64.pow(exponent))
        .min(policy.max_delay_ms);
    let jitter_range = (delay_ms as f64 * 0.25) as u64;
    let jitter = fastrand::u64(0..=jitter_range * 2);
    Duration::from_millis(delay_ms.saturating_sub(jitter_range).saturating_add(jitter))
}

/// Runs a provider call with bounded exponential backoff. Data errors are
/// returned at once; transport errors are retried and, once attempts run
/// out, reported as [`EngineError::ProviderUnavailable`].
pub async fn retry_with_backoff<F, Fut, T>(
    context: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= max_attempts => {
                let message = match err {
                    EngineError::ProviderUnavailable { message, .. } => message,
                    other => other.to_string(),
                };
                return Err(EngineError::ProviderUnavailable {
                    context: context.to_string(),
                    attempts: attempt,
                    message,
                });
            }
            Err(err) => {
                let delay = backoff_delay(policy, attempt);
                log::debug!(
                    "Attempt {}/{} for {} failed: {}. Retrying in {}ms",
                    attempt,
                    max_attempts,
                    context,
                    err,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    fn outage() -> EngineError {
        EngineError::ProviderUnavailable {
            context: "bars".to_string(),
            attempts: 1,
            message: "connection refused".to_string(),
        }
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 4000,
        };
        let first = backoff_delay(&policy, 1).as_millis();
        assert!((750..=1250).contains(&first));
        let late = backoff_delay(&policy, 10).as_millis();
        assert!((3000..=5000).contains(&late));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("bars for AAA", &fast_policy(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(outage())
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: EngineResult<()> = retry_with_backoff("bars for AAA", &fast_policy(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::Storage("timeout".to_string()))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(EngineError::ProviderUnavailable {
                context, attempts, ..
            }) => {
                assert_eq!(context, "bars for AAA");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_data_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let result: EngineResult<()> = retry_with_backoff("bars for AAA", &fast_policy(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::CorruptBar {
                symbol: "AAA".to_string(),
                date,
                field: "close",
            })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(EngineError::CorruptBar { .. })));
    }

    #[tokio::test]
    async fn test_db_macro_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = fast_policy(3);
        let result: Result<u32, EngineError> = retry_db_operation!("upsert", &policy, async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::Storage("deadlock".to_string()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
