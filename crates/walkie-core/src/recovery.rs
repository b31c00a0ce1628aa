//! Retry with exponential backoff
//!
//! The connection supervisor re-establishes a dropped signaling link with
//! [`retry_with_backoff`]. Only errors that report
//! [`WalkieError::is_recoverable`] are retried; anything else fails fast.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::{WalkieError, WalkieResult};

/// Backoff settings
///
/// ```rust
/// use walkie_core::recovery::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::default();
/// assert_eq!(config.max_attempts, 3);
/// assert_eq!(config.initial_delay, Duration::from_millis(100));
/// assert!(config.use_jitter);
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay between the first and second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Growth factor applied to the delay after each failure
    pub backoff_multiplier: f64,
    /// Whether to add +/-10% jitter to delays
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the attempt numbered `attempt` (1-based) fails
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exp);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// [`delay_after`](Self::delay_after), spread by up to 10% either way
    /// when jitter is on
    fn sleep_after(&self, attempt: u32) -> Duration {
        let base = self.delay_after(attempt);
        if !self.use_jitter {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        base.mul_f64(factor)
    }
}

/// Run `operation` until it succeeds, fails with a non-recoverable error, or
/// runs out of attempts
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    config: RetryConfig,
    mut operation: F,
) -> WalkieResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WalkieResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        debug!(operation = operation_name, attempt, of = config.max_attempts, "Trying");

        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Succeeded on retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_recoverable() {
            error!(
                operation = operation_name,
                error = %err,
                category = err.category(),
                "Giving up, error is not recoverable"
            );
            return Err(err);
        }
        if attempt >= config.max_attempts {
            error!(
                operation = operation_name,
                attempts = attempt,
                error = %err,
                "Giving up, attempts exhausted"
            );
            return Err(err);
        }

        let delay = config.sleep_after(attempt);
        warn!(
            operation = operation_name,
            attempt,
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "Attempt failed, backing off"
        );
        sleep(delay).await;
    }
}

/// Retry a synchronous fallible call with backoff
pub async fn retry_sync_with_backoff<T, F>(
    operation_name: &str,
    config: RetryConfig,
    mut operation: F,
) -> WalkieResult<T>
where
    F: FnMut() -> Result<T, WalkieError>,
{
    retry_with_backoff(operation_name, config, || {
        let result = operation();
        async move { result }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            use_jitter: false,
        };
        assert_eq!(config.delay_after(1), Duration::from_millis(100));
        assert_eq!(config.delay_after(2), Duration::from_millis(200));
        assert_eq!(config.delay_after(3), Duration::from_millis(400));
        assert_eq!(config.delay_after(4), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            use_jitter: true,
            ..fast()
        };
        for _ in 0..50 {
            let delay = config.sleep_after(1);
            assert!(delay >= Duration::from_millis(900) && delay <= Duration::from_millis(1100));
        }
    }

    #[tokio::test]
    async fn test_recoverable_error_is_retried_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff("reconnect", fast(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(WalkieError::disconnected("socket closed"))
                } else {
                    Ok("open")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "open");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_recoverable_error_fails_fast() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: WalkieResult<()> = retry_sync_with_backoff("answer", fast(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(WalkieError::permission_denied("blocked"))
        })
        .await;

        assert!(matches!(result, Err(WalkieError::PermissionDenied { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: WalkieResult<()> = retry_sync_with_backoff("reconnect", fast(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(WalkieError::disconnected("broker down"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
