// Retry utilities

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// `base * 2^attempt`, saturating instead of overflowing.
pub fn exponential_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt.min(31)))
}

/// Run `operation` until it succeeds or `max_retries` attempts have failed,
/// sleeping `base * 2^attempt` (capped at `max_delay`) between attempts.
pub async fn with_retry<F, Fut, T, E>(
    mut operation: F,
    max_retries: u32,
    base: Duration,
    max_delay: Duration,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if attempt >= max_retries {
                    return Err(error);
                }

                let delay = exponential_delay(base, attempt).min(max_delay);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Retrying operation");
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delay() {
        let base = Duration::from_millis(100);
        assert_eq!(exponential_delay(base, 0), Duration::from_millis(100));
        assert_eq!(exponential_delay(base, 3), Duration::from_millis(800));
        assert!(exponential_delay(base, 200) >= exponential_delay(base, 31));
    }

    #[test]
    fn test_with_retry_returns_first_success() {
        let result: Result<u32, String> = tokio_test::block_on(with_retry(
            || async { Ok(7) },
            3,
            Duration::from_millis(50),
            Duration::from_secs(2),
        ));
        assert_eq!(tokio_test::assert_ok!(result), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("attempt {} failed", n))
                    } else {
                        Ok(n)
                    }
                }
            },
            5,
            Duration::from_millis(50),
            Duration::from_secs(2),
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            },
            3,
            Duration::from_millis(50),
            Duration::from_secs(2),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
