//! Capped exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{GatewayError, Result};

/// Backoff bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Delay sequence for consecutive failures: `base`, `2 * base`, ... up to `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            base: policy.base,
            max: policy.max,
            current: policy.base.min(policy.max),
        }
    }

    /// Delay to sleep after the current failure.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base.min(self.max);
    }
}

/// Run `attempt` until it succeeds, sleeping with backoff between failures.
///
/// The sleep is abandoned as soon as `shutdown` fires, in which case
/// [`GatewayError::Shutdown`] is returned.
///
/// # Errors
///
/// Only [`GatewayError::Shutdown`]; attempt errors are logged and retried.
pub async fn retry<T, F, Fut>(
    policy: BackoffPolicy,
    shutdown: &CancellationToken,
    what: &str,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::new(policy);
    loop {
        if shutdown.is_cancelled() {
            return Err(GatewayError::Shutdown);
        }
        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let delay = backoff.next_delay();
        warn!(operation = what, error = %err, retry_in = ?delay, "attempt failed, retrying");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shutdown.cancelled() => return Err(GatewayError::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_doubles_until_cap() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_never_exceeds_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(7),
            max: Duration::from_millis(1000),
        };
        let mut backoff = Backoff::new(policy);
        let mut previous = Duration::ZERO;

        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay <= policy.max);
            if previous > Duration::ZERO && previous * 2 <= policy.max {
                assert_eq!(delay, previous * 2);
            }
            previous = delay;
        }
        assert_eq!(previous, policy.max);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_huge_base_saturates() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::MAX,
            max: Duration::MAX,
        });
        assert_eq!(backoff.next_delay(), Duration::MAX);
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sleeps_with_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let counter = Arc::clone(&attempts);
        let value = retry(BackoffPolicy::default(), &shutdown, "test", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(GatewayError::ConnectionClosed)
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let result: Result<()> = retry(BackoffPolicy::default(), &shutdown, "test", || async {
            Err(GatewayError::ConnectionClosed)
        })
        .await;

        assert!(matches!(result, Err(GatewayError::Shutdown)));
    }
}
