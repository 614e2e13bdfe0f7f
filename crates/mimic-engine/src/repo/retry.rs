//! Fixed-delay retry for transient infrastructure failures.
//!
//! Only transient errors (`StoreUnavailable`, `CacheUnavailable`) are
//! retried; validation, uniqueness and not-found outcomes return
//! immediately. Caller cancellation aborts pending delays, since dropping
//! the returned future drops the sleep with it.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::error::Result;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Run `op` up to `policy.attempts` times, sleeping `policy.delay` between
/// attempts. A zero attempt count still runs once.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                debug!(attempt, error = %e, "transient failure, retrying");
                sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::error::EngineError;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let value = retry(policy, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EngineError::StoreUnavailable("flaky".into()))
            } else {
                Ok(99)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_failure() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let err = retry(policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(EngineError::CacheUnavailable("down".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::CacheUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let err = retry(policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(EngineError::Validation("bad".into()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::from_millis(1));

        retry(policy, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
