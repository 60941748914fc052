//! Retry-on-conflict loop for optimistic writes.

use std::future::Future;

use mlplane_reconcile::{Clock, RetryPolicy};
use thiserror::Error;
use tracing::debug;

use crate::store::StoreError;

/// Why a retried write gave up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    /// Every attempt hit a conflict, or the deadline passed.
    #[error("gave up after {attempts} conflicting attempts: {last}")]
    Exhausted { attempts: u32, last: StoreError },

    /// A non-conflict error; not retried.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// policy's attempt count or deadline runs out.
///
/// Each attempt must re-read the object it writes; the loop itself keeps no
/// state between attempts besides the count. Waits and the deadline go
/// through `clock`.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let started = clock.now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() => {
                let elapsed = clock.now().saturating_duration_since(started);
                if !policy.allows(attempts, elapsed) {
                    return Err(RetryError::Exhausted {
                        attempts,
                        last: err,
                    });
                }
                let delay = policy.backoff.delay(attempts - 1);
                debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "write conflict, retrying");
                clock.sleep(delay).await;
            }
            Err(err) => return Err(RetryError::Store(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use mlplane_id::ResourceName;
    use mlplane_reconcile::BackoffPolicy;
    use mlplane_testing::ManualClock;

    use super::*;

    fn conflict() -> StoreError {
        StoreError::Conflict {
            name: ResourceName::parse("m").unwrap(),
            expected: 1,
            actual: 2,
        }
    }

    fn fixed_policy(max_attempts: u32, deadline: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                multiplier: 1.0,
                max: Duration::from_secs(1),
                jitter: 0.0,
            },
            deadline,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_conflicts() {
        let clock = ManualClock::new();
        let calls = AtomicU32::new(0);
        let policy = fixed_policy(5, Duration::from_secs(5));

        let result = retry_on_conflict(&policy, &clock, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(10); 2]);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let clock = ManualClock::new();
        let policy = fixed_policy(3, Duration::from_secs(5));

        let result: Result<(), _> =
            retry_on_conflict(&policy, &clock, || async { Err(conflict()) }).await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: conflict()
            })
        );
        assert_eq!(clock.sleeps().len(), 2);
    }

    #[tokio::test]
    async fn test_deadline_stops_retries() {
        let clock = ManualClock::new();
        let policy = fixed_policy(100, Duration::from_millis(25));

        let result: Result<(), _> =
            retry_on_conflict(&policy, &clock, || async { Err(conflict()) }).await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
        assert!(clock.elapsed() <= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_non_conflict_not_retried() {
        let clock = ManualClock::new();
        let policy = RetryPolicy::default();
        let missing = StoreError::NotFound(ResourceName::parse("m").unwrap());

        let result: Result<(), _> =
            retry_on_conflict(&policy, &clock, || async { Err(missing.clone()) }).await;

        assert_eq!(result, Err(RetryError::Store(missing.clone())));
        assert!(clock.sleeps().is_empty());
    }
}
