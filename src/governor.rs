// ABOUTME: Bounded-retry wrapper shielding callers from upstream throttling
// ABOUTME: Transient faults back off in seconds; throttling gets a long cooldown

use std::future::Future;
use std::time::Duration;

use crate::config::SyncPolicy;
use crate::crm::{RetryClass, UpstreamError};

/// Wraps every upstream call in the policy's retry schedule.
///
/// Two failure classes get different treatment: transient faults sleep a
/// short doubling delay, the throttling signal sleeps the full cooldown.
/// Fatal classes (auth, permanent) escalate on the first occurrence. When
/// attempts run out the caller receives `Unavailable`, which the orchestrator
/// treats as run-aborting - a false "complete" report is worse than a failed
/// run.
pub struct Governor<'a> {
    policy: &'a SyncPolicy,
}

impl<'a> Governor<'a> {
    pub fn new(policy: &'a SyncPolicy) -> Self {
        Self { policy }
    }

    pub async fn run<F, Fut, T>(&self, what: &str, mut operation: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut delay = self.policy.retry_delay;
        let mut last: Option<UpstreamError> = None;

        for attempt in 1..=max_attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => match e.retry_class() {
                    RetryClass::Fatal => return Err(e),
                    RetryClass::Transient => {
                        if attempt < max_attempts {
                            tracing::warn!(
                                "{} failed (attempt {}/{}), retrying in {:?}: {}",
                                what,
                                attempt,
                                max_attempts,
                                delay,
                                e
                            );
                            tokio::time::sleep(delay).await;
                            delay *= 2;
                        }
                        last = Some(e);
                    }
                    RetryClass::Throttled => {
                        if attempt < max_attempts {
                            tracing::warn!(
                                "{} throttled (attempt {}/{}), cooling down for {:?}: {}",
                                what,
                                attempt,
                                max_attempts,
                                self.policy.throttle_cooldown,
                                e
                            );
                            tokio::time::sleep(self.policy.throttle_cooldown).await;
                        }
                        last = Some(e);
                    }
                },
            }
        }

        Err(UpstreamError::Unavailable {
            attempts: max_attempts,
            last: last
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("{} failed", what)),
        })
    }
}

/// Backoff schedule for a given policy, exposed for logging and tests.
pub fn transient_delays(policy: &SyncPolicy) -> Vec<Duration> {
    let mut delays = Vec::new();
    let mut delay = policy.retry_delay;
    for _ in 1..policy.max_attempts.max(1) {
        delays.push(delay);
        delay *= 2;
    }
    delays
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::time::Instant;

    fn test_policy() -> SyncPolicy {
        SyncPolicy {
            max_attempts: 4,
            retry_delay: Duration::from_secs(5),
            throttle_cooldown: Duration::from_secs(300),
            ..SyncPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_try_without_sleeping() {
        let policy = test_policy();
        let governor = Governor::new(&policy);
        let start = Instant::now();

        let result = governor
            .run("fetch", || async { Ok::<_, UpstreamError>(42) })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_waits_full_cooldown_each_attempt() {
        let policy = test_policy();
        let governor = Governor::new(&policy);
        let failures = Cell::new(2u32);
        let start = Instant::now();

        let result = governor
            .run("fetch", || async {
                if failures.get() > 0 {
                    failures.set(failures.get() - 1);
                    Err(UpstreamError::Throttled("too many requests".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        // Two throttled attempts, each preceded by the full cooldown
        assert!(start.elapsed() >= policy.throttle_cooldown * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_backoff_doubles() {
        let policy = test_policy();
        let governor = Governor::new(&policy);
        let failures = Cell::new(2u32);
        let start = Instant::now();

        let result = governor
            .run("fetch", || async {
                if failures.get() > 0 {
                    failures.set(failures.get() - 1);
                    Err(UpstreamError::Transient("502".into()))
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        // 5s + 10s
        assert!(start.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_unavailable() {
        let policy = test_policy();
        let governor = Governor::new(&policy);

        let result: Result<(), _> = governor
            .run("fetch", || async {
                Err(UpstreamError::Transient("down".into()))
            })
            .await;

        match result {
            Err(UpstreamError::Unavailable { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let policy = test_policy();
        let governor = Governor::new(&policy);
        let calls = Cell::new(0u32);
        let start = Instant::now();

        let result: Result<(), _> = governor
            .run("fetch", || async {
                calls.set(calls.get() + 1);
                Err(UpstreamError::Auth("invalid token".into()))
            })
            .await;

        assert!(matches!(result, Err(UpstreamError::Auth(_))));
        assert_eq!(calls.get(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_transient_delay_schedule() {
        let policy = test_policy();
        let delays = transient_delays(&policy);
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20)
            ]
        );
    }
}
