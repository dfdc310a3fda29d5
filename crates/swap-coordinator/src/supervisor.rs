//! Retry/timeout supervisor.
//!
//! [`run_with_timeout`] runs one operation under a [`RetryPolicy`]: every
//! attempt races a deadline, failures are classified, retryable failures are
//! retried after the policy's delay until attempts run out. The caller
//! observes each cycle through [`SupervisorHooks`] and can stop the run at
//! any suspension point with a `CancellationToken`.
//!
//! When the deadline wins, the attempt future is dropped. Its eventual
//! settlement therefore never reaches the caller.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use swap_core::policy::RetryPolicy;
use swap_core::{classify, ErrorClassification, RemoteError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub error: RemoteError,
    pub classification: ErrorClassification,
}

#[derive(Debug, Clone)]
pub struct RunOutcome<T> {
    pub data: Option<T>,
    /// Failure of the last attempt, when the run did not succeed.
    pub error: Option<AttemptFailure>,
    /// The last attempt lost the race against its deadline.
    pub timed_out: bool,
    pub attempts: u32,
    pub total_duration: Duration,
    /// The run was stopped through its cancellation token.
    pub cancelled: bool,
}

impl<T> RunOutcome<T> {
    pub fn success(&self) -> bool {
        self.data.is_some()
    }
}

/// Per-cycle callbacks. All default to no-ops.
///
/// `attempt` is 1-based and `total` is the policy's `max_attempts`.
#[async_trait]
pub trait SupervisorHooks: Send + Sync {
    async fn on_timeout(&self, _attempt: u32, _total: u32) {}

    /// Called after every failed attempt, including the last one.
    async fn on_failure(
        &self,
        _attempt: u32,
        _total: u32,
        _failure: &AttemptFailure,
        _will_retry: bool,
    ) {
    }

    /// Called once the retry delay has elapsed, just before attempt `attempt` starts.
    async fn on_retry(&self, _attempt: u32, _total: u32) {}
}

impl SupervisorHooks for () {}

pub async fn run_with_timeout<T, F, Fut, H>(
    mut operation: F,
    policy: &RetryPolicy,
    hooks: &H,
    cancel: &CancellationToken,
) -> RunOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
    H: SupervisorHooks + ?Sized,
{
    let started = Instant::now();
    let total = policy.max_attempts;
    let mut attempt = 1;
    let mut last: Option<(AttemptFailure, bool)> = None;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return finish(started, attempt, None, last, true);
            }
            r = tokio::time::timeout(policy.timeout, operation(attempt)) => r,
        };

        let (error, timed_out) = match result {
            Ok(Ok(data)) => return finish(started, attempt, Some(data), None, false),
            Ok(Err(e)) => (e, false),
            Err(_) => {
                debug!(attempt, total, timeout_ms = policy.timeout.as_millis() as u64, "attempt timed out");
                hooks.on_timeout(attempt, total).await;
                (RemoteError::timed_out(policy.timeout.as_millis() as u64), true)
            }
        };

        let failure = AttemptFailure {
            classification: classify(&error),
            error,
        };
        let will_retry =
            failure.classification.is_retryable && policy.has_attempts_left(attempt);
        hooks.on_failure(attempt, total, &failure, will_retry).await;

        if !will_retry {
            return finish(started, attempt, None, Some((failure, timed_out)), false);
        }
        last = Some((failure, timed_out));

        let delay = policy.delay_for(attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return finish(started, attempt, None, last, true);
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        hooks.on_retry(attempt, total).await;
    }
}

fn finish<T>(
    started: Instant,
    attempts: u32,
    data: Option<T>,
    failure: Option<(AttemptFailure, bool)>,
    cancelled: bool,
) -> RunOutcome<T> {
    let (error, timed_out) = match failure {
        Some((f, t)) => (Some(f), t),
        None => (None, false),
    };
    RunOutcome {
        data,
        error,
        timed_out,
        attempts,
        total_duration: started.elapsed(),
        cancelled,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use swap_core::policy::Backoff;
    use swap_core::ErrorCategory;
    use tokio::sync::Mutex;

    fn policy(max: u32, timeout_ms: u64) -> RetryPolicy {
        RetryPolicy::new(
            max,
            Duration::from_millis(timeout_ms),
            Backoff::Fixed(Duration::from_secs(2)),
        )
    }

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SupervisorHooks for Recorder {
        async fn on_timeout(&self, attempt: u32, total: u32) {
            self.log.lock().await.push(format!("timeout {attempt}/{total}"));
        }
        async fn on_failure(&self, attempt: u32, total: u32, f: &AttemptFailure, will_retry: bool) {
            self.log.lock().await.push(format!(
                "failure {attempt}/{total} {} retry={will_retry}",
                f.classification.category
            ));
        }
        async fn on_retry(&self, attempt: u32, total: u32) {
            self.log.lock().await.push(format!("retry {attempt}/{total}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success() {
        let outcome = run_with_timeout(
            |_| async { Ok::<_, RemoteError>(7) },
            &policy(3, 1000),
            &(),
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.success());
        assert_eq!(outcome.data, Some(7));
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_network_failures_with_fixed_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let hooks = Recorder::default();
        let c = calls.clone();
        let outcome = run_with_timeout(
            move |attempt| {
                c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(RemoteError::new("Network request failed"))
                    } else {
                        Ok(())
                    }
                }
            },
            &policy(3, 30_000),
            &hooks,
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(outcome.total_duration >= Duration::from_secs(4));
        assert!(outcome.total_duration < Duration::from_millis(4_100));
        assert_eq!(
            *hooks.log.lock().await,
            vec![
                "failure 1/3 network retry=true",
                "retry 2/3",
                "failure 2/3 network retry=true",
                "retry 3/3",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hang_times_out_then_exhausts() {
        let hooks = Recorder::default();
        let outcome = run_with_timeout(
            |_| std::future::pending::<Result<(), RemoteError>>(),
            &policy(2, 45_000),
            &hooks,
            &CancellationToken::new(),
        )
        .await;

        assert!(!outcome.success());
        assert!(outcome.timed_out);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(
            outcome.error.unwrap().classification.category,
            ErrorCategory::Timeout
        );
        // 45s + 2s delay + 45s
        assert!(outcome.total_duration >= Duration::from_secs(92));
        assert!(outcome.total_duration < Duration::from_millis(92_100));
        let log = hooks.log.lock().await;
        assert_eq!(log[0], "timeout 1/2");
        assert_eq!(log.last().unwrap(), "failure 2/2 timeout retry=false");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_stops_immediately() {
        let outcome = run_with_timeout(
            |_| async { Err::<(), _>(RemoteError::new("403 Forbidden")) },
            &policy(3, 1000),
            &(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.error.unwrap().classification.category,
            ErrorCategory::Permission
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_settlement_after_deadline_is_dropped() {
        let settled = Arc::new(AtomicU32::new(0));
        let s = settled.clone();
        let outcome = run_with_timeout(
            move |_| {
                let s = s.clone();
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    s.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, RemoteError>(())
                }
            },
            &policy(1, 5_000),
            &(),
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.timed_out);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(settled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_retry_delay() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            trigger.cancel();
        });
        let outcome = run_with_timeout(
            |_| async { Err::<(), _>(RemoteError::new("connection reset")) },
            &policy(3, 1000),
            &(),
            &cancel,
        )
        .await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(
            outcome.error.unwrap().classification.category,
            ErrorCategory::Network
        );
    }
}
