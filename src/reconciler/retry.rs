//! Retry with exponential backoff for transient remote failures.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ReconcileError, RemoteError};
use crate::remote::RemoteResult;

use super::cancel::CancelSignal;

/// Default maximum number of attempts per remote call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per remote call, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for computed delays.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

/// A remote call that did not succeed.
#[derive(Debug, Clone)]
pub struct RetryFailure {
    /// Last error returned by the remote system.
    pub error: RemoteError,
    /// Attempts made.
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default delays.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// A delay requested by the remote system wins over the computed one.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &RemoteError) -> Duration {
        if let Some(requested) = error.retry_after() {
            return requested;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_delay.as_secs_f64() * 1000.0 * factor)
            .min(self.max_delay.as_secs_f64() * 1000.0);
        Duration::from_secs_f64(millis.max(0.0) / 1000.0)
    }

    /// Runs `call` until it succeeds, fails permanently, runs out of
    /// attempts, or the run is cancelled.
    ///
    /// `call` receives the 1-based attempt number. Only transient errors are
    /// retried; cancellation stops further attempts but never interrupts one
    /// in progress.
    ///
    /// # Errors
    ///
    /// Returns the last error together with the number of attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancelSignal,
        mut call: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let error = match call(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{label} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !error.is_transient() || attempt >= max_attempts || cancel.is_cancelled() {
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                });
            }

            let delay = self.delay_for(attempt, &error);
            warn!(
                "{label} failed (attempt {attempt}/{max_attempts}): {error}; retrying in {}ms",
                delay.as_millis()
            );

            let mut waiter = cancel.clone();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = waiter.cancelled() => {
                    debug!("{label}: cancelled while waiting to retry");
                    return Err(RetryFailure { error, attempts: attempt });
                }
            }
            attempt += 1;
        }
    }
}

impl RetryFailure {
    /// Converts the failure into a reconcile error for a resource.
    #[must_use]
    pub fn into_error(self, resource: &str, operation: &str) -> ReconcileError {
        if self.error.is_transient() {
            ReconcileError::MaxRetriesExceeded {
                attempts: self.attempts,
                resource: resource.to_string(),
                last: self.error,
            }
        } else {
            ReconcileError::OperationFailed {
                resource: resource.to_string(),
                operation: operation.to_string(),
                source: self.error,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TerminalKind;
    use crate::reconciler::cancel_pair;
    use crate::remote::{MockRemoteOps, RemoteOps, RemoteRequest, RequestToken};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        let err = RemoteError::transient("timeout");
        assert_eq!(policy.delay_for(1, &err), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2, &err), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3, &err), Duration::from_secs(2));
        assert_eq!(policy.delay_for(20, &err), Duration::from_secs(30));
    }

    #[test]
    fn test_retry_after_wins() {
        let policy = RetryPolicy::default();
        let err = RemoteError::Transient {
            message: String::from("throttled"),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("read vm1", &CancelSignal::never(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(RemoteError::transient("timeout"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let failure = fast(2)
            .run("read vm1", &CancelSignal::never(), |_| async {
                Err::<(), _>(RemoteError::transient("timeout"))
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 2);
        let err = failure.into_error("vm1", "read");
        assert!(matches!(err, ReconcileError::MaxRetriesExceeded { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_terminal_errors_are_not_retried() {
        let mut remote = MockRemoteOps::new();
        remote
            .expect_delete()
            .times(1)
            .returning(|_, _| Err(RemoteError::terminal(TerminalKind::Authorization, "denied")));

        let request = RemoteRequest::new("virtual_machine", "vm1", RequestToken::generate());
        let failure = fast(5)
            .run("delete vm1", &CancelSignal::never(), |attempt| {
                let request = request.for_attempt(attempt);
                let remote = &remote;
                async move { remote.delete(&request, "/vms/1").await }
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert!(matches!(
            failure.into_error("vm1", "delete"),
            ReconcileError::OperationFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrying() {
        let (handle, signal) = cancel_pair();
        let calls = AtomicU32::new(0);
        let failure = fast(10)
            .run("update vm1", &signal, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                handle.cancel();
                async { Err::<(), _>(RemoteError::transient("timeout")) }
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
