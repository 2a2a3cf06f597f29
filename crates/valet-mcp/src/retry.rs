//! Bounded retry for transport-level failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConnectorError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 250,
        }
    }
}

/// Run `operation` up to `max_attempts` times, sleeping `backoff_ms`
/// between attempts. Non-retryable errors and cancellation abort
/// immediately; only the final failure is surfaced.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = ConnectorError::Transport("retry loop did not run".into());
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                debug!(attempt, error = %e, "transport error; retrying");
                last_err = e;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(policy.backoff_ms)) => {}
                    _ = cancel.cancelled() => return Err(ConnectorError::Cancelled),
                }
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transport_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1,
        };
        let result = with_retry(policy, &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ConnectorError::Transport("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rpc_errors_abort_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(RetryPolicy::default(), &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ConnectorError::Rpc {
                    code: -32000,
                    message: "nope".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_between_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = with_retry(RetryPolicy::default(), &cancel, || async {
            Err(ConnectorError::Transport("never reached".into()))
        })
        .await;
        assert!(matches!(result, Err(ConnectorError::Cancelled)));
    }
}
