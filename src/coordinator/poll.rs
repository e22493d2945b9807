//! Bounded polling with explicit outcomes.
//!
//! Waits in the coordinator never surface a bare timeout: `poll_until`
//! returns a `WaitResult` carrying whether the target was reached, the last
//! observation, and the elapsed time. The caller decides whether a missed
//! target is fatal and what diagnostics to attach. Cancellation abandons
//! the wait only; whatever server-side operation is being observed keeps
//! running.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::{Error, Result};

/// Outcome of a bounded poll.
#[derive(Debug, Clone)]
pub struct WaitResult<T> {
    /// Whether the target predicate was satisfied before the timeout.
    pub reached_target: bool,
    /// The last value observed, target or not.
    pub last_observed: T,
    /// Wall clock time spent waiting.
    pub elapsed: Duration,
}

/// Poll `observe` every `interval` until `target` holds or `timeout`
/// elapses. Always performs at least one observation, so a target that
/// already holds returns immediately.
///
/// Returns `Err(Cancelled)` if `cancel` fires while waiting; observation
/// errors propagate as-is.
pub async fn poll_until<T, F, Fut, P>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut observe: F,
    mut target: P,
) -> Result<WaitResult<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&T) -> bool,
{
    let started = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let observed = observe().await?;
        if target(&observed) {
            return Ok(WaitResult {
                reached_target: true,
                last_observed: observed,
                elapsed: started.elapsed(),
            });
        }

        if started.elapsed() >= timeout {
            return Ok(WaitResult {
                reached_target: false,
                last_observed: observed,
                elapsed: started.elapsed(),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_target_already_reached_returns_immediately() {
        let cancel = CancellationToken::new();
        let result = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(60),
            &cancel,
            || async { Ok(7u64) },
            |v| *v >= 7,
        )
        .await
        .unwrap();
        assert!(result.reached_target);
        assert_eq!(result.last_observed, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_reached_after_a_few_samples() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU64::new(0));
        let observed = counter.clone();
        let result = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(60),
            &cancel,
            move || {
                let observed = observed.clone();
                async move { Ok(observed.fetch_add(1, Ordering::SeqCst)) }
            },
            |v| *v >= 3,
        )
        .await
        .unwrap();
        assert!(result.reached_target);
        assert_eq!(result.last_observed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_last_observation() {
        let cancel = CancellationToken::new();
        let result = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(12),
            &cancel,
            || async { Ok(1u64) },
            |v| *v >= 2,
        )
        .await
        .unwrap();
        assert!(!result.reached_target);
        assert_eq!(result.last_observed, 1);
        assert!(result.elapsed >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(60),
            &cancel,
            || async { Ok(0u64) },
            |v| *v > 0,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observation_errors_propagate() {
        let cancel = CancellationToken::new();
        let err = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(60),
            &cancel,
            || async { Err::<u64, _>(Error::MissingField("status".to_string())) },
            |v| *v > 0,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MissingField(_)));
    }
}
