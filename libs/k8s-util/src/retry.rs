use crate::error::{Error, Result};

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

/// Total attempts, first one included, for writes rejected by a stale `resourceVersion`.
pub const CONFLICT_RETRY_ATTEMPTS: usize = 5;

/// Short backoff for optimistic concurrency conflicts: 10ms, 20ms, 40ms, 80ms.
pub fn conflict_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(200))
        .with_max_times(CONFLICT_RETRY_ATTEMPTS - 1)
}

#[inline]
pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 409)
}

#[inline]
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 404)
}

/// Run `operation` again while `predicate` accepts its error and the backoff allows it.
///
/// `operation` is called from scratch on every attempt, so it must re-read any state it depends
/// on.
pub async fn retry_when<T, E, F, Fut, P>(
    backoff: ExponentialBuilder,
    predicate: P,
    operation: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: Display,
{
    operation
        .retry(backoff)
        .when(predicate)
        .notify(|e, duration| debug!(msg = "retrying operation", %e, ?duration))
        .await
}

/// Retry `operation` on Kubernetes write conflicts (HTTP 409). Any other error is returned as is.
pub async fn retry_on_conflict<T, F, Fut>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(
        conflict_backoff(),
        |e: &Error| matches!(e, Error::KubeError(_, ke) if is_conflict(ke)),
        operation,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::{CONFLICT_RETRY_ATTEMPTS, conflict_backoff, retry_on_conflict, retry_when};

    use crate::error::Error;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_retry_when_until_success() {
        let attempts = AtomicUsize::new(0);
        let result: Result<&str, String> = retry_when(
            conflict_backoff(),
            |e: &String| e == "conflict",
            || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("conflict".to_string())
                } else {
                    Ok("done")
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_when_is_bounded() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), String> = retry_when(
            conflict_backoff(),
            |_: &String| true,
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("conflict".to_string())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), CONFLICT_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_retry_when_stops_on_rejected_error() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), String> = retry_when(
            conflict_backoff(),
            |e: &String| e == "transient",
            || async {
                match attempts.fetch_add(1, Ordering::SeqCst) {
                    0 => Err("transient".to_string()),
                    _ => Err("fatal".to_string()),
                }
            },
        )
        .await;
        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_ignores_non_kube_errors() {
        let attempts = AtomicUsize::new(0);
        let result: crate::error::Result<()> = retry_on_conflict(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::MissingData("no status".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
