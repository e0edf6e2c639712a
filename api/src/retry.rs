use std::future::Future;
use std::time::Duration;

/// Failure of a bounded, retried call.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError<E> {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Failed(E),
}

/// Run `call` under `timeout`, retrying exactly once on timeout or error.
///
/// Both attempts get the full timeout. The error of the last attempt is returned.
pub async fn call_with_retry<T, E, F, Fut>(
    label: &str,
    timeout: Duration,
    mut call: F,
) -> Result<T, AttemptError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last = None;
    for attempt in 1..=2u32 {
        let err = match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => AttemptError::Failed(err),
            Err(_) => AttemptError::Timeout(timeout),
        };
        tracing::warn!(
            call = label,
            attempt,
            error = %err,
            "bounded call failed"
        );
        last = Some(err);
    }
    Err(last.unwrap_or(AttemptError::Timeout(timeout)))
}
