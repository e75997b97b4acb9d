//! Fail-open helpers for side effects that must never stop the dispatcher
//!
//! Activity logging, escalation notifications and producer wake-ups are
//! best-effort: a failure is logged and swallowed. The halt marker, the
//! journal and module records are NOT fail-open; their errors propagate.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Base delay between retries; attempt `n` waits `n * RETRY_BASE_DELAY`
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Run a best-effort operation, logging and discarding its error
///
/// ```no_run
/// use swarm_core::fail_open::fail_open;
/// use swarm_core::Result;
///
/// async fn append_activity() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     // None if the append failed; the caller carries on either way
///     let _ = fail_open("activity_log", || append_activity()).await;
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

/// Like [`fail_open`], retrying up to `max_retries` times with linear backoff
///
/// Used for escalation delivery, where a transient sink failure deserves a
/// second chance before the notice is given up on.
pub async fn fail_open_with_retries<F, Fut, T>(
    operation_name: &str,
    mut f: F,
    max_retries: usize,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=max_retries {
        match f().await {
            Ok(val) => return Some(val),
            Err(e) if attempt == max_retries => {
                warn!(
                    "{} failed after {} attempts (fail-open): {}",
                    operation_name, max_retries, e
                );
            }
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_retries, e
                );
                tokio::time::sleep(RETRY_BASE_DELAY * attempt as u32).await;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SwarmError;

    #[tokio::test]
    async fn test_fail_open_passes_value_through() {
        let result = fail_open("notify", || async { Ok::<_, SwarmError>("sent") }).await;
        assert_eq!(result, Some("sent"));
    }

    #[tokio::test]
    async fn test_fail_open_swallows_error() {
        let result = fail_open("notify", || async {
            Err::<(), _>(SwarmError::Notification("sink offline".to_string()))
        })
        .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let mut calls = 0;
        let result = fail_open_with_retries(
            "notify",
            || {
                calls += 1;
                async move {
                    if calls < 2 {
                        Err(SwarmError::Notification("busy".to_string()))
                    } else {
                        Ok(calls)
                    }
                }
            },
            3,
        )
        .await;
        assert_eq!(result, Some(2));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mut calls = 0;
        let result = fail_open_with_retries(
            "notify",
            || {
                calls += 1;
                async move { Err::<(), _>(SwarmError::Notification("down".to_string())) }
            },
            2,
        )
        .await;
        assert!(result.is_none());
        assert_eq!(calls, 2);
    }
}
