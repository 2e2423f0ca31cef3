//! Timeouts and retries for engine calls, built on [`keen_retry`].
//!
//! Every page-level call to an external engine goes through [`call_engine`].
//! Each attempt is bounded by the per-page timeout. Failures which look
//! transient are retried with exponential backoff, up to the configured
//! number of re-attempts; everything else fails the page immediately.

use std::time::Duration;

use async_openai::error::OpenAIError;
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use reqwest::StatusCode;
use tokio::time;

use crate::{error::EngineError, prelude::*};

/// How to retry failed engine calls.
///
/// Re-attempts stop as soon as the run is asked to pause or cancel, so a
/// retrying page delays a pause by at most one attempt (plus its backoff).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How many times to re-attempt after a transient failure. `0` means a
    /// single attempt.
    pub max_retries: u32,

    /// The shortest delay before a re-attempt.
    pub min_backoff: Duration,

    /// The longest delay before a re-attempt.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Call an engine with a per-attempt timeout, retrying transient failures
/// according to `policy`.
///
/// `stopping` is checked before every re-attempt. Once it returns `true` we
/// give up with [`EngineError::Interrupted`].
pub async fn call_engine<S, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    stopping: S,
    call: F,
) -> Result<String, EngineError>
where
    S: Fn() -> bool,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let (call, stopping) = (&call, &stopping);
    let first = attempt(timeout, call()).await;
    if policy.max_retries == 0 {
        return match first {
            RetryResult::Ok { output, .. } => Ok(output),
            RetryResult::Transient { error, .. } | RetryResult::Fatal { error, .. } => {
                Err(error)
            }
        };
    }

    let min_millis = policy.min_backoff.as_millis().max(1);
    let max_millis = policy.max_backoff.as_millis().max(min_millis);
    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: (min_millis as _)..=(max_millis as _),
        re_attempts: policy.max_retries.min(u32::from(u8::MAX)) as _,
        jitter_ratio: 0.2,
    };
    let resolved = first
        .retry_with_async(|_| async move {
            if stopping() {
                return RetryResult::Fatal {
                    input: (),
                    error: EngineError::Interrupted,
                };
            }
            attempt(timeout, call()).await
        })
        .with_exponential_jitter(|| jitter)
        .await;
    match resolved {
        ResolvedResult::Ok { output, .. } => Ok(output),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => {
            warn!(
                "Engine call succeeded after {} failed attempts: [{}]",
                retry_errors.len(),
                keen_retry::loggable_retry_errors(&retry_errors)
            );
            Ok(output)
        }
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => {
            debug!(
                "Engine call failed after {} retries: {}",
                retry_errors.len(),
                fatal_error
            );
            Err(fatal_error)
        }
    }
}

/// Make a single attempt, classifying any failure.
async fn attempt<Fut>(timeout: Duration, call: Fut) -> RetryResult<(), (), String, EngineError>
where
    Fut: Future<Output = Result<String>>,
{
    let error = match time::timeout(timeout, call).await {
        Ok(Ok(output)) => {
            return RetryResult::Ok {
                reported_input: (),
                output,
            };
        }
        Ok(Err(err)) => EngineError::Failed(err),
        Err(_) => EngineError::Timeout(timeout),
    };
    if error.is_known_transient() {
        debug!("Potentially transient error: {}", error);
        RetryResult::Transient { input: (), error }
    } else {
        RetryResult::Fatal { input: (), error }
    }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for EngineError {
    fn is_known_transient(&self) -> bool {
        match self {
            EngineError::Timeout(_) => true,
            EngineError::Failed(err) => err.chain().any(|cause| {
                if let Some(err) = cause.downcast_ref::<reqwest::Error>() {
                    err.is_known_transient()
                } else if let Some(err) = cause.downcast_ref::<OpenAIError>() {
                    err.is_known_transient()
                } else {
                    false
                }
            }),
            EngineError::MissingInput(_) | EngineError::Interrupted => false,
        }
    }
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            _ => false,
        }
    }
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Connection resets, refused connections while a local model
            // server restarts, and so on.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn never() -> bool {
        false
    }

    #[tokio::test]
    async fn stopping_runs_do_not_retry() {
        let calls = AtomicUsize::new(0);
        let result = call_engine(&quick(5), Duration::from_millis(10), || true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(Duration::from_secs(10)).await;
            Ok("late".to_owned())
        })
        .await;
        assert!(matches!(result, Err(EngineError::Interrupted)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_attempt_by_default() {
        let calls = AtomicUsize::new(0);
        let result = call_engine(&RetryPolicy::default(), Duration::from_secs(5), never, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("nope"))
        })
        .await;
        assert!(matches!(result, Err(EngineError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeouts_are_reported() {
        let result = call_engine(&quick(0), Duration::from_millis(10), never, || async {
            time::sleep(Duration::from_secs(10)).await;
            Ok("late".to_owned())
        })
        .await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
    }

    #[tokio::test]
    async fn timeouts_are_retried() {
        let calls = AtomicUsize::new(0);
        let result = call_engine(&quick(3), Duration::from_millis(20), never, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                time::sleep(Duration::from_secs(10)).await;
            }
            Ok("second time lucky".to_owned())
        })
        .await;
        assert_eq!(result.unwrap(), "second time lucky");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ordinary_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result = call_engine(&quick(3), Duration::from_secs(5), never, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("tesseract: unknown language"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn status_codes() {
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
        assert!(!EngineError::MissingInput("page 3".into()).is_known_transient());
    }
}
