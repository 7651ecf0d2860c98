use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tessera_core::error::ActionFailure;
use tessera_core::model::RetryPolicy;
use tessera_core::traits::ActionOutput;

/// Terminal result of one action after its retry budget.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Succeeded(ActionOutput),
    Failed(ActionFailure),
    /// The run was cancelled while the action was in flight or backing off.
    Cancelled,
}

impl AttemptResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub result: AttemptResult,
    /// Attempts actually started.
    pub attempts: u32,
}

fn is_retryable(failure: &ActionFailure) -> bool {
    failure.retryable
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is spent. With a `timeout`, each attempt is bounded
/// and dropped on cancellation; an elapsed attempt is a retryable timeout
/// failure. Without one, each attempt runs to completion and is expected to
/// observe `cancel` itself.
pub async fn run_with_retry<'a, F>(
    policy: &RetryPolicy,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    mut attempt: F,
) -> RetryOutcome
where
    F: FnMut(u32) -> BoxFuture<'a, Result<ActionOutput, ActionFailure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last = None;

    for n in 0..max_attempts {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: AttemptResult::Cancelled,
                attempts: n,
            };
        }

        let result = match timeout {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome { result: AttemptResult::Cancelled, attempts: n + 1 };
                }
                r = tokio::time::timeout(limit, attempt(n)) => match r {
                    Ok(r) => r,
                    Err(_) => Err(ActionFailure::timeout(format!(
                        "attempt timed out after {}ms",
                        limit.as_millis()
                    ))),
                },
            },
            None => {
                let r = attempt(n).await;
                if r.is_err() && cancel.is_cancelled() {
                    return RetryOutcome {
                        result: AttemptResult::Cancelled,
                        attempts: n + 1,
                    };
                }
                r
            }
        };

        match result {
            Ok(output) => {
                debug!(attempt = n + 1, "Action attempt succeeded");
                return RetryOutcome {
                    result: AttemptResult::Succeeded(output),
                    attempts: n + 1,
                };
            }
            Err(failure) => {
                if is_retryable(&failure) && n + 1 < max_attempts {
                    let backoff = policy.delay_for(n);
                    warn!(
                        attempt = n + 1,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %failure,
                        "Retrying action"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return RetryOutcome { result: AttemptResult::Cancelled, attempts: n + 1 };
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    last = Some(failure);
                    continue;
                }
                return RetryOutcome {
                    result: AttemptResult::Failed(failure),
                    attempts: n + 1,
                };
            }
        }
    }

    RetryOutcome {
        result: AttemptResult::Failed(
            last.unwrap_or_else(|| ActionFailure::configuration("retry policy allows no attempts")),
        ),
        attempts: max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tessera_core::error::ErrorType;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            backoff_multiplier: 1.0,
            max_delay_ms: None,
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let outcome = run_with_retry(&fast(3), Some(Duration::from_secs(1)), &CancellationToken::new(), |_| {
            let c = c.clone();
            Box::pin(async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ActionFailure::new(ErrorType::ExternalService, "503"))
                } else {
                    Ok(ActionOutput::empty().with("ok", serde_json::json!(true)))
                }
            })
        })
        .await;
        assert!(outcome.result.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let outcome = run_with_retry(&fast(5), Some(Duration::from_secs(1)), &CancellationToken::new(), |_| {
            Box::pin(async { Err(ActionFailure::fatal(ErrorType::AgentFailure, "bad output")) })
        })
        .await;
        assert_eq!(outcome.attempts, 1);
        match outcome.result {
            AttemptResult::Failed(f) => assert_eq!(f.error_type, ErrorType::AgentFailure),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let outcome = run_with_retry(&fast(2), Some(Duration::from_secs(1)), &CancellationToken::new(), |n| {
            Box::pin(async move { Err(ActionFailure::timeout(format!("attempt {}", n))) })
        })
        .await;
        assert_eq!(outcome.attempts, 2);
        match outcome.result {
            AttemptResult::Failed(f) => assert_eq!(f.message, "attempt 1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_timeout_failure() {
        let outcome = run_with_retry(&fast(1), Some(Duration::from_millis(10)), &CancellationToken::new(), |_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ActionOutput::empty())
            })
        })
        .await;
        match outcome.result {
            AttemptResult::Failed(f) => {
                assert_eq!(f.error_type, ErrorType::Timeout);
                assert!(f.retryable);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_attempt() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let outcome = run_with_retry(&fast(3), Some(Duration::from_secs(5)), &cancel, |_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ActionOutput::empty())
            })
        })
        .await;
        assert_eq!(outcome.result, AttemptResult::Cancelled);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_starts_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = run_with_retry(&fast(3), Some(Duration::from_secs(1)), &cancel, |_| {
            Box::pin(async { Ok(ActionOutput::empty()) })
        })
        .await;
        assert_eq!(outcome.result, AttemptResult::Cancelled);
        assert_eq!(outcome.attempts, 0);
    }

    #[tokio::test]
    async fn test_unbounded_attempt_runs_to_completion() {
        let outcome = run_with_retry(&fast(1), None, &CancellationToken::new(), |_| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(ActionOutput::empty())
            })
        })
        .await;
        assert!(outcome.result.is_success());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let inner = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let outcome = run_with_retry(&fast(3), None, &cancel, move |_| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.cancelled().await;
                Err(ActionFailure::new(ErrorType::CascadeFailure, "child cancelled"))
            })
        })
        .await;
        assert_eq!(outcome.result, AttemptResult::Cancelled);
        assert_eq!(outcome.attempts, 1);
    }
}
