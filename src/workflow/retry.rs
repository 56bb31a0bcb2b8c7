// Retry - Bounded retry loop shared by every stage
use backoff::backoff::Backoff;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::StageError;
use crate::types::StageKind;

/// One attempt at a stage. `prior_error` carries the latest validation
/// failure of generated code, until another attempt replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub number: u32,
    pub prior_error: Option<String>,
}

/// Runs `op` until it succeeds or a budget is spent.
///
/// Code-generation validation failures are retried immediately with the
/// failure fed into every later attempt, bounded by `max_codegen_attempts`.
/// Every other failure waits on the backoff schedule and is bounded by
/// `max_attempts`. The two budgets are counted separately. Cancellation ends
/// the loop at once.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    stage: StageKind,
    label: &str,
    mut op: F,
) -> Result<T, StageError>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let mut schedule = policy.backoff();
    let mut number = 0;
    let mut rejected = 0;
    let mut failed = 0;
    let mut prior_error: Option<String> = None;

    loop {
        number += 1;
        let attempt = Attempt {
            number,
            prior_error: prior_error.clone(),
        };

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match err {
            StageError::Cancelled { .. } => return Err(err),
            StageError::ValidationFailure { stage, message } if stage == StageKind::CodeGen => {
                rejected += 1;
                if rejected >= policy.max_codegen_attempts {
                    return Err(StageError::ValidationFailure { stage, message });
                }
                warn!(
                    "🔁 {} {}: generated code rejected ({}), retrying with feedback ({}/{})",
                    label, stage, message, rejected, policy.max_codegen_attempts
                );
                prior_error = Some(message);
            }
            _ => {
                failed += 1;
                if failed >= policy.max_attempts {
                    return Err(err);
                }
                let delay = schedule.next_backoff().unwrap_or(policy.max_backoff);
                warn!(
                    "🔄 {} {} attempt {}/{} failed: {} (retrying in {:?})",
                    label,
                    stage,
                    failed,
                    policy.max_attempts,
                    err.message(),
                    delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(StageError::Cancelled { stage }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            max_codegen_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    fn transient(stage: StageKind) -> StageError {
        StageError::TransientFailure {
            stage,
            message: "connection reset".into(),
        }
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let seen = Mutex::new(Vec::new());
        let result = run_with_retry(&fast_policy(), &CancellationToken::new(), StageKind::Audio, "scene 1", |attempt| {
            seen.lock().unwrap().push(attempt.clone());
            async move {
                if attempt.number < 3 {
                    Err(transient(StageKind::Audio))
                } else {
                    Ok(attempt.number)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|a| a.prior_error.is_none()));
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_budget() {
        let calls = Mutex::new(0u32);
        let result: Result<(), _> =
            run_with_retry(&fast_policy(), &CancellationToken::new(), StageKind::Render, "scene 2", |_| {
                *calls.lock().unwrap() += 1;
                async { Err(transient(StageKind::Render)) }
            })
            .await;

        assert!(matches!(result, Err(StageError::TransientFailure { .. })));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn codegen_validation_failure_feeds_the_error_back() {
        let seen = Mutex::new(Vec::new());
        let result = run_with_retry(&fast_policy(), &CancellationToken::new(), StageKind::CodeGen, "scene 1", |attempt| {
            seen.lock().unwrap().push(attempt.prior_error.clone());
            async move {
                match attempt.prior_error {
                    None => Err(StageError::ValidationFailure {
                        stage: StageKind::CodeGen,
                        message: "no Scene subclass".into(),
                    }),
                    Some(_) => Ok("class A(Scene): ..."),
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(seen.into_inner().unwrap(), vec![None, Some("no Scene subclass".to_string())]);
    }

    #[tokio::test]
    async fn codegen_corrective_loop_is_bounded() {
        let calls = Mutex::new(0u32);
        let result: Result<(), _> =
            run_with_retry(&fast_policy(), &CancellationToken::new(), StageKind::CodeGen, "scene 1", |_| {
                *calls.lock().unwrap() += 1;
                async {
                    Err(StageError::ValidationFailure {
                        stage: StageKind::CodeGen,
                        message: "still broken".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(StageError::ValidationFailure { .. })));
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelled_attempts_are_not_retried() {
        let calls = Mutex::new(0u32);
        let result: Result<(), _> =
            run_with_retry(&fast_policy(), &CancellationToken::new(), StageKind::Solve, "run", |_| {
                *calls.lock().unwrap() += 1;
                async { Err(StageError::Cancelled { stage: StageKind::Solve }) }
            })
            .await;

        assert!(matches!(result, Err(StageError::Cancelled { .. })));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    fn rejected(message: &str) -> StageError {
        StageError::ValidationFailure {
            stage: StageKind::CodeGen,
            message: message.into(),
        }
    }

    #[tokio::test]
    async fn feedback_survives_a_transient_failure() {
        let seen = Mutex::new(Vec::new());
        let result = run_with_retry(&fast_policy(), &CancellationToken::new(), StageKind::CodeGen, "scene 1", |attempt| {
            seen.lock().unwrap().push(attempt.prior_error.clone());
            async move {
                match attempt.number {
                    1 => Err(rejected("no Scene subclass")),
                    2 => Err(transient(StageKind::CodeGen)),
                    _ => Ok(attempt.number),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        let feedback = Some("no Scene subclass".to_string());
        assert_eq!(seen.into_inner().unwrap(), vec![None, feedback.clone(), feedback]);
    }

    #[tokio::test]
    async fn rejections_do_not_spend_the_transient_budget() {
        let policy = RetryPolicy {
            max_attempts: 2,
            max_codegen_attempts: 5,
            ..fast_policy()
        };
        let calls = Mutex::new(0u32);
        let result = run_with_retry(&policy, &CancellationToken::new(), StageKind::CodeGen, "scene 1", |attempt| {
            *calls.lock().unwrap() += 1;
            async move {
                match attempt.number {
                    1 | 2 => Err(rejected("no construct method")),
                    3 => Err(StageError::TransientFailure {
                        stage: StageKind::CodeGen,
                        message: "529".into(),
                    }),
                    _ => Ok(attempt.prior_error),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap().as_deref(), Some("no construct method"));
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn transient_failures_do_not_spend_the_corrective_budget() {
        let calls = Mutex::new(0u32);
        // fast_policy allows two rejections and three transient failures.
        let result: Result<(), _> =
            run_with_retry(&fast_policy(), &CancellationToken::new(), StageKind::CodeGen, "scene 1", |attempt| {
                *calls.lock().unwrap() += 1;
                async move {
                    match attempt.number {
                        1 | 2 => Err(transient(StageKind::CodeGen)),
                        _ => Err(rejected("still broken")),
                    }
                }
            })
            .await;

        assert!(matches!(result, Err(StageError::ValidationFailure { .. })));
        assert_eq!(*calls.lock().unwrap(), 4);
    }
}
