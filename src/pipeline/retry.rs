//! Per-step retry with timeout and backoff

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::ToolResult;
use crate::config::PipelineConfig;
use crate::planning::ToolStep;
use crate::tools::ToolExecutive;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("step timed out after {0} ms")]
    Timeout(u64),

    #[error("{0}")]
    Execution(String),

    #[error("execution aborted")]
    Aborted,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub attempts: u32,
    pub timeout: Duration,
    /// Base backoff; attempt `n` waits `n * backoff` before the next try
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig, timeout_override_ms: Option<u64>) -> Self {
        Self {
            attempts: config.retry_count.saturating_add(1),
            timeout: Duration::from_millis(timeout_override_ms.unwrap_or(config.timeout_ms)),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Run one step until it succeeds or the attempts run out.
///
/// Returns `Ok` with a successful result, `Ok` with a failed result carrying
/// the last error once attempts are exhausted, or `Err(StepError::Aborted)`
/// when the token fires before or between attempts. An attempt already in
/// flight is allowed to finish.
pub async fn execute_step_with_retry(
    executive: &dyn ToolExecutive,
    step: &ToolStep,
    trace_id: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<ToolResult, StepError> {
    let attempts = policy.attempts.max(1);
    let mut last_error = StepError::Execution("step was never attempted".to_string());
    let mut last_latency = 0;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(StepError::Aborted);
        }

        let started = Instant::now();
        let outcome = attempt_once(executive, step, trace_id, policy.timeout).await;
        last_latency = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(mut result) => {
                if result.latency_ms == 0 {
                    result.latency_ms = last_latency;
                }
                return Ok(result.with_metadata("attempts", attempt));
            }
            Err(error) => {
                tracing::warn!(
                    trace_id,
                    tool = %step.tool,
                    attempt,
                    attempts,
                    "Step attempt failed: {}",
                    error
                );
                last_error = error;
            }
        }

        if attempt < attempts {
            let wait = policy.backoff * attempt;
            tokio::select! {
                _ = cancel.cancelled() => return Err(StepError::Aborted),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    Ok(ToolResult::failure(step.tool.clone(), last_error.to_string(), last_latency)
        .with_metadata("attempts", attempts))
}

async fn attempt_once(
    executive: &dyn ToolExecutive,
    step: &ToolStep,
    trace_id: &str,
    timeout: Duration,
) -> Result<ToolResult, StepError> {
    let call = executive.execute_plan(std::slice::from_ref(step), trace_id);
    let results = match tokio::time::timeout(timeout, call).await {
        Err(_) => return Err(StepError::Timeout(timeout.as_millis() as u64)),
        Ok(Err(e)) => return Err(StepError::Execution(format!("{:#}", e))),
        Ok(Ok(results)) => results,
    };

    let mut results = results.into_iter();
    let result = match (results.next(), results.next()) {
        (Some(result), None) => result,
        (None, _) => return Err(StepError::Execution("tool returned no result".to_string())),
        (Some(_), Some(_)) => {
            return Err(StepError::Execution(
                "tool returned more than one result for a single step".to_string(),
            ))
        }
    };

    if result.success {
        Ok(ToolResult {
            tool: step.tool.clone(),
            ..result
        })
    } else {
        Err(StepError::Execution(
            result
                .error
                .unwrap_or_else(|| "tool reported failure".to_string()),
        ))
    }
}
