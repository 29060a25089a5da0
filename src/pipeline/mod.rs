//! Tool Execution Pipeline
//!
//! Turns a request into a plan, filters it through the security gate, runs
//! the surviving steps in batches with retries and timeouts, and asks the
//! router to summarize what happened. [`StepScheduler::execute`] never fails:
//! every problem ends up in the returned [`PipelineResult`].

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{PipelineConfig, SecurityConfig};
use crate::memory::{spawn_record, MemoryEvent, MemoryEventKind, MemorySink, NoopMemorySink};
use crate::planning::{ExecutionPlan, PlanParser, ToolStep};
use crate::prompts;
use crate::router::{GenerateOptions, ModelRouter};
use crate::tools::{ToolExecutive, ToolRegistry};

pub mod parallel;
pub mod retry;
pub mod security;
pub mod types;

pub use parallel::{plan_batches, Batch};
pub use retry::{execute_step_with_retry, RetryPolicy, StepError};
pub use security::{SecurityPolicy, StepValidator};
pub use types::{ExecuteOptions, PipelineContext, PipelineResult, ToolResult, ALLOW_CODE_EXECUTION};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("an execution with trace id '{0}' is already running")]
    AlreadyRunning(String),

    #[error("execution aborted")]
    Aborted,
}

type ActiveRuns = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Holds a trace id's slot in the active-run map for the life of a run
struct RunGuard {
    trace_id: String,
    token: CancellationToken,
    active: ActiveRuns,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.trace_id);
    }
}

/// Where the plan for a run came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanSource {
    Caller,
    Planner,
    FailSafe,
}

impl PlanSource {
    fn as_str(&self) -> &'static str {
        match self {
            PlanSource::Caller => "caller",
            PlanSource::Planner => "planner",
            PlanSource::FailSafe => "fail_safe",
        }
    }
}

/// Executes requests end to end
pub struct StepScheduler {
    config: PipelineConfig,
    router: Arc<ModelRouter>,
    executive: Arc<dyn ToolExecutive>,
    validator: StepValidator,
    parser: PlanParser,
    memory: Arc<dyn MemorySink>,
    active: ActiveRuns,
}

impl StepScheduler {
    pub fn new(
        config: PipelineConfig,
        router: Arc<ModelRouter>,
        executive: Arc<dyn ToolExecutive>,
    ) -> Self {
        let parser = PlanParser::with_max_steps(config.max_steps);
        Self {
            config,
            router,
            executive,
            validator: StepValidator::new(
                Arc::new(ToolRegistry::with_defaults()),
                SecurityPolicy::default(),
            ),
            parser,
            memory: Arc::new(NoopMemorySink),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the tool registry and reserved-path policy
    pub fn with_security(mut self, registry: Arc<ToolRegistry>, security: &SecurityConfig) -> Self {
        self.validator = StepValidator::new(registry, SecurityPolicy::new(security));
        self
    }

    pub fn with_memory_sink(mut self, sink: Arc<dyn MemorySink>) -> Self {
        self.memory = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    /// Request cancellation of a running execution. Returns false when no
    /// run holds the trace id.
    pub fn abort_execution(&self, trace_id: &str) -> bool {
        match self.active.lock().get(trace_id) {
            Some(token) => {
                tracing::info!(trace_id, "Aborting execution");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, trace_id: &str) -> bool {
        self.active.lock().contains_key(trace_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    fn register(
        &self,
        trace_id: &str,
        parent: Option<&CancellationToken>,
    ) -> Result<RunGuard, PipelineError> {
        let mut active = self.active.lock();
        if active.contains_key(trace_id) {
            return Err(PipelineError::AlreadyRunning(trace_id.to_string()));
        }
        let token = parent
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        active.insert(trace_id.to_string(), token.clone());
        Ok(RunGuard {
            trace_id: trace_id.to_string(),
            token,
            active: Arc::clone(&self.active),
        })
    }

    /// Run a request to completion
    pub async fn execute(
        &self,
        request: &str,
        context: PipelineContext,
        options: ExecuteOptions,
    ) -> PipelineResult {
        let started = Instant::now();

        let guard = match self.register(&context.trace_id, options.cancel.as_ref()) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(trace_id = %context.trace_id, "{}", e);
                let mut result = PipelineResult::failed(e.to_string(), 0);
                result
                    .metadata
                    .insert("trace_id".into(), json!(context.trace_id));
                return result;
            }
        };

        self.remember(MemoryEventKind::PlanStarted, request, &context, None, 0);

        let mut result = self.run(request, &context, &options, &guard.token).await;
        result.total_time_ms = started.elapsed().as_millis() as u64;

        let (kind, detail) = if result.success {
            (MemoryEventKind::PlanCompleted, result.final_output.clone())
        } else {
            (
                MemoryEventKind::PlanFailed,
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| result.final_output.clone()),
            )
        };
        self.remember(kind, request, &context, Some(detail), result.steps.len());

        tracing::info!(
            trace_id = %context.trace_id,
            success = result.success,
            steps = result.steps.len(),
            total_time_ms = result.total_time_ms,
            "Execution finished"
        );

        drop(guard);
        result
    }

    async fn run(
        &self,
        request: &str,
        context: &PipelineContext,
        options: &ExecuteOptions,
        token: &CancellationToken,
    ) -> PipelineResult {
        let trace_id = context.trace_id.as_str();

        let (mut plan, source) = match &options.steps {
            Some(steps) => (ExecutionPlan::from_steps(steps.clone()), PlanSource::Caller),
            None if token.is_cancelled() => (ExecutionPlan::empty(), PlanSource::FailSafe),
            None => self.plan(request, context).await,
        };
        plan.truncate(self.config.max_steps);
        let planned = plan.steps.len();

        let mut metadata = HashMap::new();
        metadata.insert("trace_id".to_string(), json!(trace_id));
        metadata.insert("plan_source".to_string(), json!(source.as_str()));
        metadata.insert("planned_steps".to_string(), json!(planned));
        metadata.insert("confidence".to_string(), json!(plan.confidence));
        metadata.insert("reasoning".to_string(), json!(plan.reasoning));

        let steps = self
            .validator
            .validate_and_filter_steps(plan.steps, context, options.allow_unsafe);
        let total = steps.len();
        metadata.insert("filtered_steps".to_string(), json!(planned - total));

        let policy = RetryPolicy::from_config(&self.config, options.timeout_ms);
        let batches = plan_batches(
            steps,
            self.config.allow_parallel,
            self.config.conflict_lookback,
            &context.working_dir,
        );

        let mut results: Vec<ToolResult> = Vec::with_capacity(total);
        let mut aborted = false;
        let mut halted_on: Option<String> = None;

        for batch in batches {
            if token.is_cancelled() {
                aborted = true;
                break;
            }

            let outcomes = match &batch {
                Batch::Sequential(step) => {
                    vec![self.run_step(step, trace_id, policy, token).await]
                }
                Batch::Parallel(steps) => {
                    tracing::debug!(trace_id, count = steps.len(), "Running parallel group");
                    join_all(
                        steps
                            .iter()
                            .map(|step| self.run_step(step, trace_id, policy, token)),
                    )
                    .await
                }
            };

            for outcome in outcomes {
                match outcome {
                    Ok(result) => {
                        if !result.success && self.config.validate_results && halted_on.is_none() {
                            halted_on = Some(result.tool.clone());
                        }
                        results.push(result);
                    }
                    Err(_) => aborted = true,
                }
            }

            if aborted || halted_on.is_some() {
                break;
            }
        }

        // a cancel that lands after the last step finished aborts nothing,
        // unless nothing was ever going to run
        aborted = aborted || (token.is_cancelled() && (results.len() < total || total == 0));
        metadata.insert("aborted".to_string(), json!(aborted));
        metadata.insert("halted".to_string(), json!(halted_on.is_some()));
        metadata.insert("executed_steps".to_string(), json!(results.len()));

        self.aggregate(request, results, total, aborted, halted_on, metadata)
            .await
    }

    async fn run_step(
        &self,
        step: &ToolStep,
        trace_id: &str,
        policy: RetryPolicy,
        token: &CancellationToken,
    ) -> Result<ToolResult, StepError> {
        if self.config.log_execution {
            tracing::info!(trace_id, tool = %step.tool, "Executing step");
        }
        let outcome =
            execute_step_with_retry(self.executive.as_ref(), step, trace_id, policy, token).await;
        if self.config.log_execution {
            if let Ok(result) = &outcome {
                tracing::info!(
                    trace_id,
                    tool = %step.tool,
                    success = result.success,
                    latency_ms = result.latency_ms,
                    "Step finished"
                );
            }
        }
        outcome
    }

    /// Ask the router for a plan. Any failure yields the fail-safe empty plan.
    async fn plan(&self, request: &str, context: &PipelineContext) -> (ExecutionPlan, PlanSource) {
        let system = prompts::planning_system_prompt(self.validator.registry());
        let user = prompts::planning_user_prompt(request, context, self.config.max_steps);

        let response = match self
            .router
            .generate_response(&system, &user, &GenerateOptions::default())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(trace_id = %context.trace_id, "Planning call failed: {}", e);
                return (ExecutionPlan::empty(), PlanSource::FailSafe);
            }
        };

        match self.parser.parse_plan(&response.content) {
            Some(plan) => {
                tracing::debug!(
                    trace_id = %context.trace_id,
                    steps = plan.steps.len(),
                    confidence = plan.confidence,
                    "Plan parsed"
                );
                (plan, PlanSource::Planner)
            }
            None => {
                tracing::warn!(trace_id = %context.trace_id, "Planner output rejected, using empty plan");
                (ExecutionPlan::empty(), PlanSource::FailSafe)
            }
        }
    }

    async fn aggregate(
        &self,
        request: &str,
        steps: Vec<ToolResult>,
        total: usize,
        aborted: bool,
        halted_on: Option<String>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> PipelineResult {
        let succeeded = steps.iter().filter(|s| s.success).count();

        if aborted {
            return PipelineResult {
                success: false,
                final_output: format!(
                    "Execution aborted after {} of {} steps.",
                    steps.len(),
                    total
                ),
                error: Some(PipelineError::Aborted.to_string()),
                steps,
                total_time_ms: 0,
                metadata,
            };
        }

        if steps.is_empty() {
            return PipelineResult {
                success: false,
                steps,
                total_time_ms: 0,
                final_output: "No steps were executed.".to_string(),
                error: None,
                metadata,
            };
        }

        if succeeded == 0 {
            let failures = steps
                .iter()
                .map(|s| {
                    format!(
                        "- {}: {}",
                        s.tool,
                        s.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            return PipelineResult {
                success: false,
                final_output: format!("All {} steps failed:\n{}", steps.len(), failures),
                error: Some("all steps failed".to_string()),
                steps,
                total_time_ms: 0,
                metadata,
            };
        }

        let final_output = match self
            .router
            .generate_response(
                prompts::SYNTHESIS_SYSTEM_PROMPT,
                &prompts::synthesis_user_prompt(request, &steps),
                &GenerateOptions::default(),
            )
            .await
        {
            Ok(response) if !response.content.trim().is_empty() => response.content,
            Ok(_) => templated_summary(succeeded, total),
            Err(e) => {
                tracing::warn!("Synthesis call failed, using templated summary: {}", e);
                templated_summary(succeeded, total)
            }
        };

        let error = halted_on
            .as_ref()
            .map(|tool| format!("stopped after step '{}' failed", tool));

        PipelineResult {
            success: error.is_none(),
            steps,
            total_time_ms: 0,
            final_output,
            error,
            metadata,
        }
    }

    fn remember(
        &self,
        kind: MemoryEventKind,
        request: &str,
        context: &PipelineContext,
        detail: Option<String>,
        step_count: usize,
    ) {
        spawn_record(
            &self.memory,
            MemoryEvent {
                kind,
                trace_id: context.trace_id.clone(),
                session_id: context.session_id.clone(),
                user_id: context.user_id.clone(),
                request: request.to_string(),
                detail,
                step_count,
                timestamp: Utc::now(),
            },
        );
    }
}

fn templated_summary(succeeded: usize, total: usize) -> String {
    format!("Completed {} of {} steps successfully.", succeeded, total)
}
