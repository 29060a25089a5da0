//! Pipeline Types
//!
//! Context a run executes in, per-step results and the aggregated outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::planning::ToolStep;

/// Constraint that lets code-execution tools through the security gate
pub const ALLOW_CODE_EXECUTION: &str = "allow_code_execution";

/// Who is asking, and under which limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineContext {
    pub session_id: String,
    /// Unique per run; at most one active run may hold a given trace id
    pub trace_id: String,
    pub user_id: Option<String>,
    /// Capability flags granted to this run, e.g. [`ALLOW_CODE_EXECUTION`]
    #[serde(default)]
    pub constraints: Vec<String>,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl PipelineContext {
    /// New context with a fresh trace id
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            constraints: Vec::new(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            metadata: HashMap::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_constraint(mut self, flag: impl Into<String>) -> Self {
        let flag = flag.into();
        if !self.has_constraint(&flag) {
            self.constraints.push(flag);
        }
        self
    }

    pub fn has_constraint(&self, flag: &str) -> bool {
        self.constraints.iter().any(|c| c == flag)
    }

    pub fn allows_code_execution(&self) -> bool {
        self.has_constraint(ALLOW_CODE_EXECUTION)
    }
}

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub latency_ms: u64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ToolResult {
    pub fn success(tool: impl Into<String>, output: Value, latency_ms: u64) -> Self {
        Self {
            tool: tool.into(),
            success: true,
            output: Some(output),
            error: None,
            latency_ms,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(tool: impl Into<String>, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            tool: tool.into(),
            success: false,
            output: None,
            error: Some(error.into()),
            latency_ms,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Aggregated outcome of a run. Returned on every path, including failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    /// Append-only, in execution order
    pub steps: Vec<ToolResult>,
    pub total_time_ms: u64,
    pub final_output: String,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl PipelineResult {
    pub fn failed(error: impl Into<String>, total_time_ms: u64) -> Self {
        let error = error.into();
        Self {
            success: false,
            steps: Vec::new(),
            total_time_ms,
            final_output: error.clone(),
            error: Some(error),
            metadata: HashMap::new(),
        }
    }

    pub fn aborted(&self) -> bool {
        self.metadata
            .get("aborted")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn successful_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.success).count()
    }
}

/// Per-call overrides for a run
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Skip planning and run these steps instead
    pub steps: Option<Vec<ToolStep>>,
    /// Let code-execution tools through the security gate
    pub allow_unsafe: bool,
    /// Per-attempt timeout overriding the pipeline config
    pub timeout_ms: Option<u64>,
    /// Cancelling this token aborts the run, same as `abort_execution`
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn with_steps(steps: Vec<ToolStep>) -> Self {
        Self {
            steps: Some(steps),
            ..Default::default()
        }
    }
}
