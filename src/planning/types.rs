//! Core types for execution plans

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Arguments passed to a tool, validated against the tool's schema before
/// the step is scheduled.
pub type ToolArgs = Map<String, Value>;

/// Argument keys that carry a filesystem path, in lookup order
const PATH_ARG_KEYS: &[&str] = &["path", "file_path", "directory", "dir", "source", "target"];

/// Reasoning recorded on the fail-safe empty plan
pub const FAIL_SAFE_REASONING: &str = "planning failed safely";

/// One planned tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStep {
    pub tool: String,
    #[serde(default)]
    pub args: ToolArgs,
}

impl ToolStep {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: ToolArgs::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Build a step from a JSON value; non-object values produce empty args.
    pub fn from_json(tool: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => ToolArgs::new(),
        };
        Self {
            tool: tool.into(),
            args,
        }
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    /// The first path-like argument, if any
    pub fn path_arg(&self) -> Option<&str> {
        PATH_ARG_KEYS.iter().find_map(|key| self.arg_str(key))
    }

    /// Every path-like argument, in lookup order
    pub fn path_args(&self) -> Vec<&str> {
        PATH_ARG_KEYS.iter().filter_map(|key| self.arg_str(key)).collect()
    }
}

/// A complete plan for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Ordered steps
    pub steps: Vec<ToolStep>,
    pub reasoning: String,
    /// Planner confidence in [0, 1]
    pub confidence: f64,
    pub dependencies: Vec<String>,
    pub estimated_time_ms: u64,
}

impl ExecutionPlan {
    /// The zero-step plan used whenever planning cannot produce a validated result
    pub fn empty() -> Self {
        Self {
            steps: Vec::new(),
            reasoning: FAIL_SAFE_REASONING.to_string(),
            confidence: 0.0,
            dependencies: Vec::new(),
            estimated_time_ms: 0,
        }
    }

    /// Wrap caller-supplied steps
    pub fn from_steps(steps: Vec<ToolStep>) -> Self {
        Self {
            steps,
            reasoning: "caller supplied steps".to_string(),
            confidence: 1.0,
            dependencies: Vec::new(),
            estimated_time_ms: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Drop steps past `max_steps`
    pub fn truncate(&mut self, max_steps: usize) {
        self.steps.truncate(max_steps);
    }
}
