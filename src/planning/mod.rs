//! Execution Planning Module
//!
//! Plan types plus the fail-safe parser that turns planner output into
//! validated, sanitized plans.

pub mod parser;
pub mod repair;
pub mod types;

pub use parser::{extract_json, sanitize_tool_name, PlanParser};
pub use types::{ExecutionPlan, ToolArgs, ToolStep, FAIL_SAFE_REASONING};
