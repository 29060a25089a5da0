//! Step Security Gate
//!
//! Every planned step passes through here once per run before anything is
//! scheduled. Rejected steps are dropped and logged, never executed.

use std::path::Path;
use std::sync::Arc;

use super::types::PipelineContext;
use crate::config::SecurityConfig;
use crate::planning::ToolStep;
use crate::tools::catalog::{is_code_execution, MUTATING_FILE_TOOLS};
use crate::tools::ToolRegistry;

/// System locations that mutating file steps may never target
pub const RESERVED_PATHS: &[&str] = &[
    "/",
    "/etc",
    "/bin",
    "/sbin",
    "/usr",
    "/boot",
    "/dev",
    "/proc",
    "/sys",
    "/lib",
    "/var/lib",
    "/System",
    "/Library",
    "C:\\Windows",
    "C:\\Program Files",
];

/// Why a step was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnknownTool,
    CodeExecutionNotAllowed,
    InvalidArgs(Vec<String>),
    ReservedPath(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::UnknownTool => write!(f, "unknown tool"),
            Rejection::CodeExecutionNotAllowed => write!(f, "code execution not allowed"),
            Rejection::InvalidArgs(errors) => write!(f, "invalid arguments: {}", errors.join("; ")),
            Rejection::ReservedPath(path) => write!(f, "targets reserved path {}", path),
        }
    }
}

/// Reserved-path policy
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    reserved: Vec<String>,
}

impl SecurityPolicy {
    pub fn new(config: &SecurityConfig) -> Self {
        let reserved = RESERVED_PATHS
            .iter()
            .map(|p| p.to_string())
            .chain(config.reserved_paths.iter().cloned())
            .map(|p| normalize_path(&p, Path::new("/")))
            .collect();
        Self { reserved }
    }

    /// True when `path` (resolved against `working_dir`) is a reserved
    /// location or lies inside one. The filesystem root only matches itself.
    pub fn is_reserved(&self, path: &str, working_dir: &Path) -> bool {
        let target = normalize_path(path, working_dir).to_ascii_lowercase();
        self.reserved.iter().any(|reserved| {
            let reserved = reserved.to_ascii_lowercase();
            if reserved.ends_with('/') {
                // a root such as "/" or "c:/"
                return target == reserved;
            }
            target == reserved || target.starts_with(&format!("{}/", reserved))
        })
    }
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new(&SecurityConfig::default())
    }
}

/// Filters planned steps down to the ones that may run
pub struct StepValidator {
    registry: Arc<ToolRegistry>,
    policy: SecurityPolicy,
}

impl StepValidator {
    pub fn new(registry: Arc<ToolRegistry>, policy: SecurityPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Check a single step
    pub fn check(
        &self,
        step: &ToolStep,
        context: &PipelineContext,
        allow_unsafe: bool,
    ) -> Result<(), Rejection> {
        if !self.registry.contains(&step.tool) {
            return Err(Rejection::UnknownTool);
        }

        if is_code_execution(&step.tool) && !(allow_unsafe || context.allows_code_execution()) {
            return Err(Rejection::CodeExecutionNotAllowed);
        }

        self.registry
            .validate_args(&step.tool, &step.args)
            .map_err(Rejection::InvalidArgs)?;

        if MUTATING_FILE_TOOLS.contains(&step.tool.as_str()) {
            for path in step.path_args() {
                if self.policy.is_reserved(path, &context.working_dir) {
                    return Err(Rejection::ReservedPath(path.to_string()));
                }
            }
        }

        Ok(())
    }

    /// Drop every step that fails [`StepValidator::check`], keeping plan order
    pub fn validate_and_filter_steps(
        &self,
        steps: Vec<ToolStep>,
        context: &PipelineContext,
        allow_unsafe: bool,
    ) -> Vec<ToolStep> {
        steps
            .into_iter()
            .filter(|step| match self.check(step, context, allow_unsafe) {
                Ok(()) => true,
                Err(reason) => {
                    tracing::warn!(
                        trace_id = %context.trace_id,
                        tool = %step.tool,
                        "Dropping step: {}",
                        reason
                    );
                    false
                }
            })
            .collect()
    }
}

/// Lexically resolve `raw` against `working_dir` into a `/`-separated
/// absolute path. Backslashes are treated as separators and a leading drive
/// letter is kept. The filesystem is never consulted.
pub fn normalize_path(raw: &str, working_dir: &Path) -> String {
    let raw = raw.trim().replace('\\', "/");

    let joined = if is_absolute(&raw) {
        raw
    } else {
        let base = working_dir.to_string_lossy().replace('\\', "/");
        format!("{}/{}", base, raw)
    };

    let (prefix, rest) = split_drive(&joined);
    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    format!("{}/{}", prefix, parts.join("/"))
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || !split_drive(path).0.is_empty()
}

/// Split a leading `X:` drive off a path
fn split_drive(path: &str) -> (&str, &str) {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        (&path[..2], &path[2..])
    } else {
        ("", path)
    }
}
