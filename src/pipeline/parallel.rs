//! Step batching
//!
//! Splits a filtered plan into batches. A step joins the pending parallel
//! group when its tool is read-only and it does not conflict with any of the
//! most recently scheduled steps. Any other step flushes the group and then
//! runs on its own.

use std::path::Path;

use super::security::normalize_path;
use crate::planning::ToolStep;
use crate::tools::catalog::{is_filesystem, is_parallel_safe};

/// A unit of scheduling
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    /// Steps run concurrently; results are appended in this order
    Parallel(Vec<ToolStep>),
    Sequential(ToolStep),
}

impl Batch {
    pub fn steps(&self) -> &[ToolStep] {
        match self {
            Batch::Parallel(steps) => steps,
            Batch::Sequential(step) => std::slice::from_ref(step),
        }
    }
}

/// Whether two steps must not overlap in time
pub fn conflicts(a: &ToolStep, b: &ToolStep, working_dir: &Path) -> bool {
    if is_filesystem(&a.tool) && is_filesystem(&b.tool) {
        let a_paths: Vec<String> = a.path_args().iter().map(|p| normalize_path(p, working_dir)).collect();
        let b_paths: Vec<String> = b.path_args().iter().map(|p| normalize_path(p, working_dir)).collect();
        return a_paths
            .iter()
            .any(|pa| b_paths.iter().any(|pb| prefix_related(pa, pb)));
    }

    if a.tool == "set_env_var" && b.tool == "set_env_var" {
        return matches!((a.arg_str("name"), b.arg_str("name")), (Some(x), Some(y)) if x == y);
    }

    false
}

/// One path equals the other or contains it
fn prefix_related(a: &str, b: &str) -> bool {
    let contains = |outer: &str, inner: &str| {
        inner == outer || outer == "/" || inner.starts_with(&format!("{}/", outer))
    };
    contains(a, b) || contains(b, a)
}

/// Group steps into batches in plan order.
///
/// `lookback` bounds how many of the previously scheduled steps a candidate
/// is checked against. With `allow_parallel` off every step is sequential.
pub fn plan_batches(
    steps: Vec<ToolStep>,
    allow_parallel: bool,
    lookback: usize,
    working_dir: &Path,
) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut scheduled: Vec<ToolStep> = Vec::with_capacity(steps.len());
    let mut pending: Vec<ToolStep> = Vec::new();

    for step in steps {
        let window = &scheduled[scheduled.len().saturating_sub(lookback)..];
        let eligible = allow_parallel
            && is_parallel_safe(&step.tool)
            && !window.iter().any(|prev| conflicts(&step, prev, working_dir));

        scheduled.push(step.clone());

        if eligible {
            pending.push(step);
            continue;
        }

        if !pending.is_empty() {
            batches.push(Batch::Parallel(std::mem::take(&mut pending)));
        }
        batches.push(Batch::Sequential(step));
    }

    if !pending.is_empty() {
        batches.push(Batch::Parallel(pending));
    }

    batches
}
