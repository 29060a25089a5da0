//! Side-effect free executive
//!
//! Records every step it is handed and reports success without touching the
//! system. Used by the CLI `run` command to show what a plan would do.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::ToolExecutive;
use crate::pipeline::ToolResult;
use crate::planning::ToolStep;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub trace_id: String,
    pub step: ToolStep,
}

#[derive(Debug, Default)]
pub struct DryRunExecutive {
    calls: Mutex<Vec<RecordedCall>>,
}

impl DryRunExecutive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every step seen so far, in call order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ToolExecutive for DryRunExecutive {
    async fn execute_plan(&self, steps: &[ToolStep], trace_id: &str) -> Result<Vec<ToolResult>> {
        let mut calls = self.calls.lock();
        let results = steps
            .iter()
            .map(|step| {
                tracing::info!(trace_id, tool = %step.tool, "dry run: would execute step");
                calls.push(RecordedCall {
                    trace_id: trace_id.to_string(),
                    step: step.clone(),
                });
                ToolResult::success(
                    step.tool.clone(),
                    json!({ "dry_run": true, "tool": step.tool, "args": step.args }),
                    0,
                )
                .with_metadata("dry_run", true)
            })
            .collect();
        Ok(results)
    }
}
