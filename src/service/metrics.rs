//! Service-level execution metrics

use serde::Serialize;
use std::collections::HashMap;

use crate::pipeline::PipelineResult;

/// Snapshot returned by `PipelineService::metrics`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Rolling mean of `total_time_ms` over finished runs
    pub average_latency_ms: f64,
    /// How many times each tool was executed
    pub tool_usage: HashMap<String, u64>,
    pub queue_length: usize,
    pub active: usize,
}

/// Accumulates metrics as executions finish
#[derive(Debug, Default)]
pub(crate) struct MetricsCollector {
    total: u64,
    successful: u64,
    failed: u64,
    cancelled: u64,
    average_latency_ms: f64,
    tool_usage: HashMap<String, u64>,
}

impl MetricsCollector {
    /// Count a finished run. Aborted runs are counted as cancelled rather
    /// than failed.
    pub fn record_finished(&mut self, result: &PipelineResult) {
        self.total += 1;
        if result.aborted() {
            self.cancelled += 1;
        } else if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }

        self.average_latency_ms +=
            (result.total_time_ms as f64 - self.average_latency_ms) / self.total as f64;

        for step in &result.steps {
            *self.tool_usage.entry(step.tool.clone()).or_insert(0) += 1;
        }
    }

    /// Count a request removed from the queue before it ran
    pub fn record_dequeued_cancel(&mut self) {
        self.cancelled += 1;
    }

    pub fn snapshot(&self, queue_length: usize, active: usize) -> ServiceMetrics {
        ServiceMetrics {
            total: self.total,
            successful: self.successful,
            failed: self.failed,
            cancelled: self.cancelled,
            average_latency_ms: self.average_latency_ms,
            tool_usage: self.tool_usage.clone(),
            queue_length,
            active,
        }
    }
}
