//! Execution memory sink
//!
//! The pipeline reports plan lifecycle events to a [`MemorySink`]. Writes are
//! fire-and-forget: they are spawned onto the runtime and a slow or failing
//! sink can never hold up or fail a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEventKind {
    PlanStarted,
    PlanCompleted,
    PlanFailed,
}

impl MemoryEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryEventKind::PlanStarted => "plan_started",
            MemoryEventKind::PlanCompleted => "plan_completed",
            MemoryEventKind::PlanFailed => "plan_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryEvent {
    pub kind: MemoryEventKind,
    pub trace_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub request: String,
    /// Final output on completion, error text on failure
    pub detail: Option<String>,
    pub step_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait MemorySink: Send + Sync {
    async fn record(&self, event: MemoryEvent) -> anyhow::Result<()>;
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NoopMemorySink;

#[async_trait]
impl MemorySink for NoopMemorySink {
    async fn record(&self, _event: MemoryEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes events to the tracing log
#[derive(Debug, Default)]
pub struct TracingMemorySink;

#[async_trait]
impl MemorySink for TracingMemorySink {
    async fn record(&self, event: MemoryEvent) -> anyhow::Result<()> {
        tracing::info!(
            trace_id = %event.trace_id,
            session_id = %event.session_id,
            steps = event.step_count,
            "memory: {}",
            event.kind.as_str()
        );
        Ok(())
    }
}

/// Hand an event to the sink without waiting for it
pub fn spawn_record(sink: &Arc<dyn MemorySink>, event: MemoryEvent) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        let kind = event.kind;
        if let Err(e) = sink.record(event).await {
            tracing::warn!("Memory sink failed to record {}: {:#}", kind.as_str(), e);
        }
    });
}
