//! Pipeline Service
//!
//! Accepts requests, queues them by priority and keeps at most
//! `max_concurrent_executions` scheduler runs in flight. Finished runs move
//! into a bounded history that a background task trims.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::pipeline::{ExecuteOptions, PipelineContext, PipelineResult, StepScheduler};
use crate::planning::ToolStep;

pub mod metrics;
pub mod queue;

pub use metrics::ServiceMetrics;
pub use queue::{ExecutionRequest, Priority};

use metrics::MetricsCollector;
use queue::{QueuedRequest, RequestQueue};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service is shutting down")]
    ShuttingDown,

    #[error("execution '{0}' not found")]
    NotFound(String),

    #[error("execution '{0}' ended without a result")]
    Dropped(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Active,
    Completed,
    NotFound,
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    Queued { id: String, priority: Priority },
    Started { id: String },
    Completed { id: String, success: bool },
    Cancelled { id: String },
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Priority,
    /// Wait for the run to finish and return its result
    pub wait_for_completion: bool,
    /// Per-step timeout; defaults to the service's `default_timeout_ms`
    pub timeout_ms: Option<u64>,
    /// Run these steps instead of asking the planner
    pub steps: Option<Vec<ToolStep>>,
    pub allow_unsafe: bool,
}

impl SubmitOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn waiting(mut self) -> Self {
        self.wait_for_completion = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SubmitResponse {
    pub execution_id: String,
    /// Present only when the caller asked to wait
    pub result: Option<PipelineResult>,
}

/// A finished execution kept for status queries
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub request: String,
    pub priority: Priority,
    pub result: PipelineResult,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

struct ActiveExecution {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    queue: RequestQueue,
    active: HashMap<String, ActiveExecution>,
    history: HashMap<String, ExecutionRecord>,
    history_order: VecDeque<String>,
    metrics: MetricsCollector,
    shutting_down: bool,
}

struct Inner {
    config: ServiceConfig,
    scheduler: Arc<StepScheduler>,
    state: Mutex<State>,
    events: broadcast::Sender<ServiceEvent>,
    /// Signalled whenever an active run finishes
    idle: Notify,
    shutdown: CancellationToken,
}

impl Inner {
    fn emit(&self, event: ServiceEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Start queued requests while there is capacity
    fn drain(self: &Arc<Self>) {
        let limit = self.config.max_concurrent_executions.max(1);
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        while state.active.len() < limit {
            let Some(queued) = state.queue.pop() else {
                break;
            };
            let id = queued.request.id.clone();
            tracing::debug!(execution_id = %id, "Execution started");
            // emitted under the lock so Started always precedes Completed
            self.emit(ServiceEvent::Started { id: id.clone() });

            let cancel = CancellationToken::new();
            let inner = Arc::clone(self);
            let task_cancel = cancel.clone();
            let handle = tokio::spawn(async move {
                inner.run(queued, task_cancel).await;
            });
            state.active.insert(
                id,
                ActiveExecution {
                    cancel,
                    handle: Some(handle),
                },
            );
        }
    }

    async fn run(self: Arc<Self>, queued: QueuedRequest, cancel: CancellationToken) {
        let QueuedRequest { request, waiter } = queued;
        let mut options = request.options.clone();
        options.cancel = Some(cancel);

        let result = self
            .scheduler
            .execute(&request.request, request.context.clone(), options)
            .await;

        self.finish(request, result, waiter);
    }

    fn finish(
        self: &Arc<Self>,
        request: ExecutionRequest,
        result: PipelineResult,
        waiter: Option<oneshot::Sender<PipelineResult>>,
    ) {
        let success = result.success;
        {
            let mut state = self.state.lock();
            // Abandoned at shutdown: nothing left to record into
            if state.active.remove(&request.id).is_some() {
                // a run that finished before it saw the cancel still counts
                let cancelled = result.aborted();
                if self.config.enable_metrics {
                    state.metrics.record_finished(&result);
                }
                state.history_order.push_back(request.id.clone());
                state.history.insert(
                    request.id.clone(),
                    ExecutionRecord {
                        id: request.id.clone(),
                        request: request.request.clone(),
                        priority: request.priority,
                        result: result.clone(),
                        cancelled,
                        created_at: request.created_at,
                        completed_at: Utc::now(),
                    },
                );
            }
        }

        tracing::info!(execution_id = %request.id, success, "Execution completed");
        self.emit(ServiceEvent::Completed {
            id: request.id,
            success,
        });
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        }
        self.idle.notify_waiters();
        self.drain();
    }

    /// Drop the oldest history entries beyond the cap
    fn evict_history(&self) -> usize {
        let mut state = self.state.lock();
        let mut evicted = 0;
        while state.history_order.len() > self.config.max_history {
            if let Some(id) = state.history_order.pop_front() {
                state.history.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }
}

/// Bounded, prioritized front door to the [`StepScheduler`]
pub struct PipelineService {
    inner: Arc<Inner>,
}

impl PipelineService {
    /// Create the service and start its history cleanup task. Must be called
    /// from within a Tokio runtime.
    pub fn new(scheduler: Arc<StepScheduler>, config: ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            config,
            scheduler,
            state: Mutex::new(State::default()),
            events,
            idle: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        if inner.config.auto_cleanup_interval_ms > 0 {
            spawn_cleanup(
                Arc::downgrade(&inner),
                Duration::from_millis(inner.config.auto_cleanup_interval_ms),
                inner.shutdown.clone(),
            );
        }

        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    pub fn scheduler(&self) -> &Arc<StepScheduler> {
        &self.inner.scheduler
    }

    /// Queue a request. With `wait_for_completion` the call resolves once the
    /// run has finished; otherwise it returns as soon as the request is queued.
    pub async fn submit_request(
        &self,
        request: impl Into<String>,
        context: PipelineContext,
        options: SubmitOptions,
    ) -> Result<SubmitResponse, ServiceError> {
        let id = format!("exec-{}", uuid::Uuid::new_v4());
        let priority = options.priority;

        let execution = ExecutionRequest {
            id: id.clone(),
            request: request.into(),
            context,
            priority,
            created_at: Utc::now(),
            options: ExecuteOptions {
                steps: options.steps,
                allow_unsafe: options.allow_unsafe,
                timeout_ms: Some(
                    options
                        .timeout_ms
                        .unwrap_or(self.inner.config.default_timeout_ms),
                ),
                cancel: None,
            },
        };

        let (tx, rx) = if options.wait_for_completion {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(ServiceError::ShuttingDown);
            }
            state.queue.insert(QueuedRequest {
                request: execution,
                waiter: tx,
            });
        }

        tracing::debug!(execution_id = %id, %priority, "Request queued");
        self.inner.emit(ServiceEvent::Queued {
            id: id.clone(),
            priority,
        });
        self.inner.drain();

        let result = match rx {
            Some(rx) => Some(rx.await.map_err(|_| ServiceError::Dropped(id.clone()))?),
            None => None,
        };

        Ok(SubmitResponse {
            execution_id: id,
            result,
        })
    }

    /// Where an execution is, probed queue first, then active, then history
    pub fn execution_status(&self, id: &str) -> ExecutionStatus {
        let state = self.inner.state.lock();
        if state.queue.contains(id) {
            ExecutionStatus::Queued
        } else if state.active.contains_key(id) {
            ExecutionStatus::Active
        } else if state.history.contains_key(id) {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::NotFound
        }
    }

    pub fn execution_result(&self, id: &str) -> Result<ExecutionRecord, ServiceError> {
        self.inner
            .state
            .lock()
            .history
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    /// Cancel a queued or running execution. Returns false when the id is
    /// neither queued nor active.
    pub fn cancel_execution(&self, id: &str) -> bool {
        let mut state = self.inner.state.lock();

        let queued = state.queue.remove(id);
        let found = if queued.is_some() {
            if self.inner.config.enable_metrics {
                state.metrics.record_dequeued_cancel();
            }
            true
        } else {
            match state.active.get(id) {
                Some(active) => {
                    active.cancel.cancel();
                    true
                }
                None => false,
            }
        };
        drop(state);

        if !found {
            return false;
        }

        // dropping a queued request's waiter wakes anyone blocked on it
        let stage = if queued.is_some() { "Queued" } else { "Active" };
        drop(queued);
        tracing::info!(execution_id = %id, "{} execution cancelled", stage);
        self.inner.emit(ServiceEvent::Cancelled { id: id.to_string() });
        true
    }

    pub fn metrics(&self) -> ServiceMetrics {
        let state = self.inner.state.lock();
        state.metrics.snapshot(state.queue.len(), state.active.len())
    }

    pub fn queue_length(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn history_len(&self) -> usize {
        self.inner.state.lock().history.len()
    }

    /// Stop accepting work and wait up to `timeout` for active runs.
    ///
    /// Queued requests are dropped. Runs still going at the deadline are
    /// abandoned, not killed. Returns how many were abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
            state.queue.drain()
        };
        self.inner.shutdown.cancel();
        tracing::info!(dropped = dropped.len(), "Pipeline service shutting down");
        drop(dropped);

        let wait_for_idle = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.inner.state.lock().active.is_empty() {
                    break;
                }
                notified.await;
            }
        };
        let _ = tokio::time::timeout(timeout, wait_for_idle).await;

        let mut state = self.inner.state.lock();
        let abandoned = state.active.len();
        for (id, active) in state.active.drain() {
            tracing::warn!(execution_id = %id, "Abandoning execution still running at shutdown");
            // detach; the task keeps running to completion on its own
            drop(active.handle);
        }
        state.history.clear();
        state.history_order.clear();
        abandoned
    }
}

impl Drop for PipelineService {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn spawn_cleanup(inner: Weak<Inner>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let evicted = inner.evict_history();
            if evicted > 0 {
                tracing::debug!(evicted, "Trimmed execution history");
            }
        }
    });
}
