use anyhow::Result;
use assistant_orchestrator::config::{LlmProvider, ModelConfig, PipelineConfig, RouterConfig, ServiceConfig};
use assistant_orchestrator::llm::{Completion, CompletionProvider, CompletionRequest, ProviderError, TokenUsage};
use assistant_orchestrator::pipeline::{StepScheduler, ToolResult};
use assistant_orchestrator::planning::ToolStep;
use assistant_orchestrator::router::ModelRouter;
use assistant_orchestrator::service::{PipelineService, ServiceEvent};
use assistant_orchestrator::tools::ToolExecutive;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};

/// A completion provider that replays a fixed script, then a fallback
pub struct ScriptedProvider {
    label: String,
    script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    fallback: Result<Completion, ProviderError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Err(ProviderError::Malformed("script exhausted".into())),
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, content: &str) -> Self {
        self.push(Ok(Completion {
            content: content.to_string(),
            usage: None,
        }))
    }

    pub fn reply_with_usage(self, content: &str, input_tokens: usize, output_tokens: usize) -> Self {
        self.push(Ok(Completion {
            content: content.to_string(),
            usage: Some(TokenUsage::new(input_tokens, output_tokens)),
        }))
    }

    pub fn fail(self, error: ProviderError) -> Self {
        self.push(Err(error))
    }

    /// What every call returns once the script runs out
    pub fn otherwise(mut self, outcome: Result<Completion, ProviderError>) -> Self {
        self.fallback = outcome;
        self
    }

    pub fn always_reply(self, content: &str) -> Self {
        self.otherwise(Ok(Completion {
            content: content.to_string(),
            usage: None,
        }))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// User prompts seen so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn push(self, outcome: Result<Completion, ProviderError>) -> Self {
        self.script.lock().push_back(outcome);
        self
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = request.messages.last() {
            self.prompts.lock().push(message.content.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn unavailable() -> ProviderError {
    ProviderError::Status {
        status: 503,
        body: "overloaded".into(),
    }
}

pub fn model(name: &str) -> ModelConfig {
    ModelConfig::new(name, LlmProvider::OpenAIGeneric).with_base_url("http://127.0.0.1:9/v1")
}

/// Router over scripted providers, in the given preference order
pub fn router_with(
    providers: Vec<(ModelConfig, Arc<ScriptedProvider>)>,
    config: &RouterConfig,
) -> ModelRouter {
    let providers = providers
        .into_iter()
        .map(|(model, provider)| (model, provider as Arc<dyn CompletionProvider>))
        .collect();
    ModelRouter::with_providers(providers, config)
}

/// A router with nothing configured; planning fails safe and synthesis
/// falls back to the templated summary
pub fn no_models() -> Arc<ModelRouter> {
    Arc::new(ModelRouter::with_providers(vec![], &RouterConfig::default()))
}

/// Per-tool behavior for [`RecordingExecutive`]
#[derive(Debug, Clone, Default)]
struct Behavior {
    delay: Option<Duration>,
    fail_first: u32,
    fail_always: bool,
}

/// Lets a test hold steps at the door of the executive
pub struct Gate {
    permits: Arc<Semaphore>,
    entered: mpsc::UnboundedReceiver<String>,
}

impl Gate {
    /// The tool name of the next step that reached the executive
    pub async fn next_entered(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.entered.recv())
            .await
            .expect("no step reached the executive")
            .expect("executive dropped")
    }

    pub fn release(&self, steps: usize) {
        self.permits.add_permits(steps);
    }

    pub fn open(&self) {
        self.permits.add_permits(1_000);
    }
}

/// Tool executive that records what ran, with scripted delays and failures
#[derive(Default)]
pub struct RecordingExecutive {
    behaviors: Mutex<HashMap<String, Behavior>>,
    attempts: Mutex<HashMap<String, u32>>,
    finished: Mutex<Vec<ToolStep>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    entered: Option<mpsc::UnboundedSender<String>>,
    permits: Option<Arc<Semaphore>>,
}

impl RecordingExecutive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every step waits at the gate until the test releases it
    pub fn gated() -> (Self, Gate) {
        let permits = Arc::new(Semaphore::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let executive = Self {
            entered: Some(tx),
            permits: Some(Arc::clone(&permits)),
            ..Self::default()
        };
        (executive, Gate { permits, entered: rx })
    }

    pub fn delay(self, tool: &str, delay: Duration) -> Self {
        self.behaviors.lock().entry(tool.to_string()).or_default().delay = Some(delay);
        self
    }

    pub fn fail_times(self, tool: &str, times: u32) -> Self {
        self.behaviors.lock().entry(tool.to_string()).or_default().fail_first = times;
        self
    }

    pub fn fail_always(self, tool: &str) -> Self {
        self.behaviors.lock().entry(tool.to_string()).or_default().fail_always = true;
        self
    }

    pub fn attempts(&self, tool: &str) -> u32 {
        self.attempts.lock().get(tool).copied().unwrap_or(0)
    }

    /// Tool names of finished calls, in completion order
    pub fn finished_tools(&self) -> Vec<String> {
        self.finished.lock().iter().map(|s| s.tool.clone()).collect()
    }

    pub fn finished_steps(&self) -> Vec<ToolStep> {
        self.finished.lock().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn run_one(&self, step: &ToolStep) -> ToolResult {
        if let Some(entered) = &self.entered {
            let _ = entered.send(step.tool.clone());
        }
        if let Some(permits) = &self.permits {
            if let Ok(permit) = permits.acquire().await {
                permit.forget();
            }
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let behavior = self.behaviors.lock().get(&step.tool).cloned().unwrap_or_default();
        if let Some(delay) = behavior.delay {
            tokio::time::sleep(delay).await;
        }

        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(step.tool.clone()).or_insert(0);
            *count += 1;
            *count
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.lock().push(step.clone());

        if behavior.fail_always || attempt <= behavior.fail_first {
            ToolResult::failure(&step.tool, format!("{} failed on attempt {}", step.tool, attempt), 1)
        } else {
            ToolResult::success(&step.tool, json!({ "ok": true, "attempt": attempt }), 1)
        }
    }
}

#[async_trait]
impl ToolExecutive for RecordingExecutive {
    async fn execute_plan(&self, steps: &[ToolStep], _trace_id: &str) -> Result<Vec<ToolResult>> {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            results.push(self.run_one(step).await);
        }
        Ok(results)
    }
}

/// Pipeline settings that keep retries quick
pub fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        retry_backoff_ms: 10,
        ..PipelineConfig::default()
    }
}

pub fn scheduler(
    config: PipelineConfig,
    router: Arc<ModelRouter>,
    executive: Arc<RecordingExecutive>,
) -> StepScheduler {
    StepScheduler::new(config, router, executive)
}

/// Service without the background cleanup task
pub fn service(executive: Arc<RecordingExecutive>, max_concurrent: usize) -> PipelineService {
    let scheduler = Arc::new(scheduler(fast_pipeline(), no_models(), executive));
    PipelineService::new(
        scheduler,
        ServiceConfig {
            max_concurrent_executions: max_concurrent,
            auto_cleanup_interval_ms: 0,
            ..ServiceConfig::default()
        },
    )
}

/// Read events until `count` completions have been seen
pub async fn collect_until_completed(
    events: &mut broadcast::Receiver<ServiceEvent>,
    count: usize,
) -> Vec<ServiceEvent> {
    let mut seen = Vec::new();
    let mut completed = 0;
    while completed < count {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for service events")
            .expect("event channel closed");
        if matches!(event, ServiceEvent::Completed { .. }) {
            completed += 1;
        }
        seen.push(event);
    }
    seen
}
