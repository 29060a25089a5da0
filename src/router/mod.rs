//! Model Router
//!
//! Routes completion calls across the configured models in preference order.
//! Each model sits behind its own circuit breaker so a failing provider is
//! skipped without being called until it has had time to recover. Every
//! attempted call is accounted for: latency, tokens, cost.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{ModelConfig, RouterConfig};
use crate::llm::{
    create_provider, ChatMessage, CompletionProvider, CompletionRequest, ProviderError, TokenUsage,
};

pub mod breaker;

pub use breaker::{BreakerSettings, BreakerStatus, CircuitBreaker, CircuitState};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("all model providers are unavailable")]
    AllProvidersUnavailable,

    #[error("no models configured")]
    NoModelsConfigured,

    #[error("model '{model}' failed: {source}")]
    Provider {
        model: String,
        #[source]
        source: ProviderError,
    },
}

/// Per-call knobs; unset fields fall back to the model's config
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<usize>,
    /// Try this model first, then the rest in configured order
    pub preferred_model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

/// One attempted provider call
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub model: String,
    pub provider: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<&'static str>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated counters for one model
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelMetrics {
    pub model: String,
    /// Calls that reached the provider
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Calls skipped because the breaker refused them
    pub rejected: u64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

impl ModelMetrics {
    fn record_attempt(&mut self, latency_ms: u64) {
        self.requests += 1;
        self.avg_latency_ms += (latency_ms as f64 - self.avg_latency_ms) / self.requests as f64;
    }
}

struct ModelSlot {
    config: ModelConfig,
    provider: Arc<dyn CompletionProvider>,
    breaker: Mutex<CircuitBreaker>,
    metrics: Mutex<ModelMetrics>,
}

/// A call admitted by a breaker. Dropping it without an outcome, as happens
/// when the caller abandons the future mid-call, gives the half-open trial
/// slot back.
struct Admission<'a> {
    breaker: &'a Mutex<CircuitBreaker>,
    epoch: u64,
    settled: bool,
}

impl<'a> Admission<'a> {
    fn acquire(breaker: &'a Mutex<CircuitBreaker>) -> Option<Self> {
        let mut guard = breaker.lock();
        if !guard.try_acquire() {
            return None;
        }
        Some(Self {
            breaker,
            epoch: guard.epoch(),
            settled: false,
        })
    }

    fn success(mut self) {
        self.settled = true;
        self.breaker.lock().record_success();
    }

    fn failure(mut self) {
        self.settled = true;
        self.breaker.lock().record_failure();
    }

    fn release(mut self) {
        self.settled = true;
        self.breaker.lock().release_from(self.epoch);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.lock().release_from(self.epoch);
        }
    }
}

/// Multi-provider router with per-model circuit breakers
pub struct ModelRouter {
    slots: Vec<ModelSlot>,
    request_timeout: Duration,
    total_cost: Mutex<f64>,
    records: Mutex<VecDeque<CallRecord>>,
    max_call_records: usize,
}

impl ModelRouter {
    /// Build a router with an HTTP provider for every configured model
    pub fn new(models: &[ModelConfig], config: &RouterConfig) -> anyhow::Result<Self> {
        let mut providers = Vec::with_capacity(models.len());
        for model in models {
            let provider = create_provider(model, config.request_timeout())?;
            providers.push((model.clone(), provider));
        }
        Ok(Self::with_providers(providers, config))
    }

    /// Build a router from explicit providers, in preference order
    pub fn with_providers(
        providers: Vec<(ModelConfig, Arc<dyn CompletionProvider>)>,
        config: &RouterConfig,
    ) -> Self {
        let settings = BreakerSettings::from(config);
        let slots = providers
            .into_iter()
            .map(|(config, provider)| ModelSlot {
                metrics: Mutex::new(ModelMetrics {
                    model: config.name.clone(),
                    ..Default::default()
                }),
                config,
                provider,
                breaker: Mutex::new(CircuitBreaker::new(settings)),
            })
            .collect();

        Self {
            slots,
            request_timeout: config.request_timeout(),
            total_cost: Mutex::new(0.0),
            records: Mutex::new(VecDeque::new()),
            max_call_records: config.max_call_records,
        }
    }

    pub fn model_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.config.name.as_str()).collect()
    }

    /// Issue a completion against the first healthy model.
    ///
    /// Never waits for a breaker to cool down: when every breaker refuses the
    /// call it fails with [`RouterError::AllProvidersUnavailable`].
    pub async fn generate_response(
        &self,
        system: &str,
        user: &str,
        options: &GenerateOptions,
    ) -> Result<ModelResponse, RouterError> {
        if self.slots.is_empty() {
            return Err(RouterError::NoModelsConfigured);
        }

        let mut last_error = None;

        for slot in self.ordered_slots(options.preferred_model.as_deref()) {
            let model = slot.config.name.as_str();

            let Some(admission) = Admission::acquire(&slot.breaker) else {
                tracing::debug!(model, "Circuit open, skipping model");
                slot.metrics.lock().rejected += 1;
                continue;
            };

            let request = CompletionRequest {
                model: model.to_string(),
                messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
                temperature: options.temperature.unwrap_or(slot.config.temperature),
                max_tokens: options.max_tokens.unwrap_or(slot.config.max_tokens),
            };

            let started = Instant::now();
            let call = slot.provider.complete(&request);
            let outcome = match tokio::time::timeout(self.request_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(self.request_timeout)),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(completion) => {
                    admission.success();

                    let usage = completion.usage.unwrap_or_default();
                    let cost_usd = slot.config.cost_for(usage.input_tokens, usage.output_tokens);
                    {
                        let mut metrics = slot.metrics.lock();
                        metrics.record_attempt(latency_ms);
                        metrics.successes += 1;
                        metrics.total_tokens += usage.total() as u64;
                        metrics.cost_usd += cost_usd;
                    }
                    *self.total_cost.lock() += cost_usd;
                    self.push_record(CallRecord {
                        model: model.to_string(),
                        provider: slot.provider.name().to_string(),
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cost_usd,
                        latency_ms,
                        status: CallStatus::Success,
                        error_code: None,
                        timestamp: Utc::now(),
                    });

                    tracing::debug!(model, latency_ms, tokens = usage.total(), "Completion succeeded");

                    return Ok(ModelResponse {
                        content: completion.content,
                        model: model.to_string(),
                        provider: slot.provider.name().to_string(),
                        usage,
                        cost_usd,
                        latency_ms,
                    });
                }
                Err(error) => {
                    if error.is_availability_failure() {
                        admission.failure();
                    } else {
                        admission.release();
                    }
                    {
                        let mut metrics = slot.metrics.lock();
                        metrics.record_attempt(latency_ms);
                        metrics.failures += 1;
                    }
                    self.push_record(CallRecord {
                        model: model.to_string(),
                        provider: slot.provider.name().to_string(),
                        input_tokens: 0,
                        output_tokens: 0,
                        cost_usd: 0.0,
                        latency_ms,
                        status: CallStatus::Error,
                        error_code: Some(error.code()),
                        timestamp: Utc::now(),
                    });

                    tracing::warn!(model, error = %error, "Model call failed, trying next provider");
                    last_error = Some(RouterError::Provider {
                        model: model.to_string(),
                        source: error,
                    });
                }
            }
        }

        Err(last_error.unwrap_or(RouterError::AllProvidersUnavailable))
    }

    /// Running total of spend across all models
    pub fn total_cost(&self) -> f64 {
        *self.total_cost.lock()
    }

    pub fn metrics(&self) -> Vec<ModelMetrics> {
        self.slots.iter().map(|s| s.metrics.lock().clone()).collect()
    }

    pub fn circuit_breaker_status(&self) -> Vec<BreakerStatus> {
        self.slots
            .iter()
            .map(|s| s.breaker.lock().status(&s.config.name))
            .collect()
    }

    /// Most recent calls, oldest first
    pub fn call_records(&self) -> Vec<CallRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Force a model's breaker back to closed. Returns false for unknown models.
    pub fn reset_circuit_breaker(&self, model: &str) -> bool {
        match self.slots.iter().find(|s| s.config.name == model) {
            Some(slot) => {
                slot.breaker.lock().reset();
                tracing::info!(model, "Circuit breaker reset");
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for slot in &self.slots {
            slot.breaker.lock().reset();
        }
    }

    fn ordered_slots<'a>(&'a self, preferred: Option<&'a str>) -> impl Iterator<Item = &'a ModelSlot> + 'a {
        let first = preferred.and_then(|name| self.slots.iter().find(|s| s.config.name == name));
        first.into_iter().chain(
            self.slots
                .iter()
                .filter(move |s| Some(s.config.name.as_str()) != preferred),
        )
    }

    fn push_record(&self, record: CallRecord) {
        if self.max_call_records == 0 {
            return;
        }
        let mut records = self.records.lock();
        while records.len() >= self.max_call_records {
            records.pop_front();
        }
        records.push_back(record);
    }
}
