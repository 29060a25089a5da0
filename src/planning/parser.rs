//! Plan parsing
//!
//! Turns raw planner output into a validated, sanitized [`ExecutionPlan`].
//! Every failure path yields `None`; the caller maps that to
//! [`ExecutionPlan::empty`]. The raw request text is never reinterpreted as a
//! tool call.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use super::repair::REPAIRS;
use super::types::{ExecutionPlan, ToolArgs, ToolStep};

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```[A-Za-z]*[ \t]*\n?(.*?)```").unwrap();
}

/// Wire shape of a plan as the planner is asked to produce it
#[derive(Debug, Deserialize)]
struct RawPlan {
    steps: Vec<RawStep>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default, alias = "estimatedTimeMs")]
    estimated_time_ms: Option<u64>,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    tool: String,
    #[serde(alias = "parameters")]
    args: ToolArgs,
}

/// Confidence assumed when the planner omits it
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Parses planner output into execution plans
#[derive(Debug, Clone, Default)]
pub struct PlanParser {
    max_steps: Option<usize>,
}

impl PlanParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of steps a parsed plan may carry
    pub fn with_max_steps(max_steps: usize) -> Self {
        Self {
            max_steps: Some(max_steps),
        }
    }

    /// Parse raw model output. Returns `None` when no valid plan can be recovered.
    pub fn parse_plan(&self, raw: &str) -> Option<ExecutionPlan> {
        let json = match extract_json(raw) {
            Some(json) => json,
            None => {
                tracing::debug!("No JSON object found in planner output");
                return None;
            }
        };

        if let Some(plan) = self.parse_candidate(json) {
            return Some(plan);
        }

        // Bounded repair pass: each transform builds on the previous candidate
        let mut candidate = json.to_string();
        for repair in REPAIRS {
            candidate = (repair.apply)(&candidate);
            if let Some(plan) = self.parse_candidate(&candidate) {
                tracing::debug!("Planner output recovered after '{}' repair", repair.name);
                return Some(plan);
            }
        }

        tracing::warn!("Planner output could not be parsed or repaired");
        None
    }

    fn parse_candidate(&self, candidate: &str) -> Option<ExecutionPlan> {
        let value: Value = serde_json::from_str(candidate).ok()?;
        self.validate(value)
    }

    /// Strict schema check plus sanitization
    fn validate(&self, value: Value) -> Option<ExecutionPlan> {
        if !value.is_object() {
            return None;
        }

        let raw: RawPlan = match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("Plan failed schema validation: {}", e);
                return None;
            }
        };

        if raw.steps.iter().any(|s| s.tool.trim().is_empty()) {
            tracing::debug!("Plan contains a step with an empty tool name");
            return None;
        }

        let mut steps = Vec::with_capacity(raw.steps.len());
        for step in raw.steps {
            let tool = sanitize_tool_name(&step.tool);
            if tool.is_empty() {
                tracing::warn!("Dropping step whose tool name sanitized to nothing: {:?}", step.tool);
                continue;
            }
            if tool != step.tool {
                tracing::warn!("Sanitized tool name {:?} -> {:?}", step.tool, tool);
            }
            steps.push(ToolStep {
                tool,
                args: step.args,
            });
        }

        if let Some(max) = self.max_steps {
            steps.truncate(max);
        }

        Some(ExecutionPlan {
            steps,
            reasoning: raw.reasoning,
            confidence: raw.confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
            dependencies: raw.dependencies,
            estimated_time_ms: raw.estimated_time_ms.unwrap_or(0),
        })
    }
}

/// Pull the JSON object out of model output: a fenced block wins, otherwise
/// the first balanced top-level `{...}` span.
pub fn extract_json(text: &str) -> Option<&str> {
    for caps in FENCED_BLOCK.captures_iter(text) {
        if let Some(body) = caps.get(1) {
            if let Some(obj) = first_object(body.as_str()) {
                return Some(obj);
            }
        }
    }
    first_object(text)
}

/// First balanced `{...}` span, ignoring braces inside strings. An unbalanced
/// tail falls back to the last closing brace so the repair pass can try it.
fn first_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => in_string = Some(c),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Reduce a tool name to `[A-Za-z0-9_]`, keeping `-` only between two
/// alphanumerics. Applying it twice gives the same result as once.
pub fn sanitize_tool_name(name: &str) -> String {
    let filtered: Vec<char> = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    filtered
        .iter()
        .enumerate()
        .filter(|(i, c)| {
            if **c != '-' {
                return true;
            }
            let prev = i.checked_sub(1).and_then(|p| filtered.get(p));
            let next = filtered.get(i + 1);
            matches!((prev, next), (Some(p), Some(n)) if p.is_ascii_alphanumeric() && n.is_ascii_alphanumeric())
        })
        .map(|(_, c)| *c)
        .collect()
}
