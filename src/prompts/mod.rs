//! Planning and Synthesis Prompts
//!
//! Two model calls happen per run: one turns the request into a JSON plan,
//! one turns the step results into an answer for the user.

use crate::pipeline::{PipelineContext, ToolResult};
use crate::tools::ToolRegistry;

/// System prompt for the planning call
pub const PLANNING_SYSTEM_PROMPT: &str = r#"You are the planner of a desktop assistant.
Turn the user's request into a short sequence of tool calls.

## Rules
- Only use tools from the list below, with arguments that match their schema
- Prefer read-only tools; only write, delete or run code when the request asks for it
- Keep the plan minimal; do not add steps the request does not need
- If nothing needs to be done, return an empty "steps" array

## Output format
Reply with a single JSON object and nothing else:

```json
{
  "steps": [{"tool": "<tool name>", "args": {"<key>": "<value>"}}],
  "reasoning": "<one sentence>",
  "confidence": 0.0,
  "dependencies": [],
  "estimated_time_ms": 0
}
```
"#;

/// System prompt for the synthesis call
pub const SYNTHESIS_SYSTEM_PROMPT: &str = r#"You are a desktop assistant reporting back to the user.
You are given the user's request and the results of the tools that ran for it.
Answer the request directly from those results in a few sentences.
Mention failed steps briefly. Never invent results that are not listed."#;

/// Longest tool output passed back to the model, in characters
const MAX_OUTPUT_CHARS: usize = 2000;

/// Full planning system prompt including the tool catalogue
pub fn planning_system_prompt(registry: &ToolRegistry) -> String {
    format!(
        "{}\n## Available tools\n{}\n",
        PLANNING_SYSTEM_PROMPT,
        registry.describe_for_prompt()
    )
}

pub fn planning_user_prompt(request: &str, context: &PipelineContext, max_steps: usize) -> String {
    let mut prompt = format!("Request: {}\n\n", request.trim());
    prompt.push_str(&format!("Working directory: {}\n", context.working_dir.display()));
    prompt.push_str(&format!("Maximum steps: {}\n", max_steps));

    if !context.constraints.is_empty() {
        prompt.push_str("Constraints:\n");
        for flag in &context.constraints {
            prompt.push_str(&format!("- {}\n", flag));
        }
    }

    prompt
}

pub fn synthesis_user_prompt(request: &str, results: &[ToolResult]) -> String {
    let mut prompt = format!("Request: {}\n\nTool results:\n", request.trim());

    for (i, result) in results.iter().enumerate() {
        if result.success {
            let output = result
                .output
                .as_ref()
                .map(|v| truncate(&v.to_string(), MAX_OUTPUT_CHARS))
                .unwrap_or_default();
            prompt.push_str(&format!("{}. {} succeeded: {}\n", i + 1, result.tool, output));
        } else {
            prompt.push_str(&format!(
                "{}. {} failed: {}\n",
                i + 1,
                result.tool,
                result.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    prompt
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
