//! Tool catalogue and the execution seam
//!
//! The orchestrator never implements tools itself. It only knows which tools
//! exist, what arguments they accept, and how to hand a batch of steps to a
//! [`ToolExecutive`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::pipeline::ToolResult;
use crate::planning::{ToolArgs, ToolStep};

pub mod catalog;
pub mod dry_run;

pub use dry_run::DryRunExecutive;

/// Broad grouping used when describing tools to the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Filesystem,
    Web,
    System,
    CodeExecution,
}

impl ToolCategory {
    pub fn label(&self) -> &'static str {
        match self {
            ToolCategory::Filesystem => "filesystem",
            ToolCategory::Web => "web",
            ToolCategory::System => "system",
            ToolCategory::CodeExecution => "code execution",
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Static description of one tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    /// JSON schema the step arguments must satisfy
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: ToolCategory,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category,
            input_schema,
        }
    }
}

struct RegisteredTool {
    spec: ToolSpec,
    schema: JSONSchema,
}

/// Known tools plus their compiled argument schemas
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    /// Registration order, for stable prompt output
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-filled with the desktop tool catalogue
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for spec in catalog::default_tools() {
            if let Err(e) = registry.register(spec) {
                tracing::error!("Failed to register built-in tool: {:#}", e);
            }
        }
        registry
    }

    /// Add or replace a tool. Fails if its schema does not compile.
    pub fn register(&mut self, spec: ToolSpec) -> Result<()> {
        let schema = JSONSchema::compile(&spec.input_schema)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid input schema for tool '{}'", spec.name))?;

        if !self.tools.contains_key(&spec.name) {
            self.order.push(spec.name.clone());
        }
        self.tools
            .insert(spec.name.clone(), RegisteredTool { spec, schema });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name).map(|t| &t.spec)
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check arguments against the tool's schema. Returns the validation
    /// messages on failure.
    pub fn validate_args(&self, name: &str, args: &ToolArgs) -> Result<(), Vec<String>> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| vec![format!("unknown tool '{}'", name)])?;

        let value = Value::Object(args.clone());
        let outcome = match tool.schema.validate(&value) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors.map(|e| e.to_string()).collect()),
        };
        outcome
    }

    /// Tool list in the shape the planning prompt expects
    pub fn describe_for_prompt(&self) -> String {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                format!(
                    "- {} ({}): {}\n  args schema: {}",
                    tool.spec.name, tool.spec.category, tool.spec.description, tool.spec.input_schema
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

/// The capability that actually runs tools.
///
/// The scheduler hands over one step at a time for sequential work and a
/// batch for a parallel group. Implementations return one result per step in
/// the order given.
#[async_trait]
pub trait ToolExecutive: Send + Sync {
    async fn execute_plan(&self, steps: &[ToolStep], trace_id: &str) -> Result<Vec<ToolResult>>;
}

#[async_trait]
impl<T: ToolExecutive + ?Sized> ToolExecutive for Arc<T> {
    async fn execute_plan(&self, steps: &[ToolStep], trace_id: &str) -> Result<Vec<ToolResult>> {
        (**self).execute_plan(steps, trace_id).await
    }
}
