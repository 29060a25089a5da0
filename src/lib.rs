// Library exports for assistant-orchestrator
// The binary and the integration tests both build on these modules

pub mod config;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod planning;
pub mod prompts;
pub mod router;
pub mod service;
pub mod tools;
