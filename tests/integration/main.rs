//! Integration tests for assistant-orchestrator
//!
//! These drive the router, scheduler and service through their public APIs
//! with scripted providers and a recording tool executive.

// Test utilities and common setup
mod common;

mod provider_tests;
mod router_tests;
mod service_tests;

// Re-export common utilities for use by test modules
pub use common::*;
