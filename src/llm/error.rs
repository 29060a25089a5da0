//! Error types for completion providers.

use std::time::Duration;
use thiserror::Error;

/// Errors a completion provider can return.
///
/// The router uses [`ProviderError::is_availability_failure`] to decide
/// whether an error counts against the provider's circuit breaker.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Connection refused, DNS failure, reset, etc.
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider did not answer in time.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The provider answered with a non-2xx status.
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// A response was received but could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Missing API key, bad base URL and similar local problems.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether this error says something about the provider being reachable.
    ///
    /// Malformed-but-received responses and local configuration problems are
    /// application errors and must not trip a breaker.
    pub fn is_availability_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Status { .. }
        )
    }

    /// Short error code for logs and call records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::Status { .. } => "http_status",
            Self::Malformed(_) => "malformed",
            Self::Config(_) => "config",
        }
    }
}
