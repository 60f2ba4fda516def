//! Generation provider request and error types.
//!
//! The engine treats a provider as an opaque blocking call. The only thing it
//! inspects is the retryable/non-retryable classification of `ProviderError`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single generation call issued by a unit's agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Name of the agent issuing the request.
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Fully rendered prompt.
    pub prompt: String,
}

/// Errors returned by a generation provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider timed out: {0}")]
    Timeout(String),

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Timeouts, rate limits and transient network failures may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::Transient(_)
        )
    }

    /// Provider-suggested wait before the next attempt, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}
