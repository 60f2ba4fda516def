//! Generation provider trait definition.
//!
//! Uses native async fn in traits (RPITIT, Rust 2024 edition).
//! For dynamic dispatch, use [`BoxGenerationProvider`](super::box_provider::BoxGenerationProvider).

use std::future::Future;

use cadence_types::llm::{GenerationRequest, ProviderError};

/// Core trait for generation providers.
///
/// Implementations wrap a specific LLM vendor (or a test stub). Vendor-level
/// network retries are the provider's concern; the engine only retries whole
/// unit attempts based on [`ProviderError::is_retryable`].
pub trait GenerationProvider: Send + Sync {
    /// Human-readable provider name, used in logs.
    fn name(&self) -> &str;

    /// Produce an output for a fully rendered prompt.
    fn generate(
        &self,
        request: &GenerationRequest,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;
}
