//! BoxGenerationProvider -- object-safe dynamic dispatch wrapper for
//! GenerationProvider.
//!
//! 1. Define an object-safe `GenerationProviderDyn` trait with boxed futures
//! 2. Blanket-impl `GenerationProviderDyn` for all `T: GenerationProvider`
//! 3. `BoxGenerationProvider` wraps `Box<dyn GenerationProviderDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use cadence_types::llm::{GenerationRequest, ProviderError};

use super::provider::GenerationProvider;

/// Object-safe version of [`GenerationProvider`] with boxed futures.
pub trait GenerationProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn generate_boxed<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + 'a>>;
}

impl<T: GenerationProvider> GenerationProviderDyn for T {
    fn name(&self) -> &str {
        GenerationProvider::name(self)
    }

    fn generate_boxed<'a>(
        &'a self,
        request: &'a GenerationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, ProviderError>> + Send + 'a>> {
        Box::pin(self.generate(request))
    }
}

/// Type-erased generation provider for runtime selection by name.
pub struct BoxGenerationProvider {
    inner: Box<dyn GenerationProviderDyn + Send + Sync>,
}

impl BoxGenerationProvider {
    pub fn new<T: GenerationProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.inner.generate_boxed(request).await
    }
}

impl std::fmt::Debug for BoxGenerationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxGenerationProvider")
            .field("name", &self.name())
            .finish()
    }
}
