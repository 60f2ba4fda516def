//! Provider registry for runtime provider lookup.
//!
//! A simple name-indexed registry of boxed generation providers. Units name
//! their provider through `AgentSpec::provider`.

use std::collections::HashMap;
use std::sync::Arc;

use super::box_provider::BoxGenerationProvider;
use super::provider::GenerationProvider;

/// Registry of available generation providers, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<BoxGenerationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under the given name, replacing any existing one.
    pub fn register(&mut self, name: impl Into<String>, provider: BoxGenerationProvider) {
        self.providers.insert(name.into(), Arc::new(provider));
    }

    /// Builder form of [`register`](Self::register) for concrete providers.
    pub fn with_provider<T: GenerationProvider + 'static>(
        mut self,
        name: impl Into<String>,
        provider: T,
    ) -> Self {
        self.register(name, BoxGenerationProvider::new(provider));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<BoxGenerationProvider>> {
        self.providers.get(name).cloned()
    }

    /// Registered provider names, sorted.
    pub fn list_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
