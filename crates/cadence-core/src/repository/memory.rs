//! In-memory state store backed by `DashMap`.
//!
//! Survives nothing beyond the process, but lets a run be resumed within it
//! and serves as the reference implementation in tests.

use std::collections::HashMap;

use cadence_types::error::RepositoryError;
use cadence_types::workflow::{UnitDefinition, UnitResult};
use dashmap::DashMap;

use super::state::StateStore;

/// Concurrent in-memory [`StateStore`].
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    plans: DashMap<String, Vec<UnitDefinition>>,
    results: DashMap<String, HashMap<String, UnitResult>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs with a saved plan.
    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }
}

impl StateStore for InMemoryStateStore {
    async fn save_plan(&self, run_id: &str, units: &[UnitDefinition]) -> Result<(), RepositoryError> {
        self.plans.insert(run_id.to_string(), units.to_vec());
        Ok(())
    }

    async fn load_plan(&self, run_id: &str) -> Result<Option<Vec<UnitDefinition>>, RepositoryError> {
        Ok(self.plans.get(run_id).map(|plan| plan.value().clone()))
    }

    async fn save_unit_result(
        &self,
        run_id: &str,
        name: &str,
        result: &UnitResult,
    ) -> Result<(), RepositoryError> {
        self.results
            .entry(run_id.to_string())
            .or_default()
            .insert(name.to_string(), result.clone());
        Ok(())
    }

    async fn load_unit_results(
        &self,
        run_id: &str,
    ) -> Result<HashMap<String, UnitResult>, RepositoryError> {
        Ok(self
            .results
            .get(run_id)
            .map(|results| results.value().clone())
            .unwrap_or_default())
    }
}
