//! Durable checkpoint manager for resumable runs.
//!
//! Wraps a `BoxStateStore` with the higher-level operations the engine
//! needs: persist the plan when a run starts, persist every unit result as
//! its wave commits, and reload both when a run is resumed.

use std::collections::HashMap;

use cadence_types::workflow::{UnitDefinition, UnitResult};

use crate::repository::box_store::BoxStateStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable checkpoints for workflow runs.
///
/// Save failures are reported by the `save_*` methods; the `checkpoint_*`
/// variants log and swallow them so a flaky store never fails the unit it
/// snapshots.
pub struct CheckpointManager {
    store: BoxStateStore,
}

impl CheckpointManager {
    pub fn new(store: BoxStateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &BoxStateStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Saves
    // -----------------------------------------------------------------------

    pub async fn save_plan(
        &self,
        run_id: &str,
        units: &[UnitDefinition],
    ) -> Result<(), CheckpointError> {
        self.store
            .save_plan(run_id, units)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id, units = units.len(), "checkpointed plan");
        Ok(())
    }

    pub async fn save_unit_result(
        &self,
        run_id: &str,
        result: &UnitResult,
    ) -> Result<(), CheckpointError> {
        self.store
            .save_unit_result(run_id, &result.name, result)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(
            run_id,
            unit = %result.name,
            success = result.success,
            "checkpointed unit result"
        );
        Ok(())
    }

    /// Save the plan, logging instead of failing.
    pub async fn checkpoint_plan(&self, run_id: &str, units: &[UnitDefinition]) {
        if let Err(e) = self.save_plan(run_id, units).await {
            tracing::warn!(run_id, error = %e, "failed to checkpoint plan; run will not be resumable");
        }
    }

    /// Save a unit result, logging instead of failing.
    pub async fn checkpoint_unit(&self, run_id: &str, result: &UnitResult) {
        if let Err(e) = self.save_unit_result(run_id, result).await {
            tracing::warn!(run_id, unit = %result.name, error = %e, "failed to checkpoint unit result");
        }
    }

    // -----------------------------------------------------------------------
    // Loads
    // -----------------------------------------------------------------------

    pub async fn load_plan(
        &self,
        run_id: &str,
    ) -> Result<Option<Vec<UnitDefinition>>, CheckpointError> {
        self.store
            .load_plan(run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Saved results that can be reused on resume: successful ones only.
    pub async fn load_completed(
        &self,
        run_id: &str,
    ) -> Result<HashMap<String, UnitResult>, CheckpointError> {
        let mut results = self
            .store
            .load_unit_results(run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        let saved = results.len();
        results.retain(|_, r| r.success);
        tracing::debug!(
            run_id,
            saved,
            reusable = results.len(),
            "loaded checkpointed unit results"
        );
        Ok(results)
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint store error: {0}")]
    Repository(String),

    /// No plan was saved for a run that was asked to resume from one.
    #[error("no saved plan for run: {0}")]
    PlanNotFound(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
