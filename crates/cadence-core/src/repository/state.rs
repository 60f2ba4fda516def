//! Durable state store trait definition.
//!
//! The four operations a resumable run needs: persist the plan, persist
//! each unit result, and load both back after a restart.

use std::collections::HashMap;

use cadence_types::error::RepositoryError;
use cadence_types::workflow::{UnitDefinition, UnitResult};

/// Storage interface for resumable runs.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// Implementations may block or fail; the engine treats save failures as
/// non-fatal.
pub trait StateStore: Send + Sync {
    /// Persist (or replace) the unit list for a run.
    fn save_plan(
        &self,
        run_id: &str,
        units: &[UnitDefinition],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the saved unit list. `None` when the run has no plan.
    fn load_plan(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Vec<UnitDefinition>>, RepositoryError>> + Send;

    /// Upsert one unit result, keyed by `(run_id, name)`.
    fn save_unit_result(
        &self,
        run_id: &str,
        name: &str,
        result: &UnitResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Every saved unit result for a run, keyed by unit name.
    fn load_unit_results(
        &self,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<HashMap<String, UnitResult>, RepositoryError>> + Send;
}
