//! SQLite implementation of the durable run-state store.
//!
//! Implements `StateStore` from `cadence-core`. Plans and unit results are
//! stored as JSON blobs; unit results are upserted on `(run_id, unit_name)`
//! so a resumed run overwrites the failures it re-executes.

use std::collections::HashMap;

use cadence_core::repository::state::StateStore;
use cadence_types::error::RepositoryError;
use cadence_types::workflow::{UnitDefinition, UnitResult};
use chrono::Utc;
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `StateStore`.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: DatabasePool,
}

impl SqliteStateStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Drop everything saved for a run. Returns whether anything was removed.
    pub async fn delete_run(&self, run_id: &str) -> Result<bool, RepositoryError> {
        let plans = sqlx::query("DELETE FROM run_plans WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        let results = sqlx::query("DELETE FROM unit_results WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(plans.rows_affected() + results.rows_affected() > 0)
    }
}

impl StateStore for SqliteStateStore {
    async fn save_plan(&self, run_id: &str, units: &[UnitDefinition]) -> Result<(), RepositoryError> {
        let units_json = serde_json::to_string(units)
            .map_err(|e| RepositoryError::Serialization(format!("serialize plan: {e}")))?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"INSERT INTO run_plans (run_id, units, created_at, updated_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 units = excluded.units,
                 updated_at = excluded.updated_at"#,
        )
        .bind(run_id)
        .bind(&units_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn load_plan(&self, run_id: &str) -> Result<Option<Vec<UnitDefinition>>, RepositoryError> {
        let row = sqlx::query("SELECT units FROM run_plans WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let units: String = row
            .try_get("units")
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        serde_json::from_str(&units)
            .map(Some)
            .map_err(|e| RepositoryError::Serialization(format!("invalid plan JSON: {e}")))
    }

    async fn save_unit_result(
        &self,
        run_id: &str,
        name: &str,
        result: &UnitResult,
    ) -> Result<(), RepositoryError> {
        let result_json = serde_json::to_string(result)
            .map_err(|e| RepositoryError::Serialization(format!("serialize unit result: {e}")))?;

        sqlx::query(
            r#"INSERT INTO unit_results (run_id, unit_name, success, result, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(run_id, unit_name) DO UPDATE SET
                 success = excluded.success,
                 result = excluded.result,
                 updated_at = excluded.updated_at"#,
        )
        .bind(run_id)
        .bind(name)
        .bind(result.success)
        .bind(&result_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn load_unit_results(
        &self,
        run_id: &str,
    ) -> Result<HashMap<String, UnitResult>, RepositoryError> {
        let rows = sqlx::query("SELECT unit_name, result FROM unit_results WHERE run_id = ?")
            .bind(run_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut results = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get("unit_name")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let json: String = row
                .try_get("result")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            let result: UnitResult = serde_json::from_str(&json).map_err(|e| {
                RepositoryError::Serialization(format!("invalid result JSON for '{name}': {e}"))
            })?;
            results.insert(name, result);
        }
        Ok(results)
    }
}
