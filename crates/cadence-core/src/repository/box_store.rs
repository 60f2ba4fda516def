//! BoxStateStore -- object-safe dynamic dispatch wrapper for StateStore.
//!
//! Same blanket-impl pattern as `BoxGenerationProvider`: an object-safe
//! `StateStoreDyn` twin with boxed futures, implemented for every
//! `T: StateStore`, wrapped by `BoxStateStore`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use cadence_types::error::RepositoryError;
use cadence_types::workflow::{UnitDefinition, UnitResult};

use super::state::StateStore;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Object-safe version of [`StateStore`] with boxed futures.
pub trait StateStoreDyn: Send + Sync {
    fn save_plan_boxed<'a>(
        &'a self,
        run_id: &'a str,
        units: &'a [UnitDefinition],
    ) -> BoxFuture<'a, ()>;

    fn load_plan_boxed<'a>(&'a self, run_id: &'a str) -> BoxFuture<'a, Option<Vec<UnitDefinition>>>;

    fn save_unit_result_boxed<'a>(
        &'a self,
        run_id: &'a str,
        name: &'a str,
        result: &'a UnitResult,
    ) -> BoxFuture<'a, ()>;

    fn load_unit_results_boxed<'a>(
        &'a self,
        run_id: &'a str,
    ) -> BoxFuture<'a, HashMap<String, UnitResult>>;
}

impl<T: StateStore> StateStoreDyn for T {
    fn save_plan_boxed<'a>(
        &'a self,
        run_id: &'a str,
        units: &'a [UnitDefinition],
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.save_plan(run_id, units))
    }

    fn load_plan_boxed<'a>(&'a self, run_id: &'a str) -> BoxFuture<'a, Option<Vec<UnitDefinition>>> {
        Box::pin(self.load_plan(run_id))
    }

    fn save_unit_result_boxed<'a>(
        &'a self,
        run_id: &'a str,
        name: &'a str,
        result: &'a UnitResult,
    ) -> BoxFuture<'a, ()> {
        Box::pin(self.save_unit_result(run_id, name, result))
    }

    fn load_unit_results_boxed<'a>(
        &'a self,
        run_id: &'a str,
    ) -> BoxFuture<'a, HashMap<String, UnitResult>> {
        Box::pin(self.load_unit_results(run_id))
    }
}

/// Type-erased state store, so the engine is not generic over its backend.
pub struct BoxStateStore {
    inner: Box<dyn StateStoreDyn + Send + Sync>,
}

impl BoxStateStore {
    pub fn new<T: StateStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn save_plan(
        &self,
        run_id: &str,
        units: &[UnitDefinition],
    ) -> Result<(), RepositoryError> {
        self.inner.save_plan_boxed(run_id, units).await
    }

    pub async fn load_plan(
        &self,
        run_id: &str,
    ) -> Result<Option<Vec<UnitDefinition>>, RepositoryError> {
        self.inner.load_plan_boxed(run_id).await
    }

    pub async fn save_unit_result(
        &self,
        run_id: &str,
        name: &str,
        result: &UnitResult,
    ) -> Result<(), RepositoryError> {
        self.inner.save_unit_result_boxed(run_id, name, result).await
    }

    pub async fn load_unit_results(
        &self,
        run_id: &str,
    ) -> Result<HashMap<String, UnitResult>, RepositoryError> {
        self.inner.load_unit_results_boxed(run_id).await
    }
}
