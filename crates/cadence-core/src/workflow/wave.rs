//! Wave executor: runs a wave plan on the shared worker pool.
//!
//! Units within a wave run concurrently via `tokio::JoinSet`, each holding a
//! permit from the engine-wide `Semaphore` while it executes. Small waves run
//! inline on the calling task instead. The context is read-only while a wave
//! runs; successful outputs are committed together once every unit of the
//! wave has resolved, so wave *k+1* always sees all of wave *k*.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_types::event::EngineEvent;
use cadence_types::workflow::{FailureKind, UnitDefinition, UnitFailure, UnitResult};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::checkpoint::CheckpointManager;
use super::context::ExecutionContext;
use super::dag::WavePlan;
use super::unit_runner::UnitExecutor;
use crate::event::EventBus;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Everything one `run_waves` call needs besides the context.
pub struct WaveRun<'a> {
    pub run_id: &'a str,
    /// Units in definition order.
    pub units: &'a [UnitDefinition],
    pub plan: &'a WavePlan,
    /// Run-level token; each unit gets a child.
    pub cancel: &'a CancellationToken,
    pub checkpoint: Option<&'a CheckpointManager>,
    /// Stop after a wave in which a required unit failed, marking every
    /// unit that never ran as `Halted`.
    pub halt_on_required_failure: bool,
}

// ---------------------------------------------------------------------------
// WaveExecutor
// ---------------------------------------------------------------------------

/// Schedules waves onto a bounded worker pool shared across runs.
pub struct WaveExecutor {
    units: Arc<UnitExecutor>,
    pool: Arc<Semaphore>,
    min_parallel_wave_size: usize,
    wave_timeout: Option<Duration>,
    events: EventBus,
}

impl WaveExecutor {
    pub fn new(units: Arc<UnitExecutor>, pool: Arc<Semaphore>, events: EventBus) -> Self {
        Self {
            units,
            pool,
            min_parallel_wave_size: 2,
            wave_timeout: None,
            events,
        }
    }

    pub fn with_min_parallel_wave_size(mut self, size: usize) -> Self {
        self.min_parallel_wave_size = size;
        self
    }

    pub fn with_wave_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wave_timeout = timeout;
        self
    }

    /// Execute every wave of `run.plan` in order.
    ///
    /// `results` may already hold results restored from a checkpoint; those
    /// units are not executed again (their outputs must already be committed
    /// to `context`). On return every unit in `run.units` has a result.
    pub async fn run_waves(
        &self,
        run: WaveRun<'_>,
        context: &mut ExecutionContext,
        results: &mut HashMap<String, UnitResult>,
    ) {
        let by_name: HashMap<&str, (usize, &UnitDefinition)> = run
            .units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.name.as_str(), (i, u)))
            .collect();
        let mut halted = false;

        for (wave_idx, wave) in run.plan.waves().iter().enumerate() {
            if run.cancel.is_cancelled() {
                break;
            }

            let mut runnable: Vec<(usize, &UnitDefinition)> = Vec::new();
            for name in wave {
                if results.contains_key(name) {
                    tracing::debug!(run_id = run.run_id, unit = %name, "skipping completed unit");
                    continue;
                }
                let Some(&(index, unit)) = by_name.get(name.as_str()) else {
                    continue;
                };
                let failed_dep = run.plan.dependencies_of(name).and_then(|deps| {
                    deps.iter()
                        .find(|dep| results.get(*dep).is_some_and(|r| !r.success))
                });
                if let Some(dep) = failed_dep {
                    let failure = UnitFailure::new(
                        FailureKind::PropagatedSkip,
                        format!("dependency '{dep}' did not succeed"),
                    );
                    let result = self.not_run(run.run_id, unit, failure);
                    self.record(&run, context, results, result).await;
                    if run.halt_on_required_failure && unit.required {
                        halted = true;
                    }
                    continue;
                }
                runnable.push((index, unit));
            }

            if halted {
                tracing::info!(run_id = run.run_id, wave = wave_idx, "required unit skipped, halting run");
                break;
            }
            if runnable.is_empty() {
                continue;
            }

            tracing::debug!(
                run_id = run.run_id,
                wave = wave_idx,
                units = runnable.len(),
                "processing wave"
            );
            self.events.publish(EngineEvent::WaveStarted {
                run_id: run.run_id.to_string(),
                wave: wave_idx,
                units: runnable.iter().map(|(_, u)| u.name.clone()).collect(),
            });

            let mut wave_results = if runnable.len() < self.min_parallel_wave_size {
                self.run_inline(&run, &runnable, context).await
            } else {
                self.run_parallel(&run, &runnable, context).await
            };

            // Single commit point, in definition order.
            for (_, unit) in &runnable {
                let Some(result) = wave_results.remove(&unit.name) else {
                    continue;
                };
                if run.halt_on_required_failure && unit.required && !result.success {
                    halted = true;
                }
                self.record(&run, context, results, result).await;
            }

            if halted {
                tracing::info!(run_id = run.run_id, wave = wave_idx, "required unit failed, halting run");
                break;
            }
        }

        // Units that never got a result: cancelled run or halted sequence.
        for unit in run.units {
            if results.contains_key(&unit.name) {
                continue;
            }
            let failure = if run.cancel.is_cancelled() {
                UnitFailure::new(FailureKind::Cancelled, "run cancelled")
            } else if halted {
                UnitFailure::new(FailureKind::Halted, "run halted by a failed required unit")
            } else {
                UnitFailure::new(FailureKind::Worker, "unit was never scheduled")
            };
            let result = self.not_run(run.run_id, unit, failure);
            self.record(&run, context, results, result).await;
        }
    }

    /// Run a small wave one unit at a time on the calling task.
    async fn run_inline(
        &self,
        run: &WaveRun<'_>,
        runnable: &[(usize, &UnitDefinition)],
        context: &ExecutionContext,
    ) -> HashMap<String, UnitResult> {
        let mut out = HashMap::with_capacity(runnable.len());

        let execution = async {
            for &(index, unit) in runnable {
                if run.cancel.is_cancelled() {
                    break;
                }
                let permit = tokio::select! {
                    biased;
                    _ = run.cancel.cancelled() => break,
                    permit = self.pool.acquire() => permit,
                };
                let Ok(_permit) = permit else {
                    break;
                };
                let variables = context.variables_for(
                    run.plan.uses_prev_output(&unit.name),
                    predecessor(run.units, index),
                );
                let token = run.cancel.child_token();
                let result = self
                    .units
                    .execute_unit(run.run_id, unit, &variables, &token)
                    .await;
                out.insert(unit.name.clone(), result);
            }
        };

        let timed_out = match self.wave_timeout {
            Some(limit) => tokio::time::timeout(limit, execution).await.is_err(),
            None => {
                execution.await;
                false
            }
        };

        self.fill_missing(run, runnable, &mut out, timed_out);
        out
    }

    /// Fan a wave out onto the worker pool and wait for all of it (or the
    /// wave timeout).
    async fn run_parallel(
        &self,
        run: &WaveRun<'_>,
        runnable: &[(usize, &UnitDefinition)],
        context: &ExecutionContext,
    ) -> HashMap<String, UnitResult> {
        let snapshot = Arc::new(context.clone());
        let mut set: JoinSet<(String, UnitResult)> = JoinSet::new();

        for &(index, unit) in runnable {
            let unit = unit.clone();
            let reads_prev_output = run.plan.uses_prev_output(&unit.name);
            let predecessor = predecessor(run.units, index).map(str::to_string);
            let snapshot = Arc::clone(&snapshot);
            let executor = Arc::clone(&self.units);
            let pool = Arc::clone(&self.pool);
            let token = run.cancel.child_token();
            let run_id = run.run_id.to_string();
            let events = self.events.clone();

            set.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    permit = pool.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    let failure = UnitFailure::new(FailureKind::Cancelled, "cancelled before start");
                    events.publish(EngineEvent::UnitFailed {
                        run_id,
                        unit: unit.name.clone(),
                        kind: failure.kind,
                        error: failure.message.clone(),
                    });
                    return (unit.name.clone(), UnitResult::not_run(&unit, failure));
                };
                let variables = snapshot.variables_for(reads_prev_output, predecessor.as_deref());
                let result = executor
                    .execute_unit(&run_id, &unit, &variables, &token)
                    .await;
                (unit.name.clone(), result)
            });
        }

        let mut out = HashMap::with_capacity(runnable.len());
        let collect = async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((name, result)) => {
                        out.insert(name, result);
                    }
                    Err(e) => {
                        tracing::warn!(run_id = run.run_id, error = %e, "unit worker terminated abnormally");
                    }
                }
            }
        };

        let timed_out = match self.wave_timeout {
            Some(limit) => tokio::time::timeout(limit, collect).await.is_err(),
            None => {
                collect.await;
                false
            }
        };

        if timed_out {
            set.abort_all();
            while let Some(joined) = set.join_next().await {
                if let Ok((name, result)) = joined {
                    out.insert(name, result);
                }
            }
        }

        self.fill_missing(run, runnable, &mut out, timed_out);
        out
    }

    /// Give every unit of the wave without a result a failure explaining why.
    fn fill_missing(
        &self,
        run: &WaveRun<'_>,
        runnable: &[(usize, &UnitDefinition)],
        out: &mut HashMap<String, UnitResult>,
        timed_out: bool,
    ) {
        for (_, unit) in runnable {
            if out.contains_key(&unit.name) {
                continue;
            }
            let failure = if timed_out {
                let limit = self.wave_timeout.unwrap_or_default();
                UnitFailure::new(
                    FailureKind::Timeout,
                    format!("wave timed out after {}ms", limit.as_millis()),
                )
            } else if run.cancel.is_cancelled() {
                UnitFailure::new(FailureKind::Cancelled, "run cancelled")
            } else {
                UnitFailure::new(FailureKind::Worker, "unit worker terminated abnormally")
            };
            let result = self.not_run(run.run_id, unit, failure);
            out.insert(unit.name.clone(), result);
        }
    }

    /// Build and announce the result of a unit that did not execute.
    fn not_run(&self, run_id: &str, unit: &UnitDefinition, failure: UnitFailure) -> UnitResult {
        tracing::debug!(
            run_id,
            unit = %unit.name,
            kind = ?failure.kind,
            reason = %failure.message,
            "unit not executed"
        );
        self.events.publish(EngineEvent::UnitFailed {
            run_id: run_id.to_string(),
            unit: unit.name.clone(),
            kind: failure.kind,
            error: failure.message.clone(),
        });
        UnitResult::not_run(unit, failure)
    }

    /// Commit a successful output, checkpoint, and store the result.
    async fn record(
        &self,
        run: &WaveRun<'_>,
        context: &mut ExecutionContext,
        results: &mut HashMap<String, UnitResult>,
        mut result: UnitResult,
    ) {
        if result.success {
            context.commit(&mut result);
        }
        if let Some(checkpoint) = run.checkpoint {
            checkpoint.checkpoint_unit(run.run_id, &result).await;
        }
        results.insert(result.name.clone(), result);
    }
}

impl std::fmt::Debug for WaveExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaveExecutor")
            .field("available_workers", &self.pool.available_permits())
            .field("min_parallel_wave_size", &self.min_parallel_wave_size)
            .field("wave_timeout", &self.wave_timeout)
            .finish()
    }
}

/// Name of the unit immediately before `index` in definition order.
fn predecessor(units: &[UnitDefinition], index: usize) -> Option<&str> {
    index
        .checked_sub(1)
        .and_then(|i| units.get(i))
        .map(|u| u.name.as_str())
}
