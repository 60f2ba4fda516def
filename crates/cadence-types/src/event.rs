//! Event types for the Cadence engine event bus.
//!
//! `EngineEvent` is broadcast while a workflow runs. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

use crate::workflow::{ExecutionMode, FailureKind};

/// Progress events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run has entered `Running`.
    RunStarted {
        run_id: String,
        workflow_name: String,
        mode: ExecutionMode,
        units: usize,
        /// Units restored from a durable store and not re-executed.
        resumed: usize,
    },

    /// A wave is about to be scheduled.
    WaveStarted {
        run_id: String,
        wave: usize,
        units: Vec<String>,
    },

    /// A unit began its first attempt.
    UnitStarted { run_id: String, unit: String },

    /// A unit attempt failed and another attempt is scheduled.
    UnitRetrying {
        run_id: String,
        unit: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A unit produced a valid output.
    UnitCompleted {
        run_id: String,
        unit: String,
        attempts: u32,
        duration_ms: u64,
    },

    /// A unit failed, was skipped, or was cancelled.
    UnitFailed {
        run_id: String,
        unit: String,
        kind: FailureKind,
        error: String,
    },

    /// A run reached a terminal state.
    RunCompleted {
        run_id: String,
        workflow_name: String,
        success: bool,
        duration_ms: u64,
        units_succeeded: usize,
        units_failed: usize,
    },
}

impl EngineEvent {
    /// The run every event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::WaveStarted { run_id, .. }
            | EngineEvent::UnitStarted { run_id, .. }
            | EngineEvent::UnitRetrying { run_id, .. }
            | EngineEvent::UnitCompleted { run_id, .. }
            | EngineEvent::UnitFailed { run_id, .. }
            | EngineEvent::RunCompleted { run_id, .. } => run_id,
        }
    }

    /// The unit named by unit-scoped events.
    pub fn unit(&self) -> Option<&str> {
        match self {
            EngineEvent::UnitStarted { unit, .. }
            | EngineEvent::UnitRetrying { unit, .. }
            | EngineEvent::UnitCompleted { unit, .. }
            | EngineEvent::UnitFailed { unit, .. } => Some(unit),
            EngineEvent::RunStarted { .. }
            | EngineEvent::WaveStarted { .. }
            | EngineEvent::RunCompleted { .. } => None,
        }
    }
}
