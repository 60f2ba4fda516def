//! Workflow engine core: planning, unit execution and wave scheduling.
//!
//! - `definition` -- unit-set validation and definition errors
//! - `template` -- `{{placeholder}}` scanning and prompt rendering
//! - `dag` -- dependency analysis, cycle detection, wave plans
//! - `context` -- per-run output store with `prev_output` chaining
//! - `retry` -- cancellable retry executor
//! - `unit_runner` -- render, generate, validate one unit
//! - `wave` -- bounded-pool wave executor with timeouts
//! - `checkpoint` -- durable state for resumable runs
//! - `executor` -- the `WorkflowEngine` entry point

pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod retry;
pub mod template;
pub mod unit_runner;
pub mod wave;
