//! Shared domain types for Cadence.
//!
//! This crate contains the types exchanged between the engine, its
//! collaborators and callers: unit definitions, retry policies, results,
//! engine configuration, events and error classifications.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod retry;
pub mod workflow;
