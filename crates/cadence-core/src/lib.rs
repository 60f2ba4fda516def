//! Execution engine and port traits for Cadence.
//!
//! This crate defines the ports (`GenerationProvider`, `StateStore`) that
//! the infrastructure layer implements, plus everything that runs a
//! workflow against them. It depends only on `cadence-types`, never on
//! `cadence-infra` or any database crate.

pub mod event;
pub mod llm;
pub mod repository;
pub mod workflow;
