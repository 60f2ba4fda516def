//! Infrastructure layer for Cadence.
//!
//! Contains implementations of the port traits defined in `cadence-core`:
//! the SQLite state store for resumable runs and the TOML engine-config
//! loader.

pub mod config;
pub mod sqlite;
