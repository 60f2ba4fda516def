//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (cadence-infra) implements. The core crate never depends on any specific
//! storage technology; `InMemoryStateStore` covers tests and single-process
//! use.

pub mod box_store;
pub mod memory;
pub mod state;
