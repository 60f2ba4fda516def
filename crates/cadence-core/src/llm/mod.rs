//! Generation provider abstractions.
//!
//! - `GenerationProvider`: RPITIT trait for concrete provider implementations
//! - `BoxGenerationProvider`: object-safe wrapper for dynamic dispatch
//! - `ProviderRegistry`: name-indexed lookup used by the unit executor

pub mod box_provider;
pub mod provider;
pub mod registry;
