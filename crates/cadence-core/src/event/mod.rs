//! Event bus for workflow progress.
//!
//! Provides an `EventBus` that distributes `EngineEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
