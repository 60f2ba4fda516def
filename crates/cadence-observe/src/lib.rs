//! Observability setup for Cadence: tracing subscriber installation with
//! optional JSON output and OpenTelemetry export.

pub mod tracing_setup;
