//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use cadence_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
//!
//! init_tracing(&TracingOptions::default()).unwrap();
//! // ... run workflows ...
//! shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Directive used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_DIRECTIVE: &str = "info,cadence_core=debug";

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// What to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingOptions {
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
    /// Bridge spans to OpenTelemetry with a stdout exporter.
    pub otel: bool,
    /// Filter used when `RUST_LOG` is not set.
    pub default_directive: String,
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            json: false,
            otel: false,
            default_directive: DEFAULT_DIRECTIVE.to_string(),
        }
    }
}

impl TracingOptions {
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_otel(mut self) -> Self {
        self.otel = true;
        self
    }

    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }
}

/// `RUST_LOG` if set and valid, otherwise `default`.
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize the global tracing subscriber.
///
/// - Always installs a `fmt` layer (pretty or JSON) with targets and span
///   close timing.
/// - When `options.otel` is set, additionally bridges spans to
///   OpenTelemetry using a stdout exporter.
///
/// # Errors
///
/// Returns an error if a global subscriber has already been set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let fmt_layer = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    let otel_layer = options.otel.then(|| {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("cadence");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
        tracing_opentelemetry::layer().with_tracer(tracer)
    });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(env_filter(&options.default_directive))
        .try_init()?;

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// No-op when OTel was not enabled.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}
