//! Unit executor: run one stage/task to a `UnitResult`.
//!
//! Each attempt renders the prompt against the caller's read-only variable
//! view, calls the unit's provider and runs the optional validator. Attempts
//! are driven by the `RetryExecutor`; the whole thing is bounded by the
//! unit timeout. Failures never escape as `Err`: they are classified into
//! `UnitFailure` and returned inside the result.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use cadence_types::event::EngineEvent;
use cadence_types::llm::{GenerationRequest, ProviderError};
use cadence_types::retry::RetryPolicy;
use cadence_types::workflow::{
    FailureKind, UnitDefinition, UnitFailure, UnitResult, Validation,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::retry::{RetryError, RetryExecutor, RetryableError};
use super::template::{PromptRenderer, RenderError, TemplateRenderer};
use crate::event::EventBus;
use crate::llm::registry::ProviderRegistry;

// ---------------------------------------------------------------------------
// Attempt errors
// ---------------------------------------------------------------------------

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    Render(RenderError),
    Provider(ProviderError),
    Validation(String),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Render(e) => write!(f, "render error: {e}"),
            AttemptError::Provider(e) => write!(f, "{e}"),
            AttemptError::Validation(reason) => write!(f, "validation failed: {reason}"),
        }
    }
}

impl RetryableError for AttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptError::Render(_) => false,
            AttemptError::Provider(e) => e.is_retryable(),
            AttemptError::Validation(_) => true,
        }
    }

    fn retry_delay_hint(&self) -> Option<u64> {
        match self {
            AttemptError::Provider(e) => e.retry_after_ms(),
            _ => None,
        }
    }
}

impl AttemptError {
    fn failure_kind(&self) -> FailureKind {
        match self {
            AttemptError::Render(_) => FailureKind::Render,
            AttemptError::Provider(e) if e.is_retryable() => FailureKind::RetryableProvider,
            AttemptError::Provider(_) => FailureKind::NonRetryableProvider,
            AttemptError::Validation(_) => FailureKind::Validation,
        }
    }
}

// ---------------------------------------------------------------------------
// UnitExecutor
// ---------------------------------------------------------------------------

/// Executes individual units. Holds no per-run state and is shared (behind
/// an `Arc`) by every run of an engine.
pub struct UnitExecutor {
    providers: ProviderRegistry,
    renderer: Arc<dyn PromptRenderer>,
    default_retry: RetryPolicy,
    default_timeout: Option<Duration>,
    events: EventBus,
}

impl UnitExecutor {
    pub fn new(providers: ProviderRegistry, events: EventBus) -> Self {
        Self {
            providers,
            renderer: Arc::new(TemplateRenderer),
            default_retry: RetryPolicy::default(),
            default_timeout: None,
            events,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Delay shape used by units without their own `retry` override.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Bound for units without their own `timeout_ms`.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Effective retry policy: the unit's (or default) delay shape with
    /// `max_retries + 1` attempts.
    pub fn retry_policy_for(&self, unit: &UnitDefinition) -> RetryPolicy {
        unit.retry
            .as_ref()
            .unwrap_or(&self.default_retry)
            .with_max_attempts(unit.max_retries.saturating_add(1))
    }

    /// Effective timeout. A unit `timeout_ms` of 0 disables the bound.
    pub fn timeout_for(&self, unit: &UnitDefinition) -> Option<Duration> {
        match unit.timeout_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => self.default_timeout,
        }
    }

    /// Run `unit` against `variables` and build its result.
    ///
    /// `cancel` is the unit's token: firing it aborts the current attempt or
    /// backoff wait and yields a `Cancelled` failure.
    pub async fn execute_unit(
        &self,
        run_id: &str,
        unit: &UnitDefinition,
        variables: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> UnitResult {
        let started_at = Utc::now();
        tracing::debug!(run_id, unit = %unit.name, agent = %unit.agent.name, "unit started");
        self.events.publish(EngineEvent::UnitStarted {
            run_id: run_id.to_string(),
            unit: unit.name.clone(),
        });

        // Unresolvable provider: nothing was invoked, so attempts stays 0.
        let Some(provider) = self.providers.get(&unit.agent.provider) else {
            let failure = UnitFailure::new(
                FailureKind::Definition,
                format!("unknown provider '{}'", unit.agent.provider),
            );
            return self.finish(run_id, UnitResult::failed(unit, failure, 0, started_at));
        };

        let attempts = AtomicU32::new(0);
        let retry = RetryExecutor::new(self.retry_policy_for(unit));
        let renderer = self.renderer.as_ref();
        let provider = provider.as_ref();
        let attempts_ref = &attempts;

        let run = retry.execute_observed(
            cancel,
            |attempt| {
                attempts_ref.store(attempt, Ordering::SeqCst);
                async move {
                    let prompt = renderer
                        .render(&unit.prompt_template, variables)
                        .map_err(AttemptError::Render)?;
                    let request = GenerationRequest {
                        agent: unit.agent.name.clone(),
                        system_prompt: unit.agent.system_prompt.clone(),
                        prompt,
                    };
                    let output = provider
                        .generate(&request)
                        .await
                        .map_err(AttemptError::Provider)?;
                    if let Some(validator) = &unit.validator {
                        if let Validation::Invalid { reason } = validator.validate(&output) {
                            return Err(AttemptError::Validation(reason));
                        }
                    }
                    Ok(output)
                }
            },
            |notice| {
                self.events.publish(EngineEvent::UnitRetrying {
                    run_id: run_id.to_string(),
                    unit: unit.name.clone(),
                    attempt: notice.attempt,
                    delay_ms: notice.delay.as_millis() as u64,
                    error: notice.error.to_string(),
                });
            },
        );

        let outcome = match self.timeout_for(unit) {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => Some(outcome),
                Err(_elapsed) => None,
            },
            None => Some(run.await),
        };

        let result = match outcome {
            Some(Ok(output)) => {
                UnitResult::succeeded(unit, output, attempts.load(Ordering::SeqCst), started_at)
            }
            Some(Err(err)) => {
                let count = err.attempts();
                UnitResult::failed(unit, classify(err), count, started_at)
            }
            None => {
                let limit = self.timeout_for(unit).unwrap_or_default();
                let failure = UnitFailure::new(
                    FailureKind::Timeout,
                    format!("unit timed out after {}ms", limit.as_millis()),
                );
                UnitResult::failed(
                    unit,
                    failure,
                    attempts.load(Ordering::SeqCst).max(1),
                    started_at,
                )
            }
        };

        self.finish(run_id, result)
    }

    /// Log and publish the terminal event for a unit.
    fn finish(&self, run_id: &str, result: UnitResult) -> UnitResult {
        match &result.failure {
            None => {
                tracing::debug!(
                    run_id,
                    unit = %result.name,
                    attempts = result.attempts,
                    "unit completed"
                );
                self.events.publish(EngineEvent::UnitCompleted {
                    run_id: run_id.to_string(),
                    unit: result.name.clone(),
                    attempts: result.attempts,
                    duration_ms: result.duration_ms(),
                });
            }
            Some(failure) => {
                tracing::warn!(
                    run_id,
                    unit = %result.name,
                    attempts = result.attempts,
                    kind = ?failure.kind,
                    error = %failure.message,
                    "unit failed"
                );
                self.events.publish(EngineEvent::UnitFailed {
                    run_id: run_id.to_string(),
                    unit: result.name.clone(),
                    kind: failure.kind,
                    error: failure.message.clone(),
                });
            }
        }
        result
    }
}

impl fmt::Debug for UnitExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitExecutor")
            .field("providers", &self.providers.list_names())
            .field("default_retry", &self.default_retry)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

fn classify(err: RetryError<AttemptError>) -> UnitFailure {
    match err {
        RetryError::Cancelled { .. } => UnitFailure::new(FailureKind::Cancelled, "run cancelled"),
        RetryError::Exhausted {
            attempts,
            last_error,
        } => UnitFailure::new(
            last_error.failure_kind(),
            format!("failed after {attempts} attempts: {last_error}"),
        ),
        RetryError::NonRetryable { error, .. } => {
            UnitFailure::new(error.failure_kind(), error.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
