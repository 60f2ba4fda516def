//! Workflow domain types for Cadence.
//!
//! Defines the immutable unit definitions consumed by the engine, the
//! workflow wrapper that groups them, and the result records produced by a
//! run (`UnitResult`, `WorkflowResult`).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Reserved context key holding the output of the positional predecessor.
pub const PREV_OUTPUT_KEY: &str = "prev_output";

/// Suffix of the dotted `<name>.output` context key.
pub const OUTPUT_SUFFIX: &str = ".output";

// ---------------------------------------------------------------------------
// Agent spec
// ---------------------------------------------------------------------------

/// Describes the agent that executes a unit.
///
/// Agents are ephemeral: the engine builds one from this spec for each
/// execution and looks up `provider` in its provider registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Display name of the agent (copied into results for observability).
    pub name: String,
    /// What the agent does.
    #[serde(default)]
    pub description: String,
    /// Name of the generation provider in the registry.
    pub provider: String,
    /// Optional system prompt sent alongside the rendered prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            provider: provider.into(),
            system_prompt: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Result validation
// ---------------------------------------------------------------------------

/// Outcome of running a [`ResultValidator`] over a generated output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid { reason: String },
}

impl Validation {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Validation::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }
}

/// Pure predicate over a unit's raw output.
///
/// Cheap to clone (reference counted). Not serializable: a plan reloaded
/// from a durable store has no validators.
#[derive(Clone)]
pub struct ResultValidator(Arc<dyn Fn(&str) -> Validation + Send + Sync>);

impl ResultValidator {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> Validation + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn validate(&self, output: &str) -> Validation {
        (self.0)(output)
    }
}

impl fmt::Debug for ResultValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResultValidator(<fn>)")
    }
}

// ---------------------------------------------------------------------------
// Unit definition
// ---------------------------------------------------------------------------

/// Immutable description of one piece of orchestrated work.
///
/// A "stage" when declared statically, a "task" when emitted by a planner.
/// The engine only ever reads a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDefinition {
    /// Unique within a run.
    pub name: String,
    /// Prompt with `{{placeholder}}` tokens.
    pub prompt_template: String,
    pub agent: AgentSpec,
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    #[serde(default)]
    pub max_retries: u32,
    #[serde(skip)]
    pub validator: Option<ResultValidator>,
    /// Whether a failure of this unit fails the whole run.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Per-unit timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Per-unit retry delay shape override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_required() -> bool {
    true
}

impl UnitDefinition {
    pub fn new(
        name: impl Into<String>,
        prompt_template: impl Into<String>,
        agent: AgentSpec,
    ) -> Self {
        Self {
            name: name.into(),
            prompt_template: prompt_template.into(),
            agent,
            max_retries: 0,
            validator: None,
            required: true,
            timeout_ms: None,
            retry: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_validator(mut self, validator: ResultValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Context key under which the dotted form of this unit's output lives.
    pub fn output_key(&self) -> String {
        format!("{}{}", self.name, OUTPUT_SUFFIX)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// How the engine schedules a workflow's units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Explicit stages, run one after another in definition order.
    Sequential,
    /// Planner-generated tasks, scheduled in dependency waves.
    #[default]
    Parallel,
}

/// A named, ordered set of units plus the mode used to run them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    pub units: Vec<UnitDefinition>,
    /// Values seeded into the execution context before the first unit.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
}

impl Workflow {
    pub fn sequential(name: impl Into<String>, units: Vec<UnitDefinition>) -> Self {
        Self {
            name: name.into(),
            mode: ExecutionMode::Sequential,
            units,
            variables: HashMap::new(),
        }
    }

    pub fn parallel(name: impl Into<String>, units: Vec<UnitDefinition>) -> Self {
        Self {
            name: name.into(),
            mode: ExecutionMode::Parallel,
            units,
            variables: HashMap::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle of a single `execute_workflow` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// Unit result
// ---------------------------------------------------------------------------

/// Why a unit did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient provider failure that survived every retry.
    RetryableProvider,
    /// Terminal provider failure (authentication, invalid input).
    NonRetryableProvider,
    /// Output rejected by the unit's validator on the last attempt.
    Validation,
    /// Missing context key or malformed template.
    Render,
    /// Unit or wave exceeded its time bound.
    Timeout,
    /// A transitive dependency failed; the unit never ran.
    PropagatedSkip,
    /// A required predecessor failed in a sequential run.
    Halted,
    /// The run was cancelled before the unit finished.
    Cancelled,
    /// The unit references something the engine cannot resolve (e.g. provider).
    Definition,
    /// The worker executing the unit terminated abnormally.
    Worker,
}

/// Failure detail attached to an unsuccessful [`UnitResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl UnitFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Name/description of the executing agent, copied for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub name: String,
    pub description: String,
}

impl From<&AgentSpec> for AgentMetadata {
    fn from(spec: &AgentSpec) -> Self {
        Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
        }
    }
}

/// Output record for one executed (or skipped) unit. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub name: String,
    /// Empty on failure.
    pub output: String,
    pub success: bool,
    /// Provider attempts started. 0 means the provider was never invoked:
    /// skipped, halted or cancelled-before-start units, and units whose
    /// provider could not be resolved.
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub agent: AgentMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<UnitFailure>,
}

impl UnitResult {
    pub fn succeeded(
        unit: &UnitDefinition,
        output: String,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: unit.name.clone(),
            output,
            success: true,
            attempts,
            started_at,
            ended_at: Utc::now(),
            agent: AgentMetadata::from(&unit.agent),
            failure: None,
        }
    }

    pub fn failed(
        unit: &UnitDefinition,
        failure: UnitFailure,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: unit.name.clone(),
            output: String::new(),
            success: false,
            attempts,
            started_at,
            ended_at: Utc::now(),
            agent: AgentMetadata::from(&unit.agent),
            failure: Some(failure),
        }
    }

    /// Result for a unit that never ran.
    pub fn not_run(unit: &UnitDefinition, failure: UnitFailure) -> Self {
        Self::failed(unit, failure, 0, Utc::now())
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// Workflow result
// ---------------------------------------------------------------------------

/// Aggregate of every unit result for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    /// False if any required unit failed.
    pub overall_success: bool,
    pub results: HashMap<String, UnitResult>,
    /// Unit names in definition order.
    pub order: Vec<String>,
    /// Wave plan used (a single unit per wave for sequential runs).
    pub waves: Vec<Vec<String>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub cancelled: bool,
}

impl WorkflowResult {
    pub fn get(&self, name: &str) -> Option<&UnitResult> {
        self.results.get(name)
    }

    pub fn output(&self, name: &str) -> Option<&str> {
        self.results
            .get(name)
            .filter(|r| r.success)
            .map(|r| r.output.as_str())
    }

    /// Results in definition order.
    pub fn ordered(&self) -> impl Iterator<Item = &UnitResult> {
        self.order.iter().filter_map(|n| self.results.get(n))
    }

    pub fn failed_units(&self) -> Vec<&str> {
        self.ordered()
            .filter(|r| !r.success)
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn duration_ms(&self) -> u64 {
        (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
