//! Unit-set validation and definition-level errors.
//!
//! Validation runs before any unit executes: an empty unit list, duplicate
//! names or names that cannot appear in a `{{placeholder}}` are caller
//! misuse and abort the run up front.

use std::collections::HashSet;

use cadence_types::workflow::{PREV_OUTPUT_KEY, UnitDefinition};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors detected while validating or planning a workflow.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkflowError {
    /// No units were supplied.
    #[error("workflow must have at least one unit")]
    EmptyWorkflow,

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Two units share a name.
    #[error("duplicate unit name: '{0}'")]
    DuplicateUnit(String),

    /// The dependency graph contains a cycle. Members are sorted by name.
    #[error("dependency cycle detected among units: {}", members.join(", "))]
    DependencyCycle { members: Vec<String> },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a unit set before execution.
///
/// Checks:
/// - at least one unit
/// - every name is non-empty, is not the reserved `prev_output` key, and
///   contains no whitespace, braces or dots (dots would make `name.output`
///   ambiguous)
/// - names are unique
pub fn validate_units(units: &[UnitDefinition]) -> Result<(), WorkflowError> {
    if units.is_empty() {
        return Err(WorkflowError::EmptyWorkflow);
    }

    let mut seen = HashSet::new();
    for unit in units {
        validate_name(&unit.name)?;
        if !seen.insert(unit.name.as_str()) {
            return Err(WorkflowError::DuplicateUnit(unit.name.clone()));
        }
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<(), WorkflowError> {
    if name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "unit name must not be empty".to_string(),
        ));
    }
    if name == PREV_OUTPUT_KEY {
        return Err(WorkflowError::ValidationError(format!(
            "unit name '{name}' is reserved"
        )));
    }
    if name
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | '.'))
    {
        return Err(WorkflowError::ValidationError(format!(
            "unit name '{name}' contains invalid characters (whitespace, braces and dots are not allowed)"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
