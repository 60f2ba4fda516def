//! Per-run execution context.
//!
//! `ExecutionContext` maps unit names (plus the dotted `<name>.output` form
//! and the reserved `prev_output` key) to committed outputs. One is created
//! for every `execute_workflow` call and threaded explicitly through the run;
//! the engine never stores it on itself.

use std::borrow::Cow;
use std::collections::HashMap;

use cadence_types::config::DEFAULT_MAX_OUTPUT_BYTES;
use cadence_types::workflow::{OUTPUT_SUFFIX, PREV_OUTPUT_KEY, UnitResult};

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable context for exactly one workflow run.
///
/// Mutated only by [`commit`](Self::commit) between waves; units read a
/// snapshot through [`variables_for`](Self::variables_for).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    values: HashMap<String, String>,
    /// `prev_output` supplied by the caller's initial variables, if any.
    seeded_prev_output: Option<String>,
    max_output_bytes: usize,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OUTPUT_BYTES)
    }
}

impl ExecutionContext {
    pub fn new(max_output_bytes: usize) -> Self {
        Self {
            values: HashMap::new(),
            seeded_prev_output: None,
            max_output_bytes,
        }
    }

    /// Context seeded with caller-supplied variables.
    pub fn with_variables(variables: &HashMap<String, String>, max_output_bytes: usize) -> Self {
        Self {
            values: variables.clone(),
            seeded_prev_output: variables.get(PREV_OUTPUT_KEY).cloned(),
            max_output_bytes,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &HashMap<String, String> {
        &self.values
    }

    /// Publish a successful result under `name`, `name.output` and
    /// `prev_output`.
    ///
    /// Outputs longer than the configured limit are truncated at a char
    /// boundary first; the result is updated in place so that what is
    /// recorded matches what later units see.
    pub fn commit(&mut self, result: &mut UnitResult) {
        if result.output.len() > self.max_output_bytes {
            let original = result.output.len();
            truncate_at_char_boundary(&mut result.output, self.max_output_bytes);
            tracing::warn!(
                unit = %result.name,
                size = original,
                max = self.max_output_bytes,
                "unit output exceeds size limit, truncating"
            );
        }

        let output = &result.output;
        self.values.insert(result.name.clone(), output.clone());
        self.values
            .insert(format!("{}{}", result.name, OUTPUT_SUFFIX), output.clone());
        self.values
            .insert(PREV_OUTPUT_KEY.to_string(), output.clone());
    }

    /// Variables used to render one unit.
    ///
    /// Units that do not read `prev_output` borrow the shared map. For the
    /// others `prev_output` is resolved from `predecessor`'s committed output
    /// rather than from whichever unit committed last, so units in the same
    /// wave never see each other's chaining value; that view is a copy only
    /// when the shared value differs. A unit with no predecessor sees only a
    /// caller-seeded `prev_output`.
    pub fn variables_for(
        &self,
        reads_prev_output: bool,
        predecessor: Option<&str>,
    ) -> Cow<'_, HashMap<String, String>> {
        if !reads_prev_output {
            return Cow::Borrowed(&self.values);
        }

        let wanted = match predecessor {
            Some(name) => self.values.get(name),
            None => self.seeded_prev_output.as_ref(),
        };

        if self.values.get(PREV_OUTPUT_KEY) == wanted {
            return Cow::Borrowed(&self.values);
        }

        let mut view = self.values.clone();
        match wanted {
            Some(value) => {
                view.insert(PREV_OUTPUT_KEY.to_string(), value.clone());
            }
            None => {
                view.remove(PREV_OUTPUT_KEY);
            }
        }
        Cow::Owned(view)
    }
}

/// Cut `text` to at most `max_bytes`, backing off to the nearest char
/// boundary.
pub fn truncate_at_char_boundary(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
