//! Dependency analysis and wave computation.
//!
//! Dependencies are discovered by scanning each unit's prompt template:
//! `{{name}}` / `{{name.output}}` naming another unit is an explicit edge, and
//! `{{prev_output}}` is an implicit edge on the unit immediately before it in
//! definition order. Kahn layering groups units into waves; when layering
//! stalls, `petgraph::algo::tarjan_scc` names the units on the cycle.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use cadence_types::workflow::{PREV_OUTPUT_KEY, UnitDefinition};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use super::definition::{WorkflowError, validate_units};
use super::template::extract_placeholders;

// ---------------------------------------------------------------------------
// Wave plan
// ---------------------------------------------------------------------------

/// Derived execution plan: ordered waves plus the direct dependency map.
///
/// Never persisted; recomputed from the unit list on every run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavePlan {
    waves: Vec<Vec<String>>,
    deps: HashMap<String, BTreeSet<String>>,
    order: Vec<String>,
    /// Units whose template reads `prev_output`.
    chained: HashSet<String>,
}

impl WavePlan {
    /// Waves in execution order. Units inside a wave keep definition order.
    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }

    pub fn into_waves(self) -> Vec<Vec<String>> {
        self.waves
    }

    /// Unit names in definition order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.waves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }

    /// Index of the wave containing `name`.
    pub fn wave_of(&self, name: &str) -> Option<usize> {
        self.waves
            .iter()
            .position(|wave| wave.iter().any(|n| n == name))
    }

    /// Direct dependencies of `name` (explicit and implicit).
    pub fn dependencies_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.deps.get(name)
    }

    /// Whether `name` renders `{{prev_output}}`. Only these units need a
    /// per-unit view of the context.
    pub fn uses_prev_output(&self, name: &str) -> bool {
        self.chained.contains(name)
    }

    /// Every unit that depends on `name`, directly or transitively, in
    /// definition order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for (unit, deps) in &self.deps {
            for dep in deps {
                reverse.entry(dep.as_str()).or_default().push(unit.as_str());
            }
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            for &dependent in reverse.get(current).into_iter().flatten() {
                if visited.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }
        visited.remove(name);

        self.order
            .iter()
            .filter(|n| visited.contains(n.as_str()))
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Build the wave plan for a dependency-discovered unit set.
///
/// Fails before anything runs on an empty set, duplicate names or a cycle
/// (including a unit referencing itself).
pub fn analyze_dependencies(units: &[UnitDefinition]) -> Result<WavePlan, WorkflowError> {
    validate_units(units)?;
    let order: Vec<String> = units.iter().map(|u| u.name.clone()).collect();
    let (deps, chained) = collect_dependencies(units);

    let mut assigned: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&str> = order.iter().map(String::as_str).collect();
    let mut waves: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&str>, Vec<&str>) = remaining.into_iter().partition(|name| {
            deps.get(*name)
                .is_none_or(|d| d.iter().all(|dep| assigned.contains(dep.as_str())))
        });

        if ready.is_empty() {
            return Err(WorkflowError::DependencyCycle {
                members: cycle_members(&blocked, &deps),
            });
        }

        assigned.extend(ready.iter().copied());
        waves.push(ready.into_iter().map(str::to_string).collect());
        remaining = blocked;
    }

    tracing::debug!(units = order.len(), waves = waves.len(), "dependency analysis complete");

    Ok(WavePlan {
        waves,
        deps,
        order,
        chained,
    })
}

/// One unit per wave in definition order, for explicitly sequential stages.
///
/// Dependencies are still recorded so that a failed optional stage skips its
/// dependents. No cycle check: a stage referencing a later one fails to render.
pub fn plan_sequential(units: &[UnitDefinition]) -> Result<WavePlan, WorkflowError> {
    validate_units(units)?;
    let order: Vec<String> = units.iter().map(|u| u.name.clone()).collect();
    let (deps, chained) = collect_dependencies(units);
    let waves = order.iter().map(|n| vec![n.clone()]).collect();
    Ok(WavePlan {
        waves,
        deps,
        order,
        chained,
    })
}

/// Direct dependencies of every unit, keyed by unit name, plus the units
/// that read `prev_output`.
fn collect_dependencies(
    units: &[UnitDefinition],
) -> (HashMap<String, BTreeSet<String>>, HashSet<String>) {
    let names: HashSet<&str> = units.iter().map(|u| u.name.as_str()).collect();
    let mut deps = HashMap::with_capacity(units.len());
    let mut chained = HashSet::new();

    for (index, unit) in units.iter().enumerate() {
        let mut unit_deps = BTreeSet::new();
        let placeholders = match extract_placeholders(&unit.prompt_template) {
            Ok(placeholders) => placeholders,
            Err(e) => {
                // Surfaces as a render failure when the unit runs.
                tracing::debug!(unit = %unit.name, error = %e, "template not scannable");
                Vec::new()
            }
        };

        for placeholder in placeholders {
            if placeholder.key == PREV_OUTPUT_KEY {
                chained.insert(unit.name.clone());
                if let Some(prev) = index.checked_sub(1).map(|i| &units[i]) {
                    tracing::debug!(
                        unit = %unit.name,
                        predecessor = %prev.name,
                        "implicit prev_output dependency on positional predecessor"
                    );
                    unit_deps.insert(prev.name.clone());
                }
                continue;
            }
            let referenced = placeholder.unit_name();
            if names.contains(referenced) {
                unit_deps.insert(referenced.to_string());
            }
        }

        deps.insert(unit.name.clone(), unit_deps);
    }

    (deps, chained)
}

/// Names of the units that sit on a cycle among `blocked`, sorted.
///
/// Units that are only blocked because they depend on a cycle are excluded.
fn cycle_members(blocked: &[&str], deps: &HashMap<String, BTreeSet<String>>) -> Vec<String> {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: HashMap<&str, _> = blocked
        .iter()
        .map(|name| (*name, graph.add_node(*name)))
        .collect();

    for name in blocked {
        for dep in deps.get(*name).into_iter().flatten() {
            if let Some(&from) = indices.get(dep.as_str()) {
                graph.add_edge(from, indices[name], ());
            }
        }
    }

    let mut members: Vec<String> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|idx| graph[idx].to_string())
        .collect();
    members.sort();
    members
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
