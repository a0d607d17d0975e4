//! Arena representation of a pipeline: steps in declaration order, dependency
//! edges as index pairs.
//!
//! [`PipelineGraph::build`] never fails on a malformed definition; it records
//! what it could not resolve so that validation can report every problem at
//! once. [`PipelineGraph::from_definition`] is the checked entry point.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use grantops_types::{ActionKind, Result, TargetRef};

use crate::condition::{parse_condition, ConditionExpr};
use crate::definition::{PipelineDefinition, PipelineOptions, RetrySpec};
use crate::validation::validate_or_raise;

/// Index of a step in declaration order.
pub type StepId = usize;

#[derive(Debug, Clone)]
pub struct StepNode {
    pub id: StepId,
    pub name: String,
    pub description: Option<String>,
    pub action: ActionKind,
    pub target: TargetRef,
    pub condition_source: Option<String>,
    /// Parsed condition; `None` when absent or unparsable.
    pub condition: Option<ConditionExpr>,
    pub continue_on_failure: bool,
    pub retry: Option<RetrySpec>,
    pub timeout: Option<Duration>,
    /// Steps this one waits for.
    pub deps: Vec<StepId>,
    /// Steps waiting for this one.
    pub dependents: Vec<StepId>,
    /// `true` when `deps` came from declaration order rather than `depends_on`.
    pub implicit_deps: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub name: String,
    pub description: Option<String>,
    pub options: PipelineOptions,
    fingerprint: String,
    nodes: Vec<StepNode>,
    index: HashMap<String, StepId>,
    /// `(dependency, dependent)` pairs.
    edges: Vec<(StepId, StepId)>,
    /// `depends_on` names that match no step, with the step naming them.
    unresolved: Vec<(StepId, String)>,
}

impl PipelineGraph {
    /// Build the arena without validating it.
    pub fn build(def: &PipelineDefinition) -> Result<Self> {
        let fingerprint = def.fingerprint()?;

        let mut index = HashMap::new();
        for (id, step) in def.steps.iter().enumerate() {
            // First declaration wins; duplicates are a validation error.
            index.entry(step.name.clone()).or_insert(id);
        }

        let mut nodes: Vec<StepNode> = Vec::with_capacity(def.steps.len());
        let mut edges = Vec::new();
        let mut unresolved = Vec::new();

        for (id, step) in def.steps.iter().enumerate() {
            let (deps, implicit_deps) = match &step.depends_on {
                Some(names) => {
                    let mut deps = Vec::new();
                    for name in names {
                        match index.get(name) {
                            Some(&dep) if !deps.contains(&dep) => deps.push(dep),
                            Some(_) => {}
                            None => unresolved.push((id, name.clone())),
                        }
                    }
                    (deps, false)
                }
                None if !def.options.parallel && id > 0 => (vec![id - 1], true),
                None => (Vec::new(), true),
            };
            for &dep in &deps {
                edges.push((dep, id));
            }

            nodes.push(StepNode {
                id,
                name: step.name.clone(),
                description: step.description.clone(),
                action: step.action,
                target: step.target.clone(),
                condition_source: step.condition.clone(),
                condition: step
                    .condition
                    .as_deref()
                    .and_then(|c| parse_condition(c).ok()),
                continue_on_failure: step.continue_on_failure,
                retry: step.retry.clone(),
                timeout: step.timeout,
                deps,
                dependents: Vec::new(),
                implicit_deps,
            });
        }

        for &(dep, dependent) in &edges {
            nodes[dep].dependents.push(dependent);
        }

        Ok(Self {
            name: def.name.clone(),
            description: def.description.clone(),
            options: def.options.clone(),
            fingerprint,
            nodes,
            index,
            edges,
            unresolved,
        })
    }

    /// Build and validate; fails with every violation found.
    pub fn from_definition(def: &PipelineDefinition) -> Result<Self> {
        let graph = Self::build(def)?;
        let warnings = validate_or_raise(&graph)?;
        for w in &warnings {
            tracing::warn!(pipeline = %graph.name, rule = %w.rule, "{}", w.message);
        }
        Ok(graph)
    }

    pub fn from_yaml(source: &str) -> Result<Self> {
        Self::from_definition(&PipelineDefinition::from_yaml(source)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_definition(&PipelineDefinition::load(path)?)
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[StepNode] {
        &self.nodes
    }

    pub fn node(&self, id: StepId) -> &StepNode {
        &self.nodes[id]
    }

    pub fn find(&self, name: &str) -> Option<&StepNode> {
        self.index.get(name).map(|&id| &self.nodes[id])
    }

    pub fn edges(&self) -> &[(StepId, StepId)] {
        &self.edges
    }

    pub fn unresolved(&self) -> &[(StepId, String)] {
        &self.unresolved
    }

    /// Kahn's algorithm. `Err` carries the steps left on or behind a cycle.
    pub fn topological_order(&self) -> std::result::Result<Vec<StepId>, Vec<StepId>> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.deps.len()).collect();
        let mut queue: VecDeque<StepId> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(id, _)| id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            for &next in &self.nodes[id].dependents {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() == self.nodes.len() {
            Ok(order)
        } else {
            Err((0..self.nodes.len()).filter(|&id| in_degree[id] > 0).collect())
        }
    }

    /// Transitive dependencies of a step.
    pub fn upstream(&self, id: StepId) -> HashSet<StepId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<StepId> = self.nodes[id].deps.clone();
        while let Some(next) = stack.pop() {
            if seen.insert(next) {
                stack.extend(self.nodes[next].deps.iter().copied());
            }
        }
        seen
    }

    /// Every section a run of this pipeline reads or writes: step targets plus
    /// sections named in conditions.
    pub fn referenced_sections(&self) -> BTreeSet<String> {
        let mut sections = BTreeSet::new();
        for node in &self.nodes {
            if let Some(id) = node.target.section() {
                sections.insert(id.to_string());
            }
            if let Some(cond) = &node.condition {
                sections.extend(cond.named_sections().into_iter().map(String::from));
            }
        }
        sections
    }
}
