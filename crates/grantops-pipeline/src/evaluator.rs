//! Computes, for one scheduling tick, which pending steps may run now and
//! which must be skipped without running.

use std::collections::HashMap;

use grantops_types::StepStatus;
use grantops_versions::SectionSnapshot;

use crate::condition::{evaluate_condition, ConditionScope};
use crate::graph::{PipelineGraph, StepId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipDecision {
    pub step: StepId,
    pub reason: String,
}

/// Result of one evaluation. `skipped` is ordered so that applying it front
/// to back never skips a step before the dependency that caused it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub ready: Vec<StepId>,
    pub skipped: Vec<SkipDecision>,
}

enum Dependencies {
    Satisfied,
    Waiting,
    /// A dependency ended in a status this step cannot accept.
    Blocked,
    /// Strict mode: a required dependency was skipped.
    Cascade(String),
}

pub struct Evaluator<'g> {
    graph: &'g PipelineGraph,
}

impl<'g> Evaluator<'g> {
    pub fn new(graph: &'g PipelineGraph) -> Self {
        Self { graph }
    }

    fn dependencies(&self, id: StepId, statuses: &[StepStatus]) -> Dependencies {
        let node = self.graph.node(id);
        let strict = self.graph.options.strict_dependencies;
        let mut waiting = false;
        for &dep in &node.deps {
            match statuses[dep] {
                StepStatus::Success => {}
                StepStatus::Skipped if !strict || node.continue_on_failure => {}
                StepStatus::Skipped => {
                    return Dependencies::Cascade(format!(
                        "dependency '{}' was skipped",
                        self.graph.node(dep).name
                    ))
                }
                StepStatus::Failed | StepStatus::Aborted if node.continue_on_failure => {}
                StepStatus::Failed | StepStatus::Aborted => return Dependencies::Blocked,
                StepStatus::Pending | StepStatus::Running => waiting = true,
            }
        }
        if waiting {
            Dependencies::Waiting
        } else {
            Dependencies::Satisfied
        }
    }

    /// Decide the ready set for the given step statuses and section snapshots.
    ///
    /// Skips are applied to a private copy of `statuses` until nothing
    /// changes, so a skip that unblocks (or cascades to) a dependent is
    /// resolved within the same evaluation.
    pub fn evaluate(
        &self,
        statuses: &[StepStatus],
        sections: &HashMap<String, SectionSnapshot>,
    ) -> Evaluation {
        let mut statuses = statuses.to_vec();
        let mut step_map: HashMap<String, StepStatus> = self
            .graph
            .nodes()
            .iter()
            .map(|n| (n.name.clone(), statuses[n.id]))
            .collect();
        let mut skipped = Vec::new();

        loop {
            let mut changed = false;
            let mut ready = Vec::new();

            for node in self.graph.nodes() {
                if statuses[node.id] != StepStatus::Pending {
                    continue;
                }
                let skip_reason = match self.dependencies(node.id, &statuses) {
                    Dependencies::Waiting | Dependencies::Blocked => continue,
                    Dependencies::Cascade(reason) => Some(reason),
                    Dependencies::Satisfied => match &node.condition {
                        Some(cond) => {
                            let fallback;
                            let target = match node.target.section() {
                                Some(id) => Some(match sections.get(id) {
                                    Some(snapshot) => snapshot,
                                    None => {
                                        fallback = SectionSnapshot::missing(id);
                                        &fallback
                                    }
                                }),
                                None => None,
                            };
                            let scope = ConditionScope {
                                target,
                                sections,
                                steps: &step_map,
                            };
                            (!evaluate_condition(cond, &scope)).then(|| {
                                format!(
                                    "condition '{}' is false",
                                    node.condition_source.as_deref().unwrap_or_default()
                                )
                            })
                        }
                        None => None,
                    },
                };

                match skip_reason {
                    Some(reason) => {
                        statuses[node.id] = StepStatus::Skipped;
                        step_map.insert(node.name.clone(), StepStatus::Skipped);
                        skipped.push(SkipDecision {
                            step: node.id,
                            reason,
                        });
                        changed = true;
                    }
                    None => ready.push(node.id),
                }
            }

            if !changed {
                return Evaluation { ready, skipped };
            }
        }
    }

    /// Pending steps that can never run in this generation because a
    /// dependency failed or was aborted, directly or transitively.
    pub fn blocked_steps(&self, statuses: &[StepStatus]) -> Vec<StepId> {
        let order = self
            .graph
            .topological_order()
            .unwrap_or_else(|_| (0..self.graph.len()).collect());
        let mut blocked = vec![false; self.graph.len()];
        for id in order {
            if statuses[id] != StepStatus::Pending {
                continue;
            }
            let node = self.graph.node(id);
            blocked[id] = node.deps.iter().any(|&dep| {
                blocked[dep]
                    || (!node.continue_on_failure
                        && matches!(statuses[dep], StepStatus::Failed | StepStatus::Aborted))
            });
        }
        (0..self.graph.len()).filter(|&id| blocked[id]).collect()
    }
}
