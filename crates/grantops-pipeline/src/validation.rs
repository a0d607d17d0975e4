//! Pipeline validation: lint rules and diagnostics.
//!
//! Every rule runs on every graph, so a broken definition reports all of its
//! problems together. Call [`validate`] for the full diagnostic list or
//! [`validate_or_raise`] to turn errors into [`GrantOpsError::Validation`].

use std::collections::HashMap;

use grantops_types::{GrantOpsError, Result, Violation, ViolationKind};
use grantops_versions::validate_section_id;

use crate::condition::{check_references, parse_condition};
use crate::graph::PipelineGraph;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    /// Set for `Error` diagnostics.
    pub kind: Option<ViolationKind>,
    pub message: String,
    pub step: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    fn error(rule: &str, kind: ViolationKind, step: Option<&str>, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            kind: Some(kind),
            message,
            step: step.map(String::from),
        }
    }

    fn warning(rule: &str, step: Option<&str>, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Warning,
            kind: None,
            message,
            step: step.map(String::from),
        }
    }

    fn to_violation(&self) -> Option<Violation> {
        Some(Violation {
            kind: self.kind?,
            step: self.step.clone(),
            message: self.message.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct DuplicateNameRule;
impl LintRule for DuplicateNameRule {
    fn name(&self) -> &str {
        "duplicate_name"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for node in graph.nodes() {
            *counts.entry(node.name.as_str()).or_default() += 1;
        }
        let mut reported = Vec::new();
        graph
            .nodes()
            .iter()
            .filter(|n| counts[n.name.as_str()] > 1)
            .filter(|n| {
                if reported.contains(&n.name.as_str()) {
                    return false;
                }
                reported.push(n.name.as_str());
                true
            })
            .map(|n| {
                Diagnostic::error(
                    self.name(),
                    ViolationKind::DuplicateName,
                    Some(&n.name),
                    format!("step name is declared {} times", counts[n.name.as_str()]),
                )
            })
            .collect()
    }
}

struct DependencyExistsRule;
impl LintRule for DependencyExistsRule {
    fn name(&self) -> &str {
        "dependency_exists"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .unresolved()
            .iter()
            .map(|(id, missing)| {
                Diagnostic::error(
                    self.name(),
                    ViolationKind::UnknownReference,
                    Some(&graph.node(*id).name),
                    format!("depends_on names unknown step '{missing}'"),
                )
            })
            .collect()
    }
}

struct AcyclicRule;
impl LintRule for AcyclicRule {
    fn name(&self) -> &str {
        "acyclic"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        match graph.topological_order() {
            Ok(_) => vec![],
            Err(stuck) => {
                let names: Vec<&str> = stuck.iter().map(|&id| graph.node(id).name.as_str()).collect();
                vec![Diagnostic::error(
                    self.name(),
                    ViolationKind::Cycle,
                    None,
                    format!("dependency cycle among steps: {}", names.join(", ")),
                )]
            }
        }
    }
}

struct ConditionRule;
impl LintRule for ConditionRule {
    fn name(&self) -> &str {
        "condition"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for node in graph.nodes() {
            let Some(source) = node.condition_source.as_deref() else {
                continue;
            };
            let errors = match parse_condition(source) {
                Ok(expr) => check_references(&expr, node.target.section().is_some(), |step| {
                    graph.find(step).is_some()
                }),
                Err(e) => vec![e],
            };
            for e in errors {
                let kind = if e.is_unknown_reference() {
                    ViolationKind::UnknownReference
                } else {
                    ViolationKind::InvalidCondition
                };
                diagnostics.push(Diagnostic::error(
                    self.name(),
                    kind,
                    Some(&node.name),
                    format!("condition '{source}': {e}"),
                ));
            }
        }
        diagnostics
    }
}

struct OptionsRule;
impl LintRule for OptionsRule {
    fn name(&self) -> &str {
        "options"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        let invalid = |step: Option<&str>, message: String| {
            Diagnostic::error(self.name(), ViolationKind::InvalidOption, step, message)
        };

        if graph.name.trim().is_empty() {
            diagnostics.push(invalid(None, "pipeline name is empty".into()));
        }
        if graph.options.max_concurrency == 0 {
            diagnostics.push(invalid(None, "max_concurrency must be at least 1".into()));
        }
        for node in graph.nodes() {
            let step = Some(node.name.as_str());
            if node.name.trim().is_empty() {
                diagnostics.push(invalid(step, "step name is empty".into()));
            }
            if let Some(section) = node.target.section() {
                if validate_section_id(section).is_err() {
                    diagnostics.push(invalid(step, format!("invalid target section id '{section}'")));
                }
            }
            if node.timeout.is_some_and(|t| t.is_zero()) {
                diagnostics.push(invalid(step, "timeout must be greater than zero".into()));
            }
        }
        diagnostics
    }
}

/// A condition reading a step that is not upstream sees whatever state that
/// step happens to be in when the condition is evaluated.
struct ConditionUpstreamRule;
impl LintRule for ConditionUpstreamRule {
    fn name(&self) -> &str {
        "condition_upstream"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for node in graph.nodes() {
            let Some(cond) = &node.condition else {
                continue;
            };
            let upstream = graph.upstream(node.id);
            for step in cond.referenced_steps() {
                if let Some(other) = graph.find(step) {
                    if !upstream.contains(&other.id) {
                        diagnostics.push(Diagnostic::warning(
                            self.name(),
                            Some(&node.name),
                            format!("condition reads step '{step}', which is not a dependency"),
                        ));
                    }
                }
            }
        }
        diagnostics
    }
}

struct ContinueWithoutDepsRule;
impl LintRule for ContinueWithoutDepsRule {
    fn name(&self) -> &str {
        "continue_without_deps"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .filter(|n| n.continue_on_failure && n.deps.is_empty())
            .map(|n| {
                Diagnostic::warning(
                    self.name(),
                    Some(&n.name),
                    "continue_on_failure has no effect on a step without dependencies".into(),
                )
            })
            .collect()
    }
}

struct EmptyPipelineRule;
impl LintRule for EmptyPipelineRule {
    fn name(&self) -> &str {
        "empty_pipeline"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        if graph.is_empty() {
            vec![Diagnostic::warning(
                self.name(),
                None,
                "pipeline declares no steps".into(),
            )]
        } else {
            vec![]
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &PipelineGraph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(DuplicateNameRule),
        Box::new(DependencyExistsRule),
        Box::new(AcyclicRule),
        Box::new(ConditionRule),
        Box::new(OptionsRule),
        Box::new(ConditionUpstreamRule),
        Box::new(ContinueWithoutDepsRule),
        Box::new(EmptyPipelineRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all lint rules; fail with every `Error` diagnostic, otherwise return
/// the warnings.
pub fn validate_or_raise(graph: &PipelineGraph) -> Result<Vec<Diagnostic>> {
    let (errors, warnings): (Vec<_>, Vec<_>) = validate(graph)
        .into_iter()
        .partition(|d| d.severity == Severity::Error);
    if !errors.is_empty() {
        return Err(GrantOpsError::Validation {
            violations: errors.iter().filter_map(Diagnostic::to_violation).collect(),
        });
    }
    Ok(warnings)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
