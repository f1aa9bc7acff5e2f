//! Static method checks run before a method may be submitted.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{FailurePolicy, MethodDefinition, StepId};
use crate::device::{Capability, DeviceCategory};

/// One problem found in a method definition.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ValidationError {
    #[error("method has no steps")]
    Empty,

    #[error("step id must not be empty")]
    EmptyStepId,

    #[error("step '{step}' is declared more than once")]
    DuplicateStep { step: StepId },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("dependency cycle through steps {}", .steps.join(" -> "))]
    Cycle { steps: Vec<StepId> },

    #[error("step '{step}' uses undeclared role '{role}'")]
    UndeclaredRole { step: StepId, role: String },

    #[error("step '{step}' needs {capability}, which {category} role '{role}' cannot provide")]
    CapabilityMismatch {
        step: StepId,
        role: String,
        capability: Capability,
        category: DeviceCategory,
    },

    #[error("step '{step}' has invalid parameters: {reason}")]
    InvalidParameter { step: StepId, reason: String },

    #[error("step '{step}' has a zero timeout")]
    ZeroTimeout { step: StepId },

    #[error("group '{group}' is declared more than once")]
    DuplicateGroup { group: String },

    #[error("group '{group}' has no members")]
    EmptyGroup { group: String },

    #[error("group '{group}' lists unknown step '{step}'")]
    UnknownGroupMember { group: String, step: StepId },

    #[error("group '{group}' members '{first}' and '{second}' are ordered by a dependency")]
    OrderedGroupMembers {
        group: String,
        first: StepId,
        second: StepId,
    },

    #[error("retry policy needs at least one retry")]
    NoRetries,
}

/// Check a method. Returns every problem found, in a stable order.
pub fn validate(method: &MethodDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if method.steps.is_empty() {
        errors.push(ValidationError::Empty);
    }

    let mut seen = HashSet::new();
    for step in &method.steps {
        if step.id.is_empty() {
            errors.push(ValidationError::EmptyStepId);
        } else if !seen.insert(step.id.as_str()) {
            errors.push(ValidationError::DuplicateStep {
                step: step.id.clone(),
            });
        }
    }

    for step in &method.steps {
        for dep in &step.after {
            if !seen.contains(dep.as_str()) {
                errors.push(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        check_role(method, &step.id, &step.role, step.operation.capability(), &mut errors);
        if let Some(pre) = &step.precondition {
            check_role(method, &step.id, pre.role(), pre.capability(), &mut errors);
        }

        if let Err(reason) = step.operation.check_parameters() {
            errors.push(ValidationError::InvalidParameter {
                step: step.id.clone(),
                reason,
            });
        }
        if step.timeout.is_some_and(|t| t.is_zero()) {
            errors.push(ValidationError::ZeroTimeout {
                step: step.id.clone(),
            });
        }
    }

    let graph = Graph::new(method);
    if let Some(cycle) = graph.find_cycle() {
        errors.push(ValidationError::Cycle { steps: cycle });
    } else {
        check_groups(method, &graph, &seen, &mut errors);
    }

    if let FailurePolicy::RetryThenAbort { max_retries: 0, .. } = method.failure_policy {
        errors.push(ValidationError::NoRetries);
    }

    errors
}

fn check_role(
    method: &MethodDefinition,
    step: &str,
    role: &str,
    capability: Capability,
    errors: &mut Vec<ValidationError>,
) {
    match method.roles.get(role) {
        None => errors.push(ValidationError::UndeclaredRole {
            step: step.to_string(),
            role: role.to_string(),
        }),
        Some(req) if capability.category() != req.category => {
            errors.push(ValidationError::CapabilityMismatch {
                step: step.to_string(),
                role: role.to_string(),
                capability,
                category: req.category,
            })
        }
        Some(_) => {}
    }
}

fn check_groups(
    method: &MethodDefinition,
    graph: &Graph<'_>,
    steps: &HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let mut names = HashSet::new();
    for group in &method.groups {
        if !names.insert(group.name.as_str()) {
            errors.push(ValidationError::DuplicateGroup {
                group: group.name.clone(),
            });
        }
        if group.members.is_empty() {
            errors.push(ValidationError::EmptyGroup {
                group: group.name.clone(),
            });
        }
        for member in &group.members {
            if !steps.contains(member.as_str()) {
                errors.push(ValidationError::UnknownGroupMember {
                    group: group.name.clone(),
                    step: member.clone(),
                });
            }
        }
        for (i, first) in group.members.iter().enumerate() {
            for second in &group.members[i + 1..] {
                if graph.reaches(first, second) || graph.reaches(second, first) {
                    errors.push(ValidationError::OrderedGroupMembers {
                        group: group.name.clone(),
                        first: first.clone(),
                        second: second.clone(),
                    });
                }
            }
        }
    }
}

/// Dependency edges `dep -> step` over known steps only.
struct Graph<'a> {
    nodes: Vec<&'a str>,
    edges: BTreeMap<&'a str, Vec<&'a str>>,
}

impl<'a> Graph<'a> {
    fn new(method: &'a MethodDefinition) -> Self {
        let mut nodes = Vec::new();
        let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for step in &method.steps {
            if edges.contains_key(step.id.as_str()) {
                continue;
            }
            nodes.push(step.id.as_str());
            edges.insert(step.id.as_str(), Vec::new());
        }
        for step in &method.steps {
            for dep in &step.after {
                if let Some(out) = edges.get_mut(dep.as_str()) {
                    if !out.contains(&step.id.as_str()) {
                        out.push(step.id.as_str());
                    }
                }
            }
        }
        Self { nodes, edges }
    }

    /// Kahn's algorithm; whatever cannot be ordered is reported as a cycle.
    fn find_cycle(&self) -> Option<Vec<StepId>> {
        let mut indegree: HashMap<&str, usize> = self.nodes.iter().map(|n| (*n, 0)).collect();
        for targets in self.edges.values() {
            for target in targets {
                if let Some(d) = indegree.get_mut(target) {
                    *d += 1;
                }
            }
        }
        let mut ready: VecDeque<&str> = self
            .nodes
            .iter()
            .copied()
            .filter(|n| indegree[n] == 0)
            .collect();
        let mut ordered = 0;
        while let Some(node) = ready.pop_front() {
            ordered += 1;
            for target in &self.edges[node] {
                if let Some(d) = indegree.get_mut(target) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(*target);
                    }
                }
            }
        }
        if ordered == self.nodes.len() {
            return None;
        }
        Some(
            self.nodes
                .iter()
                .filter(|n| indegree[*n] > 0)
                .map(|n| n.to_string())
                .collect(),
        )
    }

    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            if let Some(targets) = self.edges.get(node) {
                for target in targets {
                    if *target == to {
                        return true;
                    }
                    stack.push(*target);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::Operation;
    use crate::method::Step;

    fn heat(id: &str) -> Step {
        Step::new(id, "heater", Operation::SetSetpoint { celsius: 40.0 })
    }

    fn base() -> crate::method::MethodBuilder {
        MethodDefinition::builder("m")
            .role("heater", DeviceCategory::TemperatureController)
            .role("pump", DeviceCategory::Pump)
    }

    #[test]
    fn accepts_well_formed_method() {
        let method = base()
            .then(heat("a"))
            .parallel(
                "both",
                [
                    heat("b"),
                    Step::new("c", "pump", Operation::StopFlow).timeout(Duration::from_secs(5)),
                ],
            )
            .build();
        assert_eq!(validate(&method), vec![]);
    }

    #[test]
    fn rejects_empty_method() {
        assert_eq!(validate(&base().build()), vec![ValidationError::Empty]);
    }

    #[test]
    fn reports_cycles() {
        let method = base()
            .add(heat("a").after("c"))
            .add(heat("b").after("a"))
            .add(heat("c").after("b"))
            .add(heat("free"))
            .build();
        let errors = validate(&method);
        assert_eq!(
            errors,
            vec![ValidationError::Cycle {
                steps: vec!["a".into(), "b".into(), "c".into()]
            }]
        );
    }

    #[test]
    fn reports_unknown_dependencies_and_duplicates() {
        let method = base().add(heat("a").after("ghost")).add(heat("a")).build();
        let errors = validate(&method);
        assert!(errors.contains(&ValidationError::DuplicateStep { step: "a".into() }));
        assert!(errors.contains(&ValidationError::UnknownDependency {
            step: "a".into(),
            dependency: "ghost".into()
        }));
    }

    #[test]
    fn reports_role_problems() {
        let method = base()
            .then(Step::new("dispense", "heater", Operation::StopFlow))
            .then(Step::new("x", "gantry", Operation::HomeAxes))
            .build();
        let errors = validate(&method);
        assert!(errors.contains(&ValidationError::CapabilityMismatch {
            step: "dispense".into(),
            role: "heater".into(),
            capability: Capability::StopFlow,
            category: DeviceCategory::TemperatureController,
        }));
        assert!(errors.contains(&ValidationError::UndeclaredRole {
            step: "x".into(),
            role: "gantry".into()
        }));
    }

    #[test]
    fn reports_bad_parameters_and_timeouts() {
        let method = base()
            .then(
                Step::new(
                    "d",
                    "pump",
                    Operation::Dispense {
                        volume_ul: -1.0,
                        ul_per_min: 100.0,
                    },
                )
                .timeout(Duration::ZERO),
            )
            .build();
        let errors = validate(&method);
        assert!(matches!(errors[0], ValidationError::InvalidParameter { .. }));
        assert_eq!(errors[1], ValidationError::ZeroTimeout { step: "d".into() });
    }

    #[test]
    fn group_members_must_be_unordered() {
        let method = base()
            .add(heat("a"))
            .add(heat("b").after("a"))
            .build();
        let mut method = method;
        method.groups.push(crate::method::ParallelGroup {
            name: "g".into(),
            members: vec!["a".into(), "b".into(), "zz".into()],
        });
        let errors = validate(&method);
        assert!(errors.contains(&ValidationError::OrderedGroupMembers {
            group: "g".into(),
            first: "a".into(),
            second: "b".into()
        }));
        assert!(errors.contains(&ValidationError::UnknownGroupMember {
            group: "g".into(),
            step: "zz".into()
        }));
    }

    #[test]
    fn retry_policy_needs_retries() {
        let method = base()
            .then(heat("a"))
            .failure_policy(FailurePolicy::RetryThenAbort {
                max_retries: 0,
                backoff: Duration::from_millis(10),
            })
            .build();
        assert_eq!(validate(&method), vec![ValidationError::NoRetries]);
    }
}
