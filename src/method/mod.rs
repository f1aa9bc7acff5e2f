//! Method definitions.
//!
//! A method is a directed acyclic graph of [`Step`]s. Each step names a
//! device *role* (resolved to a concrete device when a run starts), a typed
//! [`Operation`], a timeout and an optional [`Precondition`]. Dependencies
//! are explicit: a step starts only after every step in its `after` list
//! has finished. Steps with no path between them run concurrently.
//!
//! ```text
//!   set_temp ──▶ wait_stable ──▶ ┌─ dispense_a ─┐ ──▶ rinse
//!                                └─ dispense_b ─┘
//!                                 group "dispense"
//! ```
//!
//! [`MethodBuilder`] produces the common shapes: `then` appends a step after
//! the current frontier; `parallel` adds a group whose members all follow the
//! frontier and become the new frontier together.
//!
//! A built [`MethodDefinition`] has no mutating API; the engine keeps it
//! behind an `Arc` for the lifetime of each run.

mod validation;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::{Capability, DeviceCategory, Operation};
use crate::limits;

pub use validation::{validate, ValidationError};

/// Step identifier, unique within a method.
pub type StepId = String;

/// Device role name, unique within a method.
pub type RoleName = String;

// =============================================================================
// Roles
// =============================================================================

/// What a role needs from the device bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRequirement {
    /// Required category.
    pub category: DeviceCategory,
    /// Restrict binding to one `vendor/model`.
    #[serde(default)]
    pub vendor_model: Option<String>,
}

// =============================================================================
// Preconditions
// =============================================================================

/// Condition re-checked immediately before a step is dispatched.
///
/// A false condition skips the step; a condition that cannot be evaluated
/// (device error) fails it with `PreconditionFailed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Precondition {
    /// `|temperature - target| < tolerance` on a temperature controller role.
    TemperatureWithin {
        /// Role to read.
        role: RoleName,
        /// Target temperature.
        target_celsius: f64,
        /// Allowed deviation.
        tolerance_celsius: f64,
    },
    /// Line pressure strictly below a limit on a pump role.
    PressureBelow {
        /// Role to read.
        role: RoleName,
        /// Limit in bar.
        max_bar: f64,
    },
    /// Valve role currently at a port.
    ValveAt {
        /// Role to read.
        role: RoleName,
        /// Expected port.
        position: u32,
    },
}

impl Precondition {
    /// Role whose device is read.
    pub fn role(&self) -> &str {
        match self {
            Precondition::TemperatureWithin { role, .. }
            | Precondition::PressureBelow { role, .. }
            | Precondition::ValveAt { role, .. } => role,
        }
    }

    /// Read operation used to evaluate the condition.
    pub fn probe(&self) -> Operation {
        match self {
            Precondition::TemperatureWithin { .. } => Operation::ReadTemperature,
            Precondition::PressureBelow { .. } => Operation::ReadPressure,
            Precondition::ValveAt { .. } => Operation::ReadPosition,
        }
    }

    /// Capability the probe needs.
    pub fn capability(&self) -> Capability {
        self.probe().capability()
    }

    /// Evaluate against a probe reading.
    pub fn holds(&self, value: f64) -> bool {
        match self {
            Precondition::TemperatureWithin {
                target_celsius,
                tolerance_celsius,
                ..
            } => (value - target_celsius).abs() < *tolerance_celsius,
            Precondition::PressureBelow { max_bar, .. } => value < *max_bar,
            Precondition::ValveAt { position, .. } => (value - f64::from(*position)).abs() < 0.5,
        }
    }
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precondition::TemperatureWithin {
                role,
                target_celsius,
                tolerance_celsius,
            } => write!(f, "|{role}.temperature - {target_celsius}| < {tolerance_celsius}"),
            Precondition::PressureBelow { role, max_bar } => {
                write!(f, "{role}.pressure < {max_bar} bar")
            }
            Precondition::ValveAt { role, position } => write!(f, "{role}.position == {position}"),
        }
    }
}

// =============================================================================
// Policies
// =============================================================================

/// What a step does when one of its dependencies was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Treat the skipped dependency as satisfied.
    #[default]
    Proceed,
    /// Fail with `PreconditionFailed`.
    Fail,
}

/// Run-level reaction to a failed step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort every pending step, cancel in-flight siblings, idle all devices.
    #[default]
    AbortOnFailure,
    /// Fail the step and everything depending on it; let other branches run.
    ContinueOnFailure,
    /// Retry the failed step with exponential backoff, then abort.
    RetryThenAbort {
        /// Additional attempts after the first failure.
        max_retries: u32,
        /// Delay before the first retry; doubled on each further retry.
        #[serde(default = "default_backoff", with = "humantime_serde")]
        backoff: Duration,
    },
}

fn default_backoff() -> Duration {
    limits::RETRY_INITIAL_BACKOFF
}

impl FailurePolicy {
    /// Retries allowed per step.
    pub fn max_retries(&self) -> u32 {
        match self {
            FailurePolicy::RetryThenAbort { max_retries, .. } => *max_retries,
            _ => 0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        match self {
            FailurePolicy::RetryThenAbort { backoff, .. } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                backoff.saturating_mul(factor)
            }
            _ => Duration::ZERO,
        }
    }

    /// Whether a failure ends the run.
    pub fn aborts_on_failure(&self) -> bool {
        !matches!(self, FailurePolicy::ContinueOnFailure)
    }
}

// =============================================================================
// Steps
// =============================================================================

/// One unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, unique in the method.
    pub id: StepId,
    /// Device role performing the operation.
    pub role: RoleName,
    /// Operation and parameters.
    pub operation: Operation,
    /// Step timeout; the method default applies when unset.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Condition checked right before dispatch.
    #[serde(default)]
    pub precondition: Option<Precondition>,
    /// Steps that must finish first.
    #[serde(default)]
    pub after: Vec<StepId>,
    /// Reaction to a skipped dependency.
    #[serde(default)]
    pub on_skipped_dependency: SkipPolicy,
    /// Wait after successful completion before dependents may start.
    #[serde(default, with = "humantime_serde")]
    pub dwell: Option<Duration>,
}

impl Step {
    /// New step with no dependencies.
    pub fn new(id: impl Into<StepId>, role: impl Into<RoleName>, operation: Operation) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            operation,
            timeout: None,
            precondition: None,
            after: Vec::new(),
            on_skipped_dependency: SkipPolicy::default(),
            dwell: None,
        }
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the precondition.
    pub fn precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    /// Add an explicit dependency.
    pub fn after(mut self, step: impl Into<StepId>) -> Self {
        self.after.push(step.into());
        self
    }

    /// Fail instead of proceeding when a dependency was skipped.
    pub fn fail_if_dependency_skipped(mut self) -> Self {
        self.on_skipped_dependency = SkipPolicy::Fail;
        self
    }

    /// Wait after completion.
    pub fn dwell(mut self, dwell: Duration) -> Self {
        self.dwell = Some(dwell);
        self
    }
}

/// Named set of sibling steps that complete together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    /// Group name.
    pub name: String,
    /// Member step ids.
    pub members: Vec<StepId>,
}

// =============================================================================
// Definition
// =============================================================================

/// Immutable experiment procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDefinition {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    roles: BTreeMap<RoleName, RoleRequirement>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    groups: Vec<ParallelGroup>,
    #[serde(default)]
    failure_policy: FailurePolicy,
    #[serde(default, with = "humantime_serde")]
    default_step_timeout: Option<Duration>,
}

impl MethodDefinition {
    /// Start building a method.
    pub fn builder(name: impl Into<String>) -> MethodBuilder {
        MethodBuilder::new(name)
    }

    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-form description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Declared roles.
    pub fn roles(&self) -> &BTreeMap<RoleName, RoleRequirement> {
        &self.roles
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Parallel groups.
    pub fn groups(&self) -> &[ParallelGroup] {
        &self.groups
    }

    /// Failure policy.
    pub fn failure_policy(&self) -> &FailurePolicy {
        &self.failure_policy
    }

    /// Timeout used by steps that do not declare one.
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout
    }

    /// Static checks; an empty list means the method may be submitted.
    pub fn validate(&self) -> Vec<ValidationError> {
        validate(self)
    }

    /// Direct dependents of each step.
    pub fn dependents(&self) -> HashMap<&str, Vec<&str>> {
        let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            map.entry(step.id.as_str()).or_default();
            for dep in &step.after {
                map.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }
        map
    }

    /// Roles actually referenced by steps or preconditions.
    pub fn referenced_roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self
            .steps
            .iter()
            .flat_map(|s| {
                std::iter::once(s.role.as_str())
                    .chain(s.precondition.as_ref().map(Precondition::role))
            })
            .collect();
        roles.sort_unstable();
        roles.dedup();
        roles
    }
}

/// Builder for [`MethodDefinition`].
#[derive(Debug, Clone)]
pub struct MethodBuilder {
    def: MethodDefinition,
    frontier: Vec<StepId>,
}

impl MethodBuilder {
    /// New empty method.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: MethodDefinition {
                name: name.into(),
                description: None,
                roles: BTreeMap::new(),
                steps: Vec::new(),
                groups: Vec::new(),
                failure_policy: FailurePolicy::default(),
                default_step_timeout: None,
            },
            frontier: Vec::new(),
        }
    }

    /// Describe the method.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.def.description = Some(description.into());
        self
    }

    /// Declare a role of a category.
    pub fn role(mut self, name: impl Into<RoleName>, category: DeviceCategory) -> Self {
        self.def.roles.insert(
            name.into(),
            RoleRequirement {
                category,
                vendor_model: None,
            },
        );
        self
    }

    /// Declare a role restricted to one `vendor/model`.
    pub fn role_model(
        mut self,
        name: impl Into<RoleName>,
        category: DeviceCategory,
        vendor_model: impl Into<String>,
    ) -> Self {
        self.def.roles.insert(
            name.into(),
            RoleRequirement {
                category,
                vendor_model: Some(vendor_model.into()),
            },
        );
        self
    }

    /// Append a step after everything in the current frontier.
    pub fn then(mut self, mut step: Step) -> Self {
        for dep in &self.frontier {
            if !step.after.contains(dep) {
                step.after.push(dep.clone());
            }
        }
        self.frontier = vec![step.id.clone()];
        self.def.steps.push(step);
        self
    }

    /// Append a parallel group after the current frontier.
    pub fn parallel(mut self, name: impl Into<String>, steps: impl IntoIterator<Item = Step>) -> Self {
        let mut members = Vec::new();
        for mut step in steps {
            for dep in &self.frontier {
                if !step.after.contains(dep) {
                    step.after.push(dep.clone());
                }
            }
            members.push(step.id.clone());
            self.def.steps.push(step);
        }
        self.def.groups.push(ParallelGroup {
            name: name.into(),
            members: members.clone(),
        });
        self.frontier = members;
        self
    }

    /// Add a step with only its own explicit dependencies. The frontier is
    /// left unchanged.
    pub fn add(mut self, step: Step) -> Self {
        self.def.steps.push(step);
        self
    }

    /// Set the failure policy.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.def.failure_policy = policy;
        self
    }

    /// Set the default step timeout.
    pub fn default_step_timeout(mut self, timeout: Duration) -> Self {
        self.def.default_step_timeout = Some(timeout);
        self
    }

    /// Finish. Call [`MethodDefinition::validate`] before submitting.
    pub fn build(self) -> MethodDefinition {
        self.def
    }
}
