//! Safety rules, the interlock and the monitor task.
//!
//! Rules are loaded once at startup into an immutable [`SafetyRuleSet`]. The
//! [`SafetyMonitor`] evaluates them against every telemetry event on the bus.
//! An `EmergencyStopAll` trip latches the [`Interlock`], which the engine
//! consults before accepting a submission.

mod monitor;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bus::Telemetry;
use crate::device::{DeviceCategory, DeviceId};
use crate::engine::RunId;
use crate::error::{LabError, LabResult};

pub use monitor::{Evaluator, SafetyMonitor, Trip};

/// Reaction to a tripped rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAction {
    /// Log and publish only.
    Warn,
    /// Pause every run bound to the tripping device.
    PauseRun,
    /// Abort every run bound to the tripping device.
    AbortRun,
    /// Abort every run, stop every device, latch the interlock.
    EmergencyStopAll,
}

impl fmt::Display for SafetyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyAction::Warn => "warn",
            SafetyAction::PauseRun => "pause_run",
            SafetyAction::AbortRun => "abort_run",
            SafetyAction::EmergencyStopAll => "emergency_stop_all",
        };
        f.write_str(s)
    }
}

/// Condition on a telemetry value that counts as a violation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// `value > limit`.
    Above(f64),
    /// `value < limit`.
    Below(f64),
    /// `value < low || value > high`.
    Outside {
        /// Lower bound of the allowed band.
        low: f64,
        /// Upper bound of the allowed band.
        high: f64,
    },
}

impl Predicate {
    /// Whether `value` violates the predicate. NaN always does.
    pub fn violated(&self, value: f64) -> bool {
        if value.is_nan() {
            return true;
        }
        match *self {
            Predicate::Above(limit) => value > limit,
            Predicate::Below(limit) => value < limit,
            Predicate::Outside { low, high } => value < low || value > high,
        }
    }
}

/// Devices a rule applies to. Empty scope matches every device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleScope {
    /// Restrict to a category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<DeviceCategory>,
    /// Restrict to one device instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
}

impl RuleScope {
    /// Whether the scope covers the telemetry source.
    pub fn matches(&self, telemetry: &Telemetry) -> bool {
        self.category.map_or(true, |c| c == telemetry.category)
            && self
                .device_id
                .as_deref()
                .map_or(true, |id| id == telemetry.device_id)
    }
}

/// Telemetry condition with an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRule {
    /// Unique rule name.
    pub name: String,
    /// Devices covered.
    #[serde(flatten)]
    pub scope: RuleScope,
    /// Telemetry field, e.g. `"temperature"`.
    pub field: String,
    /// Violation condition.
    pub when: Predicate,
    /// Reaction.
    pub action: SafetyAction,
}

impl SafetyRule {
    /// Rule covering every device.
    pub fn new(
        name: impl Into<String>,
        field: impl Into<String>,
        when: Predicate,
        action: SafetyAction,
    ) -> Self {
        Self {
            name: name.into(),
            scope: RuleScope::default(),
            field: field.into(),
            when,
            action,
        }
    }

    /// Restrict to a category.
    pub fn for_category(mut self, category: DeviceCategory) -> Self {
        self.scope.category = Some(category);
        self
    }

    /// Restrict to one device.
    pub fn for_device(mut self, device_id: impl Into<DeviceId>) -> Self {
        self.scope.device_id = Some(device_id.into());
        self
    }

    /// Whether the rule looks at this telemetry event.
    pub fn applies_to(&self, telemetry: &Telemetry) -> bool {
        self.field == telemetry.field && self.scope.matches(telemetry)
    }
}

/// Immutable, process-wide rule set.
#[derive(Debug, Clone, Default)]
pub struct SafetyRuleSet {
    rules: Arc<[SafetyRule]>,
}

impl SafetyRuleSet {
    /// Check and freeze a rule list.
    pub fn new(rules: Vec<SafetyRule>) -> LabResult<Self> {
        let mut names = HashSet::new();
        for rule in &rules {
            if rule.name.is_empty() {
                return Err(LabError::Configuration(
                    "safety rule name must not be empty".to_string(),
                ));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(LabError::Configuration(format!(
                    "duplicate safety rule '{}'",
                    rule.name
                )));
            }
            if let Predicate::Outside { low, high } = rule.when {
                if low >= high {
                    return Err(LabError::Configuration(format!(
                        "safety rule '{}': band low {low} must be below high {high}",
                        rule.name
                    )));
                }
            }
        }
        Ok(Self {
            rules: rules.into(),
        })
    }

    /// Rules in declaration order.
    pub fn rules(&self) -> &[SafetyRule] {
        &self.rules
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Latch set by an emergency stop. While latched the engine refuses new
/// runs; only an explicit reset clears it.
#[derive(Debug, Clone, Default)]
pub struct Interlock {
    cause: Arc<RwLock<Option<LabError>>>,
}

impl Interlock {
    /// Open interlock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch with `cause`. The first cause is kept.
    pub fn trip(&self, cause: LabError) {
        let mut current = self.cause.write();
        if current.is_none() {
            *current = Some(cause);
        }
    }

    /// Whether latched.
    pub fn is_latched(&self) -> bool {
        self.cause.read().is_some()
    }

    /// Cause of the latch.
    pub fn cause(&self) -> Option<LabError> {
        self.cause.read().clone()
    }

    /// Fail with the latch cause if latched.
    pub fn check(&self) -> LabResult<()> {
        match self.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Clear the latch, returning the cause it held.
    pub fn reset(&self) -> Option<LabError> {
        self.cause.write().take()
    }
}

/// What the monitor needs from the engine.
pub trait RunControl: Send + Sync {
    /// Active runs with a role bound to `device_id`.
    fn runs_using(&self, device_id: &str) -> Vec<RunId>;

    /// Every active run.
    fn all_runs(&self) -> Vec<RunId>;

    /// Pause a run. Returns false if it was not running.
    fn pause_run(&self, run: RunId) -> bool;

    /// Abort a run with `cause`. Returns false if it already finished.
    fn abort_run(&self, run: RunId, cause: LabError) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(device: &str, field: &str, value: f64) -> Telemetry {
        Telemetry {
            category: DeviceCategory::TemperatureController,
            device_id: device.into(),
            field: field.into(),
            value,
            unit: "degC".into(),
        }
    }

    #[test]
    fn predicates() {
        assert!(Predicate::Above(80.0).violated(80.1));
        assert!(!Predicate::Above(80.0).violated(80.0));
        assert!(Predicate::Below(1.0).violated(0.5));
        let band = Predicate::Outside {
            low: 10.0,
            high: 20.0,
        };
        assert!(band.violated(9.0));
        assert!(!band.violated(15.0));
        assert!(band.violated(f64::NAN));
    }

    #[test]
    fn scope_filters_by_category_and_device() {
        let rule = SafetyRule::new("t", "temperature", Predicate::Above(1.0), SafetyAction::Warn)
            .for_category(DeviceCategory::TemperatureController)
            .for_device("tc1");
        assert!(rule.applies_to(&telemetry("tc1", "temperature", 0.0)));
        assert!(!rule.applies_to(&telemetry("tc2", "temperature", 0.0)));
        assert!(!rule.applies_to(&telemetry("tc1", "pressure", 0.0)));
    }

    #[test]
    fn rule_set_rejects_duplicates_and_inverted_bands() {
        let a = SafetyRule::new("a", "x", Predicate::Above(1.0), SafetyAction::Warn);
        assert!(SafetyRuleSet::new(vec![a.clone(), a.clone()]).is_err());
        let band = SafetyRule::new(
            "b",
            "x",
            Predicate::Outside {
                low: 5.0,
                high: 1.0,
            },
            SafetyAction::Warn,
        );
        assert!(SafetyRuleSet::new(vec![band]).is_err());
        assert_eq!(SafetyRuleSet::new(vec![a]).unwrap().len(), 1);
    }

    #[test]
    fn interlock_keeps_first_cause_until_reset() {
        let interlock = Interlock::new();
        assert!(interlock.check().is_ok());
        interlock.trip(LabError::Configuration("first".into()));
        interlock.trip(LabError::Configuration("second".into()));
        assert_eq!(
            interlock.check(),
            Err(LabError::Configuration("first".into()))
        );
        assert!(interlock.reset().is_some());
        assert!(!interlock.is_latched());
    }

    #[test]
    fn rules_deserialize_from_toml() {
        let text = r#"
            name = "max_temp"
            category = "temperature_controller"
            field = "temperature"
            when = { above = 90.0 }
            action = "emergency_stop_all"
        "#;
        let rule: SafetyRule = toml::from_str(text).unwrap();
        assert_eq!(rule.when, Predicate::Above(90.0));
        assert_eq!(rule.action, SafetyAction::EmergencyStopAll);
        assert_eq!(
            rule.scope.category,
            Some(DeviceCategory::TemperatureController)
        );
    }
}
