//! Safety Monitor task.
//!
//! ```text
//!  EventBus ──Telemetry──▶ Evaluator (edge-triggered) ──Trip──▶ act()
//!                                                        │
//!        ┌──────────────┬───────────────┬────────────────┘
//!        ▼              ▼               ▼
//!      Warn      Pause/AbortRun   EmergencyStopAll
//!                (runs bound to   interlock.trip, abort all runs,
//!                 the device)     detached emergency_stop per device
//! ```
//!
//! The monitor only waits for telemetry. Device stops are issued on
//! detached tasks so a slow or hung device never delays evaluation of the
//! next event.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Interlock, RunControl, SafetyAction, SafetyRuleSet};
use crate::bus::{EventBus, EventKind, Subscription, Telemetry};
use crate::connection::ConnectionManager;
use crate::device::DeviceId;
use crate::error::LabError;

/// A rule that just tripped.
#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    /// Rule name.
    pub rule: String,
    /// Action of the rule.
    pub action: SafetyAction,
    /// Reporting device.
    pub device_id: DeviceId,
    /// Telemetry field.
    pub field: String,
    /// Offending value.
    pub value: f64,
}

impl Trip {
    /// Error recorded as the root cause of runs aborted by this trip.
    pub fn to_error(&self) -> LabError {
        LabError::SafetyTripped {
            rule: self.rule.clone(),
            device: self.device_id.clone(),
            field: self.field.clone(),
            value: self.value,
        }
    }
}

/// Edge-triggered rule evaluation.
///
/// A rule trips once per device when its predicate becomes true and re-arms
/// when a later value clears it.
#[derive(Debug)]
pub struct Evaluator {
    rules: SafetyRuleSet,
    tripped: HashSet<(usize, DeviceId)>,
}

impl Evaluator {
    /// Evaluator with every rule armed.
    pub fn new(rules: SafetyRuleSet) -> Self {
        Self {
            rules,
            tripped: HashSet::new(),
        }
    }

    /// Feed one telemetry value; returns the rules that tripped on it.
    pub fn evaluate(&mut self, telemetry: &Telemetry) -> Vec<Trip> {
        let mut trips = Vec::new();
        for (index, rule) in self.rules.rules().iter().enumerate() {
            if !rule.applies_to(telemetry) {
                continue;
            }
            let key = (index, telemetry.device_id.clone());
            if rule.when.violated(telemetry.value) {
                if self.tripped.insert(key) {
                    trips.push(Trip {
                        rule: rule.name.clone(),
                        action: rule.action,
                        device_id: telemetry.device_id.clone(),
                        field: telemetry.field.clone(),
                        value: telemetry.value,
                    });
                }
            } else if self.tripped.remove(&key) {
                info!(rule = %rule.name, device = %telemetry.device_id, "Safety rule re-armed");
            }
        }
        trips
    }
}

struct MonitorContext {
    bus: EventBus,
    runs: Arc<dyn RunControl>,
    connections: Arc<ConnectionManager>,
    interlock: Interlock,
    stop_timeout: Duration,
    trips: Arc<AtomicU64>,
}

/// Background task evaluating safety rules.
#[derive(Debug)]
pub struct SafetyMonitor {
    task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    interlock: Interlock,
    trips: Arc<AtomicU64>,
}

impl SafetyMonitor {
    /// Subscribe to `bus` and start evaluating `rules`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        rules: SafetyRuleSet,
        bus: &EventBus,
        runs: Arc<dyn RunControl>,
        connections: Arc<ConnectionManager>,
        interlock: Interlock,
        stop_timeout: Duration,
    ) -> Self {
        let subscription = bus.subscribe();
        let shutdown = CancellationToken::new();
        let trips = Arc::new(AtomicU64::new(0));
        let ctx = MonitorContext {
            bus: bus.clone(),
            runs,
            connections,
            interlock: interlock.clone(),
            stop_timeout,
            trips: Arc::clone(&trips),
        };
        info!(rules = rules.len(), "Safety monitor started");
        let task = tokio::spawn(run(Evaluator::new(rules), subscription, ctx, shutdown.clone()));
        Self {
            task: Some(task),
            shutdown,
            interlock,
            trips,
        }
    }

    /// Interlock shared with the engine.
    pub fn interlock(&self) -> &Interlock {
        &self.interlock
    }

    /// Clear a latched interlock. Returns the trip that latched it.
    pub fn reset_interlock(&self) -> Option<LabError> {
        let cause = self.interlock.reset();
        if let Some(cause) = &cause {
            info!(cause = %cause, "Safety interlock reset");
        }
        cause
    }

    /// Number of trips since start.
    pub fn trip_count(&self) -> u64 {
        self.trips.load(Ordering::SeqCst)
    }

    /// Stop the task.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SafetyMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    mut evaluator: Evaluator,
    mut events: Subscription,
    ctx: MonitorContext,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        let EventKind::Telemetry(telemetry) = &event.kind else {
            continue;
        };
        for trip in evaluator.evaluate(telemetry) {
            act(&ctx, trip);
        }
    }
    info!("Safety monitor stopped");
}

fn act(ctx: &MonitorContext, trip: Trip) {
    ctx.trips.fetch_add(1, Ordering::SeqCst);
    let cause = trip.to_error();
    warn!(
        rule = %trip.rule,
        device = %trip.device_id,
        field = %trip.field,
        value = trip.value,
        action = %trip.action,
        "Safety rule tripped"
    );
    ctx.bus.publish(
        "safety",
        EventKind::SafetyTrip {
            rule: trip.rule.clone(),
            device_id: trip.device_id.clone(),
            field: trip.field.clone(),
            value: trip.value,
            action: trip.action,
        },
    );

    match trip.action {
        SafetyAction::Warn => {}
        SafetyAction::PauseRun => {
            for run in ctx.runs.runs_using(&trip.device_id) {
                ctx.runs.pause_run(run);
            }
        }
        SafetyAction::AbortRun => {
            for run in ctx.runs.runs_using(&trip.device_id) {
                ctx.runs.abort_run(run, cause.clone());
            }
        }
        SafetyAction::EmergencyStopAll => {
            // Latch and cancel first so nothing new reaches a device while
            // the stops are in flight.
            ctx.interlock.trip(cause.clone());
            for run in ctx.runs.all_runs() {
                ctx.runs.abort_run(run, cause.clone());
            }
            for handle in ctx.connections.handles() {
                let cause = cause.clone();
                let timeout = ctx.stop_timeout;
                tokio::spawn(async move {
                    if let Err(e) = handle.emergency_stop(cause, timeout).await {
                        error!(device = %handle.id(), error = %e, "Emergency stop failed");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCategory;
    use crate::safety::{Predicate, SafetyRule};
    use tracing_test::traced_test;

    fn reading(value: f64) -> Telemetry {
        Telemetry {
            category: DeviceCategory::TemperatureController,
            device_id: "tc1".into(),
            field: "temperature".into(),
            value,
            unit: "degC".into(),
        }
    }

    #[test]
    #[traced_test]
    fn trips_once_per_excursion() {
        let rules = SafetyRuleSet::new(vec![SafetyRule::new(
            "max_temp",
            "temperature",
            Predicate::Above(80.0),
            SafetyAction::EmergencyStopAll,
        )])
        .unwrap();
        let mut evaluator = Evaluator::new(rules);

        assert!(evaluator.evaluate(&reading(70.0)).is_empty());
        let trips = evaluator.evaluate(&reading(85.0));
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0].rule, "max_temp");
        assert!(trips[0].to_error().is_safety_trip());

        // Still above: no second trip.
        assert!(evaluator.evaluate(&reading(90.0)).is_empty());
        // Clears, then trips again.
        assert!(evaluator.evaluate(&reading(75.0)).is_empty());
        assert!(logs_contain("Safety rule re-armed"));
        assert_eq!(evaluator.evaluate(&reading(81.0)).len(), 1);
    }
}
