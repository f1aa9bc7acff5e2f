//! Integration tests for method execution on simulated devices
//!
//! Covers the end-to-end heat-and-dispense method (settling and timing out),
//! sequential ordering, parallel groups, preconditions, dwell, pause/resume,
//! role binding and run cleanup.

mod common;

use std::time::Duration;

use autolab::device::{DeviceCategory, HandleState, Operation};
use autolab::engine::{RoleBindings, RunStatus, StepStatus};
use autolab::method::{MethodDefinition, Precondition, Step};
use autolab::LabError;

use common::*;

fn heat_and_dispense() -> MethodDefinition {
    MethodDefinition::builder("heat_and_dispense")
        .role("heater", DeviceCategory::TemperatureController)
        .role("pump", DeviceCategory::Pump)
        .then(Step::new(
            "set_temp",
            "heater",
            Operation::SetSetpoint { celsius: 40.0 },
        ))
        .then(
            Step::new(
                "wait_stable",
                "heater",
                Operation::WaitStable {
                    target_celsius: 40.0,
                    tolerance_celsius: 0.5,
                    poll_interval: Duration::from_millis(500),
                },
            )
            .timeout(Duration::from_secs(30)),
        )
        .then(Step::new(
            "dispense",
            "pump",
            Operation::Dispense {
                volume_ul: 2000.0,
                ul_per_min: 6000.0,
            },
        ))
        .build()
}

fn select(id: &str, position: u32) -> Step {
    Step::new(id, "valve", Operation::SelectPosition { position })
}

fn dispense(id: &str, role: &str, volume_ul: f64) -> Step {
    Step::new(
        id,
        role,
        Operation::Dispense {
            volume_ul,
            ul_per_min: 6000.0,
        },
    )
}

// =============================================================================
// Heat and dispense
// =============================================================================

#[tokio::test(start_paused = true)]
async fn heat_and_dispense_completes_in_order() {
    let t = start_lab(vec![heater("heater"), syringe("pump")]).await;

    let run = t
        .lab
        .engine()
        .submit(heat_and_dispense(), &RoleBindings::new())
        .unwrap();
    let report = run.wait().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.count(StepStatus::Completed), 3);
    assert!(report.root_cause.is_none());
    assert_eq!(report.bindings["heater"], "heater");
    assert_eq!(report.bindings["pump"], "pump");

    let set_temp = report.step("set_temp").unwrap();
    let wait = report.step("wait_stable").unwrap();
    let dispense = report.step("dispense").unwrap();
    assert!(set_temp.ended.unwrap().seq < wait.started.unwrap().seq);
    assert!(wait.ended.unwrap().seq < dispense.started.unwrap().seq);

    // 25 °C → 40 °C with τ = 5 s needs ~17 s to come within 0.5 °C.
    let settle = wait.ended.unwrap().offset - wait.started.unwrap().offset;
    assert!(secs(settle) > 15.0 && secs(settle) < 30.0, "settle {settle:?}");

    // 2000 µL at 6000 µL/min.
    let transfer = dispense.ended.unwrap().offset - dispense.started.unwrap().offset;
    assert!(secs(transfer) >= 20.0, "transfer {transfer:?}");

    assert_eq!(commands(&t.sim, "pump", "DISPENSE"), 1);

    // One safe-idle pass per bound device.
    for id in ["heater", "pump"] {
        let handle = t.lab.connections().handle(id).unwrap();
        assert_eq!(handle.safe_stop_count(), 1, "{id}");
        assert_eq!(handle.state(), HandleState::Ready);
    }

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heater_that_never_settles_times_out_and_skips_dispense() {
    // Settles at 38 °C, so the reading approaches from below and never
    // enters the 39.5 to 40.5 °C band.
    let t = start_lab(vec![offset_heater("heater", -2.0), syringe("pump")]).await;

    let run = t
        .lab
        .engine()
        .submit(heat_and_dispense(), &RoleBindings::new())
        .unwrap();
    let report = run.wait().await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.step_status("set_temp"), Some(StepStatus::Completed));
    assert_eq!(report.step_status("wait_stable"), Some(StepStatus::Failed));
    assert_eq!(report.step_status("dispense"), Some(StepStatus::Aborted));
    assert!(matches!(
        report.root_cause,
        Some(LabError::StepTimeout { ref step, timeout }) if step == "wait_stable" && timeout == Duration::from_secs(30)
    ));

    let wait = report.step("wait_stable").unwrap();
    let elapsed = wait.ended.unwrap().offset - wait.started.unwrap().offset;
    assert!(secs(elapsed) >= 30.0 && secs(elapsed) < 31.0, "{elapsed:?}");

    assert_eq!(commands(&t.sim, "pump", "DISPENSE"), 0);
    // The pump never ran but still gets its safe-idle pass.
    let pump = t.lab.connections().handle("pump").unwrap();
    assert_eq!(pump.safe_stop_count(), 1);
    let heater = t.lab.connections().handle("heater").unwrap();
    assert_eq!(heater.safe_stop_count(), 1);
    assert_eq!(heater.state(), HandleState::Ready);

    t.lab.shutdown().await;
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sequential_steps_run_in_declaration_order() {
    let t = start_lab(vec![valve("valve")]).await;

    let method = MethodDefinition::builder("route")
        .role("valve", DeviceCategory::Valve)
        .then(select("to_waste", 2))
        .then(select("to_column", 5))
        .then(select("to_collector", 3))
        .build();
    let report = t
        .lab
        .engine()
        .submit(method, &RoleBindings::new())
        .unwrap()
        .wait()
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    let order = ["to_waste", "to_column", "to_collector"];
    for pair in order.windows(2) {
        let first = report.step(pair[0]).unwrap();
        let second = report.step(pair[1]).unwrap();
        assert!(first.ended.unwrap().seq < second.started.unwrap().seq);
    }

    let moves: Vec<String> = t
        .sim
        .exchanges("valve")
        .into_iter()
        .filter(|c| c.starts_with("GO"))
        .collect();
    // Last move is the safe-idle return to the home port.
    assert_eq!(moves, ["GO 2", "GO 5", "GO 3", "GO 1"]);

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn parallel_group_members_overlap_and_complete_together() {
    let t = start_lab(vec![syringe("pump_a"), syringe("pump_b"), valve("valve")]).await;

    let method = MethodDefinition::builder("prime_lines")
        .role("a", DeviceCategory::Pump)
        .role("b", DeviceCategory::Pump)
        .role("valve", DeviceCategory::Valve)
        .then(select("open_lines", 2))
        .parallel(
            "prime",
            [dispense("prime_a", "a", 1000.0), dispense("prime_b", "b", 500.0)],
        )
        .then(select("close_lines", 1))
        .build();
    let bindings: RoleBindings = [("a", "pump_a"), ("b", "pump_b")]
        .into_iter()
        .map(|(r, d)| (r.to_string(), d.to_string()))
        .collect();

    let report = t
        .lab
        .engine()
        .submit(method, &bindings)
        .unwrap()
        .wait()
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    let a = report.step("prime_a").unwrap();
    let b = report.step("prime_b").unwrap();
    assert_eq!(a.device.as_deref(), Some("pump_a"));
    assert_eq!(b.device.as_deref(), Some("pump_b"));

    // Both started before either finished.
    assert!(a.started.unwrap().seq < b.ended.unwrap().seq);
    assert!(b.started.unwrap().seq < a.ended.unwrap().seq);

    let group = report.group("prime").unwrap().completed.unwrap();
    assert!(group.seq > a.ended.unwrap().seq);
    assert!(group.seq > b.ended.unwrap().seq);
    assert!(report.step("close_lines").unwrap().started.unwrap().seq > group.seq);

    // 10 s and 5 s transfers overlapped rather than adding up to 15 s.
    let total = report.ended.unwrap().offset - report.started.unwrap().offset;
    assert!(secs(total) < 13.0, "{total:?}");

    t.lab.shutdown().await;
}

// =============================================================================
// Preconditions and dwell
// =============================================================================

#[tokio::test(start_paused = true)]
async fn false_precondition_skips_step_and_dependents_proceed() {
    let t = start_lab(vec![valve("valve")]).await;

    let method = MethodDefinition::builder("conditional_route")
        .role("valve", DeviceCategory::Valve)
        .then(select("divert", 4).precondition(Precondition::ValveAt {
            role: "valve".into(),
            position: 2,
        }))
        .then(select("collect", 3))
        .build();
    let report = t
        .lab
        .engine()
        .submit(method, &RoleBindings::new())
        .unwrap()
        .wait()
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.step_status("divert"), Some(StepStatus::Skipped));
    assert_eq!(report.step_status("collect"), Some(StepStatus::Completed));
    assert_eq!(commands(&t.sim, "valve", "GO 4"), 0);

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dependent_can_require_its_dependency_to_run() {
    let t = start_lab(vec![valve("valve")]).await;

    let method = MethodDefinition::builder("strict_route")
        .role("valve", DeviceCategory::Valve)
        .then(select("divert", 4).precondition(Precondition::ValveAt {
            role: "valve".into(),
            position: 2,
        }))
        .then(select("collect", 3).fail_if_dependency_skipped())
        .build();
    let report = t
        .lab
        .engine()
        .submit(method, &RoleBindings::new())
        .unwrap()
        .wait()
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.step_status("divert"), Some(StepStatus::Skipped));
    assert_eq!(report.step_status("collect"), Some(StepStatus::Failed));
    assert!(matches!(
        report.root_cause,
        Some(LabError::PreconditionFailed { ref step, .. }) if step == "collect"
    ));

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn precondition_that_cannot_be_read_fails_the_step() {
    let t = start_lab(vec![heater("heater"), valve("valve")]).await;
    t.sim.cut_link("heater", true);

    let method = MethodDefinition::builder("guarded_route")
        .role("heater", DeviceCategory::TemperatureController)
        .role("valve", DeviceCategory::Valve)
        .then(select("divert", 4).precondition(Precondition::TemperatureWithin {
            role: "heater".into(),
            target_celsius: 25.0,
            tolerance_celsius: 1.0,
        }))
        .build();
    let report = t
        .lab
        .engine()
        .submit(method, &RoleBindings::new())
        .unwrap()
        .wait()
        .await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.step_status("divert"), Some(StepStatus::Failed));
    assert!(matches!(
        report.root_cause,
        Some(LabError::PreconditionFailed { .. })
    ));
    // Precondition errors are not retried.
    assert_eq!(report.step("divert").unwrap().attempts, 1);
    assert_eq!(commands(&t.sim, "valve", "GO 4"), 0);

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dwell_holds_the_step_after_the_operation() {
    let t = start_lab(vec![valve("valve")]).await;

    let method = MethodDefinition::builder("incubate")
        .role("valve", DeviceCategory::Valve)
        .then(select("load", 2).dwell(Duration::from_secs(10)))
        .then(select("flush", 3))
        .build();
    let report = t
        .lab
        .engine()
        .submit(method, &RoleBindings::new())
        .unwrap()
        .wait()
        .await;

    assert_eq!(report.status, RunStatus::Completed);
    let load = report.step("load").unwrap();
    let held = load.ended.unwrap().offset - load.started.unwrap().offset;
    assert!(secs(held) >= 10.0, "{held:?}");

    t.lab.shutdown().await;
}

// =============================================================================
// Run control
// =============================================================================

#[tokio::test(start_paused = true)]
async fn paused_run_dispatches_nothing_until_resumed() {
    let t = start_lab(vec![valve("valve")]).await;

    let method = MethodDefinition::builder("slow_route")
        .role("valve", DeviceCategory::Valve)
        .then(select("first", 2).dwell(Duration::from_secs(5)))
        .then(select("second", 3))
        .build();
    let run = t
        .lab
        .engine()
        .submit(method, &RoleBindings::new())
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(run.pause());
    assert_eq!(run.status(), RunStatus::Paused);

    // "first" finishes while paused; "second" must wait.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let snapshot = run.snapshot();
    assert_eq!(snapshot.step_status("first"), Some(StepStatus::Completed));
    assert_eq!(snapshot.step_status("second"), Some(StepStatus::Pending));

    assert!(run.resume());
    let report = run.wait().await;
    assert_eq!(report.status, RunStatus::Completed);
    let second = report.step("second").unwrap();
    assert!(secs(second.started.unwrap().offset) >= 31.0);
    assert!(report.log.iter().any(|e| e.message == "run paused"));

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cleanup_runs_once_per_run() {
    let t = start_lab(vec![valve("valve")]).await;

    let method = MethodDefinition::builder("single_move")
        .role("valve", DeviceCategory::Valve)
        .then(select("move", 4))
        .build();
    let run = t
        .lab
        .engine()
        .submit(method, &RoleBindings::new())
        .unwrap();
    run.wait().await;

    let valve = t.lab.connections().handle("valve").unwrap();
    assert_eq!(valve.safe_stop_count(), 1);
    assert_eq!(run.cleanup().await, 0);
    assert_eq!(run.cleanup().await, 0);
    assert_eq!(valve.safe_stop_count(), 1);

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn finished_runs_are_archived() {
    let t = start_lab(vec![valve("valve")]).await;
    let engine = t.lab.engine();

    let method = MethodDefinition::builder("single_move")
        .role("valve", DeviceCategory::Valve)
        .then(select("move", 4))
        .build();
    let run = engine.submit(method, &RoleBindings::new()).unwrap();
    let id = run.id();
    run.wait().await;

    assert!(engine.active_runs().is_empty());
    assert_eq!(engine.report(id).unwrap().status, RunStatus::Completed);
    assert_eq!(engine.history().len(), 1);

    t.lab.shutdown().await;
}

// =============================================================================
// Submission checks
// =============================================================================

#[tokio::test(start_paused = true)]
async fn ambiguous_role_needs_an_explicit_binding() {
    let t = start_lab(vec![syringe("pump_a"), syringe("pump_b")]).await;

    let method = MethodDefinition::builder("one_pump")
        .role("pump", DeviceCategory::Pump)
        .then(dispense("d", "pump", 100.0))
        .build();

    let err = t
        .lab
        .engine()
        .submit(method.clone(), &RoleBindings::new())
        .unwrap_err();
    assert!(matches!(err, LabError::UnboundRole { ref role, .. } if role == "pump"));

    let bindings: RoleBindings = [("pump".to_string(), "pump_b".to_string())].into();
    let report = t
        .lab
        .engine()
        .submit(method, &bindings)
        .unwrap()
        .wait()
        .await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(commands(&t.sim, "pump_a", "DISPENSE"), 0);
    assert_eq!(commands(&t.sim, "pump_b", "DISPENSE"), 1);

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn device_held_by_a_run_cannot_be_bound_by_another() {
    let t = start_lab(vec![syringe("pump"), syringe("spare"), valve("valve")]).await;
    let engine = t.lab.engine();

    let long = MethodDefinition::builder("long_transfer")
        .role("pump", DeviceCategory::Pump)
        .then(dispense("transfer", "pump", 2000.0))
        .build();
    let long_run = engine.submit(long, &RoleBindings::new()).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let route = MethodDefinition::builder("route")
        .role("pump", DeviceCategory::Pump)
        .role("valve", DeviceCategory::Valve)
        .then(select("route", 3))
        .build();
    let err = engine
        .submit(route.clone(), &RoleBindings::new())
        .unwrap_err();
    assert!(matches!(
        err,
        LabError::UnboundRole { ref role, ref reason } if role == "pump" && reason.contains("in use")
    ));

    // Implicit binding skips the busy pump.
    let flush = MethodDefinition::builder("flush")
        .role("flush", DeviceCategory::Pump)
        .then(dispense("flush", "flush", 100.0))
        .build();
    let flush_report = engine
        .submit(flush, &RoleBindings::new())
        .unwrap()
        .wait()
        .await;
    assert_eq!(flush_report.status, RunStatus::Completed);
    assert_eq!(flush_report.bindings["flush"], "spare");

    let report = long_run.wait().await;
    assert_eq!(report.status, RunStatus::Completed);
    let pump = t.lab.connections().handle("pump").unwrap();
    assert_eq!(pump.safe_stop_count(), 1);

    // Released once the holder finished.
    let report = engine
        .submit(route, &RoleBindings::new())
        .unwrap()
        .wait()
        .await;
    assert_eq!(report.status, RunStatus::Completed);

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn missing_capability_is_refused_before_anything_runs() {
    let t = start_lab(vec![peristaltic("pump")]).await;

    let method = MethodDefinition::builder("draw")
        .role("pump", DeviceCategory::Pump)
        .then(Step::new(
            "draw",
            "pump",
            Operation::Aspirate {
                volume_ul: 100.0,
                ul_per_min: 1000.0,
            },
        ))
        .build();
    let err = t
        .lab
        .engine()
        .submit(method, &RoleBindings::new())
        .unwrap_err();

    assert!(matches!(
        err,
        LabError::CapabilityMismatch { ref step, ref capability, .. }
            if step == "draw" && capability == "aspirate"
    ));
    assert!(t.lab.engine().active_runs().is_empty());
    assert_eq!(commands(&t.sim, "pump", "ASPIRATE"), 0);

    t.lab.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_method_is_rejected_with_every_problem() {
    let t = start_lab(vec![valve("valve")]).await;

    let method = MethodDefinition::builder("loop")
        .role("valve", DeviceCategory::Valve)
        .add(select("a", 2).after("b"))
        .add(select("b", 3).after("a"))
        .add(select("c", 4).after("missing"))
        .build();
    let err = t
        .lab
        .engine()
        .submit(method, &RoleBindings::new())
        .unwrap_err();

    let LabError::InvalidMethod { errors, .. } = err else {
        panic!("expected InvalidMethod, got {err:?}");
    };
    assert!(errors.len() >= 2, "{errors:?}");

    t.lab.shutdown().await;
}
