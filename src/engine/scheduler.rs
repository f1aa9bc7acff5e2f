//! Run driver: walks the step graph and applies the failure policy.
//!
//! ```text
//!            ┌────────────── dispatch_ready ◀─────────────┐
//!            ▼                                            │
//!   Pending ──▶ Running (step task, own token) ──▶ outcome ┘
//!            │                                      │
//!            │  upstream failed / skipped           │ Failed + abort policy
//!            ▼                                      ▼
//!          Failed                          halt: pending → Aborted,
//!                                          in-flight tokens cancelled,
//!                                          stragglers dropped after grace
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::run::{RunShared, RunStatus, StepStatus};
use crate::device::{DeviceHandle, OpOutput};
use crate::error::{LabError, LabResult};
use crate::method::{Precondition, SkipPolicy, Step, StepId};

enum StepOutcome {
    Completed(OpOutput),
    Skipped(String),
    Failed(LabError),
    Aborted(LabError),
}

/// Execute a run to its terminal state, then clean up.
#[instrument(skip(shared), fields(run_id = %shared.id, method = shared.method.name()))]
pub(crate) async fn drive(shared: Arc<RunShared>) {
    let halt = shared.cancel.child_token();
    let mut pause_rx = shared.pause_watch();
    let mut tasks: JoinSet<(StepId, StepOutcome)> = JoinSet::new();
    let mut grace: Option<Instant> = None;
    let mut halted = false;

    shared.set_status(RunStatus::Running);

    loop {
        let paused = *pause_rx.borrow_and_update();
        if !halted && !paused {
            if let Some(cause) = dispatch_ready(&shared, &halt, &mut tasks) {
                begin_halt(&shared, &halt, &cause, &mut grace);
                halted = true;
            }
        }

        if tasks.is_empty() {
            if halted || all_terminal(&shared) {
                break;
            }
            if !paused {
                let cause = LabError::Aborted {
                    reason: "no step can be dispatched".to_string(),
                };
                error!(run_id = %shared.id, "Run stalled with pending steps");
                shared.record_root_cause(&cause);
                abort_pending(&shared, &cause);
                break;
            }
        }

        let deadline = grace.unwrap_or_else(Instant::now);
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled(), if !halted => {
                let cause = shared.abort_cause().unwrap_or(LabError::Aborted {
                    reason: "aborted".to_string(),
                });
                begin_halt(&shared, &halt, &cause, &mut grace);
                halted = true;
            }

            Some(joined) = tasks.join_next() => match joined {
                Ok((id, outcome)) => {
                    if let Some(cause) = record_outcome(&shared, &id, outcome) {
                        if !halted {
                            begin_halt(&shared, &halt, &cause, &mut grace);
                            halted = true;
                        }
                    }
                }
                Err(e) => error!(run_id = %shared.id, error = %e, "Step task ended abnormally"),
            },

            _ = tokio::time::sleep_until(deadline), if grace.is_some() => {
                warn!(run_id = %shared.id, "Abort grace period expired; dropping in-flight steps");
                tasks.abort_all();
                while let Some(joined) = tasks.join_next().await {
                    if let Ok((id, outcome)) = joined {
                        record_outcome(&shared, &id, outcome);
                    }
                }
                let cause = shared.abort_cause().unwrap_or(LabError::Aborted {
                    reason: "abort grace period expired".to_string(),
                });
                for step in shared.method.steps() {
                    if shared.step_status(&step.id) == StepStatus::Running {
                        shared.step_finished(&step.id, StepStatus::Aborted, None, Some(cause.clone()));
                    }
                }
                grace = None;
            }

            _ = pause_rx.changed() => {}
        }
    }

    let report = shared.snapshot();
    let status = if shared.abort_cause().is_some() {
        RunStatus::Aborted
    } else if report.count(StepStatus::Failed) > 0 || report.count(StepStatus::Aborted) > 0 {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };
    shared.set_status(status);
    shared.cleanup().await;
}

fn all_terminal(shared: &RunShared) -> bool {
    shared
        .method
        .steps()
        .iter()
        .all(|s| shared.step_status(&s.id).is_terminal())
}

fn begin_halt(
    shared: &RunShared,
    halt: &CancellationToken,
    cause: &LabError,
    grace: &mut Option<Instant>,
) {
    halt.cancel();
    abort_pending(shared, cause);
    *grace = Some(Instant::now() + shared.settings.abort_grace);
}

fn abort_pending(shared: &RunShared, cause: &LabError) {
    for step in shared.method.steps() {
        if shared.step_status(&step.id) == StepStatus::Pending {
            shared.step_finished(&step.id, StepStatus::Aborted, None, Some(cause.clone()));
        }
    }
}

/// Record a step outcome. Returns the halt cause when the failure policy
/// ends the run.
fn record_outcome(shared: &RunShared, id: &str, outcome: StepOutcome) -> Option<LabError> {
    match outcome {
        StepOutcome::Completed(output) => {
            shared.step_finished(id, StepStatus::Completed, Some(output), None);
            None
        }
        StepOutcome::Skipped(reason) => {
            info!(run_id = %shared.id, step = id, %reason, "Precondition false; step skipped");
            shared.step_finished(id, StepStatus::Skipped, None, None);
            None
        }
        StepOutcome::Aborted(err) => {
            shared.step_finished(id, StepStatus::Aborted, None, Some(err));
            None
        }
        StepOutcome::Failed(err) => {
            shared.record_root_cause(&err);
            let recorded = shared.step_finished(id, StepStatus::Failed, None, Some(err));
            if recorded && shared.method.failure_policy().aborts_on_failure() {
                Some(LabError::Aborted {
                    reason: format!("step '{id}' failed"),
                })
            } else {
                None
            }
        }
    }
}

/// Start every pending step whose dependencies are terminal. Steps that can
/// be decided without running (upstream failure, skipped dependency under the
/// `Fail` policy) are recorded directly. Returns a halt cause if one of those
/// decisions ends the run.
fn dispatch_ready(
    shared: &Arc<RunShared>,
    halt: &CancellationToken,
    tasks: &mut JoinSet<(StepId, StepOutcome)>,
) -> Option<LabError> {
    loop {
        let mut decided = false;
        for step in shared.method.steps() {
            if shared.step_status(&step.id) != StepStatus::Pending {
                continue;
            }
            let deps: Vec<(&StepId, StepStatus)> = step
                .after
                .iter()
                .map(|d| (d, shared.step_status(d)))
                .collect();
            if deps.iter().any(|(_, s)| !s.is_terminal()) {
                continue;
            }

            if let Some((upstream, _)) = deps
                .iter()
                .find(|(_, s)| matches!(s, StepStatus::Failed | StepStatus::Aborted))
            {
                shared.step_finished(
                    &step.id,
                    StepStatus::Failed,
                    None,
                    Some(LabError::UpstreamFailed {
                        step: step.id.clone(),
                        upstream: (*upstream).clone(),
                    }),
                );
                decided = true;
                continue;
            }

            if step.on_skipped_dependency == SkipPolicy::Fail {
                if let Some((skipped, _)) = deps.iter().find(|(_, s)| *s == StepStatus::Skipped) {
                    let err = LabError::PreconditionFailed {
                        step: step.id.clone(),
                        reason: format!("dependency '{skipped}' was skipped"),
                    };
                    if let Some(cause) = record_outcome(shared, &step.id, StepOutcome::Failed(err)) {
                        return Some(cause);
                    }
                    decided = true;
                    continue;
                }
            }

            shared.step_started(&step.id);
            let token = halt.child_token();
            tasks.spawn(run_step(Arc::clone(shared), step.clone(), token));
        }
        if !decided {
            return None;
        }
    }
}

async fn run_step(
    shared: Arc<RunShared>,
    step: Step,
    token: CancellationToken,
) -> (StepId, StepOutcome) {
    let outcome = AssertUnwindSafe(execute_step(&shared, &step, &token))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            StepOutcome::Failed(LabError::Driver {
                device: step.role.clone(),
                message: "step task panicked".to_string(),
            })
        });
    (step.id, outcome)
}

async fn execute_step(shared: &RunShared, step: &Step, token: &CancellationToken) -> StepOutcome {
    let Some(handle) = shared.bindings.get(&step.role) else {
        return StepOutcome::Failed(LabError::UnboundRole {
            role: step.role.clone(),
            reason: "role not bound for this run".to_string(),
        });
    };
    let timeout = step
        .timeout
        .or(shared.method.default_step_timeout())
        .unwrap_or(shared.settings.default_step_timeout);
    let policy = shared.method.failure_policy();
    let mut retry = 0;

    loop {
        let attempt_no = shared.step_attempt(&step.id);
        debug!(run_id = %shared.id, step = %step.id, attempt = attempt_no, "Dispatching step");

        let result = match tokio::time::timeout(timeout, attempt(shared, step, handle, token)).await
        {
            Ok(result) => result,
            Err(_) => Err(LabError::StepTimeout {
                step: step.id.clone(),
                timeout,
            }),
        };

        match result {
            Ok(None) => {
                let reason = step
                    .precondition
                    .as_ref()
                    .map_or_else(String::new, ToString::to_string);
                return StepOutcome::Skipped(reason);
            }
            Ok(Some(output)) => {
                if let Some(dwell) = step.dwell {
                    tokio::select! {
                        _ = token.cancelled() => return StepOutcome::Aborted(abort_error(shared)),
                        _ = tokio::time::sleep(dwell) => {}
                    }
                }
                return StepOutcome::Completed(output);
            }
            Err(_) if token.is_cancelled() => return StepOutcome::Aborted(abort_error(shared)),
            Err(err) => {
                if err.is_retryable() && retry < policy.max_retries() {
                    retry += 1;
                    let delay = policy.backoff_for(retry);
                    warn!(
                        run_id = %shared.id,
                        step = %step.id,
                        retry,
                        delay = ?delay,
                        error = %err,
                        "Step failed; retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return StepOutcome::Aborted(abort_error(shared)),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                return StepOutcome::Failed(err);
            }
        }
    }
}

/// One dispatch: precondition check, then the operation. `Ok(None)` means
/// the precondition was false.
async fn attempt(
    shared: &RunShared,
    step: &Step,
    handle: &DeviceHandle,
    token: &CancellationToken,
) -> LabResult<Option<OpOutput>> {
    if let Some(pre) = &step.precondition {
        if !check_precondition(shared, step, pre, token).await? {
            return Ok(None);
        }
    }
    handle.execute(&step.operation, token).await.map(Some)
}

async fn check_precondition(
    shared: &RunShared,
    step: &Step,
    pre: &Precondition,
    token: &CancellationToken,
) -> LabResult<bool> {
    let failed = |reason: String| LabError::PreconditionFailed {
        step: step.id.clone(),
        reason,
    };
    let probe = shared
        .bindings
        .get(pre.role())
        .ok_or_else(|| failed(format!("role '{}' not bound", pre.role())))?;

    match probe.execute(&pre.probe(), token).await {
        Ok(output) => match output.reading() {
            Some(reading) => Ok(pre.holds(reading.value)),
            None => Err(failed("probe returned no reading".to_string())),
        },
        Err(e) if token.is_cancelled() => Err(e),
        Err(e) => Err(failed(format!("cannot evaluate {pre}: {e}"))),
    }
}

fn abort_error(shared: &RunShared) -> LabError {
    shared.abort_cause().unwrap_or_else(|| LabError::Aborted {
        reason: "run halted".to_string(),
    })
}
