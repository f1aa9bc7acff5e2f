//! Run records and the per-run shared state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::EngineSettings;
use crate::bus::{EventBus, EventKind};
use crate::device::{DeviceHandle, DeviceId, IdleOutcome, OpOutput};
use crate::error::LabError;
use crate::method::{MethodDefinition, RoleName, StepId};

/// Run identifier.
pub type RunId = Uuid;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, not started.
    Pending,
    /// Dispatching steps.
    Running,
    /// No new steps are dispatched until resumed.
    Paused,
    /// Every step completed or was skipped.
    Completed,
    /// At least one step failed.
    Failed,
    /// Aborted by a user or a safety action.
    Aborted,
}

impl RunStatus {
    /// Whether the run has finished.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for dependencies.
    Pending,
    /// Dispatched.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Precondition was false.
    Skipped,
    /// Cancelled before or during execution.
    Aborted,
}

impl StepStatus {
    /// Whether the step has finished.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Stamps
// =============================================================================

/// Point in a run's timeline.
///
/// `seq` is strictly increasing within a run, so two stamps taken in the same
/// tokio instant still order correctly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stamp {
    /// Logical counter.
    pub seq: u64,
    /// Monotonic time since the run started.
    #[serde(with = "humantime_serde")]
    pub offset: Duration,
    /// Wall clock.
    pub wall: DateTime<Utc>,
}

pub(crate) struct RunClock {
    origin: tokio::time::Instant,
    seq: AtomicU64,
}

impl RunClock {
    pub(crate) fn start() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn now(&self) -> Stamp {
        Stamp {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            offset: self.origin.elapsed(),
            wall: Utc::now(),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

fn error_text<S: Serializer>(err: &Option<LabError>, serializer: S) -> Result<S::Ok, S::Error> {
    err.as_ref().map(ToString::to_string).serialize(serializer)
}

/// Per-step record.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    /// Current status.
    pub status: StepStatus,
    /// Device the step's role was bound to.
    pub device: Option<DeviceId>,
    /// When the step was dispatched.
    pub started: Option<Stamp>,
    /// When the step reached a terminal state.
    pub ended: Option<Stamp>,
    /// Dispatch attempts, including retries.
    pub attempts: u32,
    /// Operation result.
    pub output: Option<OpOutput>,
    /// Failure or abort cause.
    #[serde(serialize_with = "error_text")]
    pub error: Option<LabError>,
}

impl StepRecord {
    fn pending(device: Option<DeviceId>) -> Self {
        Self {
            status: StepStatus::Pending,
            device,
            started: None,
            ended: None,
            attempts: 0,
            output: None,
            error: None,
        }
    }
}

/// Completion record of a parallel group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupRecord {
    /// Group name.
    pub name: String,
    /// Member step ids.
    pub members: Vec<StepId>,
    /// Stamp taken after the last member reached a terminal state.
    pub completed: Option<Stamp>,
}

/// One line of the run log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// When.
    pub stamp: Stamp,
    /// Run, step id or device id.
    pub subject: String,
    /// What happened.
    pub message: String,
}

/// Snapshot of a run; the final one is archived in the engine history.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run id.
    pub run_id: RunId,
    /// Method name.
    pub method: String,
    /// Current status.
    pub status: RunStatus,
    /// Role bindings fixed at run start.
    pub bindings: BTreeMap<RoleName, DeviceId>,
    /// When the run started.
    pub started: Option<Stamp>,
    /// When the run reached a terminal state.
    pub ended: Option<Stamp>,
    /// Step records by id.
    pub steps: BTreeMap<StepId, StepRecord>,
    /// Parallel group records.
    pub groups: Vec<GroupRecord>,
    /// First error that decided the outcome. A safety trip replaces any
    /// earlier cause.
    #[serde(serialize_with = "error_text")]
    pub root_cause: Option<LabError>,
    /// Accumulated event log.
    pub log: Vec<LogEntry>,
}

impl RunReport {
    /// Record of one step.
    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    /// Status of one step.
    pub fn step_status(&self, id: &str) -> Option<StepStatus> {
        self.steps.get(id).map(|r| r.status)
    }

    /// Number of steps in `status`.
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|r| r.status == status).count()
    }

    /// Group record by name.
    pub fn group(&self, name: &str) -> Option<&GroupRecord> {
        self.groups.iter().find(|g| g.name == name)
    }
}

// =============================================================================
// Shared run state
// =============================================================================

/// State shared by the run task, its step tasks and every [`RunHandle`].
pub(crate) struct RunShared {
    pub(crate) id: RunId,
    pub(crate) method: Arc<MethodDefinition>,
    pub(crate) bindings: BTreeMap<RoleName, DeviceHandle>,
    pub(crate) settings: EngineSettings,
    pub(crate) clock: RunClock,
    pub(crate) cancel: CancellationToken,
    bus: EventBus,
    report: Mutex<RunReport>,
    abort_cause: Mutex<Option<LabError>>,
    paused: watch::Sender<bool>,
    done: watch::Sender<bool>,
    cleaned: AtomicBool,
}

impl RunShared {
    pub(crate) fn new(
        method: Arc<MethodDefinition>,
        bindings: BTreeMap<RoleName, DeviceHandle>,
        settings: EngineSettings,
        bus: EventBus,
    ) -> Self {
        let id = Uuid::new_v4();
        let steps = method
            .steps()
            .iter()
            .map(|s| {
                let device = bindings.get(&s.role).map(|h| h.id().to_string());
                (s.id.clone(), StepRecord::pending(device))
            })
            .collect();
        let groups = method
            .groups()
            .iter()
            .map(|g| GroupRecord {
                name: g.name.clone(),
                members: g.members.clone(),
                completed: None,
            })
            .collect();
        let report = RunReport {
            run_id: id,
            method: method.name().to_string(),
            status: RunStatus::Pending,
            bindings: bindings
                .iter()
                .map(|(role, h)| (role.clone(), h.id().to_string()))
                .collect(),
            started: None,
            ended: None,
            steps,
            groups,
            root_cause: None,
            log: Vec::new(),
        };
        Self {
            id,
            method,
            bindings,
            settings,
            clock: RunClock::start(),
            cancel: CancellationToken::new(),
            bus,
            report: Mutex::new(report),
            abort_cause: Mutex::new(None),
            paused: watch::channel(false).0,
            done: watch::channel(false).0,
            cleaned: AtomicBool::new(false),
        }
    }

    pub(crate) fn snapshot(&self) -> RunReport {
        self.report.lock().clone()
    }

    pub(crate) fn status(&self) -> RunStatus {
        self.report.lock().status
    }

    fn source(&self) -> String {
        format!("run:{}", self.id)
    }

    fn log(report: &mut RunReport, stamp: Stamp, subject: &str, message: String) {
        report.log.push(LogEntry {
            stamp,
            subject: subject.to_string(),
            message,
        });
    }

    // ---- run status ------------------------------------------------------

    pub(crate) fn set_status(&self, status: RunStatus) {
        let stamp = self.clock.now();
        {
            let mut report = self.report.lock();
            if report.status == status || report.status.is_terminal() {
                return;
            }
            report.status = status;
            match status {
                RunStatus::Running if report.started.is_none() => report.started = Some(stamp),
                s if s.is_terminal() => report.ended = Some(stamp),
                _ => {}
            }
            let run = report.method.clone();
            Self::log(&mut report, stamp, &run, format!("run {status}"));
        }
        info!(run_id = %self.id, method = self.method.name(), %status, "Run status");
        self.bus.publish(
            self.source(),
            EventKind::RunStatus {
                run_id: self.id,
                method: self.method.name().to_string(),
                status,
            },
        );
    }

    /// Mark the run finished; wakes every `RunHandle::wait`.
    pub(crate) fn finish(&self) {
        self.done.send_replace(true);
    }

    pub(crate) async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    // ---- steps -----------------------------------------------------------

    pub(crate) fn step_status(&self, step: &str) -> StepStatus {
        self.report
            .lock()
            .steps
            .get(step)
            .map_or(StepStatus::Pending, |r| r.status)
    }

    pub(crate) fn step_started(&self, step: &str) {
        let stamp = self.clock.now();
        {
            let mut report = self.report.lock();
            let Some(record) = report.steps.get_mut(step) else {
                return;
            };
            record.status = StepStatus::Running;
            record.started = Some(stamp);
            Self::log(&mut report, stamp, step, "step running".to_string());
        }
        self.publish_step(step, StepStatus::Running, None);
    }

    pub(crate) fn step_attempt(&self, step: &str) -> u32 {
        let mut report = self.report.lock();
        match report.steps.get_mut(step) {
            Some(record) => {
                record.attempts += 1;
                record.attempts
            }
            None => 0,
        }
    }

    /// Record a terminal step state. Returns false if the step was already
    /// terminal.
    pub(crate) fn step_finished(
        &self,
        step: &str,
        status: StepStatus,
        output: Option<OpOutput>,
        error: Option<LabError>,
    ) -> bool {
        let stamp = self.clock.now();
        let detail = error.as_ref().map(ToString::to_string);
        {
            let mut report = self.report.lock();
            let Some(record) = report.steps.get_mut(step) else {
                return false;
            };
            if record.status.is_terminal() {
                return false;
            }
            record.status = status;
            record.ended = Some(stamp);
            record.output = output;
            record.error = error;
            let message = match &detail {
                Some(d) => format!("step {status}: {d}"),
                None => format!("step {status}"),
            };
            Self::log(&mut report, stamp, step, message);
        }
        match status {
            StepStatus::Failed => {
                warn!(run_id = %self.id, step, detail = detail.as_deref().unwrap_or(""), "Step failed")
            }
            _ => info!(run_id = %self.id, step, %status, "Step finished"),
        }
        self.publish_step(step, status, detail);
        self.complete_groups(step);
        true
    }

    fn publish_step(&self, step: &str, status: StepStatus, detail: Option<String>) {
        self.bus.publish(
            self.source(),
            EventKind::StepStatus {
                run_id: self.id,
                step: step.to_string(),
                status,
                detail,
            },
        );
    }

    fn complete_groups(&self, step: &str) {
        let mut completed = Vec::new();
        {
            let mut report = self.report.lock();
            let RunReport { steps, groups, .. } = &mut *report;
            for group in groups.iter_mut() {
                if group.completed.is_some() || !group.members.iter().any(|m| m == step) {
                    continue;
                }
                let all_done = group
                    .members
                    .iter()
                    .all(|m| steps.get(m).is_some_and(|r| r.status.is_terminal()));
                if all_done {
                    group.completed = Some(self.clock.now());
                    completed.push(group.name.clone());
                }
            }
        }
        for group in completed {
            self.bus.publish(
                self.source(),
                EventKind::GroupCompleted {
                    run_id: self.id,
                    group,
                },
            );
        }
    }

    // ---- errors and abort ------------------------------------------------

    pub(crate) fn record_root_cause(&self, err: &LabError) {
        let mut report = self.report.lock();
        let replace = match &report.root_cause {
            None => true,
            Some(existing) => err.is_safety_trip() && !existing.is_safety_trip(),
        };
        if replace {
            report.root_cause = Some(err.clone());
        }
    }

    /// Request an abort. Returns false if the run already finished.
    pub(crate) fn abort(&self, cause: LabError) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        {
            let mut current = self.abort_cause.lock();
            let replace = match current.as_ref() {
                None => true,
                Some(existing) => cause.is_safety_trip() && !existing.is_safety_trip(),
            };
            if replace {
                *current = Some(cause.clone());
            }
        }
        self.record_root_cause(&cause);
        warn!(run_id = %self.id, cause = %cause, "Run abort requested");
        self.cancel.cancel();
        true
    }

    pub(crate) fn abort_cause(&self) -> Option<LabError> {
        self.abort_cause.lock().clone()
    }

    // ---- pause -----------------------------------------------------------

    pub(crate) fn pause(&self) -> bool {
        if self.status() != RunStatus::Running {
            return false;
        }
        self.paused.send_replace(true);
        self.set_status(RunStatus::Paused);
        true
    }

    pub(crate) fn resume(&self) -> bool {
        if self.status() != RunStatus::Paused {
            return false;
        }
        self.paused.send_replace(false);
        self.set_status(RunStatus::Running);
        true
    }

    pub(crate) fn pause_watch(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }

    // ---- cleanup ---------------------------------------------------------

    /// Send every bound device to safe idle. Only the first call does
    /// anything; later calls return 0.
    pub(crate) async fn cleanup(&self) -> usize {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let mut devices: Vec<&DeviceHandle> = Vec::new();
        for handle in self.bindings.values() {
            if !devices.iter().any(|d| d.same_as(handle)) {
                devices.push(handle);
            }
        }
        let timeout = self.settings.safe_stop_timeout;
        let outcomes = join_all(devices.iter().map(|d| d.safe_idle(timeout))).await;

        let mut stopped = 0;
        for (device, outcome) in devices.iter().zip(outcomes) {
            match outcome {
                Ok(IdleOutcome::Stopped) => stopped += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(run_id = %self.id, device = %device.id(), error = %e, "Safe idle failed")
                }
            }
        }
        let stamp = self.clock.now();
        let run = self.method.name().to_string();
        Self::log(
            &mut self.report.lock(),
            stamp,
            &run,
            format!("cleanup: {stopped} device(s) sent to safe idle"),
        );
        stopped
    }
}

/// Caller's handle on a submitted run.
#[derive(Clone)]
pub struct RunHandle {
    pub(crate) shared: Arc<RunShared>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.shared.id)
            .field("method", &self.shared.method.name())
            .field("status", &self.status())
            .finish()
    }
}

impl RunHandle {
    /// Run id.
    pub fn id(&self) -> RunId {
        self.shared.id
    }

    /// Current status.
    pub fn status(&self) -> RunStatus {
        self.shared.status()
    }

    /// Current report.
    pub fn snapshot(&self) -> RunReport {
        self.shared.snapshot()
    }

    /// Wait until the run is terminal and cleanup has run; returns the final
    /// report.
    pub async fn wait(&self) -> RunReport {
        self.shared.wait_done().await;
        self.shared.snapshot()
    }

    /// Abort the run. In-flight steps are cancelled; the call returns
    /// immediately. Returns false if the run already finished.
    pub fn abort(&self) -> bool {
        self.shared.abort(LabError::Aborted {
            reason: "aborted by user".to_string(),
        })
    }

    /// Stop dispatching new steps. In-flight steps finish.
    pub fn pause(&self) -> bool {
        self.shared.pause()
    }

    /// Resume a paused run.
    pub fn resume(&self) -> bool {
        self.shared.resume()
    }

    /// Send every bound device to safe idle. The engine calls this when the
    /// run ends; repeated calls have no effect.
    pub async fn cleanup(&self) -> usize {
        self.shared.cleanup().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_strictly_ordered() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let clock = RunClock::start();
            let a = clock.now();
            let b = clock.now();
            assert!(b.seq > a.seq);
            assert_eq!(a.offset, b.offset);
        });
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Aborted.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }
}
