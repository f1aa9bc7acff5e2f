//! Method Execution Engine
//!
//! Accepts validated [`MethodDefinition`]s, binds their roles to open
//! devices and drives each submission as an independent run on its own tokio
//! task. Step tasks are spawned per dispatched step so parallel siblings
//! really run concurrently.
//!
//! # Lifecycle
//!
//! ```text
//! submit ─▶ interlock check ─▶ validate ─▶ bind roles ─▶ capability check
//!                                                            │
//!         history ◀─ cleanup (safe idle, once) ◀─ terminal ◀─┘ drive
//! ```
//!
//! Every run ends with exactly one cleanup pass that sends each bound device
//! to safe idle. The device's stop latch keeps that exactly-once across
//! concurrent aborts, safety actions and natural completion. Bound devices
//! are reserved from submission until that pass has finished, so no other
//! run can bind them meanwhile.

mod binding;
mod run;
mod scheduler;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::bus::EventBus;
use crate::connection::ConnectionManager;
use crate::device::{DeviceHandle, DeviceId};
use crate::error::{LabError, LabResult};
use crate::limits;
use crate::method::{validate, MethodDefinition, RoleName, ValidationError};
use crate::safety::{Interlock, RunControl};

pub use binding::RoleBindings;
pub use run::{
    GroupRecord, LogEntry, RunHandle, RunId, RunReport, RunStatus, Stamp, StepRecord, StepStatus,
};

use run::RunShared;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Timeout for steps that declare none and whose method has no default.
    #[serde(with = "humantime_serde")]
    pub default_step_timeout: Duration,
    /// Time in-flight steps get to wind down after an abort.
    #[serde(with = "humantime_serde")]
    pub abort_grace: Duration,
    /// Bound on each device's safe-idle command during cleanup.
    #[serde(with = "humantime_serde")]
    pub safe_stop_timeout: Duration,
    /// Finished runs kept for [`MethodEngine::report`].
    pub history_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_step_timeout: limits::DEFAULT_STEP_TIMEOUT,
            abort_grace: limits::ABORT_GRACE,
            safe_stop_timeout: limits::SAFE_STOP_TIMEOUT,
            history_capacity: limits::RUN_HISTORY_CAPACITY,
        }
    }
}

struct EngineInner {
    settings: EngineSettings,
    connections: Arc<ConnectionManager>,
    bus: EventBus,
    interlock: Interlock,
    active: DashMap<RunId, RunHandle>,
    /// Devices held by active runs. A device belongs to at most one run
    /// from submission until its cleanup has finished.
    reservations: DashMap<DeviceId, RunId>,
    history: Mutex<VecDeque<RunReport>>,
}

impl EngineInner {
    /// Claim every bound device for `run`, all or nothing.
    fn reserve(&self, run: RunId, bound: &BTreeMap<RoleName, DeviceHandle>) -> LabResult<()> {
        for (role, handle) in bound {
            let holder = match self.reservations.entry(handle.id().to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(run);
                    continue;
                }
                Entry::Occupied(slot) if *slot.get() == run => continue,
                Entry::Occupied(slot) => *slot.get(),
            };
            self.release(run);
            return Err(LabError::UnboundRole {
                role: role.clone(),
                reason: format!("device '{}' is in use by run {holder}", handle.id()),
            });
        }
        Ok(())
    }

    fn release(&self, run: RunId) {
        self.reservations.retain(|_, holder| *holder != run);
    }
}

/// Executes methods against open devices.
///
/// Cloning is cheap; clones share the same active runs and history.
#[derive(Clone)]
pub struct MethodEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for MethodEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodEngine")
            .field("active", &self.inner.active.len())
            .field("interlock", &self.inner.interlock.is_latched())
            .finish()
    }
}

impl MethodEngine {
    /// Create an engine over `connections`.
    pub fn new(
        settings: EngineSettings,
        connections: Arc<ConnectionManager>,
        bus: EventBus,
        interlock: Interlock,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                settings,
                connections,
                bus,
                interlock,
                active: DashMap::new(),
                reservations: DashMap::new(),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Engine settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Static checks of a method. Same as [`crate::method::validate`].
    pub fn validate(&self, method: &MethodDefinition) -> Vec<ValidationError> {
        validate(method)
    }

    /// Submit a method for execution.
    ///
    /// Fails without starting anything if the safety interlock is latched,
    /// the method does not validate, a role cannot be bound or a bound device
    /// lacks a capability the method uses.
    #[instrument(skip(self, method, bindings), fields(method = method.name()), err)]
    pub fn submit(&self, method: MethodDefinition, bindings: &RoleBindings) -> LabResult<RunHandle> {
        self.inner.interlock.check()?;

        let errors = validate(&method);
        if !errors.is_empty() {
            return Err(LabError::InvalidMethod {
                method: method.name().to_string(),
                errors,
            });
        }

        let bound = binding::resolve(
            &method,
            bindings,
            &self.inner.connections,
            &self.inner.reservations,
        )?;
        binding::check_capabilities(&method, &bound)?;

        let shared = Arc::new(RunShared::new(
            Arc::new(method),
            bound,
            self.inner.settings.clone(),
            self.inner.bus.clone(),
        ));
        self.inner.reserve(shared.id, &shared.bindings)?;
        let handle = RunHandle {
            shared: Arc::clone(&shared),
        };
        self.inner.active.insert(shared.id, handle.clone());
        info!(run_id = %shared.id, method = shared.method.name(), "Run submitted");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            scheduler::drive(Arc::clone(&shared)).await;
            inner.active.remove(&shared.id);
            inner.release(shared.id);
            {
                let mut history = inner.history.lock();
                history.push_back(shared.snapshot());
                while history.len() > inner.settings.history_capacity {
                    history.pop_front();
                }
            }
            shared.finish();
        });

        Ok(handle)
    }

    /// Handle of an active run.
    pub fn run(&self, id: RunId) -> Option<RunHandle> {
        self.inner.active.get(&id).map(|r| r.value().clone())
    }

    /// Report of an active or archived run.
    pub fn report(&self, id: RunId) -> Option<RunReport> {
        if let Some(run) = self.run(id) {
            return Some(run.snapshot());
        }
        self.inner
            .history
            .lock()
            .iter()
            .rev()
            .find(|r| r.run_id == id)
            .cloned()
    }

    /// Ids of runs that have not finished.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.inner.active.iter().map(|r| *r.key()).collect()
    }

    /// Archived reports, oldest first.
    pub fn history(&self) -> Vec<RunReport> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// Whether new submissions are refused after an emergency stop.
    pub fn interlock(&self) -> &Interlock {
        &self.inner.interlock
    }

    /// Abort every active run and wait for all of them to finish.
    pub async fn shutdown(&self) {
        let runs: Vec<RunHandle> = self.inner.active.iter().map(|r| r.value().clone()).collect();
        for run in &runs {
            run.shared.abort(LabError::Aborted {
                reason: "engine shutdown".to_string(),
            });
        }
        for run in runs {
            run.wait().await;
        }
    }
}

impl RunControl for MethodEngine {
    fn runs_using(&self, device_id: &str) -> Vec<RunId> {
        self.inner
            .active
            .iter()
            .filter(|r| r.value().shared.bindings.values().any(|h| h.id() == device_id))
            .map(|r| *r.key())
            .collect()
    }

    fn all_runs(&self) -> Vec<RunId> {
        self.active_runs()
    }

    fn pause_run(&self, run: RunId) -> bool {
        self.run(run).is_some_and(|r| r.pause())
    }

    fn abort_run(&self, run: RunId, cause: LabError) -> bool {
        self.run(run).is_some_and(|r| r.shared.abort(cause))
    }
}
