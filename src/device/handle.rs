//! Runtime device handle and its state machine.
//!
//! ```text
//!                  open                 execute            op done
//!  Disconnected ──────────▶ Connecting ────▶ Ready ──────────▶ Busy ──┐
//!       ▲                                     ▲ ▲                     │
//!       │ close                     recover   │ └─────────────────────┘
//!       └──────────────────── Faulted ◀───────┘   transport error / safety trip
//! ```
//!
//! Next to the state, every handle carries a *stop latch* that makes the
//! safe-idle command exactly-once:
//!
//! - `Done`: the device is idle, nothing to stop
//! - `Armed`: an operation has run since the last stop
//! - `InFlight`: a stop is being sent; new operations are rejected
//!
//! Operations are serialized by a per-handle lock held for the whole `Busy`
//! period. Safe-idle and emergency stops bypass that lock so a safety action
//! is never queued behind a slow device operation.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::capabilities::{Capability, OpOutput, Operation, Reading};
use super::components::DeviceComponents;
use super::{DeviceCategory, SharedSpec};
use crate::bus::{EventBus, EventKind, Telemetry};
use crate::connection::AddressClaim;
use crate::error::{LabError, LabResult};
use crate::transport::SharedTransport;

/// Lifecycle state of a [`DeviceHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    /// Transport released.
    Disconnected,
    /// Transport being acquired.
    Connecting,
    /// Idle and accepting operations.
    Ready,
    /// An operation is in progress.
    Busy,
    /// Transport error or safety trip; needs explicit recovery.
    Faulted,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandleState::Disconnected => "disconnected",
            HandleState::Connecting => "connecting",
            HandleState::Ready => "ready",
            HandleState::Busy => "busy",
            HandleState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Result of a safe-idle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// This call sent the stop command.
    Stopped,
    /// Nothing had run since the last stop.
    AlreadyIdle,
    /// Another caller was sending the stop; this call waited for it.
    AlreadyStopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopLatch {
    Done,
    Armed,
    InFlight,
}

struct Status {
    state: HandleState,
    latch: StopLatch,
    fault: Option<LabError>,
}

pub(crate) struct HandleInner {
    spec: SharedSpec,
    capabilities: BTreeSet<Capability>,
    components: DeviceComponents,
    transport: SharedTransport,
    bus: EventBus,
    status: Mutex<Status>,
    stop_done: Notify,
    safe_stops: std::sync::atomic::AtomicU64,
    op_lock: tokio::sync::Mutex<()>,
    claim: Mutex<Option<AddressClaim>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.abort();
        }
        // Address claim is released by its own Drop; the transport needs an
        // async close if it is still open.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            runtime.spawn(async move {
                let _ = transport.lock().await.close().await;
            });
        }
    }
}

/// Runtime binding of a device spec to an exclusively owned transport.
///
/// Cloning a handle is cheap; all clones refer to the same device.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceHandle {
    pub(crate) fn new(
        spec: SharedSpec,
        capabilities: BTreeSet<Capability>,
        components: DeviceComponents,
        transport: SharedTransport,
        bus: EventBus,
        claim: AddressClaim,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                spec,
                capabilities,
                components,
                transport,
                bus,
                // State of a freshly opened device is unknown; its first
                // safe-idle request always reaches the hardware.
                status: Mutex::new(Status {
                    state: HandleState::Connecting,
                    latch: StopLatch::Armed,
                    fault: None,
                }),
                stop_done: Notify::new(),
                safe_stops: std::sync::atomic::AtomicU64::new(0),
                op_lock: tokio::sync::Mutex::new(()),
                claim: Mutex::new(Some(claim)),
                poller: Mutex::new(None),
            }),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Instance id.
    pub fn id(&self) -> &str {
        self.inner.spec.id()
    }

    /// Registration record.
    pub fn spec(&self) -> &SharedSpec {
        &self.inner.spec
    }

    /// Device category.
    pub fn category(&self) -> DeviceCategory {
        self.inner.spec.category()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandleState {
        self.inner.status.lock().state
    }

    /// Error that put the handle into `Faulted`, if any.
    pub fn fault(&self) -> Option<LabError> {
        self.inner.status.lock().fault.clone()
    }

    /// Negotiated capability set.
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.inner.capabilities
    }

    /// Whether the negotiated capability set contains `capability`.
    pub fn supports(&self, capability: Capability) -> bool {
        self.inner.capabilities.contains(&capability)
    }

    /// Number of safe-idle commands actually sent to the device.
    pub fn safe_stop_count(&self) -> u64 {
        self.inner
            .safe_stops
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Whether two handles refer to the same device binding.
    pub fn same_as(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn transport(&self) -> &SharedTransport {
        &self.inner.transport
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    pub(crate) fn set_state(&self, to: HandleState) {
        let from = {
            let mut status = self.inner.status.lock();
            let from = status.state;
            status.state = to;
            if to != HandleState::Faulted {
                status.fault = None;
            }
            from
        };
        self.announce(from, to);
    }

    fn announce(&self, from: HandleState, to: HandleState) {
        if from == to {
            return;
        }
        debug!(device = %self.id(), %from, %to, "Device state change");
        self.inner.bus.publish(
            self.id(),
            EventKind::DeviceState {
                device_id: self.id().to_string(),
                from,
                to,
            },
        );
    }

    /// Put the handle into `Faulted`. Only explicit recovery leaves it.
    pub(crate) fn mark_faulted(&self, cause: LabError) {
        let from = {
            let mut status = self.inner.status.lock();
            if status.state == HandleState::Disconnected {
                return;
            }
            let from = status.state;
            status.state = HandleState::Faulted;
            status.fault = Some(cause.clone());
            from
        };
        warn!(device = %self.id(), error = %cause, "Device faulted");
        self.announce(from, HandleState::Faulted);
    }

    fn begin_operation(&self) -> LabResult<()> {
        let mut status = self.inner.status.lock();
        if status.latch == StopLatch::InFlight {
            return Err(LabError::StopInProgress {
                device: self.id().to_string(),
            });
        }
        if status.state != HandleState::Ready {
            return Err(LabError::DeviceUnavailable {
                device: self.id().to_string(),
                state: status.state,
            });
        }
        status.state = HandleState::Busy;
        status.latch = StopLatch::Armed;
        drop(status);
        self.announce(HandleState::Ready, HandleState::Busy);
        Ok(())
    }

    fn end_operation(&self) {
        let mut status = self.inner.status.lock();
        if status.state == HandleState::Busy {
            status.state = HandleState::Ready;
            drop(status);
            self.announce(HandleState::Busy, HandleState::Ready);
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Execute one operation.
    ///
    /// Waits for the device's operation lock, moves `Ready → Busy`, runs the
    /// driver call and returns to `Ready`. Cancelling `cancel` interrupts the
    /// wait or the call and yields [`LabError::Aborted`]. Transport failures
    /// fault the handle.
    #[instrument(skip(self, cancel), fields(device = %self.id(), op = op.label()), err)]
    pub async fn execute(
        &self,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> LabResult<OpOutput> {
        let capability = op.capability();
        if !self.supports(capability) {
            return Err(LabError::Unsupported {
                device: self.id().to_string(),
                capability: capability.name().to_string(),
            });
        }

        let _serial = tokio::select! {
            guard = self.inner.op_lock.lock() => guard,
            _ = cancel.cancelled() => return Err(cancelled()),
        };
        self.begin_operation()?;
        let busy = BusyGuard { handle: self };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled()),
            r = self.perform(op) => r,
        };

        if let Err(err) = &result {
            if err.is_transport() {
                self.mark_faulted(err.clone());
            }
        }
        drop(busy);
        result
    }

    async fn perform(&self, op: &Operation) -> LabResult<OpOutput> {
        if let Operation::WaitStable {
            target_celsius,
            tolerance_celsius,
            poll_interval,
        } = op
        {
            return self
                .wait_stable(*target_celsius, *tolerance_celsius, *poll_interval)
                .await;
        }

        let output = self
            .inner
            .components
            .dispatch(op)
            .await
            .map_err(|e| self.driver_error(e))?;
        if let Some(reading) = output.reading() {
            self.publish_reading(reading);
        }
        Ok(output)
    }

    async fn wait_stable(
        &self,
        target: f64,
        tolerance: f64,
        poll_interval: Duration,
    ) -> LabResult<OpOutput> {
        loop {
            let output = self
                .inner
                .components
                .dispatch(&Operation::ReadTemperature)
                .await
                .map_err(|e| self.driver_error(e))?;
            if let Some(reading) = output.reading() {
                self.publish_reading(reading);
                if (reading.value - target).abs() < tolerance {
                    debug!(device = %self.id(), value = reading.value, target, "Temperature stable");
                    return Ok(output);
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn publish_reading(&self, reading: &Reading) {
        self.inner.bus.publish_telemetry(Telemetry {
            category: self.category(),
            device_id: self.id().to_string(),
            field: reading.field.clone(),
            value: reading.value,
            unit: reading.unit.clone(),
        });
    }

    fn driver_error(&self, err: anyhow::Error) -> LabError {
        match err.downcast::<LabError>() {
            Ok(lab) => lab,
            Err(other) => LabError::Driver {
                device: self.id().to_string(),
                message: format!("{other:#}"),
            },
        }
    }

    // =========================================================================
    // Safe idle
    // =========================================================================

    /// Return the device to its safe idle state, exactly once per activity.
    ///
    /// The first caller after an operation sends the stop; concurrent callers
    /// wait for it; later callers return [`IdleOutcome::AlreadyIdle`] without
    /// touching the device.
    #[instrument(skip(self), fields(device = %self.id()))]
    pub async fn safe_idle(&self, timeout: Duration) -> LabResult<IdleOutcome> {
        loop {
            let notified = self.inner.stop_done.notified();
            {
                let mut status = self.inner.status.lock();
                match status.latch {
                    StopLatch::Done => return Ok(IdleOutcome::AlreadyIdle),
                    StopLatch::Armed => {
                        status.latch = StopLatch::InFlight;
                        break;
                    }
                    StopLatch::InFlight => {}
                }
            }
            notified.await;
            if self.inner.status.lock().latch == StopLatch::Done {
                return Ok(IdleOutcome::AlreadyStopping);
            }
        }

        let result = tokio::time::timeout(timeout, self.inner.components.instrument.safe_stop())
            .await
            .map_err(|_| LabError::Driver {
                device: self.id().to_string(),
                message: format!("safe stop did not finish within {timeout:?}"),
            })
            .and_then(|r| r.map_err(|e| self.driver_error(e)));

        self.inner
            .safe_stops
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.status.lock().latch = StopLatch::Done;
        self.inner.stop_done.notify_waiters();

        match result {
            Ok(()) => {
                info!(device = %self.id(), "Device returned to safe idle");
                Ok(IdleOutcome::Stopped)
            }
            Err(err) => {
                if err.is_transport() {
                    self.mark_faulted(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Stop the device and latch it `Faulted` with `cause`.
    ///
    /// Used by the safety monitor; the device stays unusable until recovered.
    pub async fn emergency_stop(&self, cause: LabError, timeout: Duration) -> LabResult<()> {
        // Faulted first so no new operation can start while the stop is sent.
        self.mark_faulted(cause);
        self.safe_idle(timeout).await.map(|_| ())
    }

    // =========================================================================
    // Telemetry poller
    // =========================================================================

    pub(crate) fn start_poller(&self, interval: Duration) {
        let weak: Weak<HandleInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let handle = DeviceHandle { inner };
                match handle.state() {
                    HandleState::Disconnected => break,
                    HandleState::Faulted | HandleState::Connecting => continue,
                    HandleState::Ready | HandleState::Busy => {}
                }
                match handle.inner.components.instrument.sample().await {
                    Ok(readings) => {
                        for reading in &readings {
                            handle.publish_reading(reading);
                        }
                    }
                    Err(e) => debug!(device = %handle.id(), error = %e, "Telemetry sample failed"),
                }
            }
        });
        if let Some(previous) = self.inner.poller.lock().replace(task) {
            previous.abort();
        }
    }

    pub(crate) fn stop_poller(&self) {
        if let Some(task) = self.inner.poller.lock().take() {
            task.abort();
        }
    }

    /// Release the address claim. Returns whether a claim was held.
    pub(crate) fn release_claim(&self) -> bool {
        self.inner.claim.lock().take().is_some()
    }
}

fn cancelled() -> LabError {
    LabError::Aborted {
        reason: "operation cancelled".to_string(),
    }
}

/// Returns the handle to `Ready` when an operation ends, including when the
/// operation future is dropped mid-flight.
struct BusyGuard<'a> {
    handle: &'a DeviceHandle,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.handle.end_operation();
    }
}
