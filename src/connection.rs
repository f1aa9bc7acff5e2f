//! Connection Manager
//!
//! Owns the lifecycle of every device transport: acquire (`open`), release
//! (`close`), re-acquire with backoff (`reconnect`) and explicit recovery of
//! faulted handles (`recover`).
//!
//! # Exclusivity
//!
//! Every physical address (`sim://pump_1`, `tcp://10.0.0.5:4001`,
//! `serial:///dev/ttyUSB0`) can be held by one handle at a time. The claim is
//! taken atomically before any I/O, so two concurrent `open` calls for the
//! same address cannot both succeed. Claims are released by `close` and, if
//! the owner never closes, when the last clone of the handle is dropped.
//!
//! Device ids are exclusive the same way: an id is marked as opening before
//! any I/O, so two concurrent opens of one id (even at different addresses)
//! cannot both succeed. A failed open publishes `Connecting → Disconnected`.
//!
//! # Reconnect backoff
//!
//! ```text
//! attempt:   1      2      3      4      5
//! delay:   250ms  500ms   1s     2s    (exhausted)
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::bus::{EventBus, EventKind, TelemetrySink};
use crate::device::{
    Capability, DeviceComponents, DeviceHandle, DeviceId, DeviceSpec, HandleState, SharedSpec,
};
use crate::error::{LabError, LabResult};
use crate::limits;
use crate::registry::{DriverContext, DriverFactory, DriverRegistry};
use crate::transport::{SharedTransport, TransportConnector};

// =============================================================================
// Settings
// =============================================================================

/// Exponential backoff for `reconnect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Attempts before giving up. Always bounded.
    pub max_attempts: u32,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: limits::RECONNECT_INITIAL_DELAY,
            max_delay: limits::RECONNECT_MAX_DELAY,
            backoff_multiplier: 2.0,
            max_attempts: limits::RECONNECT_MAX_ATTEMPTS,
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let delay = if self.jitter {
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

/// Connection manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Bound on acquiring a transport.
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            open_timeout: limits::OPEN_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// =============================================================================
// Address claims
// =============================================================================

type ClaimTable = Arc<DashMap<String, DeviceId>>;

/// Exclusive hold on one physical address. Released on drop.
#[derive(Debug)]
pub struct AddressClaim {
    table: ClaimTable,
    key: String,
    holder: DeviceId,
}

impl Drop for AddressClaim {
    fn drop(&mut self) {
        self.table.remove_if(&self.key, |_, holder| *holder == self.holder);
    }
}

// Marks a device id as being opened for the duration of `open_shared`.
struct OpeningId<'a> {
    set: &'a DashSet<DeviceId>,
    id: DeviceId,
}

impl Drop for OpeningId<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Owns device transports and hands out [`DeviceHandle`]s.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    connector: Arc<dyn TransportConnector>,
    drivers: Arc<DriverRegistry>,
    bus: EventBus,
    claims: ClaimTable,
    opening: DashSet<DeviceId>,
    specs: DashMap<DeviceId, SharedSpec>,
    handles: DashMap<DeviceId, DeviceHandle>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .field("open", &self.handles.len())
            .field("registered", &self.specs.len())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager.
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn TransportConnector>,
        drivers: Arc<DriverRegistry>,
        bus: EventBus,
    ) -> Self {
        Self {
            settings,
            connector,
            drivers,
            bus,
            claims: Arc::new(DashMap::new()),
            opening: DashSet::new(),
            specs: DashMap::new(),
            handles: DashMap::new(),
        }
    }

    /// Settings in effect.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Record a device spec for later `open_registered`.
    pub fn register(&self, spec: DeviceSpec) -> LabResult<()> {
        match self.specs.entry(spec.id().to_string()) {
            Entry::Occupied(_) => Err(LabError::Configuration(format!(
                "device '{}' is already registered",
                spec.id()
            ))),
            Entry::Vacant(slot) => {
                info!(device = %spec.id(), category = %spec.category(), "Device registered");
                slot.insert(Arc::new(spec));
                Ok(())
            }
        }
    }

    /// Close the device if open and forget its spec.
    pub async fn deregister(&self, id: &str) -> LabResult<bool> {
        if let Some(handle) = self.handle(id) {
            self.close(&handle).await?;
        }
        Ok(self.specs.remove(id).is_some())
    }

    /// Registered specs, sorted by id.
    pub fn registered(&self) -> Vec<SharedSpec> {
        let mut specs: Vec<_> = self.specs.iter().map(|e| Arc::clone(e.value())).collect();
        specs.sort_by(|a, b| a.id().cmp(b.id()));
        specs
    }

    /// Open a previously registered device.
    pub async fn open_registered(&self, id: &str) -> LabResult<DeviceHandle> {
        let spec = self
            .specs
            .get(id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| LabError::Configuration(format!("device '{id}' is not registered")))?;
        self.open_shared(spec).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Acquire the device's transport and bind a driver to it.
    pub async fn open(&self, spec: DeviceSpec) -> LabResult<DeviceHandle> {
        self.open_shared(Arc::new(spec)).await
    }

    #[instrument(skip(self, spec), fields(device = %spec.id()), err)]
    async fn open_shared(&self, spec: SharedSpec) -> LabResult<DeviceHandle> {
        let id = spec.id().to_string();
        // Mark before looking at `handles`: a finished open inserts its
        // handle before it unmarks, so one of the two checks always sees it.
        if !self.opening.insert(id.clone()) {
            return Err(LabError::Configuration(format!(
                "device '{id}' is already being opened"
            )));
        }
        let _opening = OpeningId {
            set: &self.opening,
            id: id.clone(),
        };
        if self.handles.contains_key(&id) {
            return Err(LabError::Configuration(format!(
                "device '{id}' is already open"
            )));
        }

        let vendor_model = spec.identity.vendor_model();
        let factory = self.drivers.resolve(spec.category(), &vendor_model)?;
        factory
            .validate(&spec.settings)
            .map_err(|e| LabError::Configuration(format!("device '{id}': {e:#}")))?;
        let capabilities = negotiate(&spec, factory.capabilities())?;

        let claim = self.claim(&spec)?;
        self.bus.publish(
            id.clone(),
            EventKind::DeviceState {
                device_id: id.clone(),
                from: HandleState::Disconnected,
                to: HandleState::Connecting,
            },
        );

        let (transport, components) = match self.connect_driver(&spec, factory.as_ref()).await {
            Ok(connected) => connected,
            Err(e) => {
                self.bus.publish(
                    id.clone(),
                    EventKind::DeviceState {
                        device_id: id.clone(),
                        from: HandleState::Connecting,
                        to: HandleState::Disconnected,
                    },
                );
                return Err(e);
            }
        };

        let handle = DeviceHandle::new(
            Arc::clone(&spec),
            capabilities,
            components,
            transport,
            self.bus.clone(),
            claim,
        );
        handle.set_state(HandleState::Ready);
        if let Some(interval) = spec.telemetry_interval {
            handle.start_poller(interval);
        }
        self.handles.insert(id.clone(), handle.clone());

        info!(
            device = %id,
            driver = factory.name(),
            address = %spec.connection.claim_key(),
            "Device opened"
        );
        Ok(handle)
    }

    async fn connect_driver(
        &self,
        spec: &SharedSpec,
        factory: &dyn DriverFactory,
    ) -> LabResult<(SharedTransport, DeviceComponents)> {
        let transport: SharedTransport =
            Arc::new(Mutex::new(self.connector.connect(&spec.connection)?));
        self.open_transport(&transport, spec).await?;

        let ctx = DriverContext {
            spec: Arc::clone(spec),
            transport: Arc::clone(&transport),
            telemetry: TelemetrySink::new(self.bus.clone(), spec.category(), spec.id()),
        };
        let message = match factory.build(ctx).await {
            Ok(components) if components.implements(spec.category()) => {
                return Ok((transport, components))
            }
            Ok(_) => format!(
                "driver '{}' does not expose the {} contract",
                factory.name(),
                spec.category()
            ),
            Err(e) => format!("{e:#}"),
        };
        let _ = transport.lock().await.close().await;
        Err(LabError::Driver {
            device: spec.id().to_string(),
            message,
        })
    }

    fn claim(&self, spec: &DeviceSpec) -> LabResult<AddressClaim> {
        let key = spec.connection.claim_key();
        match self.claims.entry(key.clone()) {
            Entry::Occupied(held) => Err(LabError::AddressInUse {
                address: key,
                holder: held.get().clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(spec.id().to_string());
                Ok(AddressClaim {
                    table: Arc::clone(&self.claims),
                    key,
                    holder: spec.id().to_string(),
                })
            }
        }
    }

    async fn open_transport(&self, transport: &SharedTransport, spec: &DeviceSpec) -> LabResult<()> {
        let address = spec.connection.claim_key();
        let timeout = self.settings.open_timeout;
        let mut guard = transport.lock().await;
        match tokio::time::timeout(timeout, guard.open()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(LabError::Transport { message, .. })) => {
                Err(LabError::TransportUnavailable {
                    address,
                    reason: message,
                })
            }
            Ok(Err(other)) => Err(other),
            Err(_) => Err(LabError::TransportUnavailable {
                address,
                reason: format!("not acquired within {timeout:?}"),
            }),
        }
    }

    /// Release the device's transport and address claim.
    ///
    /// Idempotent: closing a closed handle is a no-op.
    #[instrument(skip(self, handle), fields(device = %handle.id()))]
    pub async fn close(&self, handle: &DeviceHandle) -> LabResult<()> {
        handle.stop_poller();
        {
            let mut transport = handle.transport().lock().await;
            if transport.is_open() {
                if let Err(e) = transport.close().await {
                    warn!(device = %handle.id(), error = %e, "Transport close reported an error");
                }
            }
        }
        handle.set_state(HandleState::Disconnected);
        let released = handle.release_claim();
        self.handles.remove_if(handle.id(), |_, held| held.same_as(handle));
        if released {
            info!(device = %handle.id(), "Device closed");
        }
        Ok(())
    }

    /// Close every open handle.
    pub async fn close_all(&self) {
        for handle in self.handles() {
            let _ = self.close(&handle).await;
        }
    }

    /// Re-acquire the transport with exponential backoff.
    ///
    /// Fails with [`LabError::ReconnectExhausted`] after the configured number
    /// of attempts and leaves the handle `Faulted`.
    #[instrument(skip(self, handle), fields(device = %handle.id()), err)]
    pub async fn reconnect(&self, handle: &DeviceHandle) -> LabResult<()> {
        match handle.state() {
            HandleState::Disconnected | HandleState::Busy => {
                return Err(LabError::DeviceUnavailable {
                    device: handle.id().to_string(),
                    state: handle.state(),
                })
            }
            _ => {}
        }

        let policy = &self.settings.reconnect;
        let attempts = policy.max_attempts.max(1);
        handle.set_state(HandleState::Connecting);
        {
            let _ = handle.transport().lock().await.close().await;
        }

        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.open_transport(handle.transport(), handle.spec()).await {
                Ok(()) => {
                    handle.set_state(HandleState::Ready);
                    info!(device = %handle.id(), attempt, "Device reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(device = %handle.id(), attempt, error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        let err = LabError::ReconnectExhausted {
            device: handle.id().to_string(),
            attempts,
            last_error,
        };
        handle.mark_faulted(err.clone());
        Err(err)
    }

    /// Explicit recovery of a `Faulted` handle. No-op for a `Ready` handle.
    pub async fn recover(&self, handle: &DeviceHandle) -> LabResult<()> {
        match handle.state() {
            HandleState::Ready => Ok(()),
            _ => self.reconnect(handle).await,
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Open handle by instance id.
    pub fn handle(&self, id: &str) -> Option<DeviceHandle> {
        self.handles.get(id).map(|h| h.value().clone())
    }

    /// All open handles, sorted by id.
    pub fn handles(&self) -> Vec<DeviceHandle> {
        let mut handles: Vec<_> = self.handles.iter().map(|h| h.value().clone()).collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    /// Whether `address` (a claim key) is currently held.
    pub fn is_claimed(&self, claim_key: &str) -> bool {
        self.claims.contains_key(claim_key)
    }
}

/// Intersect the driver's declared capabilities with the category contract
/// and check the device's required capabilities against it.
fn negotiate(spec: &DeviceSpec, declared: &[Capability]) -> LabResult<BTreeSet<Capability>> {
    let contract = spec.category().capabilities();
    let mut negotiated = BTreeSet::new();
    for capability in declared {
        if !contract.contains(capability) {
            return Err(LabError::Driver {
                device: spec.id().to_string(),
                message: format!(
                    "driver declares '{capability}', which is not part of the {} contract",
                    spec.category()
                ),
            });
        }
        negotiated.insert(*capability);
    }
    if let Some(missing) = spec
        .required_capabilities
        .iter()
        .find(|c| !negotiated.contains(*c))
    {
        return Err(LabError::Unsupported {
            device: spec.id().to_string(),
            capability: missing.name().to_string(),
        });
    }
    Ok(negotiated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_attempts: 6,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            jitter: true,
            ..ReconnectPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn negotiation_rejects_foreign_capabilities() {
        let spec = DeviceSpec::simulated(crate::device::DeviceCategory::Valve, "selector", "v1");
        let err = negotiate(&spec, &[Capability::Dispense]).unwrap_err();
        assert!(matches!(err, LabError::Driver { .. }));
    }

    #[test]
    fn negotiation_checks_required_capabilities() {
        let spec = DeviceSpec::simulated(crate::device::DeviceCategory::Pump, "syringe", "p1")
            .requiring([Capability::ReadPressure]);
        let err = negotiate(&spec, &[Capability::Dispense, Capability::StopFlow]).unwrap_err();
        assert!(matches!(err, LabError::Unsupported { capability, .. } if capability == "read_pressure"));

        let ok = negotiate(&spec, &[Capability::Dispense, Capability::ReadPressure]).unwrap();
        assert_eq!(ok.len(), 2);
    }
}
