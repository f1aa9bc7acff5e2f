//! Composition root.
//!
//! [`Lab`] owns the process-wide pieces and wires them together explicitly:
//!
//! ```text
//!  DriverRegistry ─┐
//!  Connector ──────┼─▶ ConnectionManager ─▶ MethodEngine ◀─ Interlock ─┐
//!  EventBus ───────┘          │                  ▲                     │
//!                             └──── SafetyMonitor ┴── RunControl ───────┘
//! ```
//!
//! Nothing here is global: every component receives its collaborators as
//! constructor arguments, and `shutdown` tears them down in reverse order.

use std::sync::Arc;

use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::LabConfig;
use crate::connection::ConnectionManager;
use crate::drivers::register_simulated_drivers;
use crate::engine::MethodEngine;
use crate::error::LabResult;
use crate::registry::DriverRegistry;
use crate::safety::{Interlock, SafetyMonitor};
use crate::transport::{MixedConnector, SimulatedConnector, TransportConnector};

/// Running lab: registry, bus, connections, engine and safety monitor.
#[derive(Debug)]
pub struct Lab {
    config: LabConfig,
    registry: Arc<DriverRegistry>,
    bus: EventBus,
    connections: Arc<ConnectionManager>,
    engine: MethodEngine,
    monitor: SafetyMonitor,
}

impl Lab {
    /// Start with the built-in simulated drivers. Simulated devices use an
    /// in-process connector; TCP and serial devices use the native one.
    pub async fn start(config: LabConfig) -> LabResult<Self> {
        let registry = Arc::new(DriverRegistry::new());
        register_simulated_drivers(&registry)?;
        let connector = Arc::new(MixedConnector::new(SimulatedConnector::new()));
        Self::start_with(config, registry, connector).await
    }

    /// Start with a caller-supplied registry and connector.
    ///
    /// Every configured device is registered and opened; if any fails to
    /// open, the ones already open are closed again and the error returned.
    pub async fn start_with(
        config: LabConfig,
        registry: Arc<DriverRegistry>,
        connector: Arc<dyn TransportConnector>,
    ) -> LabResult<Self> {
        config.validate()?;
        let rules = config.rule_set()?;
        let bus = EventBus::new();
        let connections = Arc::new(ConnectionManager::new(
            config.connection.clone(),
            connector,
            Arc::clone(&registry),
            bus.clone(),
        ));

        for spec in &config.devices {
            connections.register(spec.clone())?;
        }
        for spec in &config.devices {
            if let Err(e) = connections.open_registered(spec.id()).await {
                warn!(device = %spec.id(), error = %e, "Device failed to open; closing lab");
                connections.close_all().await;
                return Err(e);
            }
        }

        let interlock = Interlock::new();
        let engine = MethodEngine::new(
            config.engine.clone(),
            Arc::clone(&connections),
            bus.clone(),
            interlock.clone(),
        );
        let monitor = SafetyMonitor::spawn(
            rules,
            &bus,
            Arc::new(engine.clone()),
            Arc::clone(&connections),
            interlock,
            config.engine.safe_stop_timeout,
        );

        info!(
            devices = config.devices.len(),
            rules = config.safety.len(),
            drivers = registry.len(),
            "Lab started"
        );
        Ok(Self {
            config,
            registry,
            bus,
            connections,
            engine,
            monitor,
        })
    }

    /// Configuration the lab was started with.
    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    /// Driver registry.
    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Connection manager.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Method engine.
    pub fn engine(&self) -> &MethodEngine {
        &self.engine
    }

    /// Safety monitor.
    pub fn monitor(&self) -> &SafetyMonitor {
        &self.monitor
    }

    /// Abort active runs, stop the monitor and close every device.
    pub async fn shutdown(mut self) {
        self.engine.shutdown().await;
        self.monitor.shutdown().await;
        self.connections.close_all().await;
        info!("Lab shut down");
    }
}
