//! Device Interface Layer
//!
//! Identity and registration records for instruments, the per-category
//! capability contracts, and the runtime [`DeviceHandle`] that binds a
//! [`DeviceSpec`] to an exclusively owned transport.
//!
//! ```text
//! DeviceSpec ──open──▶ ConnectionManager ──resolve──▶ DriverRegistry
//!                             │                             │
//!                             ▼                             ▼
//!                      DeviceHandle ◀──── DeviceComponents (Pump, Valve, ...)
//! ```

pub mod capabilities;
pub mod components;
pub mod deck;
pub mod handle;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capabilities::{
    Capability, Detector, Instrument, LiquidHandler, OpOutput, Operation, Pump, Reading,
    TemperatureController, Valve,
};
pub use components::DeviceComponents;
pub use deck::{BedAssignment, Deck, RackLayout};
pub use handle::{DeviceHandle, HandleState, IdleOutcome};

/// Device instance identifier (unique within a process).
pub type DeviceId = String;

/// Class of instrument sharing a capability contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    /// Syringe and peristaltic pumps.
    Pump,
    /// XYZ liquid handling robots.
    LiquidHandler,
    /// Heaters, chillers and thermoelectric controllers.
    TemperatureController,
    /// Selector and switching valves.
    Valve,
    /// UV/VIS and chromatography detectors.
    Detector,
}

impl DeviceCategory {
    /// All categories, in declaration order.
    pub const ALL: [DeviceCategory; 5] = [
        DeviceCategory::Pump,
        DeviceCategory::LiquidHandler,
        DeviceCategory::TemperatureController,
        DeviceCategory::Valve,
        DeviceCategory::Detector,
    ];

    /// Stable snake_case name.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCategory::Pump => "pump",
            DeviceCategory::LiquidHandler => "liquid_handler",
            DeviceCategory::TemperatureController => "temperature_controller",
            DeviceCategory::Valve => "valve",
            DeviceCategory::Detector => "detector",
        }
    }

    /// Full capability contract of the category.
    pub fn capabilities(&self) -> &'static [Capability] {
        Capability::for_category(*self)
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Who a device is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Category of the instrument.
    pub category: DeviceCategory,
    /// Manufacturer, e.g. `"vici"` or `"sim"`.
    pub vendor: String,
    /// Model, e.g. `"m6"`.
    pub model: String,
    /// Instance id, unique in the process (e.g. `"pump_1"`).
    pub instance_id: DeviceId,
}

impl DeviceIdentity {
    /// Driver registry key: `"{vendor}/{model}"`.
    pub fn vendor_model(&self) -> String {
        format!("{}/{}", self.vendor, self.model)
    }
}

/// Kind of physical channel used to reach an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process simulated channel.
    Simulated,
    /// Line-oriented TCP socket (`host:port`).
    Tcp,
    /// RS-232/USB serial port (`/dev/ttyUSB0`).
    Serial,
}

/// How to reach a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Transport kind.
    pub kind: TransportKind,
    /// Physical address. Exclusivity is enforced per `(kind, address)`.
    pub address: String,
    /// Serial baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Line terminator appended to requests and expected on replies.
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Read timeout for a single request/response exchange.
    #[serde(default = "default_exchange_timeout", with = "humantime_serde")]
    pub exchange_timeout: Duration,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_terminator() -> String {
    "\r".to_string()
}

fn default_exchange_timeout() -> Duration {
    crate::limits::EXCHANGE_TIMEOUT
}

impl ConnectionDescriptor {
    /// Descriptor for a simulated channel.
    pub fn simulated(address: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Simulated,
            address: address.into(),
            baud_rate: default_baud_rate(),
            terminator: default_terminator(),
            exchange_timeout: default_exchange_timeout(),
        }
    }

    /// Exclusivity key for the connection manager's address table.
    pub fn claim_key(&self) -> String {
        let kind = match self.kind {
            TransportKind::Simulated => "sim",
            TransportKind::Tcp => "tcp",
            TransportKind::Serial => "serial",
        };
        format!("{kind}://{}", self.address)
    }
}

/// Registration record of one instrument.
///
/// Immutable once a connection is established: the connection manager keeps
/// it behind an `Arc` for the life of the handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Identity.
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    /// Connection descriptor.
    pub connection: ConnectionDescriptor,
    /// Capabilities the installation relies on. Opening fails if the driver
    /// does not offer all of them. Empty means "whatever the driver offers".
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,
    /// Driver-specific settings forwarded to the driver factory.
    #[serde(default = "empty_table")]
    pub settings: toml::Value,
    /// Period of the background telemetry poller, if any.
    #[serde(default, with = "humantime_serde")]
    pub telemetry_interval: Option<Duration>,
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl DeviceSpec {
    /// New spec for a physical device. No required capabilities, empty
    /// settings, no telemetry poller.
    pub fn new(identity: DeviceIdentity, connection: ConnectionDescriptor) -> Self {
        Self {
            identity,
            connection,
            required_capabilities: Vec::new(),
            settings: empty_table(),
            telemetry_interval: None,
        }
    }

    /// New spec with a simulated transport at `sim://{instance_id}`.
    pub fn simulated(
        category: DeviceCategory,
        model: impl Into<String>,
        instance_id: impl Into<DeviceId>,
    ) -> Self {
        let instance_id = instance_id.into();
        let connection = ConnectionDescriptor::simulated(instance_id.clone());
        Self::new(
            DeviceIdentity {
                category,
                vendor: "sim".to_string(),
                model: model.into(),
                instance_id,
            },
            connection,
        )
    }

    /// Replace the driver settings.
    pub fn with_settings(mut self, settings: toml::Value) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the connection descriptor.
    pub fn with_connection(mut self, connection: ConnectionDescriptor) -> Self {
        self.connection = connection;
        self
    }

    /// Enable background telemetry polling.
    pub fn with_telemetry_interval(mut self, interval: Duration) -> Self {
        self.telemetry_interval = Some(interval);
        self
    }

    /// Require capabilities at open time.
    pub fn requiring(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.required_capabilities = capabilities.into_iter().collect();
        self
    }

    /// Instance id shortcut.
    pub fn id(&self) -> &str {
        &self.identity.instance_id
    }

    /// Category shortcut.
    pub fn category(&self) -> DeviceCategory {
        self.identity.category
    }
}

/// Shared immutable spec.
pub type SharedSpec = Arc<DeviceSpec>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_roundtrips_through_toml() {
        let text = r#"
            category = "pump"
            vendor = "sim"
            model = "syringe"
            instance_id = "pump_1"
            telemetry_interval = "250ms"

            [connection]
            kind = "simulated"
            address = "pump_1"

            [settings]
            max_volume_ul = 5000.0
        "#;
        let spec: DeviceSpec = toml::from_str(text).unwrap();
        assert_eq!(spec.category(), DeviceCategory::Pump);
        assert_eq!(spec.identity.vendor_model(), "sim/syringe");
        assert_eq!(spec.telemetry_interval, Some(Duration::from_millis(250)));
        assert_eq!(spec.connection.baud_rate, 9600);
        assert_eq!(spec.connection.claim_key(), "sim://pump_1");
    }

    #[test]
    fn physical_spec_starts_without_extras() {
        let connection = ConnectionDescriptor {
            kind: TransportKind::Tcp,
            ..ConnectionDescriptor::simulated("10.0.0.12:4001")
        };
        let spec = DeviceSpec::new(
            DeviceIdentity {
                category: DeviceCategory::Valve,
                vendor: "vici".to_string(),
                model: "m6".to_string(),
                instance_id: "valve_1".to_string(),
            },
            connection,
        );
        assert_eq!(spec.id(), "valve_1");
        assert_eq!(spec.connection.claim_key(), "tcp://10.0.0.12:4001");
        assert!(spec.required_capabilities.is_empty());
        assert_eq!(spec.telemetry_interval, None);
    }

    #[test]
    fn every_category_has_a_contract() {
        for category in DeviceCategory::ALL {
            assert!(!category.capabilities().is_empty(), "{category}");
        }
    }
}
