//! Shared fixtures for the integration tests.
//!
//! Every lab here runs on simulated devices behind a [`SimulatedConnector`]
//! the test keeps a clone of, so transport faults can be injected while the
//! lab is running. Tests run with a paused tokio clock; simulated timing
//! advances instantly whenever every task is idle.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use autolab::config::LabConfig;
use autolab::device::{DeviceCategory, DeviceSpec};
use autolab::drivers::register_simulated_drivers;
use autolab::lab::Lab;
use autolab::registry::DriverRegistry;
use autolab::safety::SafetyRule;
use autolab::transport::SimulatedConnector;

/// Running lab plus the simulator behind it.
pub struct TestLab {
    pub lab: Lab,
    pub sim: SimulatedConnector,
}

/// Parse inline TOML driver settings.
pub fn settings(text: &str) -> toml::Value {
    toml::Value::Table(text.parse::<toml::Table>().unwrap())
}

pub fn heater(id: &str) -> DeviceSpec {
    DeviceSpec::simulated(DeviceCategory::TemperatureController, "heater", id)
}

/// Heater whose loop settles `offset` degrees away from its setpoint.
pub fn offset_heater(id: &str, offset: f64) -> DeviceSpec {
    heater(id).with_settings(settings(&format!(
        "steady_state_offset_celsius = {offset}"
    )))
}

pub fn syringe(id: &str) -> DeviceSpec {
    DeviceSpec::simulated(DeviceCategory::Pump, "syringe", id)
}

pub fn peristaltic(id: &str) -> DeviceSpec {
    DeviceSpec::simulated(DeviceCategory::Pump, "peristaltic", id)
}

pub fn valve(id: &str) -> DeviceSpec {
    DeviceSpec::simulated(DeviceCategory::Valve, "selector", id)
}

pub fn detector(id: &str) -> DeviceSpec {
    DeviceSpec::simulated(DeviceCategory::Detector, "uv", id)
}

pub fn config(devices: Vec<DeviceSpec>, safety: Vec<SafetyRule>) -> LabConfig {
    LabConfig {
        devices,
        safety,
        ..Default::default()
    }
}

pub async fn start_lab(devices: Vec<DeviceSpec>) -> TestLab {
    start_lab_with(config(devices, Vec::new())).await
}

pub async fn start_lab_with(config: LabConfig) -> TestLab {
    let registry = Arc::new(DriverRegistry::new());
    register_simulated_drivers(&registry).unwrap();
    let sim = SimulatedConnector::new();
    let lab = Lab::start_with(config, registry, Arc::new(sim.clone()))
        .await
        .unwrap();
    TestLab { lab, sim }
}

/// Requests the simulator saw on `address` that start with `verb`.
pub fn commands(sim: &SimulatedConnector, address: &str, verb: &str) -> usize {
    sim.exchanges(address)
        .iter()
        .filter(|c| c.starts_with(verb))
        .count()
}

/// Seconds between two offsets, for readable assertions.
pub fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}
