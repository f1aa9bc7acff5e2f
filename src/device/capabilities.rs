//! Per-category capability contracts
//!
//! Each device category has a fixed set of named operations ([`Capability`])
//! with typed parameters ([`Operation`]) and typed results ([`OpOutput`]).
//! Drivers implement the trait of their category plus the [`Instrument`]
//! base trait, and their factory declares which capabilities are actually
//! supported. A driver that cannot perform an operation returns
//! [`LabError::Unsupported`] and omits it from its declaration; it never
//! silently succeeds.
//!
//! # Design
//!
//! Like the rest of the device layer, every trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Takes `&self`; drivers keep state behind interior mutability
//!
//! The engine only sees `Operation` values and dispatches them through
//! [`DeviceComponents`](super::DeviceComponents); it never downcasts drivers.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::DeviceCategory;
use crate::error::LabError;

// =============================================================================
// Capability names
// =============================================================================

/// Named operation of a device category.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    // Pump
    SetFlowRate,
    Aspirate,
    Dispense,
    StopFlow,
    ReadPressure,
    SelectSyringe,
    // Temperature controller
    SetSetpoint,
    ReadTemperature,
    // Valve
    SelectPosition,
    ReadPosition,
    HomeValve,
    // Liquid handler
    MoveXy,
    MoveZ,
    ReadZ,
    HomeAxes,
    MoveToWell,
    LowerToWell,
    // Detector
    SetIntegrationTime,
    Acquire,
}

const PUMP: &[Capability] = &[
    Capability::SetFlowRate,
    Capability::Aspirate,
    Capability::Dispense,
    Capability::StopFlow,
    Capability::ReadPressure,
    Capability::SelectSyringe,
];
const TEMPERATURE_CONTROLLER: &[Capability] =
    &[Capability::SetSetpoint, Capability::ReadTemperature];
const VALVE: &[Capability] = &[
    Capability::SelectPosition,
    Capability::ReadPosition,
    Capability::HomeValve,
];
const LIQUID_HANDLER: &[Capability] = &[
    Capability::MoveXy,
    Capability::MoveZ,
    Capability::ReadZ,
    Capability::HomeAxes,
    Capability::MoveToWell,
    Capability::LowerToWell,
];
const DETECTOR: &[Capability] = &[Capability::SetIntegrationTime, Capability::Acquire];

impl Capability {
    /// Capability contract of a category.
    pub fn for_category(category: DeviceCategory) -> &'static [Capability] {
        match category {
            DeviceCategory::Pump => PUMP,
            DeviceCategory::TemperatureController => TEMPERATURE_CONTROLLER,
            DeviceCategory::Valve => VALVE,
            DeviceCategory::LiquidHandler => LIQUID_HANDLER,
            DeviceCategory::Detector => DETECTOR,
        }
    }

    /// Category this capability belongs to.
    pub fn category(&self) -> DeviceCategory {
        match self {
            Capability::SetFlowRate
            | Capability::Aspirate
            | Capability::Dispense
            | Capability::StopFlow
            | Capability::ReadPressure
            | Capability::SelectSyringe => DeviceCategory::Pump,
            Capability::SetSetpoint | Capability::ReadTemperature => {
                DeviceCategory::TemperatureController
            }
            Capability::SelectPosition | Capability::ReadPosition | Capability::HomeValve => {
                DeviceCategory::Valve
            }
            Capability::MoveXy
            | Capability::MoveZ
            | Capability::ReadZ
            | Capability::HomeAxes
            | Capability::MoveToWell
            | Capability::LowerToWell => DeviceCategory::LiquidHandler,
            Capability::SetIntegrationTime | Capability::Acquire => DeviceCategory::Detector,
        }
    }

    /// Stable snake_case name.
    pub fn name(&self) -> &'static str {
        match self {
            Capability::SetFlowRate => "set_flow_rate",
            Capability::Aspirate => "aspirate",
            Capability::Dispense => "dispense",
            Capability::StopFlow => "stop_flow",
            Capability::ReadPressure => "read_pressure",
            Capability::SelectSyringe => "select_syringe",
            Capability::SetSetpoint => "set_setpoint",
            Capability::ReadTemperature => "read_temperature",
            Capability::SelectPosition => "select_position",
            Capability::ReadPosition => "read_position",
            Capability::HomeValve => "home_valve",
            Capability::MoveXy => "move_xy",
            Capability::MoveZ => "move_z",
            Capability::ReadZ => "read_z",
            Capability::HomeAxes => "home_axes",
            Capability::MoveToWell => "move_to_well",
            Capability::LowerToWell => "lower_to_well",
            Capability::SetIntegrationTime => "set_integration_time",
            Capability::Acquire => "acquire",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Operations and results
// =============================================================================

/// A capability invocation with its typed parameters.
///
/// Units follow laboratory convention: volumes in µL, flow rates in µL/min,
/// temperatures in °C, positions in mm.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Set the pump flow rate.
    SetFlowRate { ul_per_min: f64 },
    /// Draw `volume_ul` at `ul_per_min`. Completes when the volume is drawn.
    Aspirate { volume_ul: f64, ul_per_min: f64 },
    /// Deliver `volume_ul` at `ul_per_min`. Completes when the volume is delivered.
    Dispense { volume_ul: f64, ul_per_min: f64 },
    /// Halt flow immediately.
    StopFlow,
    /// Read line pressure (bar).
    ReadPressure,
    /// Fit a syringe of the given nominal size; the pump takes its inner
    /// diameter from its syringe table.
    SelectSyringe { volume_ml: f64 },
    /// Set the controller setpoint.
    SetSetpoint { celsius: f64 },
    /// Read the process temperature.
    ReadTemperature,
    /// Poll the temperature until it is within `tolerance_celsius` of the
    /// target. Bounded only by the step timeout.
    WaitStable {
        target_celsius: f64,
        tolerance_celsius: f64,
        #[serde(default = "default_poll_interval", with = "humantime_serde")]
        poll_interval: Duration,
    },
    /// Switch a selector valve to a port.
    SelectPosition { position: u32 },
    /// Read the current valve port.
    ReadPosition,
    /// Return the valve to its home port.
    HomeValve,
    /// Move the gantry in the XY plane.
    MoveXy { x_mm: f64, y_mm: f64 },
    /// Move the probe to a Z height.
    MoveZ { z_mm: f64 },
    /// Read the probe Z height.
    ReadZ,
    /// Home all axes.
    HomeAxes,
    /// Raise the probe and move over `well` of the rack on `bed`.
    MoveToWell { bed: u32, well: u32 },
    /// Lower the probe to the working height of the rack on `bed`.
    LowerToWell { bed: u32, well: u32 },
    /// Set detector integration time.
    SetIntegrationTime { seconds: f64 },
    /// Acquire one detector reading.
    Acquire,
}

fn default_poll_interval() -> Duration {
    crate::limits::STABILITY_POLL_INTERVAL
}

impl Operation {
    /// Capability required to perform this operation.
    pub fn capability(&self) -> Capability {
        match self {
            Operation::SetFlowRate { .. } => Capability::SetFlowRate,
            Operation::Aspirate { .. } => Capability::Aspirate,
            Operation::Dispense { .. } => Capability::Dispense,
            Operation::StopFlow => Capability::StopFlow,
            Operation::ReadPressure => Capability::ReadPressure,
            Operation::SelectSyringe { .. } => Capability::SelectSyringe,
            Operation::SetSetpoint { .. } => Capability::SetSetpoint,
            Operation::ReadTemperature | Operation::WaitStable { .. } => {
                Capability::ReadTemperature
            }
            Operation::SelectPosition { .. } => Capability::SelectPosition,
            Operation::ReadPosition => Capability::ReadPosition,
            Operation::HomeValve => Capability::HomeValve,
            Operation::MoveXy { .. } => Capability::MoveXy,
            Operation::MoveZ { .. } => Capability::MoveZ,
            Operation::ReadZ => Capability::ReadZ,
            Operation::HomeAxes => Capability::HomeAxes,
            Operation::MoveToWell { .. } => Capability::MoveToWell,
            Operation::LowerToWell { .. } => Capability::LowerToWell,
            Operation::SetIntegrationTime { .. } => Capability::SetIntegrationTime,
            Operation::Acquire => Capability::Acquire,
        }
    }

    /// Short label used in logs and run records.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::WaitStable { .. } => "wait_stable",
            other => other.capability().name(),
        }
    }

    /// Static parameter checks, independent of any device.
    pub fn check_parameters(&self) -> std::result::Result<(), String> {
        fn positive(name: &str, value: f64) -> std::result::Result<(), String> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(format!("{name} must be positive, got {value}"))
            }
        }
        fn finite(name: &str, value: f64) -> std::result::Result<(), String> {
            if value.is_finite() {
                Ok(())
            } else {
                Err(format!("{name} must be finite"))
            }
        }

        match self {
            Operation::SetFlowRate { ul_per_min } => positive("ul_per_min", *ul_per_min),
            Operation::Aspirate {
                volume_ul,
                ul_per_min,
            }
            | Operation::Dispense {
                volume_ul,
                ul_per_min,
            } => {
                positive("volume_ul", *volume_ul)?;
                if *volume_ul > crate::limits::MAX_TRANSFER_VOLUME_UL {
                    return Err(format!(
                        "volume_ul {volume_ul} exceeds {} per transfer",
                        crate::limits::MAX_TRANSFER_VOLUME_UL
                    ));
                }
                positive("ul_per_min", *ul_per_min)
            }
            Operation::SelectSyringe { volume_ml } => positive("volume_ml", *volume_ml),
            Operation::SetSetpoint { celsius } => finite("celsius", *celsius),
            Operation::WaitStable {
                target_celsius,
                tolerance_celsius,
                poll_interval,
            } => {
                finite("target_celsius", *target_celsius)?;
                positive("tolerance_celsius", *tolerance_celsius)?;
                if poll_interval.is_zero() {
                    return Err("poll_interval must be non-zero".to_string());
                }
                Ok(())
            }
            Operation::MoveXy { x_mm, y_mm } => {
                finite("x_mm", *x_mm)?;
                finite("y_mm", *y_mm)
            }
            Operation::MoveZ { z_mm } => finite("z_mm", *z_mm),
            Operation::MoveToWell { bed, well } | Operation::LowerToWell { bed, well } => {
                if *bed == 0 || *well == 0 {
                    return Err(format!("beds and wells count from 1, got bed {bed} well {well}"));
                }
                Ok(())
            }
            Operation::SetIntegrationTime { seconds } => positive("seconds", *seconds),
            Operation::StopFlow
            | Operation::ReadPressure
            | Operation::ReadTemperature
            | Operation::SelectPosition { .. }
            | Operation::ReadPosition
            | Operation::HomeValve
            | Operation::ReadZ
            | Operation::HomeAxes
            | Operation::Acquire => Ok(()),
        }
    }
}

/// One measured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Telemetry field, e.g. `"temperature"`.
    pub field: String,
    /// Value in `unit`.
    pub value: f64,
    /// Unit label.
    pub unit: String,
}

impl Reading {
    /// Construct a reading.
    pub fn new(field: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value,
            unit: unit.into(),
        }
    }
}

/// Result of a dispatched operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpOutput {
    /// Command accepted.
    Ack,
    /// Motion or transfer finished.
    Completed,
    /// A measured value.
    Reading(Reading),
}

impl OpOutput {
    /// Reading payload, if any.
    pub fn reading(&self) -> Option<&Reading> {
        match self {
            OpOutput::Reading(reading) => Some(reading),
            _ => None,
        }
    }
}

/// Error returned by drivers for capabilities they do not support.
pub fn unsupported(device: &str, capability: Capability) -> anyhow::Error {
    LabError::Unsupported {
        device: device.to_string(),
        capability: capability.name().to_string(),
    }
    .into()
}

// =============================================================================
// Traits
// =============================================================================

/// Base contract shared by every driver.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Bring the device to its safe idle state.
    ///
    /// Pumps stop flow, valves and gantries home, temperature controllers
    /// return to their safe setpoint. Must be safe to call at any time,
    /// including while another operation is in progress.
    async fn safe_stop(&self) -> Result<()>;

    /// Readings published by the background telemetry poller.
    async fn sample(&self) -> Result<Vec<Reading>> {
        Ok(Vec::new())
    }
}

/// Capability contract: Pump
#[async_trait]
pub trait Pump: Send + Sync {
    /// Set flow rate in µL/min.
    async fn set_flow_rate(&self, ul_per_min: f64) -> Result<()>;

    /// Aspirate `volume_ul` at `ul_per_min`; returns when complete.
    async fn aspirate(&self, volume_ul: f64, ul_per_min: f64) -> Result<()>;

    /// Dispense `volume_ul` at `ul_per_min`; returns when complete.
    async fn dispense(&self, volume_ul: f64, ul_per_min: f64) -> Result<()>;

    /// Halt flow.
    async fn stop_flow(&self) -> Result<()>;

    /// Line pressure in bar.
    async fn read_pressure(&self) -> Result<f64>;

    /// Fit a syringe of nominal size `volume_ml`.
    async fn select_syringe(&self, volume_ml: f64) -> Result<()>;
}

/// Capability contract: TemperatureController
#[async_trait]
pub trait TemperatureController: Send + Sync {
    /// Set the target temperature in °C.
    async fn set_setpoint(&self, celsius: f64) -> Result<()>;

    /// Current process temperature in °C.
    async fn read_temperature(&self) -> Result<f64>;
}

/// Capability contract: Valve
#[async_trait]
pub trait Valve: Send + Sync {
    /// Switch to port `position` (1-based).
    async fn select_position(&self, position: u32) -> Result<()>;

    /// Current port.
    async fn read_position(&self) -> Result<u32>;

    /// Return to the home port.
    async fn home(&self) -> Result<()>;
}

/// Capability contract: LiquidHandler
#[async_trait]
pub trait LiquidHandler: Send + Sync {
    /// Move the gantry in the XY plane (mm).
    async fn move_xy(&self, x_mm: f64, y_mm: f64) -> Result<()>;

    /// Move the probe to height `z_mm`.
    async fn move_z(&self, z_mm: f64) -> Result<()>;

    /// Current probe height.
    async fn read_z(&self) -> Result<f64>;

    /// Home all axes.
    async fn home(&self) -> Result<()>;

    /// Raise the probe, then move over a well of the deck.
    async fn move_to_well(&self, bed: u32, well: u32) -> Result<()>;

    /// Lower the probe into a well. The probe must already be over it.
    async fn lower_to_well(&self, bed: u32, well: u32) -> Result<()>;
}

/// Capability contract: Detector
#[async_trait]
pub trait Detector: Send + Sync {
    /// Set integration time in seconds.
    async fn set_integration_time(&self, seconds: f64) -> Result<()>;

    /// Acquire one reading.
    async fn acquire(&self) -> Result<Reading>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_tables_agree_with_categories() {
        for category in DeviceCategory::ALL {
            for capability in Capability::for_category(category) {
                assert_eq!(capability.category(), category, "{capability}");
            }
        }
    }

    #[test]
    fn wait_stable_runs_on_read_temperature() {
        let op = Operation::WaitStable {
            target_celsius: 40.0,
            tolerance_celsius: 0.5,
            poll_interval: Duration::from_millis(500),
        };
        assert_eq!(op.capability(), Capability::ReadTemperature);
        assert_eq!(op.label(), "wait_stable");
    }

    #[test]
    fn non_positive_volumes_are_rejected() {
        let op = Operation::Dispense {
            volume_ul: 0.0,
            ul_per_min: 100.0,
        };
        let err = op.check_parameters().unwrap_err();
        assert!(err.contains("volume_ul"));

        let op = Operation::SetFlowRate { ul_per_min: -5.0 };
        assert!(op.check_parameters().is_err());
    }

    #[test]
    fn transfers_beyond_a_litre_are_rejected() {
        let op = Operation::Dispense {
            volume_ul: 1e300,
            ul_per_min: 1.0,
        };
        let err = op.check_parameters().unwrap_err();
        assert!(err.contains("exceeds"), "{err}");

        let op = Operation::Aspirate {
            volume_ul: crate::limits::MAX_TRANSFER_VOLUME_UL,
            ul_per_min: 1.0,
        };
        assert!(op.check_parameters().is_ok());
    }

    #[test]
    fn wells_count_from_one() {
        let op = Operation::MoveToWell { bed: 1, well: 0 };
        assert!(op.check_parameters().is_err());
        let op = Operation::LowerToWell { bed: 2, well: 96 };
        assert!(op.check_parameters().is_ok());
        assert_eq!(op.capability().category(), DeviceCategory::LiquidHandler);
    }

    #[test]
    fn operations_parse_from_tagged_tables() {
        let op: Operation =
            toml::from_str("op = \"dispense\"\nvolume_ul = 2000.0\nul_per_min = 500.0").unwrap();
        assert_eq!(
            op,
            Operation::Dispense {
                volume_ul: 2000.0,
                ul_per_min: 500.0
            }
        );

        let op: Operation = toml::from_str(
            "op = \"wait_stable\"\ntarget_celsius = 40.0\ntolerance_celsius = 0.5",
        )
        .unwrap();
        assert_eq!(op.capability(), Capability::ReadTemperature);
    }
}
