//! Capability bag returned by driver factories.
//!
//! A driver instance is exposed through the trait objects of its category
//! plus the [`Instrument`] base. The handle dispatches [`Operation`]s through
//! this bag, so the engine never needs to know the concrete driver type.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::capabilities::{
    Capability, Detector, Instrument, LiquidHandler, OpOutput, Operation, Pump, Reading,
    TemperatureController, Valve,
};
use super::DeviceCategory;

/// Trait objects exposed by one driver instance.
#[derive(Clone)]
pub struct DeviceComponents {
    /// Base contract (safe stop, telemetry sampling).
    pub instrument: Arc<dyn Instrument>,
    /// Pump contract.
    pub pump: Option<Arc<dyn Pump>>,
    /// Temperature controller contract.
    pub temperature_controller: Option<Arc<dyn TemperatureController>>,
    /// Valve contract.
    pub valve: Option<Arc<dyn Valve>>,
    /// Liquid handler contract.
    pub liquid_handler: Option<Arc<dyn LiquidHandler>>,
    /// Detector contract.
    pub detector: Option<Arc<dyn Detector>>,
}

impl std::fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("pump", &self.pump.is_some())
            .field(
                "temperature_controller",
                &self.temperature_controller.is_some(),
            )
            .field("valve", &self.valve.is_some())
            .field("liquid_handler", &self.liquid_handler.is_some())
            .field("detector", &self.detector.is_some())
            .finish()
    }
}

impl DeviceComponents {
    /// Bag with only the base contract set.
    pub fn new(instrument: Arc<dyn Instrument>) -> Self {
        Self {
            instrument,
            pump: None,
            temperature_controller: None,
            valve: None,
            liquid_handler: None,
            detector: None,
        }
    }

    /// Attach a pump contract.
    pub fn with_pump(mut self, pump: Arc<dyn Pump>) -> Self {
        self.pump = Some(pump);
        self
    }

    /// Attach a temperature controller contract.
    pub fn with_temperature_controller(mut self, tc: Arc<dyn TemperatureController>) -> Self {
        self.temperature_controller = Some(tc);
        self
    }

    /// Attach a valve contract.
    pub fn with_valve(mut self, valve: Arc<dyn Valve>) -> Self {
        self.valve = Some(valve);
        self
    }

    /// Attach a liquid handler contract.
    pub fn with_liquid_handler(mut self, handler: Arc<dyn LiquidHandler>) -> Self {
        self.liquid_handler = Some(handler);
        self
    }

    /// Attach a detector contract.
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Whether the bag exposes the trait object for `category`.
    pub fn implements(&self, category: DeviceCategory) -> bool {
        match category {
            DeviceCategory::Pump => self.pump.is_some(),
            DeviceCategory::TemperatureController => self.temperature_controller.is_some(),
            DeviceCategory::Valve => self.valve.is_some(),
            DeviceCategory::LiquidHandler => self.liquid_handler.is_some(),
            DeviceCategory::Detector => self.detector.is_some(),
        }
    }

    /// Categories whose contract trait is attached.
    pub fn categories(&self) -> BTreeSet<DeviceCategory> {
        DeviceCategory::ALL
            .into_iter()
            .filter(|c| self.implements(*c))
            .collect()
    }

    /// Execute one operation. `WaitStable` is not handled here; the handle
    /// builds it from repeated temperature reads.
    pub(crate) async fn dispatch(&self, op: &Operation) -> Result<OpOutput> {
        match op {
            Operation::SetFlowRate { ul_per_min } => {
                self.pump()?.set_flow_rate(*ul_per_min).await?;
                Ok(OpOutput::Ack)
            }
            Operation::Aspirate {
                volume_ul,
                ul_per_min,
            } => {
                self.pump()?.aspirate(*volume_ul, *ul_per_min).await?;
                Ok(OpOutput::Completed)
            }
            Operation::Dispense {
                volume_ul,
                ul_per_min,
            } => {
                self.pump()?.dispense(*volume_ul, *ul_per_min).await?;
                Ok(OpOutput::Completed)
            }
            Operation::StopFlow => {
                self.pump()?.stop_flow().await?;
                Ok(OpOutput::Ack)
            }
            Operation::ReadPressure => {
                let bar = self.pump()?.read_pressure().await?;
                Ok(OpOutput::Reading(Reading::new("pressure", bar, "bar")))
            }
            Operation::SelectSyringe { volume_ml } => {
                self.pump()?.select_syringe(*volume_ml).await?;
                Ok(OpOutput::Ack)
            }
            Operation::SetSetpoint { celsius } => {
                self.temperature_controller()?.set_setpoint(*celsius).await?;
                Ok(OpOutput::Ack)
            }
            Operation::ReadTemperature | Operation::WaitStable { .. } => {
                let celsius = self.temperature_controller()?.read_temperature().await?;
                Ok(OpOutput::Reading(Reading::new(
                    "temperature",
                    celsius,
                    "degC",
                )))
            }
            Operation::SelectPosition { position } => {
                self.valve()?.select_position(*position).await?;
                Ok(OpOutput::Ack)
            }
            Operation::ReadPosition => {
                let position = self.valve()?.read_position().await?;
                Ok(OpOutput::Reading(Reading::new(
                    "position",
                    f64::from(position),
                    "port",
                )))
            }
            Operation::HomeValve => {
                self.valve()?.home().await?;
                Ok(OpOutput::Ack)
            }
            Operation::MoveXy { x_mm, y_mm } => {
                self.liquid_handler()?.move_xy(*x_mm, *y_mm).await?;
                Ok(OpOutput::Completed)
            }
            Operation::MoveZ { z_mm } => {
                self.liquid_handler()?.move_z(*z_mm).await?;
                Ok(OpOutput::Completed)
            }
            Operation::ReadZ => {
                let z = self.liquid_handler()?.read_z().await?;
                Ok(OpOutput::Reading(Reading::new("z", z, "mm")))
            }
            Operation::HomeAxes => {
                self.liquid_handler()?.home().await?;
                Ok(OpOutput::Completed)
            }
            Operation::MoveToWell { bed, well } => {
                self.liquid_handler()?.move_to_well(*bed, *well).await?;
                Ok(OpOutput::Completed)
            }
            Operation::LowerToWell { bed, well } => {
                self.liquid_handler()?.lower_to_well(*bed, *well).await?;
                Ok(OpOutput::Completed)
            }
            Operation::SetIntegrationTime { seconds } => {
                self.detector()?.set_integration_time(*seconds).await?;
                Ok(OpOutput::Ack)
            }
            Operation::Acquire => Ok(OpOutput::Reading(self.detector()?.acquire().await?)),
        }
    }

    fn pump(&self) -> Result<&Arc<dyn Pump>> {
        self.pump
            .as_ref()
            .ok_or_else(|| missing(Capability::SetFlowRate))
    }

    fn temperature_controller(&self) -> Result<&Arc<dyn TemperatureController>> {
        self.temperature_controller
            .as_ref()
            .ok_or_else(|| missing(Capability::SetSetpoint))
    }

    fn valve(&self) -> Result<&Arc<dyn Valve>> {
        self.valve
            .as_ref()
            .ok_or_else(|| missing(Capability::SelectPosition))
    }

    fn liquid_handler(&self) -> Result<&Arc<dyn LiquidHandler>> {
        self.liquid_handler
            .as_ref()
            .ok_or_else(|| missing(Capability::MoveXy))
    }

    fn detector(&self) -> Result<&Arc<dyn Detector>> {
        self.detector
            .as_ref()
            .ok_or_else(|| missing(Capability::Acquire))
    }
}

fn missing(sample: Capability) -> anyhow::Error {
    anyhow!("driver exposes no {} contract", sample.category())
}
