//! Simulated syringe and peristaltic pumps.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;

use super::common::{default_communication_delay, parse_settings, SimLink, SimMode};
use crate::device::capabilities::unsupported;
use crate::device::{Capability, DeviceComponents, Instrument, Pump, Reading};
use crate::registry::{DriverContext, DriverFactory};

// =============================================================================
// Factories
// =============================================================================

/// Settings of the simulated pumps.
#[derive(Debug, Clone, Deserialize)]
pub struct SimPumpConfig {
    /// Timing mode.
    #[serde(default)]
    pub mode: SimMode,
    /// Syringe capacity in µL at start (ignored by peristaltic pumps).
    #[serde(default = "default_syringe_volume")]
    pub syringe_volume_ul: f64,
    /// Volume held at start, in µL. Defaults to a full syringe.
    #[serde(default)]
    pub initial_volume_ul: Option<f64>,
    /// Highest accepted flow rate in µL/min.
    #[serde(default = "default_max_flow")]
    pub max_flow_ul_per_min: f64,
    /// Line pressure per µL/min of flow, in bar.
    #[serde(default = "default_pressure_coefficient")]
    pub bar_per_ul_min: f64,
    /// The first N transfers fail with a simulated stall.
    #[serde(default)]
    pub fail_first_transfers: u32,
    /// Delay per command.
    #[serde(default = "default_communication_delay", with = "humantime_serde")]
    pub communication_delay: Duration,
}

fn default_syringe_volume() -> f64 {
    5000.0
}

fn default_max_flow() -> f64 {
    10_000.0
}

fn default_pressure_coefficient() -> f64 {
    0.002
}

/// Gas-tight syringes the pump accepts: nominal size in mL and inner
/// diameter in mm.
pub const SYRINGE_TABLE: &[(f64, f64)] = &[
    (1.0, 4.69),
    (2.5, 9.65),
    (5.0, 12.45),
    (10.0, 15.90),
    (20.0, 20.05),
    (30.0, 22.90),
];

static SYRINGE_CAPABILITIES: &[Capability] = &[
    Capability::SetFlowRate,
    Capability::Aspirate,
    Capability::Dispense,
    Capability::StopFlow,
    Capability::ReadPressure,
    Capability::SelectSyringe,
];

// A peristaltic head has no metered intake and no pressure sensor.
static PERISTALTIC_CAPABILITIES: &[Capability] = &[
    Capability::SetFlowRate,
    Capability::Dispense,
    Capability::StopFlow,
];

/// Factory for [`SimPump`] instances.
#[derive(Debug, Clone, Copy)]
pub struct SimPumpFactory {
    kind: PumpKind,
}

impl SimPumpFactory {
    /// Syringe pump: full contract.
    pub fn syringe() -> Self {
        Self {
            kind: PumpKind::Syringe,
        }
    }

    /// Peristaltic pump: no `aspirate`, no `read_pressure`.
    pub fn peristaltic() -> Self {
        Self {
            kind: PumpKind::Peristaltic,
        }
    }
}

impl DriverFactory for SimPumpFactory {
    fn name(&self) -> &'static str {
        match self.kind {
            PumpKind::Syringe => "Simulated syringe pump",
            PumpKind::Peristaltic => "Simulated peristaltic pump",
        }
    }

    fn capabilities(&self) -> &'static [Capability] {
        match self.kind {
            PumpKind::Syringe => SYRINGE_CAPABILITIES,
            PumpKind::Peristaltic => PERISTALTIC_CAPABILITIES,
        }
    }

    fn validate(&self, settings: &toml::Value) -> Result<()> {
        let cfg: SimPumpConfig = parse_settings(settings)?;
        if cfg.syringe_volume_ul <= 0.0 || cfg.max_flow_ul_per_min <= 0.0 {
            bail!("syringe_volume_ul and max_flow_ul_per_min must be positive");
        }
        Ok(())
    }

    fn build(&self, ctx: DriverContext) -> BoxFuture<'static, Result<DeviceComponents>> {
        let kind = self.kind;
        Box::pin(async move {
            let cfg: SimPumpConfig = parse_settings(&ctx.spec.settings)?;
            let link = SimLink::new(&ctx, cfg.mode, cfg.communication_delay);
            let pump = Arc::new(SimPump::new(kind, cfg, link));
            pump.link.command("INIT").await?;
            Ok(DeviceComponents::new(pump.clone()).with_pump(pump))
        })
    }
}

// =============================================================================
// Driver
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpKind {
    Syringe,
    Peristaltic,
}

#[derive(Debug)]
struct PumpState {
    held_ul: f64,
    capacity_ul: f64,
    flow_ul_per_min: f64,
    flowing: bool,
    // Bumped by every stop; transfers started under an older generation end.
    generation: u64,
    transfers: u32,
    dispensed_ul: f64,
}

/// Simulated pump.
///
/// Transfers take `volume / rate` of tokio time and publish line pressure and
/// delivered volume while running. A stop interrupts a running transfer.
#[derive(Debug)]
pub struct SimPump {
    kind: PumpKind,
    cfg: SimPumpConfig,
    link: SimLink,
    state: Mutex<PumpState>,
}

impl SimPump {
    fn new(kind: PumpKind, cfg: SimPumpConfig, link: SimLink) -> Self {
        let capacity_ul = cfg.syringe_volume_ul;
        let held_ul = cfg.initial_volume_ul.unwrap_or(capacity_ul);
        Self {
            kind,
            cfg,
            link,
            state: Mutex::new(PumpState {
                held_ul,
                capacity_ul,
                flow_ul_per_min: 0.0,
                flowing: false,
                generation: 0,
                transfers: 0,
                dispensed_ul: 0.0,
            }),
        }
    }

    fn check_rate(&self, ul_per_min: f64) -> Result<()> {
        if ul_per_min <= 0.0 || ul_per_min > self.cfg.max_flow_ul_per_min {
            bail!(
                "flow rate {ul_per_min} µL/min outside (0, {}]",
                self.cfg.max_flow_ul_per_min
            );
        }
        Ok(())
    }

    fn pressure(&self) -> f64 {
        let state = self.state.lock();
        if state.flowing {
            state.flow_ul_per_min * self.cfg.bar_per_ul_min
        } else {
            0.0
        }
    }

    async fn transfer(&self, verb: &str, volume_ul: f64, ul_per_min: f64) -> Result<()> {
        self.check_rate(ul_per_min)?;
        let total = Duration::try_from_secs_f64(volume_ul / ul_per_min * 60.0).map_err(|_| {
            anyhow!("{verb} of {volume_ul} µL at {ul_per_min} µL/min has no finite duration")
        })?;
        let generation = {
            let mut state = self.state.lock();
            state.transfers += 1;
            if state.transfers <= self.cfg.fail_first_transfers {
                bail!("simulated plunger stall on transfer {}", state.transfers);
            }
            match verb {
                "DISPENSE" if self.kind == PumpKind::Syringe && volume_ul > state.held_ul => {
                    bail!(
                        "cannot dispense {volume_ul} µL, syringe holds {} µL",
                        state.held_ul
                    )
                }
                "ASPIRATE" if state.held_ul + volume_ul > state.capacity_ul => bail!(
                    "cannot aspirate {volume_ul} µL, capacity left {} µL",
                    state.capacity_ul - state.held_ul
                ),
                _ => {}
            }
            state.generation
        };

        self.link
            .command(format!("{verb} {volume_ul:.1} {ul_per_min:.1}"))
            .await?;
        {
            let mut state = self.state.lock();
            state.flow_ul_per_min = ul_per_min;
            state.flowing = true;
        }
        self.link
            .telemetry()
            .publish("pressure", self.pressure(), "bar");

        let chunk = Duration::from_millis(500);
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            let step = chunk.min(total - elapsed);
            self.link.pause(step).await;
            elapsed += step;
            if self.state.lock().generation != generation {
                bail!("{} interrupted by stop", verb.to_lowercase());
            }
            if self.link.mode() == SimMode::Instant {
                break;
            }
        }

        let delivered = {
            let mut state = self.state.lock();
            state.flowing = false;
            if verb == "DISPENSE" {
                if self.kind == PumpKind::Syringe {
                    state.held_ul -= volume_ul;
                }
                state.dispensed_ul += volume_ul;
            } else {
                state.held_ul += volume_ul;
            }
            state.dispensed_ul
        };
        self.link.telemetry().publish("pressure", 0.0, "bar");
        self.link
            .telemetry()
            .publish("dispensed_volume", delivered, "uL");
        Ok(())
    }
}

#[async_trait]
impl Instrument for SimPump {
    async fn safe_stop(&self) -> Result<()> {
        self.link.command("STOP").await?;
        {
            let mut state = self.state.lock();
            state.flowing = false;
            state.generation += 1;
        }
        self.link.telemetry().publish("pressure", 0.0, "bar");
        Ok(())
    }

    async fn sample(&self) -> Result<Vec<Reading>> {
        if self.kind == PumpKind::Peristaltic {
            return Ok(Vec::new());
        }
        Ok(vec![Reading::new("pressure", self.pressure(), "bar")])
    }
}

#[async_trait]
impl Pump for SimPump {
    async fn set_flow_rate(&self, ul_per_min: f64) -> Result<()> {
        self.check_rate(ul_per_min)?;
        self.link.command(format!("RATE {ul_per_min:.1}")).await?;
        self.state.lock().flow_ul_per_min = ul_per_min;
        Ok(())
    }

    async fn aspirate(&self, volume_ul: f64, ul_per_min: f64) -> Result<()> {
        if self.kind == PumpKind::Peristaltic {
            return Err(unsupported(self.link.device_id(), Capability::Aspirate));
        }
        self.transfer("ASPIRATE", volume_ul, ul_per_min).await
    }

    async fn dispense(&self, volume_ul: f64, ul_per_min: f64) -> Result<()> {
        self.transfer("DISPENSE", volume_ul, ul_per_min).await
    }

    async fn stop_flow(&self) -> Result<()> {
        self.link.command("STOP").await?;
        let mut state = self.state.lock();
        state.flowing = false;
        state.generation += 1;
        Ok(())
    }

    async fn read_pressure(&self) -> Result<f64> {
        if self.kind == PumpKind::Peristaltic {
            return Err(unsupported(self.link.device_id(), Capability::ReadPressure));
        }
        self.link.command("PRESSURE?").await?;
        Ok(self.pressure())
    }

    async fn select_syringe(&self, volume_ml: f64) -> Result<()> {
        if self.kind == PumpKind::Peristaltic {
            return Err(unsupported(self.link.device_id(), Capability::SelectSyringe));
        }
        let Some(&(_, diameter_mm)) = SYRINGE_TABLE
            .iter()
            .find(|(size, _)| (size - volume_ml).abs() < 1e-9)
        else {
            let sizes: Vec<String> = SYRINGE_TABLE.iter().map(|(size, _)| size.to_string()).collect();
            bail!(
                "unsupported syringe size {volume_ml} mL; choose from {}",
                sizes.join(", ")
            );
        };
        let capacity_ul = volume_ml * 1000.0;
        {
            let state = self.state.lock();
            if state.flowing {
                bail!("cannot change syringe while a transfer is running");
            }
            if state.held_ul > capacity_ul {
                bail!(
                    "syringe holds {} µL, more than a {volume_ml} mL syringe",
                    state.held_ul
                );
            }
        }
        self.link.command(format!("SVOLUME {capacity_ul:.1} ul")).await?;
        self.link
            .command(format!("DIAMETER {diameter_mm:.3}"))
            .await?;
        self.state.lock().capacity_ul = capacity_ul;
        Ok(())
    }
}
